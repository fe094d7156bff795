use std::collections::BTreeSet;

use crate::constants::{nested_section_key, reduce_tree_name};
use crate::error::{Error, Result};
use crate::meta::{get_u32, get_u64};
use crate::transaction::Transaction;
use crate::tree::{PageChanges, Tree};

/// How a results store keeps its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsStoreType {
    /// One value inside the shared reduce phase tree
    Nested,
    /// A dedicated tree
    Tree,
}

impl ResultsStoreType {
    pub(crate) fn code(self) -> u8 {
        match self {
            ResultsStoreType::Nested => 0,
            ResultsStoreType::Tree => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ResultsStoreType::Nested),
            1 => Ok(ResultsStoreType::Tree),
            other => Err(Error::corrupted(format!("unknown results store type {}", other))),
        }
    }
}

/// Entries of a nested section, sorted by id.
///
/// Encoded as repeated `id i64, len i32, payload`, little endian.
#[derive(Debug, Default)]
struct NestedSection {
    entries: Vec<(i64, Vec<u8>)>,
}

impl NestedSection {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let id = get_u64(bytes, at)? as i64;
            let len = get_u32(bytes, at + 8)? as i32;
            if len < 0 {
                return Err(Error::corrupted(format!(
                    "nested entry {} has a negative length",
                    id
                )));
            }
            let start = at + 12;
            let payload = bytes
                .get(start..start + len as usize)
                .ok_or_else(|| Error::corrupted(format!("nested entry {} is truncated", id)))?;
            entries.push((id, payload.to_vec()));
            at = start + len as usize;
        }
        Ok(NestedSection { entries })
    }

    fn encoded_len(&self) -> usize {
        self.entries.iter().map(|(_, p)| 12 + p.len()).sum()
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for (id, payload) in &self.entries {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    fn find(&self, id: i64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&id, |(i, _)| *i)
    }

    fn upsert(&mut self, id: i64, payload: &[u8]) {
        match self.find(id) {
            Ok(at) => self.entries[at].1 = payload.to_vec(),
            Err(at) => self.entries.insert(at, (id, payload.to_vec())),
        }
    }
}

/// Intermediate reduce results of one reduce key.
///
/// Starts out as a section in the shared reduce phase tree and moves to a
/// dedicated tree, for good, once the section would no longer fit inline.
pub struct MapReduceResultsStore {
    reduce_key_hash: u64,
    store_type: ResultsStoreType,
    nested_key: String,
    reduce_phase: Tree,
    tree: Option<Tree>,
    modified_pages: BTreeSet<u64>,
    freed_pages: BTreeSet<u64>,
}

impl MapReduceResultsStore {
    /// Open the store of `reduce_key_hash`. With `create` the backing trees
    /// are created as needed, which requires a write transaction.
    pub fn new(
        txn: &mut Transaction<'_>,
        reduce_key_hash: u64,
        store_type: ResultsStoreType,
        create: bool,
        reduce_phase_tree: &str,
    ) -> Result<Self> {
        let reduce_phase = open_tree(txn, reduce_phase_tree, create)?;
        let tree = match store_type {
            ResultsStoreType::Nested => None,
            ResultsStoreType::Tree => Some(open_tree(txn, &reduce_tree_name(reduce_key_hash), create)?),
        };
        Ok(MapReduceResultsStore {
            reduce_key_hash,
            store_type,
            nested_key: nested_section_key(reduce_key_hash),
            reduce_phase,
            tree,
            modified_pages: BTreeSet::new(),
            freed_pages: BTreeSet::new(),
        })
    }

    pub fn reduce_key_hash(&self) -> u64 {
        self.reduce_key_hash
    }

    pub fn store_type(&self) -> ResultsStoreType {
        self.store_type
    }

    /// Pages of the dedicated tree written by this store
    pub fn modified_pages(&self) -> &BTreeSet<u64> {
        &self.modified_pages
    }

    /// Pages of the dedicated tree released by this store
    pub fn freed_pages(&self) -> &BTreeSet<u64> {
        &self.freed_pages
    }

    /// Page changes made to the shared reduce phase tree through this store
    pub fn take_reduce_phase_changes(&mut self) -> PageChanges {
        self.reduce_phase.take_page_changes()
    }

    pub fn add(&mut self, txn: &mut Transaction<'_>, id: i64, result: &[u8]) -> Result<()> {
        if self.store_type == ResultsStoreType::Tree {
            return self.with_tree(|tree| tree.add(txn, &id.to_be_bytes(), result));
        }

        let mut section = self.read_section(txn)?;
        section.upsert(id, result);
        let size = section.encoded_len();
        if self
            .reduce_phase
            .should_go_to_overflow_page(txn, self.nested_key.len(), size)
        {
            return self.promote_to_tree(txn, section);
        }
        self.reduce_phase
            .add(txn, self.nested_key.as_bytes(), &section.encode())
    }

    /// Remove `id`; returns whether it was stored
    pub fn delete(&mut self, txn: &mut Transaction<'_>, id: i64) -> Result<bool> {
        if self.store_type == ResultsStoreType::Tree {
            return self.with_tree(|tree| tree.delete(txn, &id.to_be_bytes()));
        }

        let mut section = self.read_section(txn)?;
        let at = match section.find(id) {
            Ok(at) => at,
            Err(_) => return Ok(false),
        };
        section.entries.remove(at);
        if section.entries.is_empty() {
            self.reduce_phase.delete(txn, self.nested_key.as_bytes())?;
        } else {
            self.reduce_phase
                .add(txn, self.nested_key.as_bytes(), &section.encode())?;
        }
        Ok(true)
    }

    /// Stored result of `id`; a missing id is a caller error in both modes
    pub fn get(&self, txn: &Transaction<'_>, id: i64) -> Result<Vec<u8>> {
        self.try_get(txn, id)?.ok_or_else(|| {
            Error::invalid_operation(format!(
                "map result {} does not exist in the store of reduce key {}",
                id, self.reduce_key_hash
            ))
        })
    }

    pub fn try_get(&self, txn: &Transaction<'_>, id: i64) -> Result<Option<Vec<u8>>> {
        match &self.tree {
            Some(tree) => tree.read(txn, &id.to_be_bytes()),
            None => {
                let mut section = self.read_section(txn)?;
                Ok(match section.find(id) {
                    Ok(at) => Some(section.entries.swap_remove(at).1),
                    Err(_) => None,
                })
            }
        }
    }

    /// All stored results, ordered by id
    pub fn results(&self, txn: &Transaction<'_>) -> Result<Vec<(i64, Vec<u8>)>> {
        let mut results = match &self.tree {
            Some(tree) => tree
                .iter(txn)?
                .map(|entry| {
                    let (key, value) = entry?;
                    let id: [u8; 8] = key
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::corrupted("map result key is not 8 bytes"))?;
                    Ok((i64::from_be_bytes(id), value))
                })
                .collect::<Result<Vec<_>>>()?,
            None => self.read_section(txn)?.entries,
        };
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }

    pub fn entries_count(&self, txn: &Transaction<'_>) -> Result<u64> {
        match &self.tree {
            Some(tree) => Ok(tree.stats(txn)?.entries),
            None => Ok(self.read_section(txn)?.entries.len() as u64),
        }
    }

    fn read_section(&self, txn: &Transaction<'_>) -> Result<NestedSection> {
        match self.reduce_phase.read(txn, self.nested_key.as_bytes())? {
            Some(bytes) => NestedSection::decode(&bytes),
            None => Ok(NestedSection::default()),
        }
    }

    /// Move every nested entry, `section` included, into the dedicated tree
    fn promote_to_tree(&mut self, txn: &mut Transaction<'_>, section: NestedSection) -> Result<()> {
        let name = reduce_tree_name(self.reduce_key_hash);
        let mut tree = txn.create_tree(&name)?;
        for (id, payload) in &section.entries {
            tree.add(txn, &id.to_be_bytes(), payload)?;
        }
        self.reduce_phase.delete(txn, self.nested_key.as_bytes())?;
        txn.environment().logger().debug(format_args!(
            "reduce key {} moved {} results to '{}'",
            self.reduce_key_hash,
            section.entries.len(),
            name
        ));
        self.store_type = ResultsStoreType::Tree;
        self.tree = Some(tree);
        self.collect_tree_changes();
        Ok(())
    }

    fn with_tree<T>(&mut self, f: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        let tree = self
            .tree
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("results store has no tree"))?;
        let result = f(tree);
        self.collect_tree_changes();
        result
    }

    fn collect_tree_changes(&mut self) {
        if let Some(tree) = self.tree.as_mut() {
            let changes = tree.take_page_changes();
            for page in changes.modified {
                self.freed_pages.remove(&page);
                self.modified_pages.insert(page);
            }
            for page in changes.freed {
                self.modified_pages.remove(&page);
                self.freed_pages.insert(page);
            }
        }
    }
}

fn open_tree(txn: &mut Transaction<'_>, name: &str, create: bool) -> Result<Tree> {
    if create {
        return txn.create_tree(name);
    }
    txn.read_tree(name)?
        .ok_or_else(|| Error::TreeNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StorageEnvironment;
    use crate::options::StorageEnvironmentOptions;

    const REDUCE_PHASE: &str = "reduce-phase";

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap()
    }

    #[test]
    fn small_results_stay_nested() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut store =
            MapReduceResultsStore::new(&mut txn, 77, ResultsStoreType::Nested, true, REDUCE_PHASE)
                .unwrap();
        store.add(&mut txn, 1, b"payload-a").unwrap();
        store.add(&mut txn, 2, b"payload-b").unwrap();
        assert_eq!(store.store_type(), ResultsStoreType::Nested);
        assert_eq!(store.get(&txn, 1).unwrap(), b"payload-a".to_vec());
        assert_eq!(store.entries_count(&txn).unwrap(), 2);
        assert!(txn.read_tree(&reduce_tree_name(77)).unwrap().is_none());
    }

    #[test]
    fn growing_past_the_overflow_limit_promotes_to_a_tree() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut store =
            MapReduceResultsStore::new(&mut txn, 5, ResultsStoreType::Nested, true, REDUCE_PHASE)
                .unwrap();
        let payload = vec![3u8; 100];
        let mut id = 0;
        while store.store_type() == ResultsStoreType::Nested {
            id += 1;
            store.add(&mut txn, id, &payload).unwrap();
            assert!(id < 100);
        }
        assert!(id > 1);
        assert!(!store.modified_pages().is_empty());
        for existing in 1..=id {
            assert_eq!(store.get(&txn, existing).unwrap(), payload);
        }
        let phase = txn.read_tree(REDUCE_PHASE).unwrap().unwrap();
        assert!(phase.read(&txn, b"#nestedSection-5").unwrap().is_none());

        // Deleting does not move the store back
        for existing in 1..=id {
            assert!(store.delete(&mut txn, existing).unwrap());
        }
        assert_eq!(store.store_type(), ResultsStoreType::Tree);
        assert!(matches!(store.get(&txn, 1), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn missing_ids_fail_in_nested_mode_too() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut store =
            MapReduceResultsStore::new(&mut txn, 9, ResultsStoreType::Nested, true, REDUCE_PHASE)
                .unwrap();
        store.add(&mut txn, 4, b"x").unwrap();
        assert!(store.delete(&mut txn, 4).unwrap());
        assert!(!store.delete(&mut txn, 4).unwrap());
        assert!(matches!(store.get(&txn, 4), Err(Error::InvalidOperation(_))));
        assert_eq!(store.try_get(&txn, 4).unwrap(), None);
        store.add(&mut txn, 4, b"again").unwrap();
        assert_eq!(store.get(&txn, 4).unwrap(), b"again".to_vec());
    }

    #[test]
    fn results_are_ordered_by_id_in_tree_mode() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut store =
            MapReduceResultsStore::new(&mut txn, 3, ResultsStoreType::Tree, true, REDUCE_PHASE)
                .unwrap();
        for id in [10i64, -2, 7] {
            store.add(&mut txn, id, &id.to_le_bytes()).unwrap();
        }
        let ids: Vec<i64> = store
            .results(&txn)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![-2, 7, 10]);
    }

    #[test]
    fn nested_sections_round_trip_through_bytes() {
        let mut section = NestedSection::default();
        section.upsert(2, b"b");
        section.upsert(1, b"");
        section.upsert(2, b"bb");
        let decoded = NestedSection::decode(&section.encode()).unwrap();
        assert_eq!(decoded.entries, vec![(1, Vec::new()), (2, b"bb".to_vec())]);
        assert!(NestedSection::decode(&[1, 2, 3]).is_err());
    }
}
