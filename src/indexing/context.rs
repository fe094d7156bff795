use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::fixed_size_tree::FixedSizeTree;
use crate::indexing::results_store::{MapReduceResultsStore, ResultsStoreType};
use crate::transaction::Transaction;
use crate::tree::{PageChanges, Tree};

/// Fixed-size tree: reduce key hash -> results store type
pub const RESULTS_STORE_TYPES_TREE: &str = "#resultsStoreTypes";
/// Fixed-size tree: map result id -> reduce key hash
pub const MAP_ENTRIES_TREE: &str = "#mapEntries";
/// Tree: document id -> ids of the map results it produced
pub const MAP_PHASE_TREE: &str = "#mapPhase";

/// State of one map-reduce indexing batch.
///
/// Tracks the map results each document produced, routes them to the results
/// store of their reduce key and collects the pages the batch touched.
pub struct MapReduceIndexingContext {
    reduce_phase_tree: String,
    stores: BTreeMap<u64, MapReduceResultsStore>,
    store_types: FixedSizeTree,
    map_entries: FixedSizeTree,
    map_phase: Tree,
    changes: PageChanges,
}

impl MapReduceIndexingContext {
    pub fn new(txn: &mut Transaction<'_>, reduce_phase_tree: &str) -> Result<Self> {
        Ok(MapReduceIndexingContext {
            reduce_phase_tree: reduce_phase_tree.to_string(),
            stores: BTreeMap::new(),
            store_types: txn.fixed_tree(RESULTS_STORE_TYPES_TREE, 1)?,
            map_entries: txn.fixed_tree(MAP_ENTRIES_TREE, 8)?,
            map_phase: txn.create_tree(MAP_PHASE_TREE)?,
            changes: PageChanges::default(),
        })
    }

    /// Results store of `reduce_key_hash`, opened once per batch
    pub fn store_for(
        &mut self,
        txn: &mut Transaction<'_>,
        reduce_key_hash: u64,
    ) -> Result<&mut MapReduceResultsStore> {
        if !self.stores.contains_key(&reduce_key_hash) {
            let store_type = match self.store_types.read(txn, reduce_key_hash as i64)? {
                Some(code) => ResultsStoreType::from_code(code[0])?,
                None => ResultsStoreType::Nested,
            };
            let store = MapReduceResultsStore::new(
                txn,
                reduce_key_hash,
                store_type,
                true,
                &self.reduce_phase_tree,
            )?;
            self.stores.insert(reduce_key_hash, store);
        }
        self.stores
            .get_mut(&reduce_key_hash)
            .ok_or_else(|| Error::invalid_operation("results store vanished"))
    }

    /// Record a map result of `document_id` and store its payload
    pub fn put_map_result(
        &mut self,
        txn: &mut Transaction<'_>,
        document_id: &str,
        map_result_id: i64,
        reduce_key_hash: u64,
        payload: &[u8],
    ) -> Result<()> {
        self.store_for(txn, reduce_key_hash)?
            .add(txn, map_result_id, payload)?;
        self.map_entries
            .add(txn, map_result_id, &reduce_key_hash.to_le_bytes())?;

        let mut ids = self.map_results_of(txn, document_id)?;
        if let Err(at) = ids.binary_search(&map_result_id) {
            ids.insert(at, map_result_id);
            self.map_phase
                .add(txn, document_id.as_bytes(), &encode_ids(&ids))?;
        }
        Ok(())
    }

    /// Drop every map result of `document_id`; returns the affected reduce keys
    pub fn delete_map_results(
        &mut self,
        txn: &mut Transaction<'_>,
        document_id: &str,
    ) -> Result<Vec<u64>> {
        let mut affected = Vec::new();
        for id in self.map_results_of(txn, document_id)? {
            let hash = match self.map_entries.read(txn, id)? {
                Some(bytes) => decode_hash(&bytes)?,
                None => continue,
            };
            self.store_for(txn, hash)?.delete(txn, id)?;
            self.map_entries.delete(txn, id)?;
            if !affected.contains(&hash) {
                affected.push(hash);
            }
        }
        self.map_phase.delete(txn, document_id.as_bytes())?;
        Ok(affected)
    }

    /// Ids of the map results `document_id` produced, sorted
    pub fn map_results_of(&self, txn: &Transaction<'_>, document_id: &str) -> Result<Vec<i64>> {
        match self.map_phase.read(txn, document_id.as_bytes())? {
            Some(bytes) => decode_ids(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Reduce key a map result belongs to
    pub fn reduce_key_of(&self, txn: &Transaction<'_>, map_result_id: i64) -> Result<Option<u64>> {
        self.map_entries
            .read(txn, map_result_id)?
            .map(|bytes| decode_hash(&bytes))
            .transpose()
    }

    /// Persist store types and hand back every page the batch touched
    pub fn complete_batch(&mut self, txn: &mut Transaction<'_>) -> Result<PageChanges> {
        let stores = std::mem::take(&mut self.stores);
        for (hash, mut store) in stores {
            let code = [store.store_type().code()];
            if self.store_types.read(txn, hash as i64)?.as_deref() != Some(&code[..]) {
                self.store_types.add(txn, hash as i64, &code)?;
            }
            self.changes.merge(PageChanges {
                modified: store.modified_pages().clone(),
                freed: store.freed_pages().clone(),
            });
            self.changes.merge(store.take_reduce_phase_changes());
        }
        self.changes.merge(self.store_types.take_page_changes());
        self.changes.merge(self.map_entries.take_page_changes());
        self.changes.merge(self.map_phase.take_page_changes());
        Ok(std::mem::take(&mut self.changes))
    }
}

fn encode_ids(ids: &[i64]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

fn decode_ids(bytes: &[u8]) -> Result<Vec<i64>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::corrupted("map phase entry is not a list of ids"));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut id = [0u8; 8];
            id.copy_from_slice(chunk);
            i64::from_le_bytes(id)
        })
        .collect())
}

fn decode_hash(bytes: &[u8]) -> Result<u64> {
    let hash: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::corrupted("map entry does not hold a reduce key hash"))?;
    Ok(u64::from_le_bytes(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StorageEnvironment;
    use crate::options::StorageEnvironmentOptions;

    #[test]
    fn map_results_are_tracked_per_document() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        let mut txn = env.write_transaction().unwrap();
        let mut context = MapReduceIndexingContext::new(&mut txn, "reduce").unwrap();

        context.put_map_result(&mut txn, "orders/1", 10, 111, b"a").unwrap();
        context.put_map_result(&mut txn, "orders/1", 11, 222, b"b").unwrap();
        context.put_map_result(&mut txn, "orders/2", 12, 111, b"c").unwrap();
        assert_eq!(context.map_results_of(&txn, "orders/1").unwrap(), vec![10, 11]);
        assert_eq!(context.reduce_key_of(&txn, 12).unwrap(), Some(111));

        let affected = context.delete_map_results(&mut txn, "orders/1").unwrap();
        assert_eq!(affected, vec![111, 222]);
        assert!(context.map_results_of(&txn, "orders/1").unwrap().is_empty());
        assert_eq!(context.reduce_key_of(&txn, 10).unwrap(), None);
        let store = context.store_for(&mut txn, 111).unwrap();
        assert_eq!(store.entries_count(&txn).unwrap(), 1);

        let changes = context.complete_batch(&mut txn).unwrap();
        assert!(!changes.modified.is_empty());
    }

    #[test]
    fn promoted_store_types_survive_the_batch() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        {
            let mut txn = env.write_transaction().unwrap();
            let mut context = MapReduceIndexingContext::new(&mut txn, "reduce").unwrap();
            for id in 0..20 {
                context
                    .put_map_result(&mut txn, "users/1", id, 42, &[1u8; 200])
                    .unwrap();
            }
            context.complete_batch(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        let mut txn = env.write_transaction().unwrap();
        let mut context = MapReduceIndexingContext::new(&mut txn, "reduce").unwrap();
        let store = context.store_for(&mut txn, 42).unwrap();
        assert_eq!(store.store_type(), ResultsStoreType::Tree);
        assert_eq!(store.entries_count(&txn).unwrap(), 20);
    }
}
