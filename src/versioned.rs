use crate::error::{Error, Result};
use crate::meta::get_u64;
use crate::transaction::Transaction;
use crate::tree::Tree;

/// A value together with the etag of the transaction that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub etag: u64,
    pub value: Vec<u8>,
}

/// Tree of documents guarded by etags.
///
/// Every write stamps the entry with the id of the writing transaction.
/// Writers may pass the etag they last saw: `Some(0)` demands that the key
/// does not exist, any other value must match the stored etag, and `None`
/// skips the check.
#[derive(Debug)]
pub struct VersionedTree {
    tree: Tree,
}

impl VersionedTree {
    /// Open or create `name`
    pub fn open(txn: &mut Transaction<'_>, name: &str) -> Result<Self> {
        Ok(VersionedTree {
            tree: txn.create_tree(name)?,
        })
    }

    /// Open `name` if it exists
    pub fn open_existing(txn: &Transaction<'_>, name: &str) -> Result<Option<Self>> {
        Ok(txn.read_tree(name)?.map(|tree| VersionedTree { tree }))
    }

    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<VersionedValue>> {
        match self.tree.read(txn, key)? {
            Some(bytes) => Ok(Some(VersionedValue {
                etag: get_u64(&bytes, 0)?,
                value: bytes[8..].to_vec(),
            })),
            None => Ok(None),
        }
    }

    pub fn etag(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<u64>> {
        Ok(self.get(txn, key)?.map(|v| v.etag))
    }

    /// Write `value` and return its new etag
    pub fn put(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        value: &[u8],
        expected_etag: Option<u64>,
    ) -> Result<u64> {
        let current = self.etag(txn, key)?;
        check_etag(key, expected_etag, current)?;
        let etag = txn.id();
        let mut stored = Vec::with_capacity(8 + value.len());
        stored.extend_from_slice(&etag.to_le_bytes());
        stored.extend_from_slice(value);
        self.tree.add(txn, key, &stored)?;
        Ok(etag)
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        expected_etag: Option<u64>,
    ) -> Result<bool> {
        let current = self.etag(txn, key)?;
        check_etag(key, expected_etag, current)?;
        self.tree.delete(txn, key)
    }
}

fn check_etag(key: &[u8], expected: Option<u64>, actual: Option<u64>) -> Result<()> {
    let matches = match expected {
        None => true,
        Some(0) => actual.is_none(),
        Some(etag) => actual == Some(etag),
    };
    if matches {
        return Ok(());
    }
    Err(Error::Concurrency {
        key: String::from_utf8_lossy(key).into_owned(),
        expected: expected.unwrap_or_default(),
        actual,
    })
}
