//! Hi/lo identifier ranges.
//!
//! The highest id handed out for a tag is kept in a fixed-size tree together
//! with the etag of the transaction that wrote it. Reserving a range reads the
//! record in a read transaction and writes the new maximum only if the record
//! is unchanged; on a conflict the whole attempt starts over.

use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use crate::env::StorageEnvironment;
use crate::error::{Error, Result};
use crate::meta::get_u64;

/// Fixed-size tree holding the hi/lo records
pub const HILO_TREE: &str = "#hilo";

const RECORD_SIZE: u16 = 16;
const MAX_RESERVE_ATTEMPTS: usize = 128;

/// Ids `first..=last`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiLoRange {
    pub first: i64,
    pub last: i64,
}

fn tag_key(tag: &str) -> i64 {
    xxh64(tag.as_bytes(), 0) as i64
}

/// `(max, etag)` of `tag` as seen by a fresh read transaction
fn read_record(env: &StorageEnvironment, key: i64) -> Result<Option<(i64, u64)>> {
    let txn = env.read_transaction()?;
    let tree = match txn.read_fixed_tree(HILO_TREE)? {
        Some(tree) => tree,
        None => return Ok(None),
    };
    tree.read(&txn, key)?.map(|bytes| decode_record(&bytes)).transpose()
}

fn decode_record(bytes: &[u8]) -> Result<(i64, u64)> {
    Ok((get_u64(bytes, 0)? as i64, get_u64(bytes, 8)?))
}

/// Reserve the next `capacity` ids of `tag`
pub fn reserve_range(env: &StorageEnvironment, tag: &str, capacity: i64) -> Result<HiLoRange> {
    if capacity <= 0 {
        return Err(Error::invalid_operation(format!(
            "hilo capacity must be positive, got {}",
            capacity
        )));
    }
    let key = tag_key(tag);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_reserve(env, tag, key, capacity) {
            Err(e) if e.is_retryable() && attempt < MAX_RESERVE_ATTEMPTS => {
                env.logger().debug(format_args!(
                    "hilo '{}' conflicted on attempt {}, retrying",
                    tag, attempt
                ));
            }
            result => return result,
        }
    }
}

fn try_reserve(env: &StorageEnvironment, tag: &str, key: i64, capacity: i64) -> Result<HiLoRange> {
    let seen = read_record(env, key)?;
    let mut txn = env.write_transaction()?;
    let mut tree = txn.fixed_tree(HILO_TREE, RECORD_SIZE)?;
    let current = tree.read(&txn, key)?.map(|b| decode_record(&b)).transpose()?;
    if current.map(|(_, etag)| etag) != seen.map(|(_, etag)| etag) {
        return Err(Error::Concurrency {
            key: tag.to_string(),
            expected: seen.map_or(0, |(_, etag)| etag),
            actual: current.map(|(_, etag)| etag),
        });
    }

    let max = seen.map_or(0, |(max, _)| max);
    let last = max
        .checked_add(capacity)
        .ok_or_else(|| Error::invalid_operation(format!("hilo '{}' ran out of ids", tag)))?;
    let mut record = [0u8; RECORD_SIZE as usize];
    record[..8].copy_from_slice(&last.to_le_bytes());
    record[8..].copy_from_slice(&txn.id().to_le_bytes());
    tree.add(&mut txn, key, &record)?;
    txn.commit()?;
    Ok(HiLoRange {
        first: max + 1,
        last,
    })
}

/// Hands out ids for one tag, reserving a new range when the current one runs out
#[derive(Debug)]
pub struct HiLoIdGenerator {
    tag: String,
    capacity: i64,
    current: Mutex<Option<(i64, HiLoRange)>>,
}

impl HiLoIdGenerator {
    pub fn new(tag: impl Into<String>, capacity: i64) -> Self {
        HiLoIdGenerator {
            tag: tag.into(),
            capacity,
            current: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn next_id(&self, env: &StorageEnvironment) -> Result<i64> {
        let mut current = self.current.lock();
        if let Some((next, range)) = current.as_mut() {
            if *next <= range.last {
                let id = *next;
                *next += 1;
                return Ok(id);
            }
        }
        let range = reserve_range(env, &self.tag, self.capacity)?;
        *current = Some((range.first + 1, range));
        Ok(range.first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StorageEnvironmentOptions;

    #[test]
    fn ranges_follow_each_other() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        assert_eq!(
            reserve_range(&env, "users", 32).unwrap(),
            HiLoRange { first: 1, last: 32 }
        );
        assert_eq!(
            reserve_range(&env, "users", 32).unwrap(),
            HiLoRange { first: 33, last: 64 }
        );
        assert_eq!(reserve_range(&env, "orders", 8).unwrap().first, 1);
        assert!(reserve_range(&env, "orders", 0).is_err());
    }

    #[test]
    fn generator_reserves_lazily() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        let generator = HiLoIdGenerator::new("items", 2);
        let ids: Vec<i64> = (0..5).map(|_| generator.next_id(&env).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(reserve_range(&env, "items", 1).unwrap().first, 7);
    }
}
