//! Reduce-key hashing.
//!
//! A [`ReduceKeyProcessor`] turns the group-by values of one reduce group into
//! a 64-bit hash. With a single reduce field the hash is computed directly
//! from the value; with several fields, or as soon as a nested object or array
//! shows up, the exact byte representation of every value is appended to a
//! pooled buffer which is hashed as a whole.

use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};

/// Size of the first buffer a processor rents
const INITIAL_BUFFER_SIZE: usize = 16;

/// .NET style 96-bit decimal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    lo: u32,
    mid: u32,
    hi: u32,
    scale: u8,
    negative: bool,
}

impl Decimal {
    /// `mantissa * 10^-scale`; the mantissa must fit in 96 bits and the
    /// scale must not exceed 28.
    pub fn new(mantissa: i128, scale: u8) -> Result<Self> {
        let magnitude = mantissa.unsigned_abs();
        if magnitude >> 96 != 0 {
            return Err(Error::invalid_operation(format!(
                "decimal mantissa {} does not fit in 96 bits",
                mantissa
            )));
        }
        if scale > 28 {
            return Err(Error::invalid_operation(format!(
                "decimal scale {} exceeds 28",
                scale
            )));
        }
        Ok(Decimal {
            lo: magnitude as u32,
            mid: (magnitude >> 32) as u32,
            hi: (magnitude >> 64) as u32,
            scale,
            negative: mantissa < 0,
        })
    }

    /// In-memory layout: flags, hi, lo, mid
    pub fn to_bytes(&self) -> [u8; 16] {
        let flags = (self.scale as u32) << 16 | (self.negative as u32) << 31;
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.hi.to_le_bytes());
        out[8..12].copy_from_slice(&self.lo.to_le_bytes());
        out[12..16].copy_from_slice(&self.mid.to_le_bytes());
        out
    }
}

/// One property of an object value
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceProperty {
    /// Position of the property in the document's property table
    pub index: u32,
    pub name: String,
    pub value: ReduceValue,
}

/// A group-by field value
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceValue {
    Null,
    String(String),
    Long(i64),
    Int(i32),
    Double(f64),
    Float(f32),
    Decimal(Decimal),
    Bool(bool),
    /// Ticks
    DateTime(i64),
    /// Local ticks; the offset does not take part in the hash
    DateTimeOffset { ticks: i64, offset_minutes: i16 },
    /// Ticks
    TimeSpan(i64),
    Object(Vec<ReduceProperty>),
    Array(Vec<ReduceValue>),
}

/// Buffers shared by the processors of one indexing thread
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zeroed buffer of at least `min_size` bytes, rounded up to a power of two
    fn rent(&self, min_size: usize) -> Vec<u8> {
        let size = min_size.max(1).next_power_of_two();
        let mut free = self.free.lock();
        match free.iter().position(|buffer| buffer.len() == size) {
            Some(at) => {
                let mut buffer = free.swap_remove(at);
                buffer.fill(0);
                buffer
            }
            None => vec![0u8; size],
        }
    }

    fn give_back(&self, buffer: Vec<u8>) {
        if !buffer.is_empty() {
            self.free.lock().push(buffer);
        }
    }

    /// Buffers waiting to be rented
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Append-only byte buffer that grows to the next power of two
#[derive(Debug)]
struct GrowableBuffer {
    bytes: Vec<u8>,
    used: usize,
}

impl GrowableBuffer {
    fn rent(pool: &BufferPool) -> Self {
        GrowableBuffer {
            bytes: pool.rent(INITIAL_BUFFER_SIZE),
            used: 0,
        }
    }

    fn append(&mut self, pool: &BufferPool, data: &[u8]) {
        let needed = self.used + data.len();
        if needed > self.bytes.len() {
            let mut bigger = pool.rent(needed);
            bigger[..self.used].copy_from_slice(&self.bytes[..self.used]);
            pool.give_back(std::mem::replace(&mut self.bytes, bigger));
        }
        self.bytes[self.used..needed].copy_from_slice(data);
        self.used = needed;
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

/// How the processor computes its hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKeyMode {
    SingleValue,
    MultipleValues,
}

/// Hashes the values of one reduce group; reset and reuse for the next group
pub struct ReduceKeyProcessor<'p> {
    pool: &'p BufferPool,
    number_of_fields: usize,
    processed_fields: usize,
    mode: ReduceKeyMode,
    single_value_hash: u64,
    buffer: Option<GrowableBuffer>,
}

impl<'p> ReduceKeyProcessor<'p> {
    pub fn new(number_of_fields: usize, pool: &'p BufferPool) -> Self {
        let (mode, buffer) = if number_of_fields == 1 {
            (ReduceKeyMode::SingleValue, None)
        } else {
            (
                ReduceKeyMode::MultipleValues,
                Some(GrowableBuffer::rent(pool)),
            )
        };
        ReduceKeyProcessor {
            pool,
            number_of_fields,
            processed_fields: 0,
            mode,
            single_value_hash: 0,
            buffer,
        }
    }

    pub fn mode(&self) -> ReduceKeyMode {
        self.mode
    }

    /// Capacity of the value buffer, 0 before one is rented
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, GrowableBuffer::capacity)
    }

    /// Feed the value of the next reduce field
    pub fn process(&mut self, value: &ReduceValue) {
        self.processed_fields += 1;
        self.process_value(value);
    }

    fn process_value(&mut self, value: &ReduceValue) {
        match value {
            ReduceValue::Null => {}
            ReduceValue::Object(properties) => {
                self.switch_to_multiple_values();
                let mut ordered: Vec<&ReduceProperty> = properties.iter().collect();
                ordered.sort_by_key(|p| p.index);
                for property in ordered {
                    self.process_value(&property.value);
                }
            }
            ReduceValue::Array(items) => {
                self.switch_to_multiple_values();
                for item in items {
                    self.process_value(item);
                }
            }
            scalar => match self.mode {
                ReduceKeyMode::SingleValue => self.single_value_hash = single_value_hash(scalar),
                ReduceKeyMode::MultipleValues => self.append_scalar(scalar),
            },
        }
    }

    fn switch_to_multiple_values(&mut self) {
        self.mode = ReduceKeyMode::MultipleValues;
        if self.buffer.is_none() {
            self.buffer = Some(GrowableBuffer::rent(self.pool));
        }
    }

    fn append_scalar(&mut self, value: &ReduceValue) {
        let pool = self.pool;
        let buffer = self
            .buffer
            .get_or_insert_with(|| GrowableBuffer::rent(pool));
        match value {
            ReduceValue::String(s) => buffer.append(pool, s.as_bytes()),
            ReduceValue::Long(v) => buffer.append(pool, &v.to_le_bytes()),
            ReduceValue::Int(v) => buffer.append(pool, &v.to_le_bytes()),
            ReduceValue::Double(v) => buffer.append(pool, &v.to_le_bytes()),
            ReduceValue::Float(v) => buffer.append(pool, &v.to_le_bytes()),
            ReduceValue::Decimal(d) => buffer.append(pool, &d.to_bytes()),
            ReduceValue::Bool(b) => buffer.append(pool, &[*b as u8]),
            ReduceValue::DateTime(ticks)
            | ReduceValue::DateTimeOffset { ticks, .. }
            | ReduceValue::TimeSpan(ticks) => buffer.append(pool, &ticks.to_le_bytes()),
            ReduceValue::Null | ReduceValue::Object(_) | ReduceValue::Array(_) => {}
        }
    }

    /// Hash of the processed group. Fails unless every reduce field was
    /// processed exactly once.
    pub fn hash(&self) -> Result<u64> {
        if self.processed_fields != self.number_of_fields {
            return Err(Error::invalid_operation(format!(
                "reduce key hash requested after {} of {} fields were processed",
                self.processed_fields, self.number_of_fields
            )));
        }
        match self.mode {
            ReduceKeyMode::SingleValue => Ok(self.single_value_hash),
            ReduceKeyMode::MultipleValues => Ok(xxh64(
                self.buffer.as_ref().map_or(&[][..], GrowableBuffer::as_slice),
                0,
            )),
        }
    }

    /// Forget the processed values; the mode and buffer are kept
    pub fn reset(&mut self) {
        self.processed_fields = 0;
        self.single_value_hash = 0;
        if let Some(buffer) = &mut self.buffer {
            buffer.used = 0;
        }
    }
}

impl Drop for ReduceKeyProcessor<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer.bytes);
        }
    }
}

fn single_value_hash(value: &ReduceValue) -> u64 {
    match value {
        ReduceValue::String(s) => xxh64(s.as_bytes(), 0),
        ReduceValue::Long(v) => *v as u64,
        ReduceValue::Int(v) => *v as u64,
        ReduceValue::Double(v) => v.to_bits(),
        ReduceValue::Float(v) => v.to_bits() as u64,
        ReduceValue::Decimal(d) => xxh64(&d.to_bytes(), 0),
        ReduceValue::Bool(b) => {
            if *b {
                0
            } else {
                1
            }
        }
        ReduceValue::DateTime(ticks)
        | ReduceValue::DateTimeOffset { ticks, .. }
        | ReduceValue::TimeSpan(ticks) => *ticks as u64,
        ReduceValue::Null | ReduceValue::Object(_) | ReduceValue::Array(_) => 0,
    }
}
