//! Store Context Module
//!
//! Contracts for the collaborators a table talks to, and the bundle that
//! carries them into element and table operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use super::clock::{Clock, SystemClock, Timestamp};
use super::element::Element;
use crate::error::{CacheError, Result, StorageError};

// == Secondary Storage ==
/// Opaque reference to a value held by secondary storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageHandle(pub u64);

/// Overflow store for cold values.
pub trait SecondaryStorage: Send + Sync {
    /// Stores a value. `Ok(None)` means the engine declined (e.g. it is full).
    fn put(&self, key: &Bytes, value: &Bytes) -> std::result::Result<Option<StorageHandle>, StorageError>;

    fn get(&self, handle: StorageHandle) -> std::result::Result<Bytes, StorageError>;

    fn remove(&self, handle: StorageHandle) -> std::result::Result<(), StorageError>;

    /// Size charged in memory for a value that lives here.
    fn reference_size(&self) -> u64;
}

/// Secondary storage kept in process memory, bounded by a byte capacity.
#[derive(Debug)]
pub struct InMemorySecondaryStorage {
    capacity_bytes: u64,
    reference_size: u64,
    next_handle: AtomicU64,
    state: Mutex<SpillState>,
}

#[derive(Debug, Default)]
struct SpillState {
    used_bytes: u64,
    values: HashMap<StorageHandle, Bytes>,
}

/// Default in-memory charge for a spilled value.
pub const DEFAULT_REFERENCE_SIZE: u64 = 16;

impl InMemorySecondaryStorage {
    pub fn new(capacity_bytes: u64) -> Self {
        Self::with_reference_size(capacity_bytes, DEFAULT_REFERENCE_SIZE)
    }

    pub fn with_reference_size(capacity_bytes: u64, reference_size: u64) -> Self {
        Self {
            capacity_bytes,
            reference_size,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(SpillState::default()),
        }
    }

    /// Number of values currently held.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }
}

impl SecondaryStorage for InMemorySecondaryStorage {
    fn put(&self, _key: &Bytes, value: &Bytes) -> std::result::Result<Option<StorageHandle>, StorageError> {
        let mut state = self.state.lock();
        let size = value.len() as u64;
        if state.used_bytes + size > self.capacity_bytes {
            return Ok(None);
        }
        let handle = StorageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.used_bytes += size;
        state.values.insert(handle, value.clone());
        Ok(Some(handle))
    }

    fn get(&self, handle: StorageHandle) -> std::result::Result<Bytes, StorageError> {
        self.state
            .lock()
            .values
            .get(&handle)
            .cloned()
            .ok_or(StorageError::UnknownHandle(handle.0))
    }

    fn remove(&self, handle: StorageHandle) -> std::result::Result<(), StorageError> {
        let mut state = self.state.lock();
        let value = state
            .values
            .remove(&handle)
            .ok_or(StorageError::UnknownHandle(handle.0))?;
        state.used_bytes -= value.len() as u64;
        Ok(())
    }

    fn reference_size(&self) -> u64 {
        self.reference_size
    }
}

// == Size Calculation ==
/// Estimates the memory charged for keys, values and whole elements.
pub trait SizeCalculator: Send + Sync {
    fn size_of(&self, data: Option<&[u8]>) -> u64;

    /// Combines component sizes into an element size.
    fn sum(&self, parts: &[u64]) -> u64 {
        parts.iter().sum()
    }
}

/// Byte length plus a fixed per-element overhead.
#[derive(Debug, Clone, Copy)]
pub struct DefaultSizeCalculator {
    pub element_overhead: u64,
}

/// Bookkeeping charged per element on top of key and value.
pub const DEFAULT_ELEMENT_OVERHEAD: u64 = 64;

impl Default for DefaultSizeCalculator {
    fn default() -> Self {
        Self {
            element_overhead: DEFAULT_ELEMENT_OVERHEAD,
        }
    }
}

impl SizeCalculator for DefaultSizeCalculator {
    fn size_of(&self, data: Option<&[u8]>) -> u64 {
        data.map_or(0, |d| d.len() as u64)
    }

    fn sum(&self, parts: &[u64]) -> u64 {
        parts.iter().sum::<u64>() + self.element_overhead
    }
}

// == Miss Fill ==
/// A value produced by a data source, with what it cost to read.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub value: Option<Bytes>,
    pub time_to_read: Duration,
}

impl Loaded {
    pub fn new(value: Option<Bytes>, time_to_read: Duration) -> Self {
        Self {
            value,
            time_to_read,
        }
    }

    /// Encodes a structured value as JSON.
    pub fn from_serializable<T: Serialize>(value: &T, time_to_read: Duration) -> Result<Self> {
        let encoded =
            serde_json::to_vec(value).map_err(|e| CacheError::InvalidObject(e.to_string()))?;
        Ok(Self::new(Some(Bytes::from(encoded)), time_to_read))
    }
}

/// What a data source needs to refresh an element before it goes stale.
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub key: Bytes,
    /// Pass back to `ElementTable::update` so a late refill cannot clobber newer data
    pub update_counter: i64,
    pub expiration_time: Option<Timestamp>,
    pub idle_deadline: Option<Timestamp>,
    pub last_read_cost: Option<Duration>,
}

/// An in-flight asynchronous refill.
pub trait PrefetchOrder: Send {
    fn cancel(&self);
}

impl PrefetchOrder for tokio::task::JoinHandle<()> {
    fn cancel(&self) {
        self.abort();
    }
}

/// Backing source consulted on a cache miss.
pub trait DataSource: Send + Sync {
    fn get(&self, key: &Bytes) -> Result<Option<Loaded>>;

    /// Asks the source to refresh an element on its own timeline.
    fn schedule_prefetch(&self, _request: PrefetchRequest) -> Option<Box<dyn PrefetchOrder>> {
        None
    }
}

/// Write-through persistence.
pub trait DataStore: Send + Sync {
    fn store(&self, key: &Bytes, value: Option<&Bytes>) -> Result<()>;
}

/// Decides on each read whether an element is still valid.
///
/// Called on every validity check until the element turns invalid, so it
/// must be idempotent and cheap.
pub trait Invalidator: Send + Sync {
    fn process(&self, element: &Element);
}

// == Store Context ==
/// Collaborators shared by a table and its elements.
#[derive(Clone)]
pub struct StoreContext {
    pub clock: Arc<dyn Clock>,
    pub sizer: Arc<dyn SizeCalculator>,
    pub secondary: Option<Arc<dyn SecondaryStorage>>,
    pub data_source: Option<Arc<dyn DataSource>>,
    pub data_store: Option<Arc<dyn DataStore>>,
    pub invalidator: Option<Arc<dyn Invalidator>>,
}

impl StoreContext {
    /// Context with the given clock, default sizing and no optional collaborators.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sizer: Arc::new(DefaultSizeCalculator::default()),
            secondary: None,
            data_source: None,
            data_store: None,
            invalidator: None,
        }
    }

    pub fn with_sizer(mut self, sizer: Arc<dyn SizeCalculator>) -> Self {
        self.sizer = sizer;
        self
    }

    pub fn with_secondary(mut self, storage: Arc<dyn SecondaryStorage>) -> Self {
        self.secondary = Some(storage);
        self
    }

    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn Invalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub(crate) fn secondary(&self) -> std::result::Result<&Arc<dyn SecondaryStorage>, StorageError> {
        self.secondary.as_ref().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no secondary storage configured",
            ))
        })
    }
}

impl Default for StoreContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("secondary", &self.secondary.is_some())
            .field("data_source", &self.data_source.is_some())
            .field("data_store", &self.data_store.is_some())
            .field("invalidator", &self.invalidator.is_some())
            .finish()
    }
}
