//! Store Module
//!
//! Size-bounded element table: LRU ring, shared budget counters, spill to
//! secondary storage, lazy expiration and per-key change notification.

mod clock;
mod context;
mod counter;
mod element;
mod event;
mod ring;
mod stats;
mod subscriber;
mod table;
mod wire;


// Re-export public types
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use context::{
    DataSource, DataStore, DefaultSizeCalculator, InMemorySecondaryStorage, Invalidator, Loaded,
    PrefetchOrder, PrefetchRequest, SecondaryStorage, SizeCalculator, StorageHandle,
    StoreContext, DEFAULT_ELEMENT_OVERHEAD, DEFAULT_REFERENCE_SIZE,
};
pub use counter::SharedCounter;
pub use element::Element;
pub use event::{
    ContentFlags, EventType, EventTypes, ModificationEvent, NotificationMode, Projection,
    Subscriber, SubscriberId,
};
pub use ring::{LruRing, NodeId, HEADER};
pub use stats::Statistics;
pub use subscriber::{AsyncSubscriber, ChangeListener, ListenerAdapter, SubscriberList};
pub use table::{ElementTable, ElementView, Previous};
