//! Modification Events Module
//!
//! Event kinds, subscriber interest sets and the content projection applied
//! when an element notifies its subscribers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

// == Event Type ==
/// Why an element changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Add = 0,
    Update = 1,
    Remove = 2,
    Evict = 3,
    Expire = 4,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Add,
        EventType::Update,
        EventType::Remove,
        EventType::Evict,
        EventType::Expire,
    ];

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of event types a subscriber cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypes(u8);

impl EventTypes {
    pub const NONE: EventTypes = EventTypes(0);
    pub const ALL: EventTypes = EventTypes(0b1_1111);

    pub fn of(types: &[EventType]) -> Self {
        EventTypes(types.iter().fold(0, |acc, t| acc | t.bit()))
    }

    pub fn contains(self, event: EventType) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn with(self, event: EventType) -> Self {
        EventTypes(self.0 | event.bit())
    }
}

// == Content Flags ==
/// Which parts of an element a subscriber wants in its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFlags(u8);

impl ContentFlags {
    pub const NONE: ContentFlags = ContentFlags(0);
    pub const NEED_KEY: ContentFlags = ContentFlags(0b0001);
    pub const NEED_NEW_VALUE: ContentFlags = ContentFlags(0b0010);
    pub const NEED_PREVIOUS_VALUE: ContentFlags = ContentFlags(0b0100);
    pub const NEED_ALL: ContentFlags = ContentFlags(0b1000);

    pub const fn union(self, other: ContentFlags) -> ContentFlags {
        ContentFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: ContentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ContentFlags {
    type Output = ContentFlags;

    fn bitor(self, rhs: ContentFlags) -> ContentFlags {
        self.union(rhs)
    }
}

// == Projection ==
/// The fields an event carries, resolved from (event type, content flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub key: bool,
    pub new_value: bool,
    pub previous_value: bool,
}

const fn project(event: EventType, flags: u8) -> Projection {
    let flags = ContentFlags(flags);
    // no new value once the element is gone from the table
    let value_gone = matches!(event, EventType::Remove | EventType::Evict);
    if flags.contains(ContentFlags::NEED_ALL) {
        return Projection {
            key: true,
            new_value: !value_gone,
            previous_value: true,
        };
    }
    Projection {
        key: flags.contains(ContentFlags::NEED_KEY),
        new_value: flags.contains(ContentFlags::NEED_NEW_VALUE) && !value_gone,
        previous_value: flags.contains(ContentFlags::NEED_PREVIOUS_VALUE),
    }
}

const fn build_projections() -> [[Projection; 16]; 5] {
    let mut table = [[Projection {
        key: false,
        new_value: false,
        previous_value: false,
    }; 16]; 5];
    let mut e = 0;
    while e < 5 {
        let event = match e {
            0 => EventType::Add,
            1 => EventType::Update,
            2 => EventType::Remove,
            3 => EventType::Evict,
            _ => EventType::Expire,
        };
        let mut f = 0;
        while f < 16 {
            table[e][f] = project(event, f as u8);
            f += 1;
        }
        e += 1;
    }
    table
}

static PROJECTIONS: [[Projection; 16]; 5] = build_projections();

impl Projection {
    /// Looks up what an event of `event` type carries for `flags`.
    pub fn resolve(event: EventType, flags: ContentFlags) -> Projection {
        PROJECTIONS[event as usize][(flags.0 & 0x0f) as usize]
    }
}

// == Modification Event ==
/// One change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationEvent {
    pub event_type: EventType,
    pub key: Option<Bytes>,
    pub new_value: Option<Bytes>,
    pub previous_value: Option<Bytes>,
}

// == Subscriber ==
/// Identity used to deduplicate subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    /// Allocates a process-unique identity.
    pub fn next() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Sync,
    Async,
}

/// Receiver of element change notifications.
pub trait Subscriber: Send + Sync {
    fn notify(&self, events: Vec<ModificationEvent>) -> Result<()>;

    fn notification_mode(&self) -> NotificationMode;

    fn content_flags(&self) -> ContentFlags;

    fn modification_types(&self) -> EventTypes;

    fn identity(&self) -> SubscriberId;
}
