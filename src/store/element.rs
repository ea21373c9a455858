//! Element Module
//!
//! A single cache entry: key, value or secondary-storage reference,
//! timestamps, lazily computed sizes and per-entry subscribers.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tracing::warn;

use super::clock::{Clock, Timestamp};
use super::context::{PrefetchOrder, StorageHandle, StoreContext, DEFAULT_REFERENCE_SIZE};
use super::event::{EventType, ModificationEvent, Projection, Subscriber, SubscriberId};
use super::subscriber::{dispatch, SubscriberList};
use super::wire;
use crate::error::Result;

/// Where the element's value currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Resident(Option<Bytes>),
    Stored(StorageHandle),
}

// == Element ==
pub struct Element {
    key: Bytes,
    payload: Payload,
    created_time: Option<Timestamp>,
    expiration_time: Option<Timestamp>,
    idle_deadline: Option<Timestamp>,
    update_counter: i64,
    key_size: Cell<Option<u64>>,
    value_size: Cell<Option<u64>>,
    size: Cell<Option<u64>>,
    invalid: Cell<bool>,
    subscribers: SubscriberList,
    prefetch: Option<Box<dyn PrefetchOrder>>,
}

impl Element {
    // == Constructor ==
    pub fn new(
        key: Bytes,
        value: Option<Bytes>,
        created_time: Timestamp,
        expiration_time: Option<Timestamp>,
        idle_deadline: Option<Timestamp>,
    ) -> Self {
        Self {
            key,
            payload: Payload::Resident(value),
            created_time: Some(created_time),
            expiration_time,
            idle_deadline,
            update_counter: 0,
            key_size: Cell::new(None),
            value_size: Cell::new(None),
            size: Cell::new(None),
            invalid: Cell::new(false),
            subscribers: SubscriberList::new(),
            prefetch: None,
        }
    }

    // == Accessors ==
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn created_time(&self) -> Option<Timestamp> {
        self.created_time
    }

    pub fn expiration_time(&self) -> Option<Timestamp> {
        self.expiration_time
    }

    pub fn idle_deadline(&self) -> Option<Timestamp> {
        self.idle_deadline
    }

    pub fn update_counter(&self) -> i64 {
        self.update_counter
    }

    pub(crate) fn set_update_counter(&mut self, counter: i64) {
        self.update_counter = counter;
    }

    /// Pushes the idle deadline out to `now + interval`; no-op without an interval.
    pub(crate) fn refresh_idle(&mut self, now: Timestamp, interval: Option<Duration>) {
        if let Some(interval) = interval {
            self.idle_deadline = Some(now + interval);
        }
    }

    /// True when the value lives in secondary storage.
    pub fn is_stored(&self) -> bool {
        matches!(self.payload, Payload::Stored(_))
    }

    #[cfg(test)]
    fn storage_handle(&self) -> Option<StorageHandle> {
        match self.payload {
            Payload::Stored(handle) => Some(handle),
            Payload::Resident(_) => None,
        }
    }

    // == Value ==
    /// Returns the value, reading it from secondary storage when spilled.
    pub fn value(&self, ctx: &StoreContext) -> Result<Option<Bytes>> {
        match &self.payload {
            Payload::Resident(value) => Ok(value.clone()),
            Payload::Stored(handle) => Ok(Some(ctx.secondary()?.get(*handle)?)),
        }
    }

    fn value_or_log(&self, ctx: &StoreContext) -> Option<Bytes> {
        self.value(ctx).unwrap_or_else(|e| {
            warn!(error = %e, "could not resolve value for notification");
            None
        })
    }

    // == Expiration ==
    /// True once `now` is past the expiration time or the idle deadline.
    ///
    /// The clock is only read when one of them is set.
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        if self.expiration_time.is_none() && self.idle_deadline.is_none() {
            return false;
        }
        let now = clock.now();
        self.expiration_time.map_or(false, |t| now > t)
            || self.idle_deadline.map_or(false, |t| now > t)
    }

    // == Validity ==
    /// Consults the invalidator until the element turns invalid; sticky after that.
    pub fn is_invalid(&self, ctx: &StoreContext) -> bool {
        if self.invalid.get() {
            return true;
        }
        if let Some(invalidator) = &ctx.invalidator {
            invalidator.process(self);
        }
        self.invalid.get()
    }

    pub fn invalidate(&self) {
        self.invalid.set(true);
    }

    /// Expired or invalid: either way the element must go.
    pub(crate) fn is_stale(&self, ctx: &StoreContext) -> bool {
        self.is_expired(ctx.clock.as_ref()) || self.is_invalid(ctx)
    }

    // == Sizes ==
    pub fn key_size_bytes(&self, ctx: &StoreContext) -> u64 {
        memo(&self.key_size, || ctx.sizer.size_of(Some(self.key.as_ref())))
    }

    /// Real value size, or the storage reference cost while spilled.
    pub fn value_size_bytes(&self, ctx: &StoreContext) -> u64 {
        memo(&self.value_size, || match &self.payload {
            Payload::Resident(value) => ctx.sizer.size_of(value.as_deref()),
            Payload::Stored(_) => ctx
                .secondary
                .as_ref()
                .map_or(DEFAULT_REFERENCE_SIZE, |s| s.reference_size()),
        })
    }

    pub fn size_bytes(&self, ctx: &StoreContext) -> u64 {
        memo(&self.size, || {
            ctx.sizer
                .sum(&[self.key_size_bytes(ctx), self.value_size_bytes(ctx)])
        })
    }

    fn reset_value_sizes(&self) {
        self.value_size.set(None);
        self.size.set(None);
    }

    /// Forgets every cached size so the next read recomputes with a new context.
    pub(crate) fn reset_sizes(&self) {
        self.key_size.set(None);
        self.reset_value_sizes();
    }

    // == Secondary Storage ==
    /// Spills the value to secondary storage.
    ///
    /// Returns `Ok(false)` when there is nothing to spill (already stored or a
    /// null value) or when the engine declines the value.
    pub fn store(&mut self, ctx: &StoreContext) -> Result<bool> {
        let value = match &self.payload {
            Payload::Resident(Some(value)) => value,
            Payload::Resident(None) | Payload::Stored(_) => return Ok(false),
        };
        match ctx.secondary()?.put(&self.key, value)? {
            Some(handle) => {
                self.payload = Payload::Stored(handle);
                self.reset_value_sizes();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Brings a spilled value back into memory and frees its storage.
    ///
    /// Returns the element's size either way.
    pub fn load(&mut self, ctx: &StoreContext) -> Result<u64> {
        if let Payload::Stored(handle) = self.payload {
            let storage = ctx.secondary()?;
            let value = storage.get(handle)?;
            storage.remove(handle)?;
            self.payload = Payload::Resident(Some(value));
            self.reset_value_sizes();
        }
        Ok(self.size_bytes(ctx))
    }

    /// Frees the spilled value without restoring it.
    pub fn discard(&mut self, ctx: &StoreContext) -> Result<()> {
        if let Payload::Stored(handle) = self.payload {
            ctx.secondary()?.remove(handle)?;
            self.payload = Payload::Resident(None);
            self.reset_value_sizes();
        }
        Ok(())
    }

    // == Prefetch ==
    pub(crate) fn set_prefetch(&mut self, order: Option<Box<dyn PrefetchOrder>>) {
        self.prefetch = order;
    }

    #[cfg(test)]
    fn has_prefetch(&self) -> bool {
        self.prefetch.is_some()
    }

    /// Cancels any in-flight refill so it cannot land after a replace or remove.
    pub fn cancel_prefetch(&mut self) {
        if let Some(order) = self.prefetch.take() {
            order.cancel();
        }
    }

    // == Subscribers ==
    pub fn add_event_subscriber(&mut self, subscriber: Arc<dyn Subscriber>) -> bool {
        self.subscribers.add(subscriber)
    }

    pub fn remove_entry_modified_subscriber(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(id)
    }

    /// Moves this element's subscribers onto `to`.
    pub fn transfer_entry_modified_subscribers(&mut self, to: &mut Element) {
        self.subscribers.transfer_to(&mut to.subscribers);
    }

    pub fn subscribers(&self) -> &SubscriberList {
        &self.subscribers
    }

    /// Sends one single-event batch to every subscriber interested in `event`.
    pub fn notify_modification_subscribers(
        &self,
        previous: Option<&Element>,
        event: EventType,
        ctx: &StoreContext,
    ) {
        for subscriber in self.subscribers.iter() {
            if !subscriber.modification_types().contains(event) {
                continue;
            }
            let projection = Projection::resolve(event, subscriber.content_flags());
            let payload = ModificationEvent {
                event_type: event,
                key: projection.key.then(|| self.key.clone()),
                new_value: if projection.new_value {
                    self.value_or_log(ctx)
                } else {
                    None
                },
                previous_value: match previous {
                    Some(prev) if projection.previous_value => prev.value_or_log(ctx),
                    _ => None,
                },
            };
            dispatch(subscriber, vec![payload]);
        }
    }

    // == Wire ==
    /// Writes the element block. Spilled values are inlined.
    pub fn write_wire(&self, buf: &mut impl BufMut, ctx: &StoreContext) -> io::Result<()> {
        let stored = self.is_stored();
        let key_size = self.key_size.get();
        // spilled sizes describe the reference, not the inlined value
        let value_size = if stored { None } else { self.value_size.get() };
        let size = if stored { None } else { self.size.get() };

        wire::put_bool(buf, self.invalid.get());
        wire::put_bool(buf, key_size.is_some());
        wire::put_bool(buf, value_size.is_some());
        wire::put_bool(buf, size.is_some());
        buf.put_i64(self.update_counter);
        buf.put_i64(key_size.unwrap_or(0) as i64);
        buf.put_i64(value_size.unwrap_or(0) as i64);
        buf.put_i64(size.unwrap_or(0) as i64);
        wire::put_duration(buf, self.idle_deadline);
        wire::put_duration(buf, self.created_time);
        wire::put_duration(buf, self.expiration_time);
        wire::put_binary(buf, Some(self.key.as_ref()))?;

        let value = self
            .value(ctx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        wire::put_binary(buf, value.as_deref())
    }

    /// Writes the placeholder block standing in for the ring header.
    pub(crate) fn write_header_wire(buf: &mut impl BufMut) -> io::Result<()> {
        for _ in 0..4 {
            wire::put_bool(buf, false);
        }
        for _ in 0..4 {
            buf.put_i64(0);
        }
        for _ in 0..3 {
            wire::put_duration(buf, None);
        }
        wire::put_binary(buf, Some(b"".as_slice()))?;
        wire::put_binary(buf, None)
    }

    pub fn read_wire(buf: &mut impl Buf) -> io::Result<Element> {
        let invalid = wire::get_bool(buf)?;
        let has_key_size = wire::get_bool(buf)?;
        let has_value_size = wire::get_bool(buf)?;
        let has_size = wire::get_bool(buf)?;
        let update_counter = wire::get_i64(buf)?;
        let key_size = read_size(buf, has_key_size)?;
        let value_size = read_size(buf, has_value_size)?;
        let size = read_size(buf, has_size)?;
        let idle_deadline = wire::get_duration(buf)?;
        let created_time = wire::get_duration(buf)?;
        let expiration_time = wire::get_duration(buf)?;
        let key = wire::get_binary(buf)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "null element key"))?;
        let value = wire::get_binary(buf)?;

        Ok(Element {
            key,
            payload: Payload::Resident(value),
            created_time,
            expiration_time,
            idle_deadline,
            update_counter,
            key_size: Cell::new(key_size),
            value_size: Cell::new(value_size),
            size: Cell::new(size),
            invalid: Cell::new(invalid),
            subscribers: SubscriberList::new(),
            prefetch: None,
        })
    }
}

/// Reads a size field; only a flagged size has to be non-negative.
fn read_size(buf: &mut impl Buf, present: bool) -> io::Result<Option<u64>> {
    let raw = wire::get_i64(buf)?;
    if !present {
        return Ok(None);
    }
    u64::try_from(raw)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("negative size {}", raw)))
}

fn memo(cell: &Cell<Option<u64>>, compute: impl FnOnce() -> u64) -> u64 {
    match cell.get() {
        Some(size) => size,
        None => {
            let size = compute();
            cell.set(Some(size));
            size
        }
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("created_time", &self.created_time)
            .field("expiration_time", &self.expiration_time)
            .field("idle_deadline", &self.idle_deadline)
            .field("update_counter", &self.update_counter)
            .field("invalid", &self.invalid.get())
            .field("subscribers", &self.subscribers)
            .field("prefetch", &self.prefetch.is_some())
            .finish()
    }
}
