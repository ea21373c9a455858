//! Element Table Module
//!
//! Hash index plus LRU ring over [`Element`]s, with shared budget counters,
//! spill to secondary storage, lazy expiration and change notification.
//!
//! The table is not internally synchronized. Every table attached to the same
//! pair of counters must be driven from one exclusion domain.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::clock::Timestamp;
use super::context::{PrefetchRequest, StoreContext};
use super::counter::SharedCounter;
use super::element::Element;
use super::event::{EventType, Subscriber, SubscriberId};
use super::ring::{LruRing, NodeId, HEADER};
use super::stats::Statistics;
use super::subscriber::{AsyncSubscriber, SubscriberList};
use super::wire;
use crate::config::Config;
use crate::error::{CacheError, Result};

// == Results ==
/// What a key held before a remove, replace or conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Previous {
    /// Nothing was there, or the conditional operation did not apply
    Absent,
    /// A mapping existed; its value may itself be null
    Present(Option<Bytes>),
}

impl Previous {
    pub fn is_present(&self) -> bool {
        matches!(self, Previous::Present(_))
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Previous::Present(value) => value,
            Previous::Absent => None,
        }
    }
}

/// Read-only snapshot of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementView {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub created_time: Option<Timestamp>,
    pub expiration_time: Option<Timestamp>,
    pub update_counter: i64,
}

struct PutOutcome {
    previous: Option<Bytes>,
    view: ElementView,
}

// == Element Table ==
#[derive(Debug)]
pub struct ElementTable {
    index: HashMap<Bytes, NodeId>,
    ring: LruRing<Element>,
    element_counter: Option<Arc<SharedCounter>>,
    byte_counter: Option<Arc<SharedCounter>>,
    expiration_interval: Option<Duration>,
    idle_interval: Option<Duration>,
    update_subscribers: HashMap<Bytes, SubscriberList>,
    statistics: Statistics,
    ctx: StoreContext,
}

impl ElementTable {
    // == Constructors ==
    /// Creates an empty table using the configured default intervals.
    pub fn new(config: &Config, ctx: StoreContext) -> Self {
        Self::with_intervals(config.expiration_interval, config.idle_interval, ctx)
    }

    pub fn with_intervals(
        expiration_interval: Option<Duration>,
        idle_interval: Option<Duration>,
        ctx: StoreContext,
    ) -> Self {
        Self {
            index: HashMap::new(),
            ring: LruRing::new(),
            element_counter: None,
            byte_counter: None,
            expiration_interval,
            idle_interval,
            update_subscribers: HashMap::new(),
            statistics: Statistics::new(),
            ctx,
        }
    }

    // == Accessors ==
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn expiration_interval(&self) -> Option<Duration> {
        self.expiration_interval
    }

    pub fn idle_interval(&self) -> Option<Duration> {
        self.idle_interval
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Peeks at an element without touching recency, expiry or statistics.
    pub fn element(&self, key: &[u8]) -> Option<&Element> {
        self.index.get(key).and_then(|&id| self.ring.get(id))
    }

    /// Sum of every element's size, spilled ones at their reference cost.
    pub fn byte_size(&self) -> u64 {
        self.index
            .values()
            .filter_map(|&id| self.ring.get(id))
            .map(|el| el.size_bytes(&self.ctx))
            .sum()
    }

    /// Keys from least to most recently used, without side effects.
    pub fn lru_keys(&self) -> Vec<Bytes> {
        self.ring
            .ids()
            .into_iter()
            .filter_map(|id| self.ring.get(id))
            .map(|el| el.key().clone())
            .collect()
    }

    // == Counters ==
    /// Attaches the partition's budget counters, adding this table's totals.
    pub fn attach_counters(&mut self, elements: Arc<SharedCounter>, bytes: Arc<SharedCounter>) {
        self.detach_counters();
        elements.add(self.index.len() as i64);
        bytes.add(self.byte_size() as i64);
        self.element_counter = Some(elements);
        self.byte_counter = Some(bytes);
    }

    /// Detaches the counters, subtracting exactly what attaching added.
    pub fn detach_counters(&mut self) {
        if let Some(elements) = self.element_counter.take() {
            elements.subtract(self.index.len() as i64);
        }
        if let Some(bytes) = self.byte_counter.take() {
            bytes.subtract(self.byte_size() as i64);
        }
    }

    pub fn element_counter(&self) -> Option<&Arc<SharedCounter>> {
        self.element_counter.as_ref()
    }

    pub fn byte_counter(&self) -> Option<&Arc<SharedCounter>> {
        self.byte_counter.as_ref()
    }

    fn add_elements(&self, delta: i64) {
        if let Some(counter) = &self.element_counter {
            counter.add(delta);
        }
    }

    fn add_bytes(&self, delta: i64) {
        if let Some(counter) = &self.byte_counter {
            counter.add(delta);
        }
    }

    // == Get ==
    /// Reads a key, refilling from the data source on a miss.
    ///
    /// A live element is restored from secondary storage when the byte budget
    /// has room, gets its idle deadline refreshed and becomes most recently
    /// used. Expired or invalid elements are removed with an `Expire` event
    /// and the read is treated as a miss.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<ElementView>> {
        if let Some(id) = self.index.get(key).copied() {
            if !self.is_stale(id) {
                self.restore_if_room(id)?;
                let now = self.ctx.clock.now();
                let idle = self.idle_interval;
                if let Some(el) = self.ring.get_mut(id) {
                    el.refresh_idle(now, idle);
                }
                self.statistics.record_read_hit();
                self.ring.touch(id);
                return self.view(id).map(Some);
            }
            self.remove_node(id, Some(EventType::Expire), false)?;
        }
        self.statistics.record_read_miss();
        self.fill_from_source(key)
    }

    fn fill_from_source(&mut self, key: &[u8]) -> Result<Option<ElementView>> {
        let Some(source) = self.ctx.data_source.clone() else {
            return Ok(None);
        };
        let key = Bytes::copy_from_slice(key);
        match source.get(&key)? {
            Some(loaded) => {
                let outcome =
                    self.put_inner(key, loaded.value, None, false, Some(loaded.time_to_read))?;
                Ok(Some(outcome.view))
            }
            None => Ok(None),
        }
    }

    fn restore_if_room(&mut self, id: NodeId) -> Result<()> {
        let has_room = self
            .byte_counter
            .as_ref()
            .map_or(true, |c| c.is_unlimited_size() || c.value() < c.max_value());
        if !has_room {
            return Ok(());
        }
        let Some(el) = self.ring.get_mut(id) else {
            return Ok(());
        };
        if !el.is_stored() {
            return Ok(());
        }
        let before = el.size_bytes(&self.ctx) as i64;
        let after = el.load(&self.ctx)? as i64;
        debug!(key = ?el.key(), "restored element from secondary storage");
        self.statistics.record_restored();
        self.add_bytes(after - before);
        Ok(())
    }

    fn is_stale(&self, id: NodeId) -> bool {
        self.ring.get(id).map_or(true, |el| el.is_stale(&self.ctx))
    }

    fn view(&self, id: NodeId) -> Result<ElementView> {
        let el = self
            .ring
            .get(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "dangling index entry"))?;
        Ok(ElementView {
            key: el.key().clone(),
            value: el.value(&self.ctx)?,
            created_time: el.created_time(),
            expiration_time: el.expiration_time(),
            update_counter: el.update_counter(),
        })
    }

    // == Put ==
    /// Writes a brand-new element for `key`, replacing any previous one.
    ///
    /// `expiration_time` defaults to now plus the table's expiration interval.
    /// Returns the replaced value only when `return_replaced` is set and the
    /// previous element had not expired.
    pub fn put(
        &mut self,
        key: Bytes,
        value: Option<Bytes>,
        expiration_time: Option<Timestamp>,
        return_replaced: bool,
        time_to_read: Option<Duration>,
    ) -> Result<Option<Bytes>> {
        self.put_inner(key, value, expiration_time, return_replaced, time_to_read)
            .map(|outcome| outcome.previous)
    }

    fn put_inner(
        &mut self,
        key: Bytes,
        value: Option<Bytes>,
        expiration_time: Option<Timestamp>,
        return_replaced: bool,
        time_to_read: Option<Duration>,
    ) -> Result<PutOutcome> {
        let now = self.ctx.clock.now();
        let expiration = expiration_time.or_else(|| self.expiration_interval.map(|i| now + i));
        let idle_deadline = self.idle_interval.map(|i| now + i);
        let mut element = Element::new(key.clone(), value, now, expiration, idle_deadline);

        let previous_id = self.index.get(&key).copied();
        let mut replaced = None;
        let mut old_size = 0;
        if let Some(old) = previous_id.and_then(|id| self.ring.get(id)) {
            old_size = old.size_bytes(&self.ctx) as i64;
            // read before anything changes so a storage failure leaves the table intact
            if return_replaced && !old.is_expired(self.ctx.clock.as_ref()) {
                replaced = old.value(&self.ctx)?;
            }
        }
        self.add_bytes(element.size_bytes(&self.ctx) as i64 - old_size);

        match previous_id.and_then(|id| self.ring.remove(id)) {
            None => {
                self.add_elements(1);
                self.statistics.record_write_miss();
                if let Some(registered) = self.update_subscribers.get(&key) {
                    for subscriber in registered.iter() {
                        element.add_event_subscriber(Arc::clone(subscriber));
                    }
                }
                element.notify_modification_subscribers(None, EventType::Add, &self.ctx);
            }
            Some(mut old) => {
                old.cancel_prefetch();
                self.statistics.record_write_hit();
                element.set_update_counter(old.update_counter() + 1);
                old.transfer_entry_modified_subscribers(&mut element);
                element.notify_modification_subscribers(Some(&old), EventType::Update, &self.ctx);
                self.discard_spilled(&mut old);
            }
        }

        if let Some(source) = &self.ctx.data_source {
            let order = source.schedule_prefetch(PrefetchRequest {
                key: key.clone(),
                update_counter: element.update_counter(),
                expiration_time: element.expiration_time(),
                idle_deadline: element.idle_deadline(),
                last_read_cost: time_to_read,
            });
            element.set_prefetch(order);
        }

        let view = ElementView {
            key: key.clone(),
            value: element.value(&self.ctx)?,
            created_time: element.created_time(),
            expiration_time: element.expiration_time(),
            update_counter: element.update_counter(),
        };
        let id = self.ring.insert(element);
        self.ring.link_mru(id);
        self.index.insert(key.clone(), id);

        let persisted = match &self.ctx.data_store {
            Some(store) => store.store(&key, view.value.as_ref()),
            None => Ok(()),
        };
        if let Err(e) = &persisted {
            warn!(key = ?key, error = %e, "write-through store failed");
        }

        self.guard_elements()?;
        self.guard_bytes()?;
        persisted?;

        Ok(PutOutcome {
            previous: replaced,
            view,
        })
    }

    fn discard_spilled(&mut self, el: &mut Element) {
        if !el.is_stored() {
            return;
        }
        self.statistics.record_restored();
        if let Err(e) = el.discard(&self.ctx) {
            warn!(key = ?el.key(), error = %e, "could not free spilled value");
        }
    }

    // == Conditional Writes ==
    /// Writes only if the key's update counter still equals `expected_counter`.
    ///
    /// Returns `Previous::Absent` without touching anything when the key is
    /// missing or has been rewritten since the counter was captured.
    pub fn update(
        &mut self,
        key: Bytes,
        value: Option<Bytes>,
        time_to_read: Option<Duration>,
        expected_counter: i64,
    ) -> Result<Previous> {
        match self.element(&key) {
            Some(el) if el.update_counter() == expected_counter => {}
            _ => return Ok(Previous::Absent),
        }
        let previous = self.put(key, value, None, true, time_to_read)?;
        Ok(Previous::Present(previous))
    }

    /// Replaces the value of a live mapping.
    pub fn replace(&mut self, key: Bytes, value: Option<Bytes>) -> Result<Previous> {
        if self.live_id(&key)?.is_none() {
            return Ok(Previous::Absent);
        }
        let previous = self.put(key, value, None, true, None)?;
        Ok(Previous::Present(previous))
    }

    /// Replaces the value only if the live mapping currently holds `expected`.
    pub fn replace_if(
        &mut self,
        key: Bytes,
        expected: Option<&[u8]>,
        value: Option<Bytes>,
    ) -> Result<bool> {
        let Some(id) = self.live_id(&key)? else {
            return Ok(false);
        };
        if self.view(id)?.value.as_deref() != expected {
            return Ok(false);
        }
        self.put(key, value, None, false, None)?;
        Ok(true)
    }

    // == Remove ==
    /// Removes the key unconditionally.
    pub fn remove(&mut self, key: &[u8]) -> Result<Previous> {
        match self.index.get(key).copied() {
            Some(id) => Ok(Previous::Present(self.remove_node(
                id,
                Some(EventType::Remove),
                true,
            )?)),
            None => Ok(Previous::Absent),
        }
    }

    /// Removes the key only if its live mapping holds `expected`.
    pub fn remove_if(&mut self, key: &[u8], expected: Option<&[u8]>) -> Result<bool> {
        let Some(id) = self.live_id(key)? else {
            return Ok(false);
        };
        if self.view(id)?.value.as_deref() != expected {
            return Ok(false);
        }
        self.remove_node(id, Some(EventType::Remove), false)?;
        Ok(true)
    }

    /// Unlinks and destroys one element, keeping counters and storage in step.
    ///
    /// `event` is `None` when subscribers must not hear about it. The value is
    /// resolved before spilled storage is freed when `want_value` is set.
    fn remove_node(
        &mut self,
        id: NodeId,
        event: Option<EventType>,
        want_value: bool,
    ) -> Result<Option<Bytes>> {
        let Some(mut el) = self.ring.remove(id) else {
            return Ok(None);
        };
        if self.index.get(el.key()) == Some(&id) {
            self.index.remove(el.key());
        }
        el.cancel_prefetch();
        self.add_elements(-1);
        self.add_bytes(-(el.size_bytes(&self.ctx) as i64));

        if let Some(event) = event {
            el.notify_modification_subscribers(Some(&el), event, &self.ctx);
        }
        let value = if want_value {
            el.value(&self.ctx)
        } else {
            Ok(None)
        };
        self.discard_spilled(&mut el);
        value
    }

    /// Live element id for `key`, dropping it first if it has gone stale.
    fn live_id(&mut self, key: &[u8]) -> Result<Option<NodeId>> {
        let Some(id) = self.index.get(key).copied() else {
            return Ok(None);
        };
        if self.is_stale(id) {
            self.remove_node(id, Some(EventType::Expire), false)?;
            return Ok(None);
        }
        Ok(Some(id))
    }

    // == Guards ==
    /// Evicts the single least recently used element when over the element budget.
    fn guard_elements(&mut self) -> Result<()> {
        let over = match &self.element_counter {
            Some(counter) if !counter.is_unlimited_size() => {
                self.index.len() as i64 > counter.max_value()
            }
            _ => false,
        };
        if !over {
            return Ok(());
        }
        if let Some(id) = self.ring.lru() {
            debug!(elements = self.index.len(), "element budget exceeded, evicting");
            self.remove_node(id, Some(EventType::Evict), false)?;
        }
        Ok(())
    }

    /// Brings the byte counter back under budget.
    ///
    /// First walks from the LRU end dropping stale elements and spilling live
    /// ones, stopping at the first spill the secondary storage refuses or
    /// fails. Then evicts from the LRU end until under budget.
    fn guard_bytes(&mut self) -> Result<()> {
        let Some(counter) = self.byte_counter.clone() else {
            return Ok(());
        };
        if !counter.is_over_limit() {
            return Ok(());
        }

        if self.ctx.secondary.is_some() {
            let mut cursor = self.ring.lru();
            while let Some(id) = cursor {
                if !counter.is_over_limit() {
                    break;
                }
                cursor = self.ring.after(id).filter(|&next| next != HEADER);
                if self.is_stale(id) {
                    self.remove_node(id, Some(EventType::Expire), false)?;
                    continue;
                }
                let Some(el) = self.ring.get_mut(id) else {
                    continue;
                };
                if el.is_stored() {
                    continue;
                }
                let before = el.size_bytes(&self.ctx);
                match el.store(&self.ctx) {
                    Ok(true) => {
                        let freed = before as i64 - el.size_bytes(&self.ctx) as i64;
                        counter.subtract(freed);
                        self.statistics.record_stored();
                        debug!(key = ?el.key(), freed, "spilled element");
                    }
                    // null values have nothing to spill
                    Ok(false) if el.value(&self.ctx).map_or(false, |v| v.is_none()) => {}
                    Ok(false) => {
                        debug!("secondary storage declined, stopping compaction");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "secondary storage failed, stopping compaction");
                        break;
                    }
                }
            }
        }

        while counter.is_over_limit() {
            let Some(id) = self.ring.lru() else {
                break;
            };
            debug!(bytes = counter.value(), max = counter.max_value(), "byte budget exceeded, evicting");
            self.remove_node(id, Some(EventType::Evict), false)?;
        }
        Ok(())
    }

    // == Bulk Reads ==
    /// Drops stale elements and refreshes idle deadlines of the survivors.
    ///
    /// Returns the surviving ids from least to most recently used.
    fn sweep(&mut self) -> Result<Vec<NodeId>> {
        let now = self.ctx.clock.now();
        let mut live = Vec::with_capacity(self.index.len());
        for id in self.ring.ids() {
            if self.is_stale(id) {
                self.remove_node(id, Some(EventType::Expire), false)?;
                continue;
            }
            if let Some(el) = self.ring.get_mut(id) {
                el.refresh_idle(now, self.idle_interval);
            }
            live.push(id);
        }
        Ok(live)
    }

    /// Removes every stale element, returning how many went.
    pub fn purge_expired(&mut self) -> Result<usize> {
        let before = self.index.len();
        self.sweep()?;
        Ok(before - self.index.len())
    }

    pub fn contains_key(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.live_id(key)?.is_some())
    }

    pub fn contains_value(&mut self, value: Option<&[u8]>) -> Result<bool> {
        for id in self.sweep()? {
            if self.view(id)?.value.as_deref() == value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Live keys, least recently used first.
    pub fn key_set(&mut self) -> Result<Vec<Bytes>> {
        let ids = self.sweep()?;
        Ok(ids
            .into_iter()
            .filter_map(|id| self.ring.get(id))
            .map(|el| el.key().clone())
            .collect())
    }

    /// Live values, least recently used first.
    pub fn values(&mut self) -> Result<Vec<Option<Bytes>>> {
        Ok(self.entry_set()?.into_iter().map(|(_, v)| v).collect())
    }

    /// Live key/value pairs, least recently used first.
    pub fn entry_set(&mut self) -> Result<Vec<(Bytes, Option<Bytes>)>> {
        self.sweep()?
            .into_iter()
            .map(|id| self.view(id).map(|view| (view.key, view.value)))
            .collect()
    }

    // == Bulk Writes ==
    /// Removes every element whose key is not in `keys`.
    pub fn retain_all(&mut self, keys: &HashSet<Bytes>) -> Result<bool> {
        if keys.is_empty() {
            let changed = !self.index.is_empty();
            self.clear();
            return Ok(changed);
        }
        let doomed: Vec<NodeId> = self
            .index
            .iter()
            .filter(|(key, _)| !keys.contains(*key))
            .map(|(_, &id)| id)
            .collect();
        for &id in &doomed {
            self.remove_node(id, Some(EventType::Remove), false)?;
        }
        Ok(!doomed.is_empty())
    }

    /// Drops every element and resets statistics.
    ///
    /// The shared counters lose exactly this table's totals; key-level
    /// subscriptions survive.
    pub fn clear(&mut self) {
        let count = self.index.len() as i64;
        let bytes = self.byte_size() as i64;
        let ids: Vec<NodeId> = self.index.values().copied().collect();
        for id in ids {
            if let Some(mut el) = self.ring.remove(id) {
                el.cancel_prefetch();
                self.discard_spilled(&mut el);
            }
        }
        self.index.clear();
        self.ring.clear();
        self.statistics.reset();
        self.add_elements(-count);
        self.add_bytes(-bytes);
    }

    /// Moves every element into `other` without notifying anyone.
    ///
    /// Elements keep their spilled state, deadlines and subscribers, and are
    /// re-sized with `other`'s context. Both tables' secondary storage must be
    /// the same engine. `other`'s guards run once afterwards.
    pub fn transfer_to(&mut self, other: &mut ElementTable) -> Result<()> {
        for id in self.ring.ids() {
            let Some(mut el) = self.ring.remove(id) else {
                continue;
            };
            self.index.remove(el.key());
            self.add_elements(-1);
            self.add_bytes(-(el.size_bytes(&self.ctx) as i64));
            el.cancel_prefetch();
            if el.is_stored() {
                self.statistics.record_restored();
                other.statistics.record_stored();
            }

            if let Some(existing) = other.index.get(el.key()).copied() {
                other.remove_node(existing, None, false)?;
            }
            el.reset_sizes();
            other.add_elements(1);
            other.add_bytes(el.size_bytes(&other.ctx) as i64);
            let key = el.key().clone();
            let new_id = other.ring.insert(el);
            other.ring.link_mru(new_id);
            other.index.insert(key, new_id);
        }
        other.guard_elements()?;
        other.guard_bytes()
    }

    // == Subscribers ==
    /// Registers a key-level subscriber, attaching it to the live element too.
    ///
    /// A subscriber asking for asynchronous delivery is wrapped in an
    /// [`AsyncSubscriber`] on the current tokio runtime. Returns false if a
    /// subscriber with the same identity was already registered.
    pub fn add_event_subscriber(&mut self, key: Bytes, subscriber: Arc<dyn Subscriber>) -> bool {
        let subscriber = AsyncSubscriber::wrap_for_current_runtime(subscriber);
        if let Some(el) = self.index.get(&key).and_then(|&id| self.ring.get_mut(id)) {
            el.add_event_subscriber(Arc::clone(&subscriber));
        }
        self.update_subscribers
            .entry(key)
            .or_default()
            .add(subscriber)
    }

    /// Unregisters `id` from every key in `keys`.
    ///
    /// Fails with `NotSubscribed` only if nothing matched on any key.
    pub fn remove_event_subscriber(&mut self, keys: &[Bytes], id: SubscriberId) -> Result<()> {
        let mut matched = 0;
        for key in keys {
            if let Some(registered) = self.update_subscribers.get_mut(key) {
                if registered.remove(id) {
                    matched += 1;
                }
                if registered.is_empty() {
                    self.update_subscribers.remove(key);
                }
            }
            if let Some(el) = self.index.get(key).and_then(|&nid| self.ring.get_mut(nid)) {
                if el.remove_entry_modified_subscriber(id) {
                    matched += 1;
                }
            }
        }
        if matched == 0 {
            return Err(CacheError::NotSubscribed(id));
        }
        Ok(())
    }

    // == Wire ==
    /// Writes the whole table: intervals, statistics, header block, then
    /// elements from least to most recently used.
    pub fn write_wire(&self, buf: &mut impl BufMut) -> Result<()> {
        wire::put_duration(buf, self.expiration_interval);
        wire::put_duration(buf, self.idle_interval);
        self.statistics.write_wire(buf);
        Element::write_header_wire(buf)?;

        let ids = self.ring.ids();
        let count = u32::try_from(ids.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "too many elements to encode")
        })?;
        buf.put_u32(count);
        for id in ids {
            if let Some(el) = self.ring.get(id) {
                el.write_wire(buf, &self.ctx)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.write_wire(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Rebuilds a table from its wire form. Counters are left detached.
    pub fn read_wire(buf: &mut impl Buf, ctx: StoreContext) -> Result<ElementTable> {
        let expiration_interval = wire::get_duration(buf)?;
        let idle_interval = wire::get_duration(buf)?;
        let statistics = Statistics::read_wire(buf)?;
        Element::read_wire(buf)?;
        let count = wire::get_u32(buf)?;

        let mut table = ElementTable::with_intervals(expiration_interval, idle_interval, ctx);
        table.statistics = statistics;
        for _ in 0..count {
            let el = Element::read_wire(buf)?;
            let key = el.key().clone();
            if table.index.contains_key(&key) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("duplicate key {:?} in snapshot", key),
                )
                .into());
            }
            let id = table.ring.insert(el);
            table.ring.link_mru(id);
            table.index.insert(key, id);
        }
        Ok(table)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::ManualClock;
    use crate::error::StorageError;
    use crate::store::context::{
        DataSource, DataStore, DefaultSizeCalculator, InMemorySecondaryStorage, Invalidator,
        Loaded, PrefetchOrder, SecondaryStorage, StorageHandle,
    };
    use crate::store::event::{
        ContentFlags, EventTypes, ModificationEvent, NotificationMode,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread::{self, ThreadId};

    const START: Duration = Duration::from_secs(1_000);

    struct Harness {
        clock: Arc<ManualClock>,
        storage: Arc<InMemorySecondaryStorage>,
        elements: Arc<SharedCounter>,
        bytes: Arc<SharedCounter>,
    }

    impl Harness {
        fn new(max_elements: i64, max_bytes: i64, spill_capacity: u64) -> Self {
            Self {
                clock: Arc::new(ManualClock::new(START)),
                storage: Arc::new(InMemorySecondaryStorage::with_reference_size(
                    spill_capacity,
                    1,
                )),
                elements: Arc::new(SharedCounter::new(max_elements)),
                bytes: Arc::new(SharedCounter::new(max_bytes)),
            }
        }

        fn ctx(&self) -> StoreContext {
            StoreContext::new(self.clock.clone())
                .with_sizer(Arc::new(DefaultSizeCalculator {
                    element_overhead: 0,
                }))
                .with_secondary(self.storage.clone())
        }

        fn table(&self) -> ElementTable {
            self.table_with(self.ctx())
        }

        fn table_with(&self, ctx: StoreContext) -> ElementTable {
            let mut table = ElementTable::with_intervals(None, None, ctx);
            table.attach_counters(self.elements.clone(), self.bytes.clone());
            table
        }
    }

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn put(table: &mut ElementTable, key: &'static str, value: &'static str) {
        table.put(b(key), Some(b(value)), None, false, None).unwrap();
    }

    struct Recorder {
        id: SubscriberId,
        seen: Mutex<Vec<ModificationEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId::next(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn types(&self) -> Vec<EventType> {
            self.seen.lock().iter().map(|e| e.event_type).collect()
        }
    }

    impl Subscriber for Recorder {
        fn notify(&self, events: Vec<ModificationEvent>) -> Result<()> {
            assert_eq!(events.len(), 1);
            self.seen.lock().extend(events);
            Ok(())
        }
        fn notification_mode(&self) -> NotificationMode {
            NotificationMode::Sync
        }
        fn content_flags(&self) -> ContentFlags {
            ContentFlags::NEED_ALL
        }
        fn modification_types(&self) -> EventTypes {
            EventTypes::ALL
        }
        fn identity(&self) -> SubscriberId {
            self.id
        }
    }

    #[test]
    fn test_put_and_get() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "key1", "value1");

        let view = table.get(b"key1").unwrap().unwrap();
        assert_eq!(view.value, Some(b("value1")));
        assert_eq!(view.created_time, Some(START));
        assert_eq!(view.update_counter, 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.statistics().read_hits, 1);
        assert_eq!(table.statistics().write_misses, 1);
    }

    #[test]
    fn test_get_missing_records_miss() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        assert!(table.get(b"nope").unwrap().is_none());
        assert_eq!(table.statistics().read_misses, 1);
    }

    #[test]
    fn test_overwrite_bumps_counter_and_returns_previous() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "k", "one");
        let previous = table.put(b("k"), Some(b("two")), None, true, None).unwrap();
        assert_eq!(previous, Some(b("one")));

        let previous = table.put(b("k"), Some(b("three")), None, false, None).unwrap();
        assert_eq!(previous, None);

        assert_eq!(table.element(b"k").unwrap().update_counter(), 2);
        assert_eq!(table.statistics().write_hits, 2);
        assert_eq!(h.elements.value(), 1);
        assert_eq!(h.bytes.value(), 1 + 5);
    }

    #[test]
    fn test_put_returns_nothing_for_expired_previous() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        table
            .put(b("k"), Some(b("old")), Some(START + Duration::from_secs(1)), false, None)
            .unwrap();
        h.clock.advance(Duration::from_secs(2));
        let previous = table.put(b("k"), Some(b("new")), None, true, None).unwrap();
        assert_eq!(previous, None);
    }

    #[test]
    fn test_default_intervals_applied() {
        let h = Harness::new(0, 0, 0);
        let mut table = ElementTable::with_intervals(
            Some(Duration::from_secs(60)),
            Some(Duration::from_secs(10)),
            h.ctx(),
        );
        put(&mut table, "k", "v");
        let el = table.element(b"k").unwrap();
        assert_eq!(el.expiration_time(), Some(START + Duration::from_secs(60)));
        assert_eq!(el.idle_deadline(), Some(START + Duration::from_secs(10)));

        h.clock.advance(Duration::from_secs(5));
        table.get(b"k").unwrap().unwrap();
        assert_eq!(
            table.element(b"k").unwrap().idle_deadline(),
            Some(START + Duration::from_secs(15))
        );

        h.clock.advance(Duration::from_secs(11));
        assert!(table.get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let h = Harness::new(2, 0, 0);
        let mut table = h.table();
        put(&mut table, "A", "1");
        put(&mut table, "B", "2");
        put(&mut table, "C", "3");

        assert_eq!(table.key_set().unwrap(), vec![b("B"), b("C")]);
        assert_eq!(h.elements.value(), 2);
        assert_eq!(h.bytes.value() as u64, table.byte_size());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let h = Harness::new(2, 0, 0);
        let mut table = h.table();
        put(&mut table, "A", "1");
        put(&mut table, "B", "2");
        table.get(b"A").unwrap();
        put(&mut table, "C", "3");

        assert_eq!(table.lru_keys(), vec![b("A"), b("C")]);
    }

    #[test]
    fn test_byte_guard_spills_before_evicting() {
        let h = Harness::new(0, 20, 1_000);
        let mut table = h.table();
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        assert_eq!(h.bytes.value(), 20);
        assert!(h.storage.is_empty());

        put(&mut table, "c", "123456789");
        assert_eq!(table.len(), 3);
        assert_eq!(h.storage.len(), 2);
        assert!(table.element(b"a").unwrap().is_stored());
        assert!(table.element(b"b").unwrap().is_stored());
        assert!(!table.element(b"c").unwrap().is_stored());
        assert_eq!(h.bytes.value(), 2 + 2 + 10);
        assert_eq!(h.bytes.value() as u64, table.byte_size());
        assert_eq!(table.statistics().on_disk, 2);
    }

    #[test]
    fn test_byte_guard_stops_compaction_when_storage_full() {
        let h = Harness::new(0, 20, 9);
        let mut table = h.table();
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");

        // a spilled, b refused, then a evicted to get back under budget
        assert_eq!(table.lru_keys(), vec![b("b"), b("c")]);
        assert!(h.storage.is_empty());
        assert_eq!(h.bytes.value(), 20);
        assert_eq!(table.statistics().on_disk, 0);
    }

    #[test]
    fn test_byte_guard_without_secondary_evicts() {
        let h = Harness::new(0, 20, 0);
        let ctx = StoreContext::new(h.clock.clone()).with_sizer(Arc::new(DefaultSizeCalculator {
            element_overhead: 0,
        }));
        let mut table = h.table_with(ctx);
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");
        assert_eq!(table.lru_keys(), vec![b("b"), b("c")]);
        assert_eq!(h.bytes.value(), 20);
    }

    #[test]
    fn test_get_restores_spilled_value() {
        let h = Harness::new(0, 20, 1_000);
        let mut table = h.table();
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");
        assert_eq!(h.bytes.value(), 14);

        let view = table.get(b"a").unwrap().unwrap();
        assert_eq!(view.value, Some(b("123456789")));
        assert!(!table.element(b"a").unwrap().is_stored());
        assert_eq!(h.storage.len(), 1);
        assert_eq!(h.bytes.value(), 22);
        assert_eq!(table.statistics().on_disk, 1);
    }

    /// Secondary storage whose every write fails.
    #[derive(Default)]
    struct BrokenDisk {
        attempts: Mutex<Vec<Bytes>>,
    }

    impl SecondaryStorage for BrokenDisk {
        fn put(
            &self,
            key: &Bytes,
            _value: &Bytes,
        ) -> std::result::Result<Option<StorageHandle>, StorageError> {
            self.attempts.lock().push(key.clone());
            Err(io::Error::new(io::ErrorKind::Other, "device unavailable").into())
        }

        fn get(&self, handle: StorageHandle) -> std::result::Result<Bytes, StorageError> {
            Err(StorageError::UnknownHandle(handle.0))
        }

        fn remove(&self, handle: StorageHandle) -> std::result::Result<(), StorageError> {
            Err(StorageError::UnknownHandle(handle.0))
        }

        fn reference_size(&self) -> u64 {
            1
        }
    }

    #[test]
    fn test_byte_guard_storage_failure_falls_back_to_eviction() {
        let h = Harness::new(0, 20, 0);
        let disk = Arc::new(BrokenDisk::default());
        let mut table = h.table_with(h.ctx().with_secondary(disk.clone()));
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");

        // only the LRU element was tried before compaction gave up
        assert_eq!(*disk.attempts.lock(), vec![b("a")]);
        assert_eq!(table.lru_keys(), vec![b("b"), b("c")]);
        assert!(!table.element(b"b").unwrap().is_stored());
        assert_eq!(h.bytes.value(), 20);
        assert_eq!(h.bytes.value() as u64, table.byte_size());
        assert_eq!(table.statistics().on_disk, 0);
    }

    #[test]
    fn test_get_leaves_spilled_value_when_budget_full() {
        let h = Harness::new(0, 20, 1_000);
        let mut table = h.table();
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");
        put(&mut table, "d", "12345");
        assert_eq!(h.bytes.value(), 20);
        assert!(table.element(b"a").unwrap().is_stored());

        let view = table.get(b"a").unwrap().unwrap();
        assert_eq!(view.value, Some(b("123456789")));
        assert!(table.element(b"a").unwrap().is_stored());
        assert_eq!(h.storage.len(), 2);
        assert_eq!(h.bytes.value(), 20);
        assert_eq!(table.statistics().on_disk, 2);
        // still counts as a use
        assert_eq!(table.lru_keys().last(), Some(&b("a")));
    }

    #[test]
    fn test_remove_tri_state() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        table.put(b("null"), None, None, false, None).unwrap();
        put(&mut table, "k", "v");

        assert_eq!(table.remove(b"missing").unwrap(), Previous::Absent);
        assert_eq!(table.remove(b"null").unwrap(), Previous::Present(None));
        assert_eq!(table.remove(b"k").unwrap(), Previous::Present(Some(b("v"))));
        assert!(table.is_empty());
        assert_eq!(h.elements.value(), 0);
        assert_eq!(h.bytes.value(), 0);
    }

    #[test]
    fn test_remove_spilled_frees_storage() {
        let h = Harness::new(0, 20, 1_000);
        let mut table = h.table();
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");

        assert_eq!(
            table.remove(b"a").unwrap(),
            Previous::Present(Some(b("123456789")))
        );
        assert_eq!(h.storage.len(), 1);
        assert_eq!(table.statistics().on_disk, 1);
        assert_eq!(h.bytes.value() as u64, table.byte_size());
    }

    #[test]
    fn test_conditional_remove_and_replace() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "k", "v1");

        assert!(!table.remove_if(b"k", Some(b"other")).unwrap());
        assert!(!table.replace_if(b("k"), Some(b"other"), Some(b("v2"))).unwrap());
        assert!(table.replace_if(b("k"), Some(b"v1"), Some(b("v2"))).unwrap());
        assert_eq!(table.replace(b("k"), Some(b("v3"))).unwrap(), Previous::Present(Some(b("v2"))));
        assert_eq!(table.replace(b("zz"), Some(b("v3"))).unwrap(), Previous::Absent);
        assert!(!table.contains_key(b"zz").unwrap());
        assert!(table.remove_if(b"k", Some(b"v3")).unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_requires_matching_counter() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        assert_eq!(table.update(b("k"), Some(b("x")), None, 0).unwrap(), Previous::Absent);

        put(&mut table, "k", "v1");
        put(&mut table, "k", "v2");
        assert_eq!(table.update(b("k"), Some(b("stale")), None, 0).unwrap(), Previous::Absent);
        assert_eq!(table.get(b"k").unwrap().unwrap().value, Some(b("v2")));

        let applied = table.update(b("k"), Some(b("fresh")), None, 1).unwrap();
        assert_eq!(applied, Previous::Present(Some(b("v2"))));
        assert_eq!(table.element(b"k").unwrap().update_counter(), 2);
    }

    #[test]
    fn test_expired_elements_vanish_from_bulk_reads() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let soon = Some(START + Duration::from_secs(1));
        table.put(b("old"), Some(b("x")), soon, false, None).unwrap();
        put(&mut table, "live", "y");
        h.clock.advance(Duration::from_secs(2));

        assert_eq!(h.elements.value(), 2);
        assert_eq!(table.key_set().unwrap(), vec![b("live")]);
        assert_eq!(h.elements.value(), 1);
        assert_eq!(h.bytes.value() as u64, table.byte_size());
        assert_eq!(table.values().unwrap(), vec![Some(b("y"))]);
        assert_eq!(table.entry_set().unwrap(), vec![(b("live"), Some(b("y")))]);
        assert!(table.contains_value(Some(b"y")).unwrap());
        assert!(!table.contains_value(Some(b"x")).unwrap());
    }

    #[test]
    fn test_purge_expired_counts() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let soon = Some(START + Duration::from_secs(1));
        table.put(b("a"), Some(b("x")), soon, false, None).unwrap();
        table.put(b("b"), Some(b("x")), soon, false, None).unwrap();
        put(&mut table, "c", "z");
        h.clock.advance(Duration::from_secs(2));
        assert_eq!(table.purge_expired().unwrap(), 2);
        assert_eq!(table.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_invalidated_element_is_a_miss() {
        struct ByKey;
        impl Invalidator for ByKey {
            fn process(&self, element: &Element) {
                if element.key().as_ref() == b"bad" {
                    element.invalidate();
                }
            }
        }
        let h = Harness::new(0, 0, 0);
        let mut table = h.table_with(h.ctx().with_invalidator(Arc::new(ByKey)));
        put(&mut table, "bad", "v");
        put(&mut table, "good", "v");

        assert!(table.get(b"bad").unwrap().is_none());
        assert!(table.get(b"good").unwrap().is_some());
        assert_eq!(h.elements.value(), 1);
    }

    #[test]
    fn test_retain_all() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "a", "1");
        put(&mut table, "b", "2");
        put(&mut table, "c", "3");

        let keep: HashSet<Bytes> = [b("b"), b("zz")].into_iter().collect();
        assert!(table.retain_all(&keep).unwrap());
        assert_eq!(table.lru_keys(), vec![b("b")]);
        assert!(!table.retain_all(&keep).unwrap());
        assert_eq!(h.elements.value(), 1);

        assert!(table.retain_all(&HashSet::new()).unwrap());
        assert!(table.is_empty());
        assert_eq!(h.bytes.value(), 0);
    }

    #[test]
    fn test_clear_only_subtracts_own_totals() {
        let h = Harness::new(0, 0, 1_000);
        let mut first = h.table();
        let mut second = h.table();
        put(&mut first, "a", "1");
        put(&mut second, "b", "22");
        put(&mut second, "c", "333");
        assert_eq!(h.elements.value(), 3);

        second.clear();
        assert!(second.is_empty());
        assert_eq!(h.elements.value(), 1);
        assert_eq!(h.bytes.value() as u64, first.byte_size());
        assert_eq!(second.statistics(), &Statistics::default());
    }

    #[test]
    fn test_attach_detach_symmetric() {
        let h = Harness::new(0, 0, 0);
        let mut table = ElementTable::with_intervals(None, None, h.ctx());
        put(&mut table, "a", "1");
        put(&mut table, "b", "2");

        table.attach_counters(h.elements.clone(), h.bytes.clone());
        assert_eq!(h.elements.value(), 2);
        assert_eq!(h.bytes.value(), 4);

        table.detach_counters();
        assert_eq!(h.elements.value(), 0);
        assert_eq!(h.bytes.value(), 0);
        assert!(table.element_counter().is_none());
    }

    #[test]
    fn test_transfer_moves_everything_silently() {
        let h = Harness::new(0, 0, 1_000);
        let mut source = h.table();
        let other_elements = Arc::new(SharedCounter::unlimited());
        let other_bytes = Arc::new(SharedCounter::unlimited());
        let mut target = ElementTable::with_intervals(None, None, h.ctx());
        target.attach_counters(other_elements.clone(), other_bytes.clone());

        let recorder = Recorder::new();
        put(&mut source, "a", "1");
        put(&mut source, "b", "2");
        source.add_event_subscriber(b("a"), recorder.clone());

        source.transfer_to(&mut target).unwrap();
        assert!(source.is_empty());
        assert_eq!(h.elements.value(), 0);
        assert_eq!(h.bytes.value(), 0);
        assert_eq!(target.lru_keys(), vec![b("a"), b("b")]);
        assert_eq!(other_elements.value(), 2);
        assert_eq!(other_bytes.value(), 4);
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(target.element(b"a").unwrap().subscribers().len(), 1);
    }

    #[test]
    fn test_subscriber_lifecycle() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let recorder = Recorder::new();
        assert!(table.add_event_subscriber(b("k"), recorder.clone()));
        assert!(!table.add_event_subscriber(b("k"), recorder.clone()));

        put(&mut table, "k", "v1");
        put(&mut table, "k", "v2");
        table.remove(b"k").unwrap();
        put(&mut table, "k", "v3");

        assert_eq!(
            recorder.types(),
            vec![EventType::Add, EventType::Update, EventType::Remove, EventType::Add]
        );
        let seen = recorder.seen.lock();
        assert_eq!(seen[1].previous_value, Some(b("v1")));
        assert_eq!(seen[1].new_value, Some(b("v2")));
        assert_eq!(seen[2].new_value, None);
        assert_eq!(seen[2].previous_value, Some(b("v2")));
    }

    #[test]
    fn test_subscriber_attaches_to_live_element_immediately() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "k", "v1");
        let recorder = Recorder::new();
        table.add_event_subscriber(b("k"), recorder.clone());
        put(&mut table, "k", "v2");
        assert_eq!(recorder.types(), vec![EventType::Update]);
    }

    /// Asynchronous subscriber reporting which thread each event arrived on.
    struct Relay {
        id: SubscriberId,
        tx: Mutex<mpsc::Sender<(ThreadId, EventType)>>,
    }

    impl Relay {
        fn new() -> (Arc<Self>, mpsc::Receiver<(ThreadId, EventType)>) {
            let (tx, rx) = mpsc::channel();
            let relay = Arc::new(Self {
                id: SubscriberId::next(),
                tx: Mutex::new(tx),
            });
            (relay, rx)
        }
    }

    impl Subscriber for Relay {
        fn notify(&self, events: Vec<ModificationEvent>) -> Result<()> {
            let tx = self.tx.lock();
            for event in events {
                let _ = tx.send((thread::current().id(), event.event_type));
            }
            Ok(())
        }
        fn notification_mode(&self) -> NotificationMode {
            NotificationMode::Async
        }
        fn content_flags(&self) -> ContentFlags {
            ContentFlags::NEED_KEY
        }
        fn modification_types(&self) -> EventTypes {
            EventTypes::ALL
        }
        fn identity(&self) -> SubscriberId {
            self.id
        }
    }

    #[test]
    fn test_async_subscriber_delivered_off_caller_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let (relay, rx) = Relay::new();
        assert!(table.add_event_subscriber(b("k"), relay.clone()));
        assert!(!table.add_event_subscriber(b("k"), relay.clone()));

        put(&mut table, "k", "v");

        let (delivered_on, event) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, EventType::Add);
        assert_ne!(delivered_on, thread::current().id());
        table.remove_event_subscriber(&[b("k")], relay.id).unwrap();
    }

    #[test]
    fn test_async_subscriber_without_runtime_delivered_inline() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let (relay, rx) = Relay::new();
        table.add_event_subscriber(b("k"), relay);

        put(&mut table, "k", "v");

        let (delivered_on, event) = rx.try_recv().unwrap();
        assert_eq!(event, EventType::Add);
        assert_eq!(delivered_on, thread::current().id());
    }

    #[test]
    fn test_eviction_and_expiry_events() {
        let h = Harness::new(1, 0, 0);
        let mut table = h.table();
        let recorder = Recorder::new();
        table.add_event_subscriber(b("a"), recorder.clone());
        table.add_event_subscriber(b("b"), recorder.clone());

        put(&mut table, "a", "1");
        table
            .put(b("b"), Some(b("2")), Some(START + Duration::from_secs(1)), false, None)
            .unwrap();
        h.clock.advance(Duration::from_secs(2));
        table.get(b"b").unwrap();

        assert_eq!(
            recorder.types(),
            vec![EventType::Add, EventType::Add, EventType::Evict, EventType::Expire]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        let recorder = Recorder::new();
        put(&mut table, "k", "v");
        table.add_event_subscriber(b("k"), recorder.clone());

        table.remove_event_subscriber(&[b("k"), b("other")], recorder.id).unwrap();
        assert!(table.element(b"k").unwrap().subscribers().is_empty());

        let err = table
            .remove_event_subscriber(&[b("k")], recorder.id)
            .unwrap_err();
        assert!(matches!(err, CacheError::NotSubscribed(id) if id == recorder.id));

        put(&mut table, "k", "v2");
        assert!(recorder.seen.lock().is_empty());
    }

    struct Source {
        reads: AtomicUsize,
        prefetches: Mutex<Vec<PrefetchRequest>>,
        cancelled: Arc<AtomicUsize>,
    }

    struct Cancel(Arc<AtomicUsize>);

    impl PrefetchOrder for Cancel {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DataSource for Source {
        fn get(&self, key: &Bytes) -> Result<Option<Loaded>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if key.as_ref() == b"db" {
                return Ok(Some(Loaded::new(Some(b("from-db")), Duration::from_millis(7))));
            }
            Ok(None)
        }

        fn schedule_prefetch(&self, request: PrefetchRequest) -> Option<Box<dyn PrefetchOrder>> {
            self.prefetches.lock().push(request);
            Some(Box::new(Cancel(self.cancelled.clone())))
        }
    }

    #[derive(Default)]
    struct Sink {
        writes: Mutex<Vec<(Bytes, Option<Bytes>)>>,
    }

    impl DataStore for Sink {
        fn store(&self, key: &Bytes, value: Option<&Bytes>) -> Result<()> {
            self.writes.lock().push((key.clone(), value.cloned()));
            Ok(())
        }
    }

    #[test]
    fn test_miss_fill_prefetch_and_write_through() {
        let h = Harness::new(0, 0, 0);
        let source = Arc::new(Source {
            reads: AtomicUsize::new(0),
            prefetches: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
        });
        let sink = Arc::new(Sink::default());
        let ctx = h.ctx().with_data_source(source.clone()).with_data_store(sink.clone());
        let mut table = h.table_with(ctx);

        let view = table.get(b"db").unwrap().unwrap();
        assert_eq!(view.value, Some(b("from-db")));
        assert_eq!(table.statistics().read_misses, 1);
        assert!(table.get(b"elsewhere").unwrap().is_none());
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);

        {
            let prefetches = source.prefetches.lock();
            assert_eq!(prefetches.len(), 1);
            assert_eq!(prefetches[0].last_read_cost, Some(Duration::from_millis(7)));
            assert_eq!(prefetches[0].update_counter, 0);
        }
        assert_eq!(sink.writes.lock()[0], (b("db"), Some(b("from-db"))));

        // replacing cancels the old element's prefetch
        put(&mut table, "db", "newer");
        assert_eq!(source.cancelled.load(Ordering::SeqCst), 1);
        table.remove(b"db").unwrap();
        assert_eq!(source.cancelled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_data_store_still_leaves_table_consistent() {
        struct Broken;
        impl DataStore for Broken {
            fn store(&self, _key: &Bytes, _value: Option<&Bytes>) -> Result<()> {
                Err(CacheError::DataStore("offline".into()))
            }
        }
        let h = Harness::new(0, 0, 0);
        let mut table = h.table_with(h.ctx().with_data_store(Arc::new(Broken)));
        let err = table.put(b("k"), Some(b("v")), None, false, None).unwrap_err();
        assert!(matches!(err, CacheError::DataStore(_)));
        assert_eq!(table.len(), 1);
        assert_eq!(h.elements.value(), 1);
    }

    #[test]
    fn test_wire_roundtrip() {
        let h = Harness::new(0, 20, 1_000);
        let mut table = ElementTable::with_intervals(
            Some(Duration::from_secs(30)),
            None,
            h.ctx(),
        );
        table.attach_counters(h.elements.clone(), h.bytes.clone());
        put(&mut table, "a", "123456789");
        put(&mut table, "b", "123456789");
        put(&mut table, "c", "123456789");
        table.put(b("n"), None, None, false, None).unwrap();
        table.get(b"c").unwrap();
        assert!(table.element(b"b").unwrap().is_stored());

        let encoded = table.to_bytes().unwrap();
        let mut decoded = ElementTable::read_wire(&mut encoded.clone(), h.ctx()).unwrap();

        assert_eq!(decoded.lru_keys(), table.lru_keys());
        assert_eq!(decoded.statistics(), table.statistics());
        assert_eq!(decoded.expiration_interval(), Some(Duration::from_secs(30)));
        assert_eq!(decoded.idle_interval(), None);
        assert!(!decoded.element(b"b").unwrap().is_stored());
        assert_eq!(decoded.entry_set().unwrap(), table.entry_set().unwrap());
        assert_eq!(decoded.to_bytes().unwrap().len(), encoded.len());
    }

    #[test]
    fn test_wire_truncated_snapshot() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "a", "1");
        let encoded = table.to_bytes().unwrap();
        let mut short = encoded.slice(..encoded.len() - 1);
        let err = ElementTable::read_wire(&mut short, h.ctx()).unwrap_err();
        assert!(matches!(err, CacheError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_wire_negative_size_rejected() {
        let h = Harness::new(0, 0, 0);
        let mut table = h.table();
        put(&mut table, "a", "1");
        put(&mut table, "b", "2");
        let mut raw = BytesMut::from(table.to_bytes().unwrap().as_ref());

        // intervals, statistics, header block and count come first
        let first = 1 + 1 + 40 + 47 + 4;
        let block = (raw.len() - first) / 2;
        for start in [first, first + block] {
            // flags, update counter, key size and value size precede the size
            let size_at = start + 4 + 8 * 3;
            raw[size_at..size_at + 8].copy_from_slice(&[0xFF; 8]);
        }

        let err = ElementTable::read_wire(&mut raw.freeze(), h.ctx()).unwrap_err();
        assert!(matches!(err, CacheError::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
    }
}
