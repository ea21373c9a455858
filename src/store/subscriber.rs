//! Subscriber Adapters Module
//!
//! Wraps user listeners with identity, defaults, panic containment and
//! asynchronous dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use super::event::{
    ContentFlags, EventTypes, ModificationEvent, NotificationMode, Subscriber, SubscriberId,
};
use crate::error::{CacheError, Result};

// == Change Listener ==
/// User-facing change callback.
///
/// Every `Option` hook may return `None` to accept the adapter's default:
/// all event types, `NEED_ALL` content and synchronous delivery.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, events: &[ModificationEvent]) -> anyhow::Result<()>;

    fn content_flags(&self) -> Option<ContentFlags> {
        None
    }

    fn modification_types(&self) -> Option<EventTypes> {
        None
    }

    fn notification_mode(&self) -> Option<NotificationMode> {
        None
    }
}

/// Turns a [`ChangeListener`] into a [`Subscriber`] with a stable identity.
pub struct ListenerAdapter<L> {
    id: SubscriberId,
    listener: L,
}

impl<L: ChangeListener> ListenerAdapter<L> {
    pub fn new(listener: L) -> Self {
        Self {
            id: SubscriberId::next(),
            listener,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }
}

impl<L: ChangeListener> Subscriber for ListenerAdapter<L> {
    fn notify(&self, events: Vec<ModificationEvent>) -> Result<()> {
        match catch_unwind(AssertUnwindSafe(|| self.listener.on_change(&events))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CacheError::Subscriber(format!("{}: {:#}", self.id, e))),
            Err(_) => Err(CacheError::Subscriber(format!(
                "{}: listener panicked",
                self.id
            ))),
        }
    }

    fn notification_mode(&self) -> NotificationMode {
        self.listener
            .notification_mode()
            .unwrap_or(NotificationMode::Sync)
    }

    fn content_flags(&self) -> ContentFlags {
        self.listener
            .content_flags()
            .unwrap_or(ContentFlags::NEED_ALL)
    }

    fn modification_types(&self) -> EventTypes {
        self.listener
            .modification_types()
            .unwrap_or(EventTypes::ALL)
    }

    fn identity(&self) -> SubscriberId {
        self.id
    }
}

// == Async Subscriber ==
/// Delivers notifications on a tokio runtime instead of the caller's thread.
///
/// Delegate failures are logged; `notify` itself only fails if nothing could
/// be scheduled.
pub struct AsyncSubscriber {
    delegate: Arc<dyn Subscriber>,
    runtime: Handle,
}

impl AsyncSubscriber {
    pub fn new(delegate: Arc<dyn Subscriber>, runtime: Handle) -> Self {
        Self { delegate, runtime }
    }

    /// Wraps `subscriber` only if it asks for asynchronous delivery.
    pub fn wrap_if_async(subscriber: Arc<dyn Subscriber>, runtime: &Handle) -> Arc<dyn Subscriber> {
        match subscriber.notification_mode() {
            NotificationMode::Async => Arc::new(Self::new(subscriber, runtime.clone())),
            NotificationMode::Sync => subscriber,
        }
    }

    /// Like [`wrap_if_async`](Self::wrap_if_async), on the ambient tokio runtime.
    ///
    /// Outside a runtime an asynchronous subscriber is kept as is and
    /// delivered synchronously, with a warning.
    pub fn wrap_for_current_runtime(subscriber: Arc<dyn Subscriber>) -> Arc<dyn Subscriber> {
        if subscriber.notification_mode() == NotificationMode::Sync {
            return subscriber;
        }
        match Handle::try_current() {
            Ok(runtime) => Self::wrap_if_async(subscriber, &runtime),
            Err(_) => {
                warn!(
                    subscriber = %subscriber.identity(),
                    "no tokio runtime, delivering asynchronous subscriber synchronously"
                );
                subscriber
            }
        }
    }
}

impl Subscriber for AsyncSubscriber {
    fn notify(&self, events: Vec<ModificationEvent>) -> Result<()> {
        let delegate = Arc::clone(&self.delegate);
        self.runtime.spawn_blocking(move || {
            if let Err(e) = delegate.notify(events) {
                warn!(subscriber = %delegate.identity(), error = %e, "async subscriber failed");
            }
        });
        Ok(())
    }

    fn notification_mode(&self) -> NotificationMode {
        NotificationMode::Async
    }

    fn content_flags(&self) -> ContentFlags {
        self.delegate.content_flags()
    }

    fn modification_types(&self) -> EventTypes {
        self.delegate.modification_types()
    }

    fn identity(&self) -> SubscriberId {
        self.delegate.identity()
    }
}

// == Subscriber List ==
/// Subscribers deduplicated by identity, in registration order.
#[derive(Clone, Default)]
pub struct SubscriberList {
    items: Vec<Arc<dyn Subscriber>>,
}

impl SubscriberList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subscriber` unless one with the same identity is present.
    pub fn add(&mut self, subscriber: Arc<dyn Subscriber>) -> bool {
        if self.contains(subscriber.identity()) {
            return false;
        }
        self.items.push(subscriber);
        true
    }

    /// Removes the subscriber with `id`, returning whether one was found.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.items.len();
        self.items.retain(|s| s.identity() != id);
        self.items.len() != before
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.items.iter().any(|s| s.identity() == id)
    }

    /// Moves every subscriber into `other`, leaving this list empty.
    pub fn transfer_to(&mut self, other: &mut SubscriberList) {
        for subscriber in self.items.drain(..) {
            other.add(subscriber);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Subscriber>> {
        self.items.iter()
    }
}

impl std::fmt::Debug for SubscriberList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|s| s.identity()))
            .finish()
    }
}

/// Sends `events` to `subscriber`, logging instead of propagating failures.
pub(crate) fn dispatch(subscriber: &Arc<dyn Subscriber>, events: Vec<ModificationEvent>) {
    if let Err(e) = subscriber.notify(events) {
        warn!(subscriber = %subscriber.identity(), error = %e, "subscriber notification failed");
    }
}
