// Slab-backed registry of live subscribers for one shard.
//
// Ids carry a generation so a stale id held by a timer or transport task can
// never reach a subscriber that reused the same slot.
use courier_common::LongpollConfig;
use courier_common::ids::MessageId;
use courier_store::{MessageRef, MessageStore};
use http::StatusCode;
use slab::Slab;
use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, TimerToken};
use crate::error::{Result, SubscriberError};
use crate::notifier::UnsubscribeNotifier;
use crate::subscriber::{ReleaseOutcome, Subscriber, SubscriberState, Teardown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId {
    key: usize,
    generation: u64,
}

impl SubscriberId {
    pub const fn new(key: usize, generation: u64) -> Self {
        Self { key, generation }
    }

    pub const fn key(self) -> usize {
        self.key
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}.{}", self.key, self.generation)
    }
}

pub type NotifierFactory = Box<dyn Fn(SubscriberId) -> Box<dyn UnsubscribeNotifier> + Send>;

pub struct SubscriberPool<C> {
    subscribers: Slab<Subscriber<C>>,
    next_generation: u64,
    config: Arc<LongpollConfig>,
    store: Arc<dyn MessageStore>,
    notifier_factory: Option<NotifierFactory>,
}

impl<C: Connection> SubscriberPool<C> {
    pub fn new(config: LongpollConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            subscribers: Slab::new(),
            next_generation: 0,
            config: Arc::new(config),
            store,
            notifier_factory: None,
        }
    }

    /// Attach a notifier to every subscriber created while an unsubscribe
    /// url is configured.
    pub fn with_notifier_factory(
        mut self,
        factory: impl Fn(SubscriberId) -> Box<dyn UnsubscribeNotifier> + Send + 'static,
    ) -> Self {
        self.notifier_factory = Some(Box::new(factory));
        self
    }

    pub fn config(&self) -> &LongpollConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: SubscriberId) -> Option<&Subscriber<C>> {
        self.subscribers
            .get(id.key)
            .filter(|sub| sub.id().generation == id.generation)
    }

    pub fn get_mut(&mut self, id: SubscriberId) -> Option<&mut Subscriber<C>> {
        self.subscribers
            .get_mut(id.key)
            .filter(|sub| sub.id().generation == id.generation)
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(|(_, sub)| sub.id()).collect()
    }

    pub fn create(&mut self, connection: C, resume_from: Option<MessageId>) -> SubscriberId {
        let entry = self.subscribers.vacant_entry();
        self.next_generation += 1;
        let id = SubscriberId::new(entry.key(), self.next_generation);
        let mut subscriber = Subscriber::new(
            id,
            connection,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            resume_from,
        );
        if self.config.unsubscribe_url.is_some()
            && let Some(factory) = &self.notifier_factory
        {
            subscriber.set_unsubscribe_notifier(factory(id));
        }
        entry.insert(subscriber);
        self.record_len();
        id
    }

    pub fn enqueue(&mut self, id: SubscriberId) -> Result<()> {
        self.subscriber(id)?.enqueue()
    }

    pub fn dequeue(&mut self, id: SubscriberId) -> Result<()> {
        self.subscriber(id)?.dequeue();
        self.reap(id);
        Ok(())
    }

    pub fn reserve(&mut self, id: SubscriberId) -> Result<usize> {
        Ok(self.subscriber(id)?.reserve())
    }

    pub fn release(&mut self, id: SubscriberId, suppress_destroy: bool) -> Result<ReleaseOutcome> {
        let outcome = self.subscriber(id)?.release(suppress_destroy)?;
        if outcome == ReleaseOutcome::Destroyed {
            self.remove(id);
        }
        Ok(outcome)
    }

    pub fn set_dequeue_callback(
        &mut self,
        id: SubscriberId,
        callback: impl FnOnce(SubscriberId) + Send + 'static,
    ) -> Result<()> {
        self.subscriber(id)?.set_dequeue_callback(callback);
        Ok(())
    }

    pub fn set_interval_poll(&mut self, id: SubscriberId, enabled: bool) -> Result<()> {
        self.subscriber(id)?.set_interval_poll(enabled);
        Ok(())
    }

    pub fn deliver_message(&mut self, id: SubscriberId, message: MessageRef) -> Result<()> {
        let delivered = self.subscriber(id)?.deliver_message(message);
        self.reap(id);
        delivered
    }

    pub fn deliver_status(
        &mut self,
        id: SubscriberId,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<()> {
        let delivered = self.subscriber(id)?.deliver_status(status, status_line);
        self.reap(id);
        delivered
    }

    pub fn timeout_fired(&mut self, id: SubscriberId, token: TimerToken) -> Result<()> {
        let fired = self.subscriber(id)?.timeout_fired(token);
        self.reap(id);
        fired
    }

    pub fn dequeue_after_status(&mut self, id: SubscriberId, status: StatusCode) -> Result<bool> {
        let dequeued = self.subscriber(id)?.dequeue_after_status(status);
        self.reap(id);
        Ok(dequeued)
    }

    pub fn respond_unqueued_status(
        &mut self,
        id: SubscriberId,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<()> {
        let sent = self
            .subscriber(id)?
            .respond_unqueued_status(status, status_line);
        self.reap(id);
        sent
    }

    pub fn connection_closed(&mut self, id: SubscriberId) -> Result<Teardown> {
        let closed = self.subscriber(id)?.connection_closed();
        if matches!(closed, Ok(Teardown::Freed)) {
            self.remove(id);
        } else {
            self.reap(id);
        }
        closed
    }

    pub fn destroy(&mut self, id: SubscriberId) -> Result<Teardown> {
        let teardown = self.subscriber(id)?.destroy()?;
        if teardown == Teardown::Freed {
            self.remove(id);
        }
        Ok(teardown)
    }

    fn subscriber(&mut self, id: SubscriberId) -> Result<&mut Subscriber<C>> {
        self.get_mut(id).ok_or(SubscriberError::NotFound)
    }

    // Dead subscribers are destroyed as soon as they leave the wait list; a
    // reserved one stays until its last release, and one with a flushed
    // batch stays until its connection closes.
    fn reap(&mut self, id: SubscriberId) {
        let Some(sub) = self.get_mut(id) else {
            return;
        };
        if sub.state() != SubscriberState::Dead
            || sub.reservations().awaiting_destruction()
            || sub.batch_cleanup_pending()
        {
            return;
        }
        match sub.destroy() {
            Ok(Teardown::Freed) => self.remove(id),
            Ok(_) => {}
            Err(err) => tracing::warn!(subscriber = %id, error = %err, "reap failed"),
        }
    }

    fn remove(&mut self, id: SubscriberId) {
        if self.contains(id) {
            self.subscribers.remove(id.key);
            tracing::debug!(subscriber = %id, "subscriber removed");
            self.record_len();
        }
    }

    fn record_len(&self) {
        metrics::gauge!("courier_longpoll_subscribers").set(self.subscribers.len() as f64);
    }
}

impl<C> fmt::Debug for SubscriberPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberPool")
            .field("subscribers", &self.subscribers.len())
            .field("next_generation", &self.next_generation)
            .finish_non_exhaustive()
    }
}
