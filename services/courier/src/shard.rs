// Single-task owner of the subscriber pool and the message store.
//
// Every subscriber mutation happens inside `Shard::handle`, so the pool needs
// no locking. HTTP handlers, timers and drop guards talk to the shard only by
// posting `ShardEvent`s.
use axum::http::StatusCode;
use bytes::Bytes;
use courier_common::ids::MessageId;
use courier_longpoll::{
    Connection, Finalize, ReleaseOutcome, Response, SubscriberError, SubscriberId,
    SubscriberPool, TimerToken, TransportError, UnsubscribeNotifier,
};
use courier_store::{MemoryStore, MessageRef, MultiplexCopy, SharedMessage, StoreError};
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::CourierConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey(u64);

impl RequestKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Fully rendered answer for one long-poll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: StatusCode,
    pub content_type: Option<Bytes>,
    pub message_id: Option<MessageId>,
    pub previous_message_id: Option<MessageId>,
    pub body: Bytes,
    // Ask the client not to reuse the connection.
    pub close: bool,
}

impl HttpReply {
    fn from_response(response: Response) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            message_id: Some(response.message_id),
            previous_message_id: Some(response.previous_message_id),
            body: response.body.to_bytes(),
            close: false,
        }
    }

    fn from_status(
        status: StatusCode,
        status_line: Option<&str>,
        ids: Option<(MessageId, MessageId)>,
    ) -> Self {
        let (message_id, previous_message_id) = match ids {
            Some((id, previous)) => (Some(id), Some(previous)),
            None => (None, None),
        };
        let body = status_line
            .map(|line| Bytes::copy_from_slice(line.as_bytes()))
            .unwrap_or_default();
        Self {
            status,
            content_type: (!body.is_empty()).then(|| Bytes::from_static(b"text/plain")),
            message_id,
            previous_message_id,
            body,
            close: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    // Live subscribers, including dead ones still reserved.
    pub subscribers: usize,
    // Wait-list entries across all channels.
    pub waiting: usize,
    pub channels: usize,
}

#[derive(Debug)]
pub enum ShardEvent {
    Subscribe {
        request: RequestKey,
        channels: Vec<String>,
        resume_from: Option<MessageId>,
        reply: oneshot::Sender<HttpReply>,
    },
    Publish {
        channel: String,
        payload: Bytes,
        content_type: Option<Bytes>,
        reply: oneshot::Sender<Result<MessageId, StoreError>>,
    },
    Timeout {
        request: RequestKey,
        token: TimerToken,
    },
    Dequeued {
        subscriber: SubscriberId,
    },
    Closed {
        request: RequestKey,
    },
    Stats {
        reply: oneshot::Sender<ShardStats>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    #[error("shard is not running")]
    Unavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ShardHandle {
    events: mpsc::Sender<ShardEvent>,
}

impl ShardHandle {
    /// Registers a long-poll request. The receiver resolves once the
    /// subscriber answers.
    pub async fn subscribe(
        &self,
        request: RequestKey,
        channels: Vec<String>,
        resume_from: Option<MessageId>,
    ) -> Result<oneshot::Receiver<HttpReply>, ShardError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ShardEvent::Subscribe {
                request,
                channels,
                resume_from,
                reply,
            })
            .await
            .map_err(|_| ShardError::Unavailable)?;
        Ok(rx)
    }

    pub async fn publish(
        &self,
        channel: String,
        payload: Bytes,
        content_type: Option<Bytes>,
    ) -> Result<MessageId, ShardError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ShardEvent::Publish {
                channel,
                payload,
                content_type,
                reply,
            })
            .await
            .map_err(|_| ShardError::Unavailable)?;
        Ok(rx.await.map_err(|_| ShardError::Unavailable)??)
    }

    pub async fn stats(&self) -> Result<ShardStats, ShardError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ShardEvent::Stats { reply })
            .await
            .map_err(|_| ShardError::Unavailable)?;
        rx.await.map_err(|_| ShardError::Unavailable)
    }

    /// Reports that the request behind `request` is gone. Safe to call from
    /// `Drop`.
    pub fn closed(&self, request: RequestKey) {
        post_from_sync(&self.events, ShardEvent::Closed { request });
    }
}

// Posts without blocking the caller; a full queue hands the send to a task so
// the event is delayed rather than lost.
fn post_from_sync(events: &mpsc::Sender<ShardEvent>, event: ShardEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            let events = events.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = events.send(event).await;
                    });
                }
                Err(_) => tracing::warn!(?event, "shard event dropped outside runtime"),
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Transport side of one long-poll request.
///
/// Output is buffered until the subscriber finalizes the request, then
/// handed to the waiting HTTP handler in one piece.
pub struct HttpConnection {
    request: RequestKey,
    reply: Option<oneshot::Sender<HttpReply>>,
    pending: Option<HttpReply>,
    id_headers: Option<(MessageId, MessageId)>,
    events: mpsc::Sender<ShardEvent>,
    timers: Vec<(TimerToken, AbortHandle)>,
    next_timer: u64,
    keepalive: bool,
    pinned: bool,
}

impl HttpConnection {
    fn new(
        request: RequestKey,
        reply: oneshot::Sender<HttpReply>,
        events: mpsc::Sender<ShardEvent>,
    ) -> Self {
        Self {
            request,
            reply: Some(reply),
            pending: None,
            id_headers: None,
            events,
            timers: Vec::new(),
            next_timer: 0,
            keepalive: true,
            pinned: false,
        }
    }

    fn commit(&mut self, reply: HttpReply) -> Result<(), TransportError> {
        let Some(sender) = self.reply.as_ref() else {
            return Err(TransportError::AlreadyCommitted);
        };
        if sender.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.pending.is_some() {
            return Err(TransportError::AlreadyCommitted);
        }
        self.pending = Some(reply);
        Ok(())
    }

    fn dispatch(&mut self) {
        let Some(mut reply) = self.pending.take() else {
            return;
        };
        let Some(sender) = self.reply.take() else {
            return;
        };
        reply.close = !self.keepalive;
        let status = reply.status;
        if sender.send(reply).is_err() {
            tracing::debug!(request = %self.request, %status, "client left before reply");
        }
    }
}

impl Connection for HttpConnection {
    fn send_response(&mut self, response: Response) -> Result<(), TransportError> {
        self.commit(HttpReply::from_response(response))
    }

    fn send_status(
        &mut self,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<(), TransportError> {
        let ids = self.id_headers.take();
        self.commit(HttpReply::from_status(status, status_line, ids))
    }

    fn set_message_id_headers(&mut self, id: &MessageId, previous: &MessageId) {
        self.id_headers = Some((id.clone(), previous.clone()));
    }

    fn pin_open(&mut self) {
        self.pinned = true;
        tracing::trace!(request = %self.request, "request pinned open");
    }

    fn schedule_timer(&mut self, after: Duration) -> TimerToken {
        self.next_timer += 1;
        let token = TimerToken::new(self.next_timer);
        let events = self.events.clone();
        let request = self.request;
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(ShardEvent::Timeout { request, token }).await;
        });
        self.timers.push((token, task.abort_handle()));
        token
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        self.timers.retain(|(armed, handle)| {
            if *armed == token {
                handle.abort();
                return false;
            }
            true
        });
    }

    fn disable_keepalive(&mut self) {
        self.keepalive = false;
    }

    fn finalize(&mut self, finalize: Finalize) {
        tracing::trace!(request = %self.request, code = ?finalize.code(), "finalize request");
        self.dispatch();
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("request", &self.request)
            .field("pinned", &self.pinned)
            .field("keepalive", &self.keepalive)
            .field("timers", &self.timers.len())
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain(..) {
            handle.abort();
        }
        self.dispatch();
    }
}

// The upstream call is left to a proxy in front of courier; record the
// outcome it would have been told about.
struct LoggingNotifier {
    url: String,
}

impl UnsubscribeNotifier for LoggingNotifier {
    fn block_on_unsubscribe(&mut self, subscriber: SubscriberId, finalize: Finalize) {
        metrics::counter!("courier_unsubscribe_notifications_total").increment(1);
        tracing::info!(
            %subscriber,
            url = %self.url,
            code = ?finalize.code(),
            "unsubscribe notification"
        );
    }
}

struct Subscription {
    channels: Vec<String>,
    // Latest message id seen per channel tag.
    cursor: MessageId,
}

pub struct Shard {
    pool: SubscriberPool<HttpConnection>,
    store: Arc<MemoryStore>,
    requests: HashMap<RequestKey, SubscriberId>,
    subscriptions: HashMap<SubscriberId, Subscription>,
    waiting: HashMap<String, Vec<SubscriberId>>,
    events: mpsc::Sender<ShardEvent>,
}

/// Starts the shard task and returns the handle used to reach it.
pub fn spawn_shard(config: &CourierConfig) -> (ShardHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.shard_queue_depth);
    let shard = Shard::new(config, tx.clone());
    let task = tokio::spawn(shard.run(rx));
    (ShardHandle { events: tx }, task)
}

impl Shard {
    fn new(config: &CourierConfig, events: mpsc::Sender<ShardEvent>) -> Self {
        let store = Arc::new(MemoryStore::with_log_capacity(config.store_log_capacity));
        let mut pool = SubscriberPool::new(config.longpoll.clone(), store.clone());
        if let Some(url) = config.longpoll.unsubscribe_url.clone() {
            pool = pool.with_notifier_factory(move |_| -> Box<dyn UnsubscribeNotifier> {
                Box::new(LoggingNotifier { url: url.clone() })
            });
        }
        Self {
            pool,
            store,
            requests: HashMap::new(),
            subscriptions: HashMap::new(),
            waiting: HashMap::new(),
            events,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<ShardEvent>) {
        tracing::info!("shard started");
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::info!("shard stopped");
    }

    fn handle(&mut self, event: ShardEvent) {
        match event {
            ShardEvent::Subscribe {
                request,
                channels,
                resume_from,
                reply,
            } => self.subscribe(request, channels, resume_from, reply),
            ShardEvent::Publish {
                channel,
                payload,
                content_type,
                reply,
            } => {
                let published = self.publish(&channel, payload, content_type);
                let _ = reply.send(published);
            }
            ShardEvent::Timeout { request, token } => self.timeout(request, token),
            ShardEvent::Dequeued { subscriber } => self.forget(subscriber),
            ShardEvent::Closed { request } => self.closed(request),
            ShardEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn subscribe(
        &mut self,
        request: RequestKey,
        channels: Vec<String>,
        resume_from: Option<MessageId>,
        reply: oneshot::Sender<HttpReply>,
    ) {
        metrics::counter!("courier_subscribe_requests_total").increment(1);
        let cursor = match &resume_from {
            Some(id) => id.clone(),
            None => MessageId::multiplexed(channels.iter().map(|c| self.store.last_seq(c))),
        };
        let connection = HttpConnection::new(request, reply, self.events.clone());
        let id = self.pool.create(connection, Some(cursor.clone()));
        self.requests.insert(request, id);
        tracing::debug!(%request, subscriber = %id, ?channels, "subscribe");

        if cursor.tag_count() != channels.len() {
            if let Err(err) = self.pool.respond_unqueued_status(
                id,
                StatusCode::BAD_REQUEST,
                Some("message id does not match the subscribed channels"),
            ) {
                tracing::debug!(subscriber = %id, error = %err, "reject failed");
            }
            return;
        }

        let events = self.events.clone();
        if let Err(err) = self.pool.set_dequeue_callback(id, move |subscriber| {
            post_from_sync(&events, ShardEvent::Dequeued { subscriber });
        }) {
            tracing::warn!(subscriber = %id, error = %err, "set dequeue callback failed");
        }

        let backlog = self.backlog(&channels, resume_from.as_ref());
        self.subscriptions.insert(id, Subscription { channels, cursor });
        if !backlog.is_empty() {
            self.deliver_backlog(id, backlog);
            return;
        }

        match self.pool.enqueue(id) {
            Ok(()) => {
                if let Some(subscription) = self.subscriptions.get(&id) {
                    for channel in &subscription.channels {
                        self.waiting.entry(channel.clone()).or_default().push(id);
                    }
                }
            }
            Err(err) => tracing::warn!(subscriber = %id, error = %err, "enqueue failed"),
        }
    }

    fn backlog(&self, channels: &[String], resume_from: Option<&MessageId>) -> Vec<(usize, SharedMessage)> {
        let Some(resume_from) = resume_from else {
            return Vec::new();
        };
        channels
            .iter()
            .enumerate()
            .flat_map(|(tag, channel)| {
                self.store
                    .messages_after(channel, resume_from.seq(tag))
                    .into_iter()
                    .map(move |message| (tag, message))
            })
            .collect()
    }

    fn deliver_backlog(&mut self, id: SubscriberId, backlog: Vec<(usize, SharedMessage)>) {
        let batching = self.pool.config().multimsg;
        if self.pool.reserve(id).is_err() {
            return;
        }
        for (tag, message) in backlog {
            let Some(message) = self.route(id, tag, message) else {
                break;
            };
            if let Err(err) = self.pool.deliver_message(id, message) {
                tracing::warn!(subscriber = %id, error = %err, "backlog delivery failed");
                break;
            }
            // Without batching the oldest message answers the request.
            if !batching {
                break;
            }
        }
        if batching && let Err(err) = self.pool.deliver_status(id, StatusCode::NO_CONTENT, None) {
            tracing::warn!(subscriber = %id, error = %err, "backlog flush failed");
        }
        self.release(id);
    }

    fn publish(
        &mut self,
        channel: &str,
        payload: Bytes,
        content_type: Option<Bytes>,
    ) -> Result<MessageId, StoreError> {
        let message = self.store.publish(channel, payload, content_type)?;
        metrics::counter!("courier_publish_requests_total").increment(1);
        let batching = self.pool.config().multimsg;
        let waiters = self.waiting.remove(channel).unwrap_or_default();
        tracing::debug!(channel, id = %message.id(), waiters = waiters.len(), "publish");

        let mut still_waiting = Vec::new();
        for id in waiters {
            let Some(tag) = self
                .subscriptions
                .get(&id)
                .and_then(|sub| sub.channels.iter().position(|c| c == channel))
            else {
                continue;
            };
            // Held across delivery so a reaped subscriber is not freed mid-call.
            if self.pool.reserve(id).is_err() {
                continue;
            }
            if let Some(routed) = self.route(id, tag, message.clone())
                && let Err(err) = self.pool.deliver_message(id, routed)
            {
                tracing::debug!(subscriber = %id, error = %err, "delivery skipped");
            }
            // The store signals "no more for now" so batches flush right away.
            if batching
                && self.is_enqueued(id)
                && let Err(err) = self.pool.deliver_status(id, StatusCode::NO_CONTENT, None)
            {
                tracing::warn!(subscriber = %id, error = %err, "batch flush failed");
            }
            if self.is_enqueued(id) {
                still_waiting.push(id);
            }
            self.release(id);
        }
        if !still_waiting.is_empty() {
            self.waiting
                .entry(channel.to_string())
                .or_default()
                .extend(still_waiting);
        }
        Ok(message.id().clone())
    }

    fn route(&mut self, id: SubscriberId, tag: usize, message: SharedMessage) -> Option<MessageRef> {
        let subscription = self.subscriptions.get_mut(&id)?;
        let seq = message.id().seq(0)?;
        subscription.cursor = subscription.cursor.with_seq(tag, seq);
        if subscription.channels.len() == 1 {
            return Some(message.into());
        }
        Some(MultiplexCopy::new(message, subscription.cursor.clone()).into())
    }

    fn timeout(&mut self, request: RequestKey, token: TimerToken) {
        let Some(&id) = self.requests.get(&request) else {
            return;
        };
        match self.pool.timeout_fired(id, token) {
            Ok(()) | Err(SubscriberError::NotFound) => {}
            Err(err) => tracing::warn!(subscriber = %id, error = %err, "timeout handling failed"),
        }
        if !self.is_enqueued(id) {
            self.forget(id);
        }
    }

    fn closed(&mut self, request: RequestKey) {
        let Some(id) = self.requests.remove(&request) else {
            return;
        };
        match self.pool.connection_closed(id) {
            Ok(teardown) => tracing::trace!(subscriber = %id, ?teardown, "connection closed"),
            Err(SubscriberError::NotFound) => {}
            Err(err) => tracing::warn!(subscriber = %id, error = %err, "close handling failed"),
        }
        self.forget(id);
    }

    fn release(&mut self, id: SubscriberId) {
        match self.pool.release(id, false) {
            Ok(ReleaseOutcome::Destroyed) => self.forget(id),
            Ok(ReleaseOutcome::Retained) => {}
            Err(err) => tracing::warn!(subscriber = %id, error = %err, "release failed"),
        }
    }

    fn forget(&mut self, id: SubscriberId) {
        let Some(subscription) = self.subscriptions.remove(&id) else {
            return;
        };
        for channel in subscription.channels {
            if let Some(waiters) = self.waiting.get_mut(&channel) {
                waiters.retain(|waiter| *waiter != id);
                if waiters.is_empty() {
                    self.waiting.remove(&channel);
                }
            }
        }
    }

    fn is_enqueued(&self, id: SubscriberId) -> bool {
        self.pool.get(id).is_some_and(|sub| sub.is_enqueued())
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            subscribers: self.pool.len(),
            waiting: self.waiting.values().map(Vec::len).sum(),
            channels: self.store.channel_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::LongpollConfig;

    fn config(longpoll: LongpollConfig) -> CourierConfig {
        CourierConfig {
            http_bind: "127.0.0.1:0".parse().expect("addr"),
            metrics_bind: "127.0.0.1:0".parse().expect("addr"),
            shard_queue_depth: 64,
            store_log_capacity: 16,
            longpoll,
        }
    }

    async fn wait_for_waiting(shard: &ShardHandle, expected: usize) {
        for _ in 0..100 {
            if shard.stats().await.expect("stats").waiting == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("waiting count never reached {expected}");
    }

    #[tokio::test]
    async fn publish_answers_waiting_subscriber() {
        let (shard, task) = spawn_shard(&config(LongpollConfig::default()));
        let request = RequestKey::next();
        let rx = shard
            .subscribe(request, vec!["news".to_string()], None)
            .await
            .expect("subscribe");
        wait_for_waiting(&shard, 1).await;

        let id = shard
            .publish("news".to_string(), Bytes::from_static(b"hello"), None)
            .await
            .expect("publish");
        assert_eq!(id, MessageId::new(1));

        let reply = rx.await.expect("reply");
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, Bytes::from_static(b"hello"));
        assert_eq!(reply.message_id, Some(MessageId::new(1)));
        assert_eq!(reply.previous_message_id, Some(MessageId::new(0)));

        shard.closed(request);
        let stats = shard.stats().await.expect("stats");
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.waiting, 0);
        task.abort();
    }

    #[tokio::test]
    async fn closed_request_leaves_no_waiter() {
        let (shard, task) = spawn_shard(&config(LongpollConfig::default()));
        let request = RequestKey::next();
        let rx = shard
            .subscribe(request, vec!["a".to_string(), "b".to_string()], None)
            .await
            .expect("subscribe");
        wait_for_waiting(&shard, 2).await;
        drop(rx);
        shard.closed(request);
        let stats = shard.stats().await.expect("stats");
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.waiting, 0);
        task.abort();
    }

    #[tokio::test]
    async fn mismatched_resume_id_is_rejected() {
        let (shard, task) = spawn_shard(&config(LongpollConfig::default()));
        let rx = shard
            .subscribe(
                RequestKey::next(),
                vec!["a".to_string(), "b".to_string()],
                Some(MessageId::new(3)),
            )
            .await
            .expect("subscribe");
        let reply = rx.await.expect("reply");
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        task.abort();
    }

    #[tokio::test]
    async fn multiplexed_delivery_advances_one_tag() {
        let (shard, task) = spawn_shard(&config(LongpollConfig::default()));
        shard
            .publish("a".to_string(), Bytes::from_static(b"old"), None)
            .await
            .expect("publish");
        let rx = shard
            .subscribe(
                RequestKey::next(),
                vec!["a".to_string(), "b".to_string()],
                None,
            )
            .await
            .expect("subscribe");
        wait_for_waiting(&shard, 2).await;
        shard
            .publish("b".to_string(), Bytes::from_static(b"new"), None)
            .await
            .expect("publish");
        let reply = rx.await.expect("reply");
        assert_eq!(reply.message_id, Some(MessageId::multiplexed([1, 1])));
        assert_eq!(reply.previous_message_id, Some(MessageId::multiplexed([1, 0])));
        task.abort();
    }

    #[tokio::test]
    async fn timeout_answers_with_request_timeout() {
        let longpoll = LongpollConfig {
            subscriber_timeout_secs: 1,
            ..LongpollConfig::default()
        };
        let (shard, task) = spawn_shard(&config(longpoll));
        let rx = shard
            .subscribe(RequestKey::next(), vec!["idle".to_string()], None)
            .await
            .expect("subscribe");
        let reply = rx.await.expect("reply");
        assert_eq!(reply.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(reply.message_id, Some(MessageId::new(0)));
        task.abort();
    }

    #[tokio::test]
    async fn timeout_forgets_subscriber_before_dequeue_event_arrives() {
        let longpoll = LongpollConfig {
            subscriber_timeout_secs: 1,
            ..LongpollConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let mut shard = Shard::new(&config(longpoll), tx);
        let (reply, reply_rx) = oneshot::channel();
        shard.handle(ShardEvent::Subscribe {
            request: RequestKey::next(),
            channels: vec!["idle".to_string()],
            resume_from: None,
            reply,
        });
        assert_eq!(shard.stats().waiting, 1);

        // Drive the shard by hand so the queued Dequeued event is never seen.
        let timeout = loop {
            let event = rx.recv().await.expect("timer event");
            if matches!(event, ShardEvent::Timeout { .. }) {
                break event;
            }
        };
        shard.handle(timeout);

        let stats = shard.stats();
        assert_eq!((stats.subscribers, stats.waiting), (0, 0));
        assert!(shard.subscriptions.is_empty());
        let reply = reply_rx.await.expect("reply");
        assert_eq!(reply.status, StatusCode::REQUEST_TIMEOUT);
    }
}
