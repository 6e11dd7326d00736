//! Long-poll subscriber state machine.
//!
//! A subscriber can be fulfilled (message or status), timed out, or torn
//! down by the client closing the connection. These triggers arrive in any
//! order; the guards below (`state`, reservations, the armed disconnect hook,
//! the timer token and the finalize flag) make whichever fires first win and
//! turn the others into no-ops.
use courier_common::LongpollConfig;
use courier_common::ids::MessageId;
use courier_store::{MessageRef, MessageStore};
use http::StatusCode;
use std::fmt;
use std::sync::Arc;

use crate::assembler::{self, BatchEncoding};
use crate::batch::Batch;
use crate::connection::{Connection, Finalize, TimerToken};
use crate::error::{Result, SubscriberError, invariant_violation};
use crate::notifier::UnsubscribeNotifier;
use crate::pool::SubscriberId;
use crate::reservation::{Release, Reservations};
use crate::status::{self, StatusAction};

pub type DequeueCallback = Box<dyn FnOnce(SubscriberId) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    // Created, or dequeued without being finalized.
    Created,
    Enqueued,
    Responding,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Single,
    Batch(BatchEncoding),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectHook {
    // Client close before a response was committed.
    Abort,
    Disarmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Retained,
    // The deferred destroy ran; the caller must stop using the subscriber.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    // Nothing to tear down.
    Retained,
    // Reserved; freed by the last release.
    Deferred,
    Freed,
}

pub struct Subscriber<C> {
    id: SubscriberId,
    connection: C,
    config: Arc<LongpollConfig>,
    mode: Mode,
    state: SubscriberState,
    reservations: Reservations,
    last_message_id: MessageId,
    previous_message_id: MessageId,
    timer: Option<TimerToken>,
    on_dequeue: Option<DequeueCallback>,
    connection_held: bool,
    batch: Batch,
    disconnect_hook: DisconnectHook,
    // Release the batch when the connection goes away.
    batch_cleanup_armed: bool,
    finalize_on_dequeue: bool,
    dequeue_after_response: bool,
    already_responded: bool,
    was_enqueued: bool,
    act_as_interval_poll: bool,
    notifier: Option<Box<dyn UnsubscribeNotifier>>,
    freed: bool,
}

impl<C: Connection> Subscriber<C> {
    pub fn new(
        id: SubscriberId,
        connection: C,
        config: Arc<LongpollConfig>,
        store: Arc<dyn MessageStore>,
        resume_from: Option<MessageId>,
    ) -> Self {
        let mode = if config.multimsg {
            Mode::Batch(BatchEncoding::from_config(&config))
        } else {
            Mode::Single
        };
        tracing::debug!(subscriber = %id, ?mode, "create subscriber");
        Self {
            id,
            connection,
            mode,
            state: SubscriberState::Created,
            reservations: Reservations::default(),
            last_message_id: resume_from.unwrap_or_default(),
            previous_message_id: MessageId::unset(),
            timer: None,
            on_dequeue: None,
            connection_held: false,
            batch: Batch::new(store),
            disconnect_hook: DisconnectHook::Abort,
            batch_cleanup_armed: false,
            finalize_on_dequeue: true,
            // Batching subscribers stay registered until a flush.
            dequeue_after_response: !config.multimsg,
            already_responded: false,
            was_enqueued: false,
            act_as_interval_poll: config.act_as_interval_poll,
            notifier: None,
            freed: false,
            config,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn is_enqueued(&self) -> bool {
        self.state == SubscriberState::Enqueued
    }

    pub fn is_batching(&self) -> bool {
        matches!(self.mode, Mode::Batch(_))
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    pub fn last_message_id(&self) -> &MessageId {
        &self.last_message_id
    }

    pub fn previous_message_id(&self) -> &MessageId {
        &self.previous_message_id
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// A flushed batch still reserved until the connection closes.
    pub fn batch_cleanup_pending(&self) -> bool {
        self.batch_cleanup_armed
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn connection_held(&self) -> bool {
        self.connection_held
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn set_interval_poll(&mut self, enabled: bool) {
        self.act_as_interval_poll = enabled;
    }

    pub fn set_unsubscribe_notifier(&mut self, notifier: Box<dyn UnsubscribeNotifier>) {
        self.notifier = Some(notifier);
    }

    pub fn set_dequeue_callback(&mut self, callback: impl FnOnce(SubscriberId) + Send + 'static) {
        self.on_dequeue = Some(Box::new(callback));
    }

    pub fn enqueue(&mut self) -> Result<()> {
        match self.state {
            SubscriberState::Enqueued => return Err(SubscriberError::AlreadyEnqueued),
            SubscriberState::Dead => return Err(SubscriberError::Dead),
            SubscriberState::Created | SubscriberState::Responding => {}
        }
        tracing::debug!(subscriber = %self.id, "enqueue");
        self.finalize_on_dequeue = true;
        self.hold_connection();
        if let Some(timeout) = self.config.subscriber_timeout() {
            self.cancel_timer();
            self.timer = Some(self.connection.schedule_timer(timeout));
        }
        self.was_enqueued = true;
        self.state = SubscriberState::Enqueued;
        Ok(())
    }

    /// Unregisters the subscriber. The dequeue callback runs at most once per
    /// subscriber and the terminal finalize at most once per enqueue.
    pub fn dequeue(&mut self) {
        self.cancel_timer();
        tracing::debug!(subscriber = %self.id, "dequeue");
        if let Some(callback) = self.on_dequeue.take() {
            callback(self.id);
        }
        if self.state != SubscriberState::Dead {
            self.state = SubscriberState::Created;
        }
        if self.finalize_on_dequeue {
            self.finalize_on_dequeue = false;
            self.finalize_connection(Finalize::Complete);
            self.state = SubscriberState::Dead;
        }
    }

    pub fn reserve(&mut self) -> usize {
        self.hold_connection();
        let count = self.reservations.reserve();
        tracing::trace!(subscriber = %self.id, reservations = count, "reserve");
        count
    }

    pub fn release(&mut self, suppress_destroy: bool) -> Result<ReleaseOutcome> {
        let release = self.reservations.release(suppress_destroy)?;
        tracing::trace!(
            subscriber = %self.id,
            reservations = self.reservations.count(),
            "release"
        );
        match release {
            Release::Retained => Ok(ReleaseOutcome::Retained),
            Release::DestroyNow => {
                self.free()?;
                Ok(ReleaseOutcome::Destroyed)
            }
        }
    }

    pub fn destroy(&mut self) -> Result<Teardown> {
        if self.freed {
            return Ok(Teardown::Freed);
        }
        if !self.reservations.request_destroy() {
            tracing::debug!(
                subscriber = %self.id,
                reservations = self.reservations.count(),
                "destroy deferred while reserved"
            );
            return Ok(Teardown::Deferred);
        }
        self.free()?;
        Ok(Teardown::Freed)
    }

    pub fn deliver_message(&mut self, message: MessageRef) -> Result<()> {
        if self.state == SubscriberState::Dead {
            return Err(SubscriberError::Dead);
        }
        tracing::debug!(subscriber = %self.id, id = %message.id(), "deliver message");
        self.previous_message_id =
            std::mem::replace(&mut self.last_message_id, message.id().clone());
        self.cancel_timer();

        match &self.mode {
            Mode::Single => {
                // The response is committed from here on.
                self.disconnect_hook = DisconnectHook::Disarmed;
                if self.already_responded {
                    return Err(invariant_violation!(
                        "single-message subscriber responded more than once"
                    ));
                }
                self.already_responded = true;
                self.state = SubscriberState::Responding;
                let response = assembler::render_message(
                    message.message(),
                    &self.last_message_id,
                    &self.previous_message_id,
                );
                if let Err(err) = self.connection.send_response(response) {
                    return self.abort_response(err.into());
                }
                metrics::counter!("courier_longpoll_responses_total", "kind" => "message")
                    .increment(1);
            }
            Mode::Batch(_) => {
                if let Err(err) = self.batch.add(message) {
                    return self.abort_response(err);
                }
            }
        }
        self.dequeue_maybe();
        Ok(())
    }

    pub fn deliver_status(&mut self, status: StatusCode, status_line: Option<&str>) -> Result<()> {
        if self.state == SubscriberState::Dead {
            return Err(SubscriberError::Dead);
        }
        match status::classify(
            status,
            status_line,
            self.act_as_interval_poll,
            self.is_batching(),
        ) {
            StatusAction::Wait => Ok(()),
            StatusAction::Flush => {
                if self.batch.is_empty() {
                    return Ok(());
                }
                let flushed = self.flush_batch();
                self.dequeue_maybe();
                flushed
            }
            StatusAction::Respond(translated) => {
                let status_line = if translated == status { status_line } else { None };
                self.respond_status(translated, status_line)
            }
        }
    }

    /// Fires the armed timeout. Stale or cancelled tokens are ignored.
    pub fn timeout_fired(&mut self, token: TimerToken) -> Result<()> {
        if self.timer != Some(token) {
            tracing::trace!(subscriber = %self.id, %token, "ignoring stale timer");
            return Ok(());
        }
        self.timer = None;
        tracing::debug!(subscriber = %self.id, "subscriber timed out");
        metrics::counter!("courier_longpoll_timeouts_total").increment(1);
        self.dequeue_after_response = true;
        self.deliver_status(StatusCode::REQUEST_TIMEOUT, None)
    }

    /// Called by the transport whenever the connection goes away, whether
    /// after a response or because the client hung up first.
    pub fn connection_closed(&mut self) -> Result<Teardown> {
        let cleanup = if std::mem::take(&mut self.batch_cleanup_armed) {
            self.batch.release_all().map(|_| ())
        } else {
            Ok(())
        };
        let teardown =
            match std::mem::replace(&mut self.disconnect_hook, DisconnectHook::Disarmed) {
                DisconnectHook::Abort => self.abrupt_disconnect()?,
                DisconnectHook::Disarmed => Teardown::Retained,
            };
        cleanup?;
        Ok(teardown)
    }

    /// Ends the wait after statuses that forbid reusing the connection.
    /// Returns whether the subscriber was dequeued.
    pub fn dequeue_after_status(&mut self, status: StatusCode) -> bool {
        if !status::ends_wait(status) {
            return false;
        }
        self.disconnect_hook = DisconnectHook::Disarmed;
        self.connection.disable_keepalive();
        if self.config.unsubscribe_url.is_none() {
            self.finalize_on_dequeue = true;
        }
        self.dequeue();
        true
    }

    /// Rejects a subscriber that never made it into a channel's wait list.
    pub fn respond_unqueued_status(
        &mut self,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<()> {
        self.disconnect_hook = DisconnectHook::Disarmed;
        self.finalize_on_dequeue = false;
        self.state = SubscriberState::Dead;
        self.dequeue();
        let sent = self.connection.send_status(status, status_line);
        self.connection.finalize(Finalize::Complete);
        sent.map_err(Into::into)
    }

    fn respond_status(&mut self, status: StatusCode, status_line: Option<&str>) -> Result<()> {
        tracing::debug!(subscriber = %self.id, %status, "respond status");
        if self.is_batching() {
            self.dequeue_after_response = true;
        }
        self.connection
            .set_message_id_headers(&self.last_message_id, &self.previous_message_id);
        self.disconnect_hook = DisconnectHook::Disarmed;
        self.state = SubscriberState::Responding;
        let sent = self.connection.send_status(status, status_line);
        metrics::counter!("courier_longpoll_responses_total", "kind" => "status").increment(1);
        self.dequeue_maybe();
        sent.map_err(|err| {
            tracing::warn!(subscriber = %self.id, error = %err, "status response failed");
            err.into()
        })
    }

    fn flush_batch(&mut self) -> Result<()> {
        let Mode::Batch(encoding) = &self.mode else {
            return Ok(());
        };
        self.disconnect_hook = DisconnectHook::Disarmed;
        self.dequeue_after_response = true;
        // Entries stay reserved until the transport lets go of the response.
        self.batch_cleanup_armed = true;
        let Some(response) =
            assembler::render_batch(self.batch.entries(), encoding, &self.previous_message_id)
        else {
            return Ok(());
        };
        self.state = SubscriberState::Responding;
        metrics::histogram!("courier_longpoll_batch_messages").record(self.batch.len() as f64);
        tracing::debug!(
            subscriber = %self.id,
            messages = self.batch.len(),
            bytes = response.content_length(),
            "flush batch"
        );
        if let Err(err) = self.connection.send_response(response) {
            // Nothing reached the transport, so no close will run the cleanup.
            self.batch_cleanup_armed = false;
            if let Err(release_err) = self.batch.release_all() {
                tracing::error!(subscriber = %self.id, error = %release_err, "batch release failed");
            }
            return self.abort_response(err.into());
        }
        metrics::counter!("courier_longpoll_responses_total", "kind" => "batch").increment(1);
        Ok(())
    }

    fn abrupt_disconnect(&mut self) -> Result<Teardown> {
        tracing::debug!(subscriber = %self.id, "client closed before response");
        metrics::counter!("courier_longpoll_disconnects_total").increment(1);
        if self.config.unsubscribe_url.is_some() {
            match self.notifier.as_mut() {
                Some(notifier) => notifier.block_on_unsubscribe(self.id, Finalize::ClientClosed),
                None => tracing::warn!(
                    subscriber = %self.id,
                    "unsubscribe url configured but no notifier attached"
                ),
            }
        }
        self.state = SubscriberState::Dead;
        // The connection is already gone; nothing to finalize.
        self.finalize_on_dequeue = false;
        self.dequeue();
        self.destroy()
    }

    fn abort_response(&mut self, err: SubscriberError) -> Result<()> {
        tracing::warn!(subscriber = %self.id, error = %err, "aborting response");
        metrics::counter!("courier_longpoll_aborted_responses_total").increment(1);
        self.dequeue_maybe();
        Err(err)
    }

    fn dequeue_maybe(&mut self) {
        if self.dequeue_after_response {
            self.dequeue();
        }
    }

    fn finalize_connection(&mut self, mut finalize: Finalize) {
        if self.was_enqueued && self.config.unsubscribe_url.is_some() {
            match self.notifier.as_mut() {
                Some(notifier) => {
                    notifier.block_on_unsubscribe(self.id, finalize);
                    finalize = Finalize::ClientClosed;
                }
                None => tracing::warn!(
                    subscriber = %self.id,
                    "unsubscribe url configured but no notifier attached"
                ),
            }
        }
        self.connection.finalize(finalize);
    }

    fn hold_connection(&mut self) {
        if !self.connection_held {
            self.connection_held = true;
            self.connection.pin_open();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            self.connection.cancel_timer(token);
        }
    }

    fn free(&mut self) -> Result<()> {
        if self.state != SubscriberState::Dead {
            return Err(invariant_violation!("freeing a subscriber that is not dead"));
        }
        tracing::debug!(subscriber = %self.id, "free subscriber");
        self.freed = true;
        self.batch_cleanup_armed = false;
        self.last_message_id = MessageId::unset();
        self.previous_message_id = MessageId::unset();
        if let Err(err) = self.batch.release_all() {
            tracing::error!(subscriber = %self.id, error = %err, "batch release on free failed");
        }
        Ok(())
    }
}

impl<C> fmt::Debug for Subscriber<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("reservations", &self.reservations)
            .field("last_message_id", &self.last_message_id)
            .field("batch", &self.batch.len())
            .finish_non_exhaustive()
    }
}
