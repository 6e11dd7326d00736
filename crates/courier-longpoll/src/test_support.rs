// Recording doubles for subscriber unit tests.
use bytes::Bytes;
use courier_common::ids::MessageId;
use courier_store::{MemoryStore, MessageStore, SharedMessage, StoreError};
use http::StatusCode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::assembler::Response;
use crate::connection::{Connection, Finalize, TimerToken};
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Response(Response),
    Status(StatusCode, Option<String>),
    MessageIdHeaders(MessageId, MessageId),
    PinOpen,
    TimerScheduled(TimerToken, Duration),
    TimerCancelled(TimerToken),
    KeepaliveDisabled,
    Finalized(Finalize),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Vec<Event>,
    fail_sends: bool,
    next_timer: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingConnection(Arc<Mutex<Recorder>>);

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self) {
        self.0.lock().fail_sends = true;
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().events.iter().filter(|e| pred(e)).count()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.0
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Response(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn finalized(&self) -> Vec<Finalize> {
        self.0
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Finalized(finalize) => Some(*finalize),
                _ => None,
            })
            .collect()
    }

    pub fn last_timer(&self) -> Option<TimerToken> {
        self.0.lock().events.iter().rev().find_map(|e| match e {
            Event::TimerScheduled(token, _) => Some(*token),
            _ => None,
        })
    }

    fn push(&self, event: Event) {
        self.0.lock().events.push(event);
    }

    fn send(&self, event: Event) -> Result<(), TransportError> {
        let mut recorder = self.0.lock();
        if recorder.fail_sends {
            return Err(TransportError::Closed);
        }
        recorder.events.push(event);
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn send_response(&mut self, response: Response) -> Result<(), TransportError> {
        self.send(Event::Response(response))
    }

    fn send_status(
        &mut self,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<(), TransportError> {
        self.send(Event::Status(status, status_line.map(str::to_string)))
    }

    fn set_message_id_headers(&mut self, id: &MessageId, previous: &MessageId) {
        self.push(Event::MessageIdHeaders(id.clone(), previous.clone()));
    }

    fn pin_open(&mut self) {
        self.push(Event::PinOpen);
    }

    fn schedule_timer(&mut self, after: Duration) -> TimerToken {
        let mut recorder = self.0.lock();
        recorder.next_timer += 1;
        let token = TimerToken::new(recorder.next_timer);
        recorder.events.push(Event::TimerScheduled(token, after));
        token
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        self.push(Event::TimerCancelled(token));
    }

    fn disable_keepalive(&mut self) {
        self.push(Event::KeepaliveDisabled);
    }

    fn finalize(&mut self, finalize: Finalize) {
        self.push(Event::Finalized(finalize));
    }
}

/// MemoryStore wrapper that logs the order of releases.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    releases: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, channel: &str, payload: Bytes) -> SharedMessage {
        self.inner
            .publish(channel, payload, None)
            .expect("publish to recording store")
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().clone()
    }
}

impl MessageStore for RecordingStore {
    fn reserve(&self, message: &SharedMessage, reason: &'static str) {
        self.inner.reserve(message, reason);
    }

    fn release(&self, message: &SharedMessage, reason: &'static str) -> Result<(), StoreError> {
        self.releases.lock().push(message.id().to_string());
        self.inner.release(message, reason)
    }
}
