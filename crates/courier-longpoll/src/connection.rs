//! Transport seam consumed by the subscriber.
//!
//! The subscriber never owns sockets or timers directly. It asks the
//! connection to pin itself open, schedule or cancel a timer, send a
//! response and finalize. Events flowing the other way (timer fired,
//! connection closed) are fed back through [`crate::SubscriberPool`].
use courier_common::ids::MessageId;
use http::StatusCode;
use std::fmt;
use std::time::Duration;

use crate::assembler::Response;
use crate::error::TransportError;

/// Handle to a scheduled timer. Tokens are compared at fire time so a timer
/// that was cancelled or replaced never acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// How the underlying request is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    // The response (if any) has been handed to the transport.
    Complete,
    // The client went away; used when an upstream unsubscribe call owns the
    // real outcome.
    ClientClosed,
}

impl Finalize {
    pub const CLIENT_CLOSED_REQUEST: u16 = 499;

    pub fn code(self) -> Option<u16> {
        match self {
            Finalize::Complete => None,
            Finalize::ClientClosed => Some(Self::CLIENT_CLOSED_REQUEST),
        }
    }
}

pub trait Connection {
    fn send_response(&mut self, response: Response) -> Result<(), TransportError>;

    fn send_status(
        &mut self,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<(), TransportError>;

    fn set_message_id_headers(&mut self, id: &MessageId, previous: &MessageId);

    /// Keep the request open past the handler returning. Called at most once
    /// per subscriber.
    fn pin_open(&mut self);

    fn schedule_timer(&mut self, after: Duration) -> TimerToken;

    fn cancel_timer(&mut self, token: TimerToken);

    fn disable_keepalive(&mut self);

    fn finalize(&mut self, finalize: Finalize);
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn send_response(&mut self, response: Response) -> Result<(), TransportError> {
        (**self).send_response(response)
    }

    fn send_status(
        &mut self,
        status: StatusCode,
        status_line: Option<&str>,
    ) -> Result<(), TransportError> {
        (**self).send_status(status, status_line)
    }

    fn set_message_id_headers(&mut self, id: &MessageId, previous: &MessageId) {
        (**self).set_message_id_headers(id, previous)
    }

    fn pin_open(&mut self) {
        (**self).pin_open()
    }

    fn schedule_timer(&mut self, after: Duration) -> TimerToken {
        (**self).schedule_timer(after)
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        (**self).cancel_timer(token)
    }

    fn disable_keepalive(&mut self) {
        (**self).disable_keepalive()
    }

    fn finalize(&mut self, finalize: Finalize) {
        (**self).finalize(finalize)
    }
}
