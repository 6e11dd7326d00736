//! Response rendering for long-poll subscribers.
//!
//! A response body is an ordered list of immutable [`Segment`]s. The length
//! is accumulated while segments are pushed, so the declared
//! `Content-Length` always equals the bytes a writer will emit.
//!
//! Batches use one of two encodings:
//!
//! - raw separator: `payload + separator` for every message, last included;
//! - multipart: `--b`, part header, payload, then `\r\n--b` before each
//!   following part and `\r\n--b--\r\n` after the last one.
//!
//! A batch of one renders exactly like a single message.
use bytes::{Bytes, BytesMut};
use courier_common::LongpollConfig;
use courier_common::ids::MessageId;
use courier_store::{Message, MessageRef};
use http::StatusCode;
use rand::Rng;
use std::fmt;

const BOUNDARY_LEN: usize = 32;
// RFC 2046 caps boundaries at 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;
const HEX: &[u8; 16] = b"0123456789abcdef";
const BLANK_PART_HEADER: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Boundary,
    PartHeader,
    Payload,
    Separator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    segments: Vec<Segment>,
    len: usize,
}

impl Body {
    fn with_capacity(segments: usize) -> Self {
        Self {
            segments: Vec::with_capacity(segments),
            len: 0,
        }
    }

    // Empty segments are skipped; an empty payload emits nothing.
    fn push(&mut self, kind: SegmentKind, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push(Segment { kind, bytes });
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn to_bytes(&self) -> Bytes {
        if let [only] = self.segments.as_slice() {
            return only.bytes.clone();
        }
        let mut buf = BytesMut::with_capacity(self.len);
        for segment in &self.segments {
            buf.extend_from_slice(&segment.bytes);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: Option<Bytes>,
    pub message_id: MessageId,
    pub previous_message_id: MessageId,
    pub body: Body,
}

impl Response {
    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEncoding {
    RawSeparator(Bytes),
    Multipart,
}

impl BatchEncoding {
    pub fn from_config(config: &LongpollConfig) -> Self {
        if config.use_raw_stream_separator {
            BatchEncoding::RawSeparator(Bytes::copy_from_slice(config.raw_separator()))
        } else {
            BatchEncoding::Multipart
        }
    }
}

/// Multipart boundary token, generated once per response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl Boundary {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..BOUNDARY_LEN)
            .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
            .collect();
        Self(token)
    }

    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let valid = !token.is_empty()
            && token.len() <= MAX_BOUNDARY_LEN
            && token.bytes().all(|b| b.is_ascii_alphanumeric() || b"'()+_,-./:=?".contains(&b));
        valid.then_some(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn content_type(&self) -> Bytes {
        Bytes::from(format!("multipart/mixed; boundary={}", self.0))
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn render_message(message: &Message, id: &MessageId, previous: &MessageId) -> Response {
    let mut body = Body::with_capacity(1);
    body.push(SegmentKind::Payload, message.payload.clone());
    Response {
        status: StatusCode::OK,
        content_type: message.content_type.clone().filter(|ct| !ct.is_empty()),
        message_id: id.clone(),
        previous_message_id: previous.clone(),
        body,
    }
}

/// Renders a batch; `None` for an empty batch. Message id headers carry the
/// last message's id.
pub fn render_batch(
    parts: &[MessageRef],
    encoding: &BatchEncoding,
    previous: &MessageId,
) -> Option<Response> {
    let (last, rest) = parts.split_last()?;
    if rest.is_empty() {
        return Some(render_message(last.message(), last.id(), previous));
    }
    let response = match encoding {
        BatchEncoding::RawSeparator(separator) => render_raw(parts, separator, previous),
        BatchEncoding::Multipart => render_multipart(parts, &Boundary::random(), previous),
    };
    Some(response)
}

pub fn render_raw(parts: &[MessageRef], separator: &Bytes, previous: &MessageId) -> Response {
    let mut body = Body::with_capacity(parts.len() * 2);
    for part in parts {
        body.push(SegmentKind::Payload, part.message().payload.clone());
        body.push(SegmentKind::Separator, separator.clone());
    }
    Response {
        status: StatusCode::OK,
        content_type: None,
        message_id: last_id(parts),
        previous_message_id: previous.clone(),
        body,
    }
}

pub fn render_multipart(parts: &[MessageRef], boundary: &Boundary, previous: &MessageId) -> Response {
    let open = Bytes::from(format!("--{boundary}"));
    let mid = Bytes::from(format!("\r\n--{boundary}"));
    let close = Bytes::from(format!("\r\n--{boundary}--\r\n"));
    let blank = Bytes::from_static(BLANK_PART_HEADER);

    let mut body = Body::with_capacity(parts.len() * 3 + 1);
    for (idx, part) in parts.iter().enumerate() {
        let message = part.message();
        body.push(
            SegmentKind::Boundary,
            if idx == 0 { open.clone() } else { mid.clone() },
        );
        let header = match &message.content_type {
            Some(content_type) if !content_type.is_empty() => part_header(content_type),
            _ => blank.clone(),
        };
        body.push(SegmentKind::PartHeader, header);
        body.push(SegmentKind::Payload, message.payload.clone());
    }
    body.push(SegmentKind::Boundary, close);

    Response {
        status: StatusCode::OK,
        content_type: Some(boundary.content_type()),
        message_id: last_id(parts),
        previous_message_id: previous.clone(),
        body,
    }
}

fn part_header(content_type: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(content_type.len() + 20);
    buf.extend_from_slice(b"\r\nContent-Type: ");
    buf.extend_from_slice(content_type);
    buf.extend_from_slice(b"\r\n\r\n");
    buf.freeze()
}

fn last_id(parts: &[MessageRef]) -> MessageId {
    parts
        .last()
        .map(|part| part.id().clone())
        .unwrap_or_default()
}
