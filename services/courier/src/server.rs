// HTTP surface: long-poll subscribe and publish endpoints.
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use courier_common::ids::MessageId;
use courier_store::StoreError;

use crate::shard::{HttpReply, RequestKey, ShardError, ShardHandle};

pub const LAST_MESSAGE_ID: &str = "x-last-msg-id";
pub const MESSAGE_ID: &str = "x-msg-id";
pub const PREVIOUS_MESSAGE_ID: &str = "x-prev-msg-id";

pub fn router(shard: ShardHandle) -> Router {
    Router::new()
        .route("/sub/:channels", get(subscribe))
        .route("/pub/:channel", post(publish))
        .with_state(shard)
}

// Posts `Closed` when the handler future ends, including when the client
// hangs up and the server drops it mid-wait.
struct CloseGuard {
    request: RequestKey,
    shard: ShardHandle,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.shard.closed(self.request);
    }
}

async fn subscribe(
    State(shard): State<ShardHandle>,
    Path(channels): Path<String>,
    headers: HeaderMap,
) -> Response {
    let channels = match parse_channels(&channels) {
        Ok(channels) => channels,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };
    let resume_from = match parse_resume(&headers) {
        Ok(resume_from) => resume_from,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    let request = RequestKey::next();
    let _guard = CloseGuard {
        request,
        shard: shard.clone(),
    };
    let reply = match shard.subscribe(request, channels, resume_from).await {
        Ok(reply) => reply,
        Err(err) => return unavailable(err),
    };
    match reply.await {
        Ok(reply) => reply.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "subscriber dropped").into_response(),
    }
}

async fn publish(
    State(shard): State<ShardHandle>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .map(|value| Bytes::copy_from_slice(value.as_bytes()));
    match shard.publish(channel, body, content_type).await {
        Ok(id) => {
            let id = id.to_string();
            (StatusCode::ACCEPTED, [(MESSAGE_ID, id.clone())], id).into_response()
        }
        Err(ShardError::Store(StoreError::InvalidChannel(name))) => {
            (StatusCode::BAD_REQUEST, format!("invalid channel: {name:?}")).into_response()
        }
        Err(err) => unavailable(err),
    }
}

fn unavailable(err: ShardError) -> Response {
    tracing::warn!(error = %err, "shard unavailable");
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
}

fn parse_channels(raw: &str) -> Result<Vec<String>, &'static str> {
    let channels: Vec<String> = raw.split(',').map(str::to_string).collect();
    if channels.iter().any(String::is_empty) {
        return Err("empty channel name");
    }
    Ok(channels)
}

fn parse_resume(headers: &HeaderMap) -> Result<Option<MessageId>, &'static str> {
    let Some(value) = headers.get(LAST_MESSAGE_ID) else {
        return Ok(None);
    };
    let id = value
        .to_str()
        .ok()
        .and_then(|value| value.parse::<MessageId>().ok())
        .ok_or("malformed message id")?;
    // "-" carries no position; treat it like a fresh subscription.
    Ok((!id.is_unset()).then_some(id))
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        let mut response = Body::from(self.body).into_response();
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        if let Some(content_type) = self.content_type
            && let Ok(value) = HeaderValue::from_maybe_shared(content_type)
        {
            headers.insert(CONTENT_TYPE, value);
        }
        for (name, id) in [
            (MESSAGE_ID, self.message_id),
            (PREVIOUS_MESSAGE_ID, self.previous_message_id),
        ] {
            if let Some(id) = id.filter(|id| !id.is_unset())
                && let Ok(value) = HeaderValue::from_str(&id.to_string())
            {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        if self.close {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}
