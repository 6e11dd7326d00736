// Status/control event policy for long-poll subscribers.
use http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    // Nothing to send; the wait continues.
    Wait,
    // Send whatever the batch holds (nothing if it is empty).
    Flush,
    // Terminal: send this status and end the wait.
    Respond(StatusCode),
}

pub fn classify(
    status: StatusCode,
    status_line: Option<&str>,
    interval_poll: bool,
    batching: bool,
) -> StatusAction {
    if interval_poll {
        if matches!(
            status,
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND
        ) {
            return StatusAction::Respond(StatusCode::NOT_MODIFIED);
        }
        return StatusAction::Respond(status);
    }
    if status == StatusCode::NO_CONTENT
        || (status == StatusCode::NOT_MODIFIED && status_line.is_none())
    {
        return if batching {
            StatusAction::Flush
        } else {
            StatusAction::Wait
        };
    }
    StatusAction::Respond(status)
}

/// Statuses after which the connection must not be reused for another wait.
pub fn ends_wait(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error() || status == StatusCode::NOT_MODIFIED
}
