use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Crate-wide error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum CometError {
    /// Raised by [`crate::registry::Registry::create`] when the population
    /// cap would be exceeded. Not reachable from the HTTP path: the handler
    /// never creates channels, only looks them up.
    #[error("too many virtual channels")]
    TooManyChannels,

    /// The request body exceeded the host's per-request size cap.
    #[error("request body too large")]
    InputTooLarge,

    /// Both `active` and `ended` decoded empty, or the body could not be
    /// decoded as form data at all.
    #[error("empty or incorrect registration")]
    BadRequest,

    /// A config attribute was missing or malformed; refuses to start.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IntoResponse for CometError {
    fn into_response(self) -> Response {
        match self {
            CometError::BadRequest => (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/html")],
                "Empty or incorrect registration",
            )
                .into_response(),
            CometError::InputTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                [(header::CONTENT_TYPE, "text/html")],
                "Request body too large",
            )
                .into_response(),
            CometError::TooManyChannels => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/html")],
                "Too many virtual channels",
            )
                .into_response(),
            CometError::Config(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}
