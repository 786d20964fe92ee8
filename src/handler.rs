use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::warn;

use crate::channel::{Channel, Outcome};
use crate::codec::{self, DeliveredEvent, Subscription};
use crate::config::CometConfig;
use crate::error::CometError;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<CometConfig>,
}

/// Reports delivery outcomes once the response body has actually left the
/// process. Rust's HTTP stack gives us no native "transmission finished"
/// hook, so this drop guard stands in for the finalizer spec §4.3/§9
/// describes: it reports `delivered` if the stream generator ran to
/// completion (the whole body was handed to the body sink) and `failed`
/// if it gets dropped first (e.g. the client disconnected mid-write).
struct OutcomeReporter {
    pending: Vec<(Arc<Channel>, u64)>,
    delivered: bool,
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        let outcome = if self.delivered {
            Outcome::Delivered
        } else {
            Outcome::Failed
        };
        for (channel, tag) in self.pending.drain(..) {
            channel.report_outcome(outcome, tag);
        }
    }
}

/// The `comet` extension entry point (spec §4.4). Only requests whose
/// content-type top-level/subtype pair is `application/x-ocsigen-comet` are
/// handled; this single-purpose router has no further extension to yield
/// to, so other requests are rejected outright rather than passed through.
pub async fn handle_comet(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_comet_request(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    if body.len() > codec::REQUEST_BODY_LIMIT_BYTES {
        return CometError::InputTooLarge.into_response();
    }

    let subscription = match codec::decode_request(&body, &state.registry).await {
        Ok(subscription) => subscription,
        Err(err) => return err.into_response(),
    };

    if subscription.active.is_empty() && subscription.ended.is_empty() {
        return CometError::BadRequest.into_response();
    }

    if subscription.active.is_empty() {
        let body = codec::encode_response(&subscription.ended, None);
        return html_response(StatusCode::OK, body);
    }

    wait_and_respond(subscription, state.config.timeout).await
}

fn is_comet_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or("").trim() == codec::COMET_CONTENT_TYPE)
        .unwrap_or(false)
}

/// RAII guard pairing `add_listeners(1)` on every active channel with
/// `add_listeners(-1)` on drop. A plain "increment, await, decrement"
/// sequence only decrements on the happy path; if the client disconnects
/// while the handler future is suspended in the wait, axum drops that
/// future outright and any code after the await point never runs. Tying
/// the decrement to `Drop` instead means cancellation (spec §5: "the
/// merged wait and the timeout MUST both be released and listener counts
/// decremented") is handled the same way as normal completion.
struct ListenerGuard<'a> {
    channels: &'a [Arc<Channel>],
}

impl<'a> ListenerGuard<'a> {
    fn enter(channels: &'a [Arc<Channel>]) -> Self {
        for channel in channels {
            channel.add_listeners(1);
        }
        Self { channels }
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        for channel in self.channels {
            channel.add_listeners(-1);
        }
    }
}

/// The wait phase of spec §4.4: subscribe, race the merged wait against the
/// timeout, decrement listeners on every exit path, then encode and return.
async fn wait_and_respond(subscription: Subscription, timeout: Duration) -> Response {
    let Subscription { active, ended } = subscription;

    let guard = ListenerGuard::enter(&active);
    let batch = race_events_against_timeout(&active, timeout).await;
    // Dropped explicitly here rather than left to fall out of scope, so the
    // decrement is visible before the response body is committed (spec
    // §4.4: "this MUST happen before the response body is committed to
    // network, to keep the counter accurate while the producer may still
    // be publishing").
    drop(guard);

    if batch.is_empty() {
        let body = codec::encode_response(&ended, None);
        return html_response(StatusCode::OK, body);
    }

    let events: Vec<DeliveredEvent> = batch
        .into_iter()
        .map(|(channel, event)| DeliveredEvent {
            channel,
            payload: event.payload,
            tag: event.tag,
        })
        .collect();

    let body = codec::encode_response(&ended, Some(&events));
    streamed_response(body, events)
}

/// Merges every active channel's event stream and races it against a
/// timeout sleep (spec §4.4). On the first event, drains any further
/// events that are *already* available without waiting further, so
/// simultaneous publications land in the same response (spec §9: "the
/// merge accumulator captured them before the timeout arm resolved").
///
/// Returns the empty vec on timeout, matching the "None means timeout"
/// branch of spec §4.4.
async fn race_events_against_timeout(
    active: &[Arc<Channel>],
    timeout: Duration,
) -> Vec<(Arc<Channel>, crate::channel::Event)> {
    let mut merged: StreamMap<String, BroadcastStream<crate::channel::Event>> = StreamMap::new();
    for channel in active {
        merged.insert(
            channel.id_of().to_string(),
            BroadcastStream::new(channel.observe_events()),
        );
    }

    let mut batch = Vec::new();

    tokio::select! {
        biased;
        _ = tokio::time::sleep(timeout) => return batch,
        first = merged.next() => {
            push_resolved(&mut batch, active, first);
        }
    }

    // Drain anything else that's already buffered, without awaiting further.
    while let Some(next) = merged.next().now_or_never() {
        push_resolved(&mut batch, active, next);
    }

    batch
}

fn push_resolved(
    batch: &mut Vec<(Arc<Channel>, crate::channel::Event)>,
    active: &[Arc<Channel>],
    item: Option<(String, Result<crate::channel::Event, tokio_stream::wrappers::errors::BroadcastStreamRecvError>)>,
) {
    let Some((id, result)) = item else { return };
    let event = match result {
        Ok(event) => event,
        Err(_) => {
            // Lagged: this subscriber missed some events. Nothing in spec
            // requires replaying them; the broadcast channel is sized
            // generously enough that this should not occur in practice.
            warn!(channel_id = %id, "listener lagged behind channel broadcast");
            return;
        }
    };
    if let Some(channel) = active.iter().find(|c| c.id_of() == id) {
        batch.push((channel.clone(), event));
    }
}

fn html_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, codec::RESPONSE_CONTENT_TYPE)], body).into_response()
}

/// Builds a streamed response body that reports outcomes once the body
/// generator has run to completion (see `OutcomeReporter`).
fn streamed_response(body: String, events: Vec<DeliveredEvent>) -> Response {
    let pending: Vec<(Arc<Channel>, u64)> = events
        .iter()
        .filter_map(|e| e.tag.map(|tag| (e.channel.clone(), tag)))
        .collect();

    let stream = async_stream::stream! {
        let mut reporter = OutcomeReporter { pending, delivered: false };
        yield Ok::<_, std::convert::Infallible>(Bytes::from(body));
        reporter.delivered = true;
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(codec::RESPONSE_CONTENT_TYPE),
    );
    response
}
