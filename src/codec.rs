use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::channel::Channel;
use crate::error::CometError;
use crate::registry::Registry;

/// Channel separator in the response body grammar (spec §4.3).
pub const CHANNEL_SEPARATOR: char = '\n';
/// Field separator, also doubling as the legacy join between the ENDED
/// section and the events section (spec §4.3, §9).
pub const FIELD_SEPARATOR: char = ':';
/// Sentinel payload for a channel id that did not resolve to a live channel.
pub const ENDED_SENTINEL: &str = "ENDED_CHANNEL";
/// The form parameter name carrying the newline-separated id list.
pub const REGISTRATION_PARAM: &str = "registration";
/// Content-type the handler dispatches on.
pub const COMET_CONTENT_TYPE: &str = "application/x-ocsigen-comet";
/// Content-type of every response this endpoint produces.
pub const RESPONSE_CONTENT_TYPE: &str = "text/html";
/// The request body size cap named by spec §4.3/§7 ("body read exceeds the
/// host's per-request size cap -> InputTooLarge"), checked explicitly in
/// `crate::handler::handle_comet` before decoding is attempted.
pub const REQUEST_BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Percent-encoding set matching spec §4.3: standard percent-encoding with
/// `+` not used for spaces (i.e. space encodes to `%20`, not `+`). The
/// `percent-encoding` crate's `NON_ALPHANUMERIC` set already behaves this
/// way — it never special-cases space into `+`, unlike form encoding — and
/// as a side effect also escapes `:` and `\n`, keeping payload bytes from
/// colliding with the wire grammar's own separators.
const ENCODE_SET: &percent_encoding::AsciiSet = NON_ALPHANUMERIC;

/// A decoded subscription request (spec §3, §4.3): ids that resolved to a
/// live channel, and ids that did not. Order within each list follows the
/// order ids appeared in the request.
pub struct Subscription {
    pub active: Vec<Arc<Channel>>,
    pub ended: Vec<String>,
}

/// Decodes a `registration`-bearing `application/x-www-form-urlencoded`
/// body. An absent or empty body yields an empty subscription, not an
/// error (spec §4.3).
///
/// Parsing is done by hand, pair by pair, rather than via a permissive
/// form-decoding crate, so that invalid percent-encoding surfaces as
/// `BadRequest` instead of being silently replaced (spec §4.3: "malformed
/// URL encoding -> surface as BadRequest").
pub async fn decode_request(body: &[u8], registry: &Registry) -> Result<Subscription, CometError> {
    let body_str = std::str::from_utf8(body).map_err(|_| CometError::BadRequest)?;

    let mut ids = Vec::new();
    for pair in body_str.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = decode_form_component(raw_key)?;
        if key != REGISTRATION_PARAM {
            continue;
        }
        let value = decode_form_component(raw_value)?;
        ids.extend(value.split(CHANNEL_SEPARATOR).filter(|s| !s.is_empty()).map(str::to_string));
    }

    let mut active = Vec::new();
    let mut ended = Vec::new();
    for id in ids {
        match registry.find(&id).await {
            Some(channel) => active.push(channel),
            None => ended.push(id),
        }
    }

    Ok(Subscription { active, ended })
}

/// Decodes one `x-www-form-urlencoded` key or value: `+` means space, then
/// percent-escapes are resolved as UTF-8.
///
/// `percent_decode_str` itself never rejects a malformed `%XX` escape (a
/// non-hex digit, or a `%` too close to the end of the string) — it just
/// passes the literal bytes through unchanged. Spec §4.3/§7 names malformed
/// URL encoding as its own `BadRequest` cause, distinct from a body that
/// merely fails to be valid UTF-8 once decoded, so escape well-formedness
/// is checked explicitly before decoding is attempted.
fn decode_form_component(raw: &str) -> Result<String, CometError> {
    let with_spaces = raw.replace('+', " ");
    reject_malformed_percent_escapes(&with_spaces)?;
    percent_decode_str(&with_spaces)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| CometError::BadRequest)
}

/// Rejects a `%` not immediately followed by two ASCII hex digits. Scanning
/// by byte is safe here: `%` is single-byte ASCII, and UTF-8 continuation
/// bytes are always `>= 0x80`, so they can never be mistaken for it.
fn reject_malformed_percent_escapes(s: &str) -> Result<(), CometError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3).ok_or(CometError::BadRequest)?;
            if !escape.iter().all(|b| b.is_ascii_hexdigit()) {
                return Err(CometError::BadRequest);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// One event chosen for inclusion in a response body (spec §4.3, §4.4):
/// the channel it arrived on, its payload, and its optional producer tag.
pub struct DeliveredEvent {
    pub channel: Arc<Channel>,
    pub payload: String,
    pub tag: Option<u64>,
}

/// Encodes the response body per spec §4.3/§6.
///
/// - `ended` alone (`events` absent): ENDED notices only, possibly empty.
/// - `events` alone (`ended` empty): `id:payload` items only.
/// - both present: ENDED notices, then a single `:`, then the events
///   section — the legacy framing quirk spec §9 says to keep bit-exact.
pub fn encode_response(ended: &[String], events: Option<&[DeliveredEvent]>) -> String {
    let ended_body = ended
        .iter()
        .map(|id| format!("{id}{FIELD_SEPARATOR}{ENDED_SENTINEL}"))
        .collect::<Vec<_>>()
        .join(&CHANNEL_SEPARATOR.to_string());

    match events {
        None => ended_body,
        Some(events) => {
            let events_body = events
                .iter()
                .map(|e| {
                    format!(
                        "{}{FIELD_SEPARATOR}{}",
                        e.channel.id_of(),
                        utf8_percent_encode(&e.payload, ENCODE_SET)
                    )
                })
                .collect::<Vec<_>>()
                .join(&CHANNEL_SEPARATOR.to_string());

            if ended_body.is_empty() {
                events_body
            } else {
                format!("{ended_body}{FIELD_SEPARATOR}{events_body}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_body_decodes_to_empty_subscription() {
        let registry = Registry::new(None);
        let sub = decode_request(b"", &registry).await.unwrap();
        assert!(sub.active.is_empty());
        assert!(sub.ended.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_lands_in_ended() {
        let registry = Registry::new(None);
        let sub = decode_request(b"registration=abc", &registry).await.unwrap();
        assert!(sub.active.is_empty());
        assert_eq!(sub.ended, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn live_channel_lands_in_active() {
        let registry = Registry::new(None);
        let channel = registry.create().await.unwrap();
        let body = format!("registration={}", channel.id_of());
        let sub = decode_request(body.as_bytes(), &registry).await.unwrap();
        assert_eq!(sub.active.len(), 1);
        assert!(sub.ended.is_empty());
    }

    #[tokio::test]
    async fn multiple_registration_params_concatenate_in_order() {
        let registry = Registry::new(None);
        let sub = decode_request(b"registration=a\nb&registration=c", &registry)
            .await
            .unwrap();
        assert_eq!(sub.ended, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn other_params_are_ignored() {
        let registry = Registry::new(None);
        let sub = decode_request(b"foo=bar&registration=a", &registry)
            .await
            .unwrap();
        assert_eq!(sub.ended, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn malformed_percent_escape_is_bad_request() {
        let registry = Registry::new(None);
        let err = decode_request(b"registration=%zz", &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CometError::BadRequest));
    }

    #[tokio::test]
    async fn trailing_truncated_percent_escape_is_bad_request() {
        let registry = Registry::new(None);
        let err = decode_request(b"registration=abc%4", &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CometError::BadRequest));
    }

    #[tokio::test]
    async fn well_formed_percent_escape_still_decodes() {
        let registry = Registry::new(None);
        let sub = decode_request(b"registration=hello%20world", &registry)
            .await
            .unwrap();
        assert_eq!(sub.ended, vec!["hello world".to_string()]);
    }

    #[test]
    fn unknown_id_round_trip_matches_exact_sentinel() {
        let body = encode_response(&["abc".to_string()], None);
        assert_eq!(body, "abc:ENDED_CHANNEL");
    }

    #[test]
    fn timeout_with_no_unknown_ids_is_empty() {
        let body = encode_response(&[], None);
        assert_eq!(body, "");
    }

    #[test]
    fn payload_is_percent_encoded_without_plus_for_space() {
        let channel = Arc::new(Channel::new(
            "A".to_string(),
            Arc::new(std::sync::atomic::AtomicUsize::new(1)),
        ));
        let events = vec![DeliveredEvent {
            channel,
            payload: "hello world".to_string(),
            tag: Some(7),
        }];
        let body = encode_response(&[], Some(&events));
        assert_eq!(body, "A:hello%20world");
    }

    #[test]
    fn mixed_framing_joins_with_single_colon() {
        let channel = Arc::new(Channel::new(
            "A".to_string(),
            Arc::new(std::sync::atomic::AtomicUsize::new(1)),
        ));
        let events = vec![DeliveredEvent {
            channel,
            payload: "x".to_string(),
            tag: None,
        }];
        let body = encode_response(&["Z".to_string()], Some(&events));
        assert_eq!(body, "Z:ENDED_CHANNEL:A:x");
    }
}
