//! Incoming message envelope and its wire codec.
//!
//! The function host hands the endpoint the raw queue payload: a JSON object
//! with PascalCase keys, where the body is base64 encoded. Payloads written by
//! other tooling may carry a byte-order mark, so decoding goes through
//! `encoding_rs` BOM sniffing before the JSON is parsed.
//!
//! ```text
//! {"Id":"4a1c...","Headers":{"NServiceBus.EnclosedMessageTypes":"Orders.PlaceOrder"},"Body":"eyJ..."}
//! ```

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Message headers. Insertion order carries no meaning.
pub type Headers = HashMap<String, String>;

/// Well-known header keys.
pub mod headers {
    pub const MESSAGE_ID: &str = "NServiceBus.MessageId";
    pub const ENCLOSED_MESSAGE_TYPES: &str = "NServiceBus.EnclosedMessageTypes";
    pub const FAILED_QUEUE: &str = "NServiceBus.FailedQ";
    pub const PROCESSING_ENDPOINT: &str = "NServiceBus.ProcessingEndpoint";
    pub const TIME_OF_FAILURE: &str = "NServiceBus.TimeOfFailure";
    pub const EXCEPTION_MESSAGE: &str = "NServiceBus.ExceptionInfo.Message";
    pub const EXCEPTION_SOURCE: &str = "NServiceBus.ExceptionInfo.Source";
}

/// A decoded incoming message.
///
/// Built once per delivery by [`decode`] and never mutated afterwards.
/// Redeliveries of the same logical message share the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Logical message identifier.
    pub id: String,
    /// Message metadata.
    pub headers: Headers,
    /// Serialized message body, passed to handlers untouched.
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            headers,
            body: body.into(),
        }
    }
}

/// On-wire representation. Fields the endpoint does not use are accepted and
/// dropped.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageWrapper {
    #[serde(default)]
    id: Option<String>,
    /// Writers may emit `null` for a header that has no value.
    #[serde(default)]
    headers: Option<HashMap<String, Option<String>>>,
    #[serde(default)]
    body: Option<String>,
}

/// Decode a raw queue payload into an [`Envelope`].
///
/// A leading UTF-8, UTF-16LE or UTF-16BE byte-order mark selects the text
/// encoding and is stripped; without one the payload is read as UTF-8.
/// On failure no partial envelope is produced.
pub fn decode(raw: &[u8]) -> Result<Envelope, CodecError> {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(raw);
    if had_errors {
        return Err(CodecError::new(CodecErrorKind::Text));
    }

    let wrapper: MessageWrapper =
        serde_json::from_str(&text).map_err(|e| CodecError::new(CodecErrorKind::Json(e)))?;

    let body = match wrapper.body.as_deref() {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| CodecError::new(CodecErrorKind::Body(e)))?,
        None => Vec::new(),
    };
    let headers: Headers = wrapper
        .headers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| Some((key, value?)))
        .collect();
    let id = headers
        .get(headers::MESSAGE_ID)
        .filter(|id| !id.is_empty())
        .cloned()
        .or(wrapper.id)
        .unwrap_or_default();

    Ok(Envelope { id, headers, body })
}

/// Encode an [`Envelope`] into the wire shape accepted by [`decode`].
///
/// The output never carries a byte-order mark.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let wrapper = MessageWrapper {
        id: Some(envelope.id.clone()),
        headers: Some(
            envelope
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), Some(value.clone())))
                .collect(),
        ),
        body: Some(STANDARD.encode(&envelope.body)),
    };
    serde_json::to_vec(&wrapper).map_err(|e| CodecError::new(CodecErrorKind::Json(e)))
}

/// Error returned when a payload cannot be decoded or encoded.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

/// Codec error kinds.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// The payload is not valid text in the detected encoding.
    Text,
    /// The text is not a valid message wrapper.
    Json(serde_json::Error),
    /// The `Body` field is not valid base64.
    Body(base64::DecodeError),
}

impl CodecError {
    fn new(kind: CodecErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::Text => writeln!(f, "Codec error: payload is not valid text"),
            CodecErrorKind::Json(err) => writeln!(f, "Codec error: {err}"),
            CodecErrorKind::Body(err) => writeln!(f, "Codec error: invalid body encoding: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Text => None,
            CodecErrorKind::Json(err) => Some(err),
            CodecErrorKind::Body(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"Id":"msg-1","Headers":{"NServiceBus.EnclosedMessageTypes":"Orders.PlaceOrder"},"Body":"eyJvcmRlciI6NDJ9"}"#;

    fn utf16le_with_bom(text: &str) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn decodes_wire_payload() {
        let envelope = decode(PAYLOAD.as_bytes()).unwrap();

        assert_eq!(envelope.id, "msg-1");
        assert_eq!(
            envelope.headers.get(headers::ENCLOSED_MESSAGE_TYPES).map(String::as_str),
            Some("Orders.PlaceOrder")
        );
        assert_eq!(envelope.body, br#"{"order":42}"#);
    }

    #[test]
    fn byte_order_mark_does_not_change_the_envelope() {
        let plain = decode(PAYLOAD.as_bytes()).unwrap();

        let mut utf8_bom = vec![0xEF, 0xBB, 0xBF];
        utf8_bom.extend_from_slice(PAYLOAD.as_bytes());

        assert_eq!(decode(&utf8_bom).unwrap(), plain);
        assert_eq!(decode(&utf16le_with_bom(PAYLOAD)).unwrap(), plain);
    }

    #[test]
    fn missing_headers_and_body_are_empty() {
        let envelope = decode(br#"{"Id":"abc","Headers":null}"#).unwrap();

        assert_eq!(envelope.id, "abc");
        assert!(envelope.headers.is_empty());
        assert!(envelope.body.is_empty());
    }

    #[test]
    fn null_header_values_are_dropped() {
        let envelope = decode(
            br#"{"Id":"m","Headers":{"NServiceBus.EnclosedMessageTypes":"A","NServiceBus.ReplyToAddress":null},"Body":"e30="}"#,
        )
        .unwrap();

        assert_eq!(envelope.id, "m");
        assert_eq!(envelope.headers.len(), 1);
        assert_eq!(envelope.headers[headers::ENCLOSED_MESSAGE_TYPES], "A");
        assert_eq!(envelope.body, b"{}");
    }

    #[test]
    fn message_id_header_takes_precedence() {
        let envelope =
            decode(br#"{"Id":"transport-id","Headers":{"NServiceBus.MessageId":"logical-id"}}"#)
                .unwrap();

        assert_eq!(envelope.id, "logical-id");
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = decode(b"{\"Id\": ").unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Json(_)));

        let err = decode(br#"{"Id":"x","Body":"not base64!"}"#).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Body(_)));

        let err = decode(&[0x7B, 0xFF, 0x7D]).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Text));
    }

    #[test]
    fn encoded_envelope_is_accepted_by_decode() {
        let mut headers = Headers::new();
        headers.insert("custom".to_owned(), "value".to_owned());
        let envelope = Envelope::new("id-7", headers, b"payload".to_vec());

        let bytes = encode(&envelope).unwrap();

        assert!(!bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
        assert_eq!(decode(&bytes).unwrap(), envelope);
    }
}
