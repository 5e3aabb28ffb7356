//! Message Payload Parsing
//!
//! Two parser shapes share one dispatch surface: a binary parser that passes
//! octet streams through untouched, and a JSON parser that decodes, optionally
//! validates against a JSON Schema, and re-serializes to canonical UTF-8
//! bytes for transport. The parser runs on the publish path; on the way back
//! out (consume responses and subscriber pushes) only the content type needs
//! recovering, since the stored bytes are already in wire shape.

use serde_json::Value;

/// MIME type accepted and emitted by binary routes.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// MIME type accepted and emitted by JSON routes.
pub const APPLICATION_JSON: &str = "application/json";

/// Payload discipline of a queue route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Opaque bytes, `application/octet-stream`.
    Binary,
    /// JSON documents, `application/json`, optionally schema-checked.
    Json,
}

impl ContentKind {
    /// The MIME type messages of this kind travel with.
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Binary => OCTET_STREAM,
            Self::Json => APPLICATION_JSON,
        }
    }
}

/// A request body rejected by the parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The request's `Content-Type` does not match the route.
    #[error("unsupported content type '{got}', this route accepts '{want}'")]
    UnsupportedContentType {
        /// What the request carried (empty if absent).
        got: String,
        /// What the route requires.
        want: &'static str,
    },

    /// The body is not parseable as the route's content kind.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The body parsed but does not satisfy the route's JSON Schema.
    #[error("payload does not match schema: {0}")]
    SchemaViolation(String),
}

/// A validated payload ready for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Canonical wire bytes.
    pub bytes: Vec<u8>,
    /// The kind they were validated as.
    pub kind: ContentKind,
}

impl Payload {
    /// MIME type to stamp on the AMQP message.
    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        self.kind.mime()
    }
}

/// Tagged parser variant for a queue route.
pub enum PayloadParser {
    /// Pass bytes through verbatim.
    Binary,
    /// Parse JSON, optionally validate against a compiled schema.
    Json {
        /// Compiled JSON Schema, if the route declares one.
        schema: Option<jsonschema::JSONSchema>,
    },
}

impl std::fmt::Debug for PayloadParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => f.write_str("PayloadParser::Binary"),
            Self::Json { schema } => f
                .debug_struct("PayloadParser::Json")
                .field("schema", &schema.is_some())
                .finish(),
        }
    }
}

impl PayloadParser {
    /// Build the parser for a route.
    ///
    /// # Errors
    ///
    /// Returns the schema compilation error text when `kind` is JSON and the
    /// configured schema is not itself a valid JSON Schema.
    pub fn new(kind: ContentKind, schema: Option<&Value>) -> Result<Self, String> {
        match kind {
            ContentKind::Binary => Ok(Self::Binary),
            ContentKind::Json => {
                let schema = schema
                    .map(|raw| jsonschema::JSONSchema::compile(raw).map_err(|e| e.to_string()))
                    .transpose()?;
                Ok(Self::Json { schema })
            }
        }
    }

    /// The content kind this parser accepts.
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        match self {
            Self::Binary => ContentKind::Binary,
            Self::Json { .. } => ContentKind::Json,
        }
    }

    /// Validate and shape an inbound request body into a broker payload.
    ///
    /// # Errors
    ///
    /// - [`PayloadError::UnsupportedContentType`] when the `Content-Type`
    ///   header is absent or names a different type than the route.
    /// - [`PayloadError::InvalidPayload`] when a JSON body does not parse.
    /// - [`PayloadError::SchemaViolation`] when it parses but fails the
    ///   route's schema.
    pub fn parse_inbound(
        &self,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Payload, PayloadError> {
        let want = self.kind().mime();
        let got = content_type.unwrap_or_default();
        if !media_type_matches(got, want) {
            return Err(PayloadError::UnsupportedContentType {
                got: got.to_string(),
                want,
            });
        }

        match self {
            Self::Binary => Ok(Payload {
                bytes: body.to_vec(),
                kind: ContentKind::Binary,
            }),
            Self::Json { schema } => {
                let value: Value = serde_json::from_slice(body)
                    .map_err(|e| PayloadError::InvalidPayload(e.to_string()))?;

                if let Some(schema) = schema {
                    if let Err(errors) = schema.validate(&value) {
                        let detail = errors
                            .map(|e| e.to_string())
                            .collect::<Vec<_>>()
                            .join("; ");
                        return Err(PayloadError::SchemaViolation(detail));
                    }
                }

                // Canonical re-serialization: what the broker stores is what
                // serde parsed, not the client's whitespace.
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| PayloadError::InvalidPayload(e.to_string()))?;
                Ok(Payload {
                    bytes,
                    kind: ContentKind::Json,
                })
            }
        }
    }
}

/// Compare a request media type against the expected one, ignoring
/// parameters (`application/json; charset=utf-8` matches `application/json`).
fn media_type_matches(got: &str, want: &str) -> bool {
    got.split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(want))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_passes_bytes_through() {
        let parser = PayloadParser::new(ContentKind::Binary, None).unwrap();
        let payload = parser
            .parse_inbound(Some("application/octet-stream"), b"binarystuff")
            .unwrap();
        assert_eq!(payload.bytes, b"binarystuff");
        assert_eq!(payload.content_type(), OCTET_STREAM);
    }

    #[test]
    fn binary_rejects_json_content_type() {
        let parser = PayloadParser::new(ContentKind::Binary, None).unwrap();
        let err = parser
            .parse_inbound(Some("application/json"), b"{}")
            .unwrap_err();
        assert!(matches!(err, PayloadError::UnsupportedContentType { .. }));
    }

    #[test]
    fn json_rejects_octet_stream_content_type() {
        let parser = PayloadParser::new(ContentKind::Json, None).unwrap();
        let err = parser
            .parse_inbound(Some("application/octet-stream"), b"binarystuff")
            .unwrap_err();
        assert!(matches!(err, PayloadError::UnsupportedContentType { .. }));
    }

    #[test]
    fn missing_content_type_is_unsupported() {
        let parser = PayloadParser::new(ContentKind::Json, None).unwrap();
        let err = parser.parse_inbound(None, b"{}").unwrap_err();
        assert!(matches!(err, PayloadError::UnsupportedContentType { .. }));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let parser = PayloadParser::new(ContentKind::Json, None).unwrap();
        let payload = parser
            .parse_inbound(Some("application/json; charset=utf-8"), br#"{"ok":true}"#)
            .unwrap();
        assert_eq!(payload.bytes, br#"{"ok":true}"#);
    }

    #[test]
    fn json_body_is_canonicalized() {
        let parser = PayloadParser::new(ContentKind::Json, None).unwrap();
        let payload = parser
            .parse_inbound(Some("application/json"), b"{ \"ok\" :  true }")
            .unwrap();
        assert_eq!(payload.bytes, br#"{"ok":true}"#);
        assert_eq!(payload.content_type(), APPLICATION_JSON);
    }

    #[test]
    fn malformed_json_is_invalid_payload() {
        let parser = PayloadParser::new(ContentKind::Json, None).unwrap();
        let err = parser
            .parse_inbound(
                Some("application/json"),
                b"{ouch, this doesn't look like json",
            )
            .unwrap_err();
        assert!(matches!(err, PayloadError::InvalidPayload(_)));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let schema = json!({
            "type": "object",
            "properties": { "count": { "type": "integer" } },
            "required": ["count"]
        });
        let parser = PayloadParser::new(ContentKind::Json, Some(&schema)).unwrap();

        let ok = parser.parse_inbound(Some("application/json"), br#"{"count":3}"#);
        assert!(ok.is_ok());

        let err = parser
            .parse_inbound(Some("application/json"), br#"{"count":"three"}"#)
            .unwrap_err();
        assert!(matches!(err, PayloadError::SchemaViolation(_)));
    }

    #[test]
    fn invalid_schema_fails_construction() {
        let schema = json!({ "type": "definitely-not-a-type" });
        assert!(PayloadParser::new(ContentKind::Json, Some(&schema)).is_err());
    }
}
