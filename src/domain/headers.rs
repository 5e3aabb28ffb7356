//! The `X-Bunny-*` Header Namespace
//!
//! Every piece of proxy metadata travels in headers prefixed `X-Bunny-`.
//! Identity and token headers authenticate a request against a queue's
//! allowlist, the correlation id maps onto the AMQP `correlation_id`
//! property, and everything else in the namespace passes through to the
//! broker (and back out to consumers and subscriber targets).
//!
//! Credentials never pass through: forwarding `X-Bunny-Identity` or
//! `X-Bunny-Token` into AMQP headers would hand them to every downstream
//! consumer of the queue.

/// Header carrying the identity name for queue authentication.
pub const IDENTITY: &str = "x-bunny-identity";

/// Header carrying the identity token for queue authentication.
pub const TOKEN: &str = "x-bunny-token";

/// Header mapped onto the AMQP `correlation_id` property.
pub const CORRELATION_ID: &str = "x-bunny-correlationid";

/// Header set by the proxy on pushes: the broker's redelivered flag.
pub const REDELIVERED: &str = "x-bunny-redelivered";

/// Header set by the proxy on consume responses: messages left in the queue.
pub const MESSAGE_COUNT: &str = "x-bunny-message-count";

/// Namespace prefix for pass-through headers.
pub const PREFIX: &str = "x-bunny-";

/// Whether this header name is owned by the proxy and must not be forwarded
/// as an ordinary pass-through header.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        IDENTITY | TOKEN | CORRELATION_ID | REDELIVERED | MESSAGE_COUNT
    )
}

/// Filter `(name, value)` pairs down to the pass-through set.
///
/// Keeps headers in the `X-Bunny-` namespace, drops the proxy-owned names,
/// and lower-cases the kept names (AMQP header keys are stored lower-case).
pub fn passthrough<'a, I>(pairs: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if lower.starts_with(PREFIX) && !is_reserved(&lower) {
                Some((lower, value.to_string()))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_namespace_headers_lowercased() {
        let kept = passthrough(vec![
            ("X-Bunny-Trace", "abc"),
            ("Content-Type", "application/json"),
            ("x-bunny-origin", "svc-a"),
        ]);
        assert_eq!(
            kept,
            vec![
                ("x-bunny-trace".to_string(), "abc".to_string()),
                ("x-bunny-origin".to_string(), "svc-a".to_string()),
            ]
        );
    }

    #[test]
    fn strips_credentials_and_proxy_owned_names() {
        let kept = passthrough(vec![
            ("X-Bunny-Identity", "Bob"),
            ("X-Bunny-Token", "secret"),
            ("X-Bunny-CorrelationID", "id-1"),
            ("X-Bunny-Redelivered", "true"),
            ("X-Bunny-Message-Count", "3"),
        ]);
        assert!(kept.is_empty());
    }

    #[test]
    fn reserved_names_are_case_insensitive() {
        assert!(is_reserved("X-BUNNY-TOKEN"));
        assert!(is_reserved("x-bunny-identity"));
        assert!(!is_reserved("x-bunny-trace"));
    }
}
