//! Route Configuration File
//!
//! The YAML file declares who exists (`identities`) and which queues the
//! proxy serves, split into the three route sections: `publishers`,
//! `consumers`, and `subscribers`. Loaded and validated once at startup;
//! any inconsistency is fatal before the proxy binds a socket.
//!
//! ```yaml
//! identities:
//!   - name: Bob
//!     token: THISisBOBSsuperSECRETauthToken123
//! publishers:
//!   - queue: jsonq
//!     contentType: json
//!     confirm: true
//!     schema:
//!       type: object
//!   - queue: nonconfirm
//!     contentType: binary
//!     confirm: false
//! consumers:
//!   - queue: nonconfirm
//! subscribers:
//!   - queue: jsontest
//!     target: http://localhost:8008/sink
//!     prefetch: 2
//!     timeout: 1000
//!     retries: 5
//!     backoffStrategy: linear
//!     retryDelay: 1000
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::domain::backoff::BackoffStrategy;
use crate::domain::payload::ContentKind;

const fn default_confirm() -> bool {
    true
}

const fn default_prefetch() -> u16 {
    1
}

const fn default_timeout_ms() -> u64 {
    2000
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

/// One `(name, token)` identity.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEntry {
    /// Identity name, unique across the file.
    pub name: String,
    /// Static token presented in `X-Bunny-Token`.
    pub token: String,
}

/// One publish route.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherEntry {
    /// Queue the route publishes to.
    pub queue: String,
    /// Payload discipline of the route.
    pub content_type: ContentKind,
    /// Optional JSON Schema, only valid for JSON routes.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// Whether publishes await a broker confirm.
    #[serde(default = "default_confirm")]
    pub confirm: bool,
    /// Identity names allowed to publish; empty means unrestricted.
    #[serde(default)]
    pub identities: Vec<String>,
}

/// One consume route.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerEntry {
    /// Queue the route pulls from.
    pub queue: String,
    /// Identity names allowed to consume; empty means unrestricted.
    #[serde(default)]
    pub identities: Vec<String>,
}

/// One push subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberEntry {
    /// Queue the subscriber consumes.
    pub queue: String,
    /// URL deliveries are POSTed to.
    pub target: String,
    /// Maximum unacked deliveries held concurrently.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Per-attempt push deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Retries after the first failed attempt.
    #[serde(default)]
    pub retries: u32,
    /// How the retry delay grows.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Base retry delay in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay: u64,
}

impl SubscriberEntry {
    /// Per-attempt deadline as a [`Duration`].
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Base retry delay as a [`Duration`].
    #[must_use]
    pub const fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

/// The whole route file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Known identities.
    #[serde(default)]
    pub identities: Vec<IdentityEntry>,
    /// Publish routes.
    #[serde(default)]
    pub publishers: Vec<PublisherEntry>,
    /// Consume routes.
    #[serde(default)]
    pub consumers: Vec<ConsumerEntry>,
    /// Push subscribers.
    #[serde(default)]
    pub subscribers: Vec<SubscriberEntry>,
}

impl FileConfig {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] for malformed YAML and
    /// [`ConfigError::ValidationError`] for a well-formed file that
    /// describes an invalid setup.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_bw::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut identity_names = HashSet::new();
        for identity in &self.identities {
            if identity.name.is_empty() || identity.token.is_empty() {
                return Err(ConfigError::ValidationError(
                    "identity entries need a non-empty name and token".to_string(),
                ));
            }
            if !identity_names.insert(identity.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate identity name '{}'",
                    identity.name
                )));
            }
        }

        check_unique_queues("publishers", self.publishers.iter().map(|p| &p.queue))?;
        check_unique_queues("consumers", self.consumers.iter().map(|c| &c.queue))?;
        check_unique_queues("subscribers", self.subscribers.iter().map(|s| &s.queue))?;

        for publisher in &self.publishers {
            if publisher.schema.is_some() && publisher.content_type != ContentKind::Json {
                return Err(ConfigError::ValidationError(format!(
                    "publisher '{}' declares a schema but is not a JSON route",
                    publisher.queue
                )));
            }
            check_identity_refs("publisher", &publisher.queue, &publisher.identities, &identity_names)?;
        }

        for consumer in &self.consumers {
            check_identity_refs("consumer", &consumer.queue, &consumer.identities, &identity_names)?;
        }

        for subscriber in &self.subscribers {
            if subscriber.prefetch < 1 {
                return Err(ConfigError::ValidationError(format!(
                    "subscriber '{}' needs prefetch >= 1",
                    subscriber.queue
                )));
            }
            if subscriber.timeout == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "subscriber '{}' needs a timeout > 0",
                    subscriber.queue
                )));
            }
            if reqwest::Url::parse(&subscriber.target).is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "subscriber '{}' has an invalid target URL '{}'",
                    subscriber.queue, subscriber.target
                )));
            }
        }

        Ok(())
    }
}

/// Read and validate the route file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file is unreadable, unparseable, or
/// fails validation.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.display().to_string(),
        source,
    })?;
    FileConfig::from_yaml(&raw)
}

fn check_unique_queues<'a, I>(section: &str, queues: I) -> Result<(), ConfigError>
where
    I: Iterator<Item = &'a String>,
{
    let mut seen = HashSet::new();
    for queue in queues {
        if queue.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{section} entries need a non-empty queue name"
            )));
        }
        if !seen.insert(queue.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate queue '{queue}' in {section}"
            )));
        }
    }
    Ok(())
}

fn check_identity_refs(
    section: &str,
    queue: &str,
    refs: &[String],
    known: &HashSet<&str>,
) -> Result<(), ConfigError> {
    for name in refs {
        if !known.contains(name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "{section} '{queue}' references unknown identity '{name}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r"
identities:
  - name: Bob
    token: THISisBOBSsuperSECRETauthToken123
publishers:
  - queue: jsonq
    contentType: json
    confirm: true
  - queue: auth
    contentType: binary
    confirm: true
    identities: [Bob]
consumers:
  - queue: nonconfirm
subscribers:
  - queue: jsontest
    target: http://localhost:8008/sink
    prefetch: 2
    timeout: 1000
    retries: 5
    backoffStrategy: linear
    retryDelay: 1000
";

    #[test]
    fn valid_file_parses() {
        let config = FileConfig::from_yaml(VALID).unwrap();
        assert_eq!(config.identities.len(), 1);
        assert_eq!(config.publishers.len(), 2);
        assert_eq!(config.consumers.len(), 1);
        assert_eq!(config.subscribers.len(), 1);

        let subscriber = &config.subscribers[0];
        assert_eq!(subscriber.prefetch, 2);
        assert_eq!(subscriber.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(subscriber.timeout_duration(), Duration::from_millis(1000));
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config = FileConfig::from_yaml(
            r"
publishers:
  - queue: q
    contentType: binary
subscribers:
  - queue: s
    target: http://localhost:1/
",
        )
        .unwrap();
        assert!(config.publishers[0].confirm);
        assert!(config.publishers[0].identities.is_empty());
        let subscriber = &config.subscribers[0];
        assert_eq!(subscriber.prefetch, 1);
        assert_eq!(subscriber.retries, 0);
        assert_eq!(subscriber.backoff_strategy, BackoffStrategy::Fixed);
        assert_eq!(subscriber.timeout, 2000);
        assert_eq!(subscriber.retry_delay, 1000);
    }

    #[test]
    fn duplicate_queue_in_section_is_fatal() {
        let err = FileConfig::from_yaml(
            r"
consumers:
  - queue: q
  - queue: q
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn same_queue_across_sections_is_fine() {
        let config = FileConfig::from_yaml(
            r"
publishers:
  - queue: q
    contentType: binary
consumers:
  - queue: q
",
        );
        assert!(config.is_ok());
    }

    #[test]
    fn schema_on_binary_route_is_fatal() {
        let err = FileConfig::from_yaml(
            r"
publishers:
  - queue: q
    contentType: binary
    schema:
      type: object
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn unknown_identity_reference_is_fatal() {
        let err = FileConfig::from_yaml(
            r"
publishers:
  - queue: q
    contentType: binary
    identities: [Ghost]
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn zero_timeout_is_fatal() {
        let err = FileConfig::from_yaml(
            r"
subscribers:
  - queue: s
    target: http://localhost:1/
    timeout: 0
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn bad_target_url_is_fatal() {
        let err = FileConfig::from_yaml(
            r"
subscribers:
  - queue: s
    target: not-a-url
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = FileConfig::from_yaml("publishers: [ { queue: ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
