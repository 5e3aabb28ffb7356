//! Route File Loading Tests
//!
//! Loads full YAML fixtures through the public entry points and checks the
//! startup-fatal validation paths.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;

use bunny_rest_proxy::infrastructure::config::load_file_config;
use bunny_rest_proxy::{BackoffStrategy, ConfigError, ContentKind, FileConfig};

const FULL_FIXTURE: &str = r#"
identities:
  - name: Bob
    token: THISisBOBSsuperSECRETauthToken123
  - name: Alice
    token: alices-token

publishers:
  - queue: jsonq
    contentType: json
    confirm: true
    schema:
      type: object
      properties:
        ok:
          type: boolean
      required: [ok]
  - queue: nonconfirm
    contentType: binary
    confirm: false
  - queue: auth
    contentType: binary
    identities: [Bob]

consumers:
  - queue: nonconfirm
  - queue: auth
    identities: [Bob, Alice]

subscribers:
  - queue: jsontest
    target: http://localhost:8008/sink
    prefetch: 2
    timeout: 1000
    retries: 5
    backoffStrategy: linear
    retryDelay: 1000
  - queue: binarytest
    target: http://localhost:8009/sink
"#;

fn write_fixture(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "bunny-rest-proxy-test-{}-{name}.yaml",
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn full_fixture_loads_from_disk() {
    let path = write_fixture("full", FULL_FIXTURE);
    let config = load_file_config(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.identities.len(), 2);
    assert_eq!(config.publishers.len(), 3);
    assert_eq!(config.consumers.len(), 2);
    assert_eq!(config.subscribers.len(), 2);

    let jsonq = &config.publishers[0];
    assert_eq!(jsonq.queue, "jsonq");
    assert_eq!(jsonq.content_type, ContentKind::Json);
    assert!(jsonq.confirm);
    assert!(jsonq.schema.is_some());

    let nonconfirm = &config.publishers[1];
    assert!(!nonconfirm.confirm);
    assert_eq!(nonconfirm.content_type, ContentKind::Binary);

    let auth = &config.publishers[2];
    assert_eq!(auth.identities, vec!["Bob".to_string()]);

    let jsontest = &config.subscribers[0];
    assert_eq!(jsontest.prefetch, 2);
    assert_eq!(jsontest.retries, 5);
    assert_eq!(jsontest.backoff_strategy, BackoffStrategy::Linear);

    // Defaults cover the second subscriber entirely.
    let binarytest = &config.subscribers[1];
    assert_eq!(binarytest.prefetch, 1);
    assert_eq!(binarytest.retries, 0);
    assert_eq!(binarytest.backoff_strategy, BackoffStrategy::Fixed);
}

#[test]
fn missing_file_is_a_read_error() {
    let err = load_file_config(std::path::Path::new("/nonexistent/bunny.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::ReadError { .. }));
}

#[test]
fn same_queue_may_appear_in_every_section() {
    let config = FileConfig::from_yaml(
        r"
publishers:
  - queue: shared
    contentType: binary
consumers:
  - queue: shared
subscribers:
  - queue: shared
    target: http://localhost:1/
",
    )
    .unwrap();
    assert_eq!(config.publishers[0].queue, "shared");
    assert_eq!(config.consumers[0].queue, "shared");
    assert_eq!(config.subscribers[0].queue, "shared");
}

#[test]
fn duplicate_queue_within_a_section_is_rejected() {
    let err = FileConfig::from_yaml(
        r"
publishers:
  - queue: twice
    contentType: binary
  - queue: twice
    contentType: json
",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn schema_on_a_binary_publisher_is_rejected() {
    let err = FileConfig::from_yaml(
        r"
publishers:
  - queue: q
    contentType: binary
    schema:
      type: string
",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn unknown_identity_reference_is_rejected() {
    let err = FileConfig::from_yaml(
        r"
identities:
  - name: Bob
    token: t
consumers:
  - queue: q
    identities: [NotBob]
",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn duplicate_identity_name_is_rejected() {
    let err = FileConfig::from_yaml(
        r"
identities:
  - name: Bob
    token: a
  - name: Bob
    token: b
",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn invalid_subscriber_target_is_rejected() {
    let err = FileConfig::from_yaml(
        r"
subscribers:
  - queue: q
    target: 'not a url at all'
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
