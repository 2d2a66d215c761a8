//! Tests for environment-driven configuration.

use std::time::Duration;

use broker_pubsub::{
    ConfigError,
    Framing,
    PubSubConfig,
    TopicStrategy,
    broker::SecurityProtocol,
    config::{DEFAULT_READY_TIMEOUT, ENV_HOST, ENV_PORT, ENV_SECURITY, ENV_TOPIC},
};
use serial_test::serial;

fn clear_env() {
    for var in [ENV_TOPIC, ENV_HOST, ENV_PORT, ENV_SECURITY] {
        // SAFETY: tests touching the environment are serialised.
        unsafe { std::env::remove_var(var) };
    }
}

fn set_env(var: &str, value: &str) {
    // SAFETY: tests touching the environment are serialised.
    unsafe { std::env::set_var(var, value) };
}

#[test]
#[serial]
fn defaults_apply_when_unset() -> Result<(), ConfigError> {
    clear_env();
    let config = PubSubConfig::from_env()?;

    assert_eq!(
        config.topics(),
        &TopicStrategy::Shared {
            topic: "test".to_owned()
        }
    );
    assert_eq!(config.broker().host, "localhost");
    assert_eq!(config.broker().port, 9092);
    assert_eq!(config.broker().security, SecurityProtocol::Plaintext);
    assert_eq!(config.framing(), Framing::Envelope);
    assert_eq!(config.ready_timeout(), DEFAULT_READY_TIMEOUT);
    assert_eq!(DEFAULT_READY_TIMEOUT, Duration::from_secs(10));
    Ok(())
}

#[test]
#[serial]
fn variables_override_defaults() -> Result<(), ConfigError> {
    clear_env();
    set_env(ENV_TOPIC, "orders");
    set_env(ENV_HOST, "broker.internal");
    set_env(ENV_PORT, "19092");
    set_env(ENV_SECURITY, "sasl_ssl");

    let config = PubSubConfig::from_env()?;
    clear_env();

    assert_eq!(config.topics().topic_for("anything"), "orders");
    assert_eq!(config.broker().endpoint(), "broker.internal:19092");
    assert_eq!(config.broker().security, SecurityProtocol::SaslSsl);
    Ok(())
}

#[test]
#[serial]
fn invalid_port_is_rejected() {
    clear_env();
    set_env(ENV_PORT, "not-a-port");
    let result = PubSubConfig::from_env();
    clear_env();

    assert!(matches!(
        result,
        Err(ConfigError::InvalidPort { ref value, .. }) if value == "not-a-port"
    ));
}

#[test]
#[serial]
fn unknown_security_protocol_is_rejected() {
    clear_env();
    set_env(ENV_SECURITY, "kerberos");
    let result = PubSubConfig::from_env();
    clear_env();

    assert!(matches!(result, Err(ConfigError::Security(_))));
}
