//! Shared fixtures for unit tests.

use std::time::Duration;

use crate::config::{BackendConfig, GatewayConfig};

/// The shell backend under `tests/fixtures`.
pub(crate) fn fake_backend() -> BackendConfig {
    BackendConfig::new("sh").with_args([concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/fake_mcp_server.sh"
    )])
}

/// A command that can never be spawned.
pub(crate) fn missing_backend() -> BackendConfig {
    BackendConfig::new("/nonexistent/embeddenator-gateway-test-binary")
}

/// Short timeouts so failure paths finish quickly.
pub(crate) fn fast_config() -> GatewayConfig {
    GatewayConfig {
        message_timeout: Duration::from_secs(5),
        tool_timeout: Duration::from_secs(5),
        discovery_timeout: Duration::from_secs(5),
        start_grace: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}
