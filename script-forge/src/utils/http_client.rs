//! HTTP client construction for the generation backend.

use std::sync::Once;
use std::time::Duration;

use tracing::{trace, warn};

/// Idle connections to the queue are kept this long between polls.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Make aws-lc-rs the process-wide rustls crypto provider.
///
/// Idempotent; an already installed provider is left in place.
pub fn install_rustls_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            trace!("rustls crypto provider was installed elsewhere");
        }
    });
}

/// Build the `reqwest::Client` used for queue submissions and polls.
///
/// A zero `request_timeout` disables the per-request timeout.
pub fn build_client(request_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    let builder = reqwest::Client::builder()
        .user_agent(concat!("script-forge/", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(POOL_IDLE_TIMEOUT);
    let builder = if request_timeout.is_zero() {
        builder
    } else {
        builder.timeout(request_timeout)
    };

    match builder.build() {
        Ok(client) => client,
        Err(error) => {
            warn!(%error, "Queue client configuration rejected; using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install_rustls_provider();
        install_rustls_provider();
    }

    #[test]
    fn test_build_client_without_timeout() {
        let _client = build_client(Duration::ZERO);
    }
}
