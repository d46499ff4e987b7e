//! Endpoint configuration.

use std::time::Duration;

use crate::guard::RetryPolicy;

/// Time limits applied by the fault endpoint.
///
/// Built once per scenario and passed by value; there is no global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// How long to wait for the source to connect.
    pub accept_timeout: Duration,
    /// How long to wait for a handshake (source role).
    pub hello_timeout: Duration,
    /// How long to wait for one request or response frame.
    pub request_timeout: Duration,
    /// How long a deliberate stall lasts before the endpoint gives up.
    pub stall_limit: Duration,
    /// How long to wait for the peer to close an abandoned connection.
    pub close_timeout: Duration,
    /// Connect retry schedule (source role).
    pub connect: RetryPolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(5),
            hello_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            stall_limit: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            connect: RetryPolicy::default(),
        }
    }
}

impl EndpointConfig {
    /// Config whose stall outlasts a peer request limit of `request_limit`.
    ///
    /// A stalled endpoint must still be stalling when the peer's own limit
    /// fires, otherwise the peer never observes the hang.
    pub fn outlasting(request_limit: Duration) -> Self {
        let defaults = Self::default();
        let stall_limit = (request_limit * 2).max(defaults.stall_limit);
        Self { stall_limit, request_timeout: stall_limit, ..defaults }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_outlasts_request_limit() {
        let config = EndpointConfig::outlasting(Duration::from_secs(30));
        assert_eq!(config.stall_limit, Duration::from_secs(60));
        assert!(config.request_timeout >= config.stall_limit);

        let short = EndpointConfig::outlasting(Duration::from_secs(1));
        assert_eq!(short.stall_limit, EndpointConfig::default().stall_limit);
    }
}
