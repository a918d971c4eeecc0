//! Client configuration.

use std::time::Duration;

/// Connectivity class of the environment, fed to the client through a
/// `tokio::sync::watch` channel so changes take effect while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// No network at all; connect attempts are refused up front.
    None,
    /// Metered/mobile-class connection.
    Metered,
    /// Unmetered/Wi-Fi-class connection.
    Unmetered,
}

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// Upper bound on a single reply document.
    pub max_reply_size: usize,
    /// On the very first message fetch of a session, only the most
    /// recent N messages are requested to bound the payload. Zero
    /// fetches everything.
    pub message_window: u32,
    /// Liveness probes after a shutdown request before giving up and
    /// leaving the connection open.
    pub shutdown_poll_attempts: u32,
    /// Spacing between those probes.
    pub shutdown_poll_interval: Duration,
    /// Auto-refresh interval on a metered connection. Zero disables.
    pub refresh_interval_metered: Duration,
    /// Auto-refresh interval on an unmetered connection. Zero disables.
    pub refresh_interval_unmetered: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_reply_size: 16 * 1024 * 1024,
            message_window: 50,
            shutdown_poll_attempts: 5,
            shutdown_poll_interval: Duration::from_millis(400),
            refresh_interval_metered: Duration::from_secs(60),
            refresh_interval_unmetered: Duration::from_secs(10),
        }
    }
}
