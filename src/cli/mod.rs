use clap::{ Parser, ValueEnum };

/// How a guest history's time-to-live is counted.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    /// Every write resets the timeout.
    #[default]
    Sliding,
    /// The timeout counts from the first write of the session.
    Fixed,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- History Store Args ---
    /// History chat store type (redis, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "redis")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Batch size for Redis SCAN command when sweeping guest histories.
    #[arg(long, env = "HISTORY_REDIS_SCAN_COUNT", default_value = "100")]
    pub history_redis_scan_count: usize,

    /// Namespace prepended to every history key.
    #[arg(long, env = "HISTORY_SESSION_KEY", default_value = "ai_chat_history")]
    pub history_session_key: String,

    /// Maximum number of messages kept per history. Older messages are dropped.
    #[arg(long, env = "HISTORY_MAX_LENGTH", default_value = "50")]
    pub history_max_length: usize,

    /// Lifetime in seconds of a guest history.
    #[arg(long, env = "HISTORY_TIMEOUT", default_value = "3600")] // 1 hour
    pub history_timeout: u64,

    /// Whether guest writes refresh the timeout (sliding) or not (fixed).
    #[arg(long, env = "HISTORY_EXPIRY", value_enum, default_value = "sliding")]
    pub history_expiry: ExpiryPolicy,

    // --- Cleanup Args ---
    /// Seconds between scheduled cleanup sweeps. 0 disables the timer.
    #[arg(long, env = "CLEANUP_INTERVAL", default_value = "300")]
    pub cleanup_interval: u64,

    /// Action name that triggers a cleanup sweep through the HTTP API.
    #[arg(long, env = "CLEANUP_ACTION", default_value = "ai_chat_cleanup")]
    pub cleanup_action: String,

    // --- Server Args ---
    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Header set by the upstream authentication layer with the signed-in user id.
    #[arg(long, env = "AUTH_USER_HEADER", default_value = "x-user-id")]
    pub auth_user_header: String,

    /// Optional path to the TLS certificate file (PEM format) for enabling HTTPS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling HTTPS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["chat-history"]);
        assert_eq!(args.history_type, "redis");
        assert_eq!(args.history_max_length, 50);
        assert_eq!(args.history_timeout, 3600);
        assert_eq!(args.history_expiry, ExpiryPolicy::Sliding);
        assert_eq!(args.cleanup_action, "ai_chat_cleanup");
    }

    #[test]
    fn expiry_policy_parses_from_flag() {
        let args = Args::parse_from(["chat-history", "--history-expiry", "fixed"]);
        assert_eq!(args.history_expiry, ExpiryPolicy::Fixed);
    }
}
