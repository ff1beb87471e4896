use std::path::PathBuf;

use structopt::StructOpt;

/// Server options, fixed for the lifetime of the process.
#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "minimta",
    about = "A minimal SMTP mail transfer agent with STARTTLS and relay delivery"
)]
pub struct Opt {
    /// Hostname announced to peers and used for the local-delivery decision
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Offer STARTTLS to clients (requires --tls-cert and --tls-key)
    #[structopt(long = "starttls")]
    pub starttls: bool,

    /// TLS certificate chain file (PEM)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM, PKCS#8)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Maximum number of concurrent sessions
    #[structopt(long = "max-sessions", default_value = "64")]
    pub max_sessions: usize,

    /// Maximum message body size in bytes
    #[structopt(long = "max-message-size", default_value = "10240000")]
    pub max_message_size: usize,

    /// Welcome banner text sent in the 220 greeting
    #[structopt(long = "welcome", default_value = "minimta ESMTP service ready")]
    pub welcome: String,

    /// Log file path (log lines always go to stdout as well)
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Directory where locally delivered messages are written as .eml files
    #[structopt(long = "maildrop", parse(from_os_str))]
    pub maildrop: Option<PathBuf>,

    /// Port dialed when relaying to a recipient domain's server
    #[structopt(long = "relay-port", default_value = "25")]
    pub relay_port: u16,

    /// Accept any certificate from relay peers instead of verifying
    /// against the bundled roots
    #[structopt(long = "relay-allow-invalid-certs")]
    pub relay_allow_invalid_certs: bool,

    /// Seconds a session may sit idle between reads before it is closed
    #[structopt(long = "idle-timeout", default_value = "300")]
    pub idle_timeout: u64,
}
