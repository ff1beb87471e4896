use thiserror::Error;

/// Errors raised by the SMTP session, the outbound client and delivery.
///
/// Protocol syntax problems on the inbound side are answered with a 5xx
/// reply and never surface here; this type covers the failures that end a
/// session or a relay attempt.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("ill-formatted e-mail address: {0}")]
    AddressSyntax(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("session idle timeout expired")]
    IdleTimeout,

    #[error("malformed reply from peer: {0}")]
    BadReply(String),

    #[error("request rejected by peer: {code} {text}")]
    Rejected { code: u16, text: String },

    #[error("invalid TLS server name: {0}")]
    ServerName(String),
}
