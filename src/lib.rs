//! A minimal SMTP mail transfer agent.
//!
//! The server accepts inbound connections, drives one SMTP session per
//! connection, and hands completed envelopes to the delivery dispatcher,
//! which either writes them to the local maildrop or relays them to the
//! recipient domain's server. Sessions can upgrade to TLS mid-dialogue via
//! STARTTLS when the server was started with a certificate.

pub mod client;
pub mod command;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod logger;
pub mod server;
pub mod session;

pub use config::Opt;
pub use error::SmtpError;
pub use server::Server;
