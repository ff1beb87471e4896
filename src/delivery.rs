use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsConnector;

use crate::client::SmtpClient;
use crate::config::Opt;
use crate::envelope::Envelope;
use crate::error::SmtpError;
use crate::logger::Logger;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on one complete relay attempt, handshake to QUIT.
const RELAY_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of delivering to one recipient.
#[derive(Debug)]
pub enum DeliveryStatus {
    Delivered,
    /// Transient failure (unreachable peer, timeout, 4xx reply).
    Deferred(String),
    /// Permanent failure (5xx reply from the peer).
    Rejected(String),
}

#[derive(Debug)]
pub struct DeliveryReport {
    pub recipient: String,
    pub status: DeliveryStatus,
}

/// The domain suffix of an address: everything after the last `@`, or the
/// whole address when there is none.
pub fn domain_of(address: &str) -> &str {
    match address.rfind('@') {
        Some(i) => &address[i + 1..],
        None => address,
    }
}

/// Classifies each recipient of a completed envelope as local or remote and
/// performs the transfer. Failures are contained to the recipient being
/// processed; earlier deliveries are never rolled back.
pub struct Dispatcher {
    options: Arc<Opt>,
    logger: Arc<Logger>,
    sequence: AtomicU64,
}

impl Dispatcher {
    pub fn new(options: Arc<Opt>, logger: Arc<Logger>) -> Self {
        Self {
            options,
            logger,
            sequence: AtomicU64::new(0),
        }
    }

    /// Deliver to every recipient in submission order and report per
    /// recipient.
    pub async fn deliver(&self, envelope: &Envelope) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(envelope.recipients.len());

        for recipient in &envelope.recipients {
            let domain = domain_of(recipient);
            let status = if domain.trim() == self.options.hostname.trim() {
                match self.deliver_local(envelope, recipient).await {
                    Ok(()) => DeliveryStatus::Delivered,
                    Err(err) => DeliveryStatus::Deferred(err.to_string()),
                }
            } else {
                match time::timeout(RELAY_TIMEOUT, self.relay(envelope, recipient, domain)).await {
                    Ok(Ok(())) => DeliveryStatus::Delivered,
                    Ok(Err(SmtpError::Rejected { code, text })) if code >= 500 => {
                        DeliveryStatus::Rejected(format!("{} {}", code, text))
                    }
                    Ok(Err(err)) => DeliveryStatus::Deferred(err.to_string()),
                    Err(_) => DeliveryStatus::Deferred("relay attempt timed out".into()),
                }
            };

            match &status {
                DeliveryStatus::Delivered => {
                    self.logger
                        .log(recipient, &format!("delivered ({} bytes)", envelope.body.len()))
                        .await;
                }
                DeliveryStatus::Deferred(reason) | DeliveryStatus::Rejected(reason) => {
                    self.logger
                        .log(recipient, &format!("delivery failed: {}", reason))
                        .await;
                }
            }

            reports.push(DeliveryReport {
                recipient: recipient.clone(),
                status,
            });
        }

        reports
    }

    /// Write the envelope to the operator's transcript and, when a maildrop
    /// directory is configured, to a .eml file in it.
    async fn deliver_local(&self, envelope: &Envelope, recipient: &str) -> Result<(), SmtpError> {
        self.logger
            .log(
                recipient,
                &format!(
                    "local delivery from <{}> to {} recipient(s)",
                    envelope.sender,
                    envelope.recipients.len()
                ),
            )
            .await;

        if let Some(dir) = &self.options.maildrop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let filename = format!("{}_{}.eml", Local::now().format("%Y%m%d_%H%M%S%.3f"), seq);
            let path = dir.join(filename);

            let mut content = Vec::new();
            content.extend_from_slice(format!("Return-Path: <{}>\r\n", envelope.sender).as_bytes());
            content.extend_from_slice(format!("Delivered-To: {}\r\n", recipient).as_bytes());
            content.extend_from_slice(&envelope.body);

            tokio::fs::write(&path, content).await?;
            self.logger
                .log(recipient, &format!("written to {}", path.display()))
                .await;
        }

        Ok(())
    }

    /// Act as an SMTP client towards the recipient domain's server.
    async fn relay(
        &self,
        envelope: &Envelope,
        recipient: &str,
        domain: &str,
    ) -> Result<(), SmtpError> {
        let addr = format!("{}:{}", domain.trim(), self.options.relay_port);
        self.logger
            .log(recipient, &format!("relaying via {}", addr))
            .await;

        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                SmtpError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })??;

        let mut client = SmtpClient::new(stream, &self.options.hostname);
        let greeting = client.read_greeting().await?;
        if !greeting.completed() {
            return Err(SmtpError::Rejected {
                code: greeting.code,
                text: "greeting refused".into(),
            });
        }

        let hello = client.hello().await?;

        // Opportunistic upgrade when the peer advertises STARTTLS; a refusal
        // of the upgrade itself falls back to cleartext.
        if hello.advertises("STARTTLS") {
            let reply = client.command("STARTTLS").await?;
            if reply.code == 220 {
                let server_name = ServerName::try_from(domain.trim())
                    .map_err(|_| SmtpError::ServerName(domain.trim().to_owned()))?;
                let tls_stream = self
                    .tls_connector()
                    .connect(server_name, client.into_inner())
                    .await?;
                let mut client = SmtpClient::new(tls_stream, &self.options.hostname);
                client.hello().await?;
                self.logger.log(recipient, "relay channel upgraded to TLS").await;
                return transact(&mut client, envelope, recipient).await;
            }
        }

        transact(&mut client, envelope, recipient).await
    }

    fn tls_connector(&self) -> TlsConnector {
        let config = if self.options.relay_allow_invalid_certs {
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        TlsConnector::from(Arc::new(config))
    }
}

/// Run MAIL/RCPT/DATA/QUIT for one recipient over an established channel.
async fn transact<S>(
    client: &mut SmtpClient<S>,
    envelope: &Envelope,
    recipient: &str,
) -> Result<(), SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.mail_from(&envelope.sender).await?;
    client.rcpt_to(recipient).await?;
    client.data(&envelope.body).await?;
    let _ = client.quit().await;
    Ok(())
}

/// Verifier behind --relay-allow-invalid-certs: accepts any peer
/// certificate.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options(allow_invalid_certs: bool) -> Opt {
        Opt {
            hostname: "test.local".into(),
            address: "127.0.0.1".into(),
            port: 0,
            starttls: false,
            tls_cert: None,
            tls_key: None,
            max_sessions: 4,
            max_message_size: 1024,
            welcome: "test service ready".into(),
            log_file: None,
            maildrop: None,
            relay_port: 25,
            relay_allow_invalid_certs: allow_invalid_certs,
            idle_timeout: 10,
        }
    }

    #[test]
    fn connector_builds_in_both_trust_modes() {
        for allow_invalid in [false, true] {
            let logger = Arc::new(Logger::new(None).unwrap());
            let dispatcher = Dispatcher::new(Arc::new(test_options(allow_invalid)), logger);
            let _ = dispatcher.tls_connector();
        }
    }

    #[test]
    fn domain_uses_suffix_after_last_at_sign() {
        assert_eq!(domain_of("user@example.com"), "example.com");
        assert_eq!(domain_of("odd@quoted@example.org"), "example.org");
        assert_eq!(domain_of("no-domain"), "no-domain");
        assert_eq!(domain_of("trailing@"), "");
    }
}
