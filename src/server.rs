use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tokio_rustls::TlsAcceptor;

use crate::config::Opt;
use crate::logger::Logger;
use crate::session::{Session, SessionOutcome};

/// The connection acceptor: owns the listening socket, the TLS identity and
/// the live-session accounting, and spawns one session task per connection.
pub struct Server {
    options: Arc<Opt>,
    logger: Arc<Logger>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    next_session_id: AtomicU64,
}

impl Server {
    /// Build the server from its options. Fails when the log file cannot be
    /// opened or, with --starttls, when the identity cannot be loaded.
    pub fn new(options: Opt) -> Result<Self> {
        let logger = Arc::new(Logger::new(options.log_file.clone())?);

        let tls_acceptor = if options.starttls {
            let (cert_path, key_path) = match (&options.tls_cert, &options.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => bail!("--starttls requires --tls-cert and --tls-key"),
            };

            let cert_file = std::fs::File::open(cert_path)
                .with_context(|| format!("failed to open certificate {:?}", cert_path))?;
            let cert_chain: Vec<Certificate> = certs(&mut StdBufReader::new(cert_file))
                .with_context(|| format!("failed to parse certificate {:?}", cert_path))?
                .into_iter()
                .map(Certificate)
                .collect();

            let key_file = std::fs::File::open(key_path)
                .with_context(|| format!("failed to open private key {:?}", key_path))?;
            let mut keys = pkcs8_private_keys(&mut StdBufReader::new(key_file))
                .with_context(|| format!("failed to parse private key {:?}", key_path))?;
            if keys.is_empty() {
                bail!("no PKCS#8 private key found in {:?}", key_path);
            }

            let config = ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(cert_chain, PrivateKey(keys.remove(0)))
                .context("failed to build TLS config")?;

            Some(Arc::new(TlsAcceptor::from(Arc::new(config))))
        } else {
            None
        };

        Ok(Self {
            slots: Arc::new(Semaphore::new(options.max_sessions)),
            options: Arc::new(options),
            logger,
            tls_acceptor,
            active: Arc::new(AtomicUsize::new(0)),
            next_session_id: AtomicU64::new(0),
        })
    }

    /// Number of sessions currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the listen address and serve until a non-transient accept error.
    /// A bind failure is fatal and propagates to the caller.
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.options.address, self.options.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind to {}", addr))?;
        self.start_with_listener(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn start_with_listener(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        self.logger
            .log("server", &format!("listening on {} as {}", local, self.options.hostname))
            .await;
        if self.tls_acceptor.is_some() {
            self.logger.log("server", "STARTTLS enabled").await;
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;

                    let permit = match self.slots.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.logger
                                .log(&peer.to_string(), "session limit reached, rejecting")
                                .await;
                            let mut stream = stream;
                            let _ = stream
                                .write_all(b"421 Too busy. Try again later.\r\n")
                                .await;
                            continue;
                        }
                    };

                    let guard = ActiveGuard::new(self.active.clone());
                    self.logger
                        .log(
                            &peer.to_string(),
                            &format!("session {} accepted ({} active)", id, self.active_sessions()),
                        )
                        .await;

                    let options = self.options.clone();
                    let logger = self.logger.clone();
                    let acceptor = self.tls_acceptor.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _guard = guard;
                        handle_connection(stream, peer, id, options, logger, acceptor).await;
                    });
                }
                Err(err) if is_transient(&err) => {
                    self.logger
                        .log("server", &format!("accept error: {} - will continue", err))
                        .await;
                    time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => {
                    return Err(err).context("accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    options: Arc<Opt>,
    logger: Arc<Logger>,
    acceptor: Option<Arc<TlsAcceptor>>,
) {
    let mut session = Session::new(id, peer, options, logger.clone(), acceptor.is_some());

    match session.serve(stream).await {
        Ok(SessionOutcome::Closed) => {}
        Ok(SessionOutcome::StartTls(stream)) => {
            let acceptor = match acceptor {
                Some(acceptor) => acceptor,
                None => return,
            };
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    session.mark_tls_active();
                    if let Err(err) = session.serve(tls_stream).await {
                        logger
                            .log(&peer.to_string(), &format!("session error: {}", err))
                            .await;
                    }
                }
                Err(err) => {
                    logger
                        .log(&peer.to_string(), &format!("TLS handshake failed: {}", err))
                        .await;
                }
            }
        }
        Err(err) => {
            logger
                .log(&peer.to_string(), &format!("session error: {}", err))
                .await;
        }
    }

    logger.log(&peer.to_string(), "connection closed").await;
}

/// Accept errors worth retrying after a short backoff, typically caused by
/// the peer vanishing between accept and handshake or by fd pressure.
fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

/// Increments the live-session counter on creation and decrements it when
/// the session task finishes, on every exit path.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
