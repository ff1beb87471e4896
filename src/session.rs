use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, SecondsFormat};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;

use crate::command::{parse_address, Command};
use crate::config::Opt;
use crate::delivery::{DeliveryStatus, Dispatcher};
use crate::envelope::Envelope;
use crate::error::SmtpError;
use crate::logger::Logger;

/// Upper bound on a single command line.
const MAX_COMMAND_LINE: usize = 4096;

/// How a call to [`Session::serve`] ended.
pub enum SessionOutcome<S> {
    /// The dialogue is over and the connection can be dropped.
    Closed,
    /// The client asked for STARTTLS and was told `220`; the raw stream is
    /// handed back so the acceptor can wrap it and resume the session.
    StartTls(S),
}

enum Flow {
    Continue,
    Quit,
    StartTls,
}

enum LineRead {
    Line(Vec<u8>),
    /// The line exceeded the limit. Input is left just before the
    /// terminating LF so the caller can resynchronize with [`discard_line`].
    Overflow,
    Eof,
}

/// The SMTP state machine for one client connection.
///
/// The session is generic over its transport so the same dispatch loop runs
/// over plain TCP and over the TLS stream a STARTTLS upgrade produces.
pub struct Session {
    id: u64,
    scope: String,
    options: Arc<Opt>,
    logger: Arc<Logger>,
    dispatcher: Dispatcher,
    envelope: Option<Envelope>,
    tls_available: bool,
    tls_active: bool,
}

impl Session {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        options: Arc<Opt>,
        logger: Arc<Logger>,
        tls_available: bool,
    ) -> Self {
        let dispatcher = Dispatcher::new(options.clone(), logger.clone());
        Self {
            id,
            scope: peer.to_string(),
            options,
            logger,
            dispatcher,
            envelope: None,
            tls_available,
            tls_active: false,
        }
    }

    /// Mark the transport as encrypted. Called by the acceptor after a
    /// successful STARTTLS handshake, before the session is resumed.
    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
    }

    /// Drive the command dialogue until the connection closes, the client
    /// quits, or a STARTTLS upgrade is requested.
    pub async fn serve<S>(&mut self, stream: S) -> Result<SessionOutcome<S>, SmtpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        // The greeting is only sent on the initial plaintext connection;
        // after STARTTLS the client is expected to re-EHLO instead.
        if !self.tls_active {
            let greeting = format!(
                "{} - Session id: {}, Time: {}",
                self.options.welcome,
                self.id,
                Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
            );
            self.respond(&mut writer, 220, &greeting).await?;
        }

        loop {
            let line = match self.read_line_timed(&mut reader, MAX_COMMAND_LINE).await {
                Ok(LineRead::Line(raw)) => String::from_utf8_lossy(&raw).into_owned(),
                Ok(LineRead::Overflow) => {
                    self.respond(&mut writer, 500, "Line too long").await?;
                    match self.discard_line_timed(&mut reader).await {
                        Ok(()) => {}
                        Err(SmtpError::IdleTimeout) => {
                            self.logger
                                .log(&self.scope, "idle timeout, closing session")
                                .await;
                            return Ok(SessionOutcome::Closed);
                        }
                        Err(err) => return Err(err),
                    }
                    self.envelope = None;
                    continue;
                }
                Ok(LineRead::Eof) => return Ok(SessionOutcome::Closed),
                Err(SmtpError::IdleTimeout) => {
                    self.logger
                        .log(&self.scope, "idle timeout, closing session")
                        .await;
                    return Ok(SessionOutcome::Closed);
                }
                Err(err) => return Err(err),
            };

            self.logger.log(&self.scope, &format!(">> {}", line)).await;

            let cmd = Command::parse(&line);
            if cmd.fields.is_empty() {
                continue;
            }

            match self.handle_command(cmd, &mut reader, &mut writer).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(SessionOutcome::Closed),
                Flow::StartTls => {
                    let stream = reader.into_inner().unsplit(writer);
                    return Ok(SessionOutcome::StartTls(stream));
                }
            }
        }
    }

    async fn handle_command<R, W>(
        &mut self,
        cmd: Command,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Flow, SmtpError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match cmd.verb.as_str() {
            "HELO" => {
                if cmd.fields.len() < 2 {
                    self.respond(writer, 502, "Missing parameters").await?;
                } else {
                    self.respond(writer, 250, "Go ahead").await?;
                }
                Ok(Flow::Continue)
            }
            "EHLO" => {
                self.handle_ehlo(&cmd, writer).await?;
                Ok(Flow::Continue)
            }
            "MAIL" => {
                self.handle_mail(&cmd, writer).await?;
                Ok(Flow::Continue)
            }
            "RCPT" => {
                self.handle_rcpt(&cmd, writer).await?;
                Ok(Flow::Continue)
            }
            "DATA" => self.handle_data(reader, writer).await,
            "STARTTLS" => self.handle_starttls(writer).await,
            "RSET" => {
                self.envelope = None;
                self.respond(writer, 250, "Go ahead").await?;
                Ok(Flow::Continue)
            }
            "NOOP" => {
                self.respond(writer, 250, "Go ahead").await?;
                Ok(Flow::Continue)
            }
            "QUIT" => {
                self.respond(writer, 221, "OK, bye").await?;
                Ok(Flow::Quit)
            }
            _ => {
                self.respond(writer, 502, "Unsupported command.").await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_ehlo<W>(&mut self, cmd: &Command, writer: &mut W) -> Result<(), SmtpError>
    where
        W: AsyncWrite + Unpin,
    {
        if cmd.fields.len() < 2 {
            return self.respond(writer, 502, "Missing parameters").await;
        }

        let mut block = String::from("250-PIPELINING\r\n");
        block.push_str(&format!("250-SIZE {}\r\n", self.options.max_message_size));
        block.push_str("250-ENHANCEDSTATUSCODES\r\n");
        block.push_str("250-8BITMIME\r\n");
        if self.tls_available && !self.tls_active {
            block.push_str("250-STARTTLS\r\n");
        }
        block.push_str("250 DSN\r\n");

        writer.write_all(block.as_bytes()).await?;
        writer.flush().await?;
        self.logger
            .log(&self.scope, "<< 250 (EHLO capabilities)")
            .await;
        Ok(())
    }

    async fn handle_mail<W>(&mut self, cmd: &Command, writer: &mut W) -> Result<(), SmtpError>
    where
        W: AsyncWrite + Unpin,
    {
        if cmd.params.len() != 2 || !cmd.params[0].eq_ignore_ascii_case("FROM") {
            return self.respond(writer, 502, "Invalid syntax.").await;
        }
        if self.envelope.is_some() {
            return self.respond(writer, 502, "Duplicate MAIL").await;
        }
        match parse_address(&cmd.params[1]) {
            Ok(addr) => {
                self.envelope = Some(Envelope::new(addr));
                self.respond(writer, 250, "Go ahead").await
            }
            Err(_) => self.respond(writer, 502, "Ill-formatted e-mail address").await,
        }
    }

    async fn handle_rcpt<W>(&mut self, cmd: &Command, writer: &mut W) -> Result<(), SmtpError>
    where
        W: AsyncWrite + Unpin,
    {
        if cmd.params.len() != 2 || !cmd.params[0].eq_ignore_ascii_case("TO") {
            return self.respond(writer, 502, "Invalid syntax.").await;
        }
        if self.envelope.is_none() {
            return self.respond(writer, 502, "Missing MAIL FROM command.").await;
        }
        match parse_address(&cmd.params[1]) {
            Ok(addr) => {
                if let Some(envelope) = self.envelope.as_mut() {
                    envelope.add_recipient(addr);
                }
                self.respond(writer, 250, "Go ahead").await
            }
            Err(_) => self.respond(writer, 502, "Ill-formatted e-mail address").await,
        }
    }

    async fn handle_starttls<W>(&mut self, writer: &mut W) -> Result<Flow, SmtpError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.envelope.is_some() {
            self.respond(writer, 503, "STARTTLS not allowed during a mail transaction")
                .await?;
            return Ok(Flow::Continue);
        }
        if !self.tls_available || self.tls_active {
            self.respond(writer, 454, "TLS not available").await?;
            return Ok(Flow::Continue);
        }
        self.respond(writer, 220, "Ready to start TLS").await?;
        Ok(Flow::StartTls)
    }

    /// Read the dot-terminated message body, enforce the size limit, and
    /// hand the completed envelope to delivery.
    async fn handle_data<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<Flow, SmtpError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let has_recipients = self
            .envelope
            .as_ref()
            .map_or(false, |envelope| !envelope.recipients.is_empty());
        if !has_recipients {
            self.respond(writer, 502, "Missing RCPT TO command.").await?;
            return Ok(Flow::Continue);
        }

        self.respond(writer, 354, "Go ahead. End your data with <CR><LF>.<CR><LF>")
            .await?;

        let max = self.options.max_message_size;
        let mut body: Vec<u8> = Vec::new();
        let mut oversized = false;

        // Keep reading to the terminator even once the limit is blown, so
        // the stream stays aligned for the next command.
        loop {
            match self.read_line_timed(reader, max + 1024).await {
                Ok(LineRead::Line(line)) => {
                    if line.as_slice() == b"." {
                        break;
                    }
                    // Transparency: a leading dot escapes a literal dot line.
                    let text: &[u8] = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line
                    };
                    if !oversized && body.len() + text.len() + 2 > max {
                        oversized = true;
                    }
                    if !oversized {
                        body.extend_from_slice(text);
                        body.extend_from_slice(b"\r\n");
                    }
                }
                Ok(LineRead::Overflow) => {
                    self.discard_line_timed(reader).await?;
                    oversized = true;
                }
                Ok(LineRead::Eof) => return Err(SmtpError::ConnectionClosed),
                Err(err) => return Err(err),
            }
        }

        if oversized {
            self.envelope = None;
            self.respond(
                writer,
                552,
                &format!("Message exceeded max message size of {} bytes", max),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let envelope = match self.envelope.take() {
            Some(mut envelope) => {
                envelope.body = body;
                envelope
            }
            None => return Ok(Flow::Continue),
        };

        let reports = self.dispatcher.deliver(&envelope).await;
        let failed: Vec<&str> = reports
            .iter()
            .filter(|report| !matches!(report.status, DeliveryStatus::Delivered))
            .map(|report| report.recipient.as_str())
            .collect();

        if failed.is_empty() {
            self.respond(writer, 250, "Thank you.").await?;
        } else {
            self.respond(
                writer,
                451,
                &format!("Delivery failed for: {}", failed.join(", ")),
            )
            .await?;
        }
        Ok(Flow::Continue)
    }

    async fn respond<W>(&self, writer: &mut W, code: u16, text: &str) -> Result<(), SmtpError>
    where
        W: AsyncWrite + Unpin,
    {
        self.logger
            .log(&self.scope, &format!("<< {} {}", code, text))
            .await;
        writer
            .write_all(format!("{} {}\r\n", code, text).as_bytes())
            .await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_line_timed<R>(&self, reader: &mut R, limit: usize) -> Result<LineRead, SmtpError>
    where
        R: AsyncBufRead + Unpin,
    {
        let idle = Duration::from_secs(self.options.idle_timeout);
        match time::timeout(idle, read_line_bounded(reader, limit)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SmtpError::IdleTimeout),
        }
    }

    /// Resynchronize past the next LF under the same idle deadline as reads,
    /// so a peer stalling mid-line cannot hold the session open.
    async fn discard_line_timed<R>(&self, reader: &mut R) -> Result<(), SmtpError>
    where
        R: AsyncBufRead + Unpin,
    {
        let idle = Duration::from_secs(self.options.idle_timeout);
        match time::timeout(idle, discard_line(reader)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SmtpError::IdleTimeout),
        }
    }
}

/// Read one LF-terminated line, stripping the terminator and an optional
/// trailing CR. Lines longer than `limit` yield [`LineRead::Overflow`] with
/// the terminating LF left unconsumed.
async fn read_line_bounded<R>(reader: &mut R, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(LineRead::Eof);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if line.len() + pos > limit {
                    reader.consume(pos);
                    return Ok(LineRead::Overflow);
                }
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                if line.ends_with(b"\r") {
                    line.pop();
                }
                return Ok(LineRead::Line(line));
            }
            None => {
                let n = buf.len();
                if line.len() + n > limit {
                    reader.consume(n);
                    return Ok(LineRead::Overflow);
                }
                line.extend_from_slice(buf);
                reader.consume(n);
            }
        }
    }
}

/// Advance the reader past the next LF (or to EOF).
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options() -> Opt {
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
            relay_allow_invalid_certs: false,
            idle_timeout: 10,
        }
    }

    #[tokio::test]
    async fn bounded_reader_strips_crlf() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"HELO client.local\r\n").await.unwrap();

        let mut reader = BufReader::new(server);
        match read_line_bounded(&mut reader, 100).await.unwrap() {
            LineRead::Line(line) => assert_eq!(line, b"HELO client.local"),
            _ => panic!("expected a complete line"),
        }
    }

    #[tokio::test]
    async fn bounded_reader_reports_overflow_and_resynchronizes() {
        let (mut client, server) = tokio::io::duplex(256);
        let long = vec![b'A'; 64];
        client.write_all(&long).await.unwrap();
        client.write_all(b"\r\nNOOP\r\n").await.unwrap();

        let mut reader = BufReader::new(server);
        assert!(matches!(
            read_line_bounded(&mut reader, 16).await.unwrap(),
            LineRead::Overflow
        ));
        discard_line(&mut reader).await.unwrap();
        match read_line_bounded(&mut reader, 16).await.unwrap() {
            LineRead::Line(line) => assert_eq!(line, b"NOOP"),
            _ => panic!("expected the next command after resync"),
        }
    }

    #[tokio::test]
    async fn bounded_reader_signals_eof() {
        let (client, server) = tokio::io::duplex(256);
        drop(client);

        let mut reader = BufReader::new(server);
        assert!(matches!(
            read_line_bounded(&mut reader, 16).await.unwrap(),
            LineRead::Eof
        ));
    }

    #[tokio::test]
    async fn session_greets_ignores_blank_lines_and_quits() {
        let options = Arc::new(test_options());
        let logger = Arc::new(Logger::new(None).unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut session = Session::new(7, peer, options, logger, false);

        let (client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let outcome = session.serve(server).await.unwrap();
            matches!(outcome, SessionOutcome::Closed)
        });

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220 "));
        assert!(line.contains("Session id: 7"));

        // A blank line draws no response; the next reply belongs to NOOP.
        client.get_mut().write_all(b"\r\nNOOP\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "250 Go ahead\r\n");

        client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "221 OK, bye\r\n");

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn stalled_peer_after_overlong_line_is_disconnected() {
        let mut options = test_options();
        options.idle_timeout = 1;
        let options = Arc::new(options);
        let logger = Arc::new(Logger::new(None).unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut session = Session::new(2, peer, options, logger, false);

        let (client, server) = tokio::io::duplex(16384);
        tokio::spawn(async move {
            let _ = session.serve(server).await;
        });

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220 "));

        // Blow past the command-line limit without ever sending the LF.
        let partial = vec![b'A'; MAX_COMMAND_LINE + 1024];
        client.get_mut().write_all(&partial).await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "500 Line too long\r\n");

        // Never completing the line gets the session closed, not stuck.
        line.clear();
        let n = client.read_line(&mut line).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn starttls_rejected_without_identity_and_during_transaction() {
        let options = Arc::new(test_options());
        let logger = Arc::new(Logger::new(None).unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut session = Session::new(1, peer, options, logger, false);

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = session.serve(server).await;
        });

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();

        client.get_mut().write_all(b"STARTTLS\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "454 TLS not available\r\n");

        client
            .get_mut()
            .write_all(b"MAIL FROM:<u@a.tld>\r\nSTARTTLS\r\n")
            .await
            .unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "250 Go ahead\r\n");
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("503 "));
    }
}
