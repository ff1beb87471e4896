use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::SmtpError;

/// One SMTP reply, possibly spanning several `250-...` continuation lines.
#[derive(Debug)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// 2xx: the requested action completed.
    pub fn completed(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: the peer wants more input (the DATA go-ahead).
    pub fn intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Whether an EHLO reply advertises the given extension keyword.
    pub fn advertises(&self, capability: &str) -> bool {
        let want = capability.to_ascii_uppercase();
        self.lines
            .iter()
            .any(|line| line.to_ascii_uppercase().starts_with(&want))
    }

    fn text(&self) -> String {
        self.lines.join(" ")
    }

    fn rejected(self) -> SmtpError {
        SmtpError::Rejected {
            code: self.code,
            text: self.text(),
        }
    }
}

/// Outbound SMTP client used by the relay path.
///
/// Generic over the transport so the same transaction code runs before and
/// after a STARTTLS upgrade.
pub struct SmtpClient<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
    local_name: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    pub fn new(stream: S, local_name: &str) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            local_name: local_name.to_owned(),
        }
    }

    /// Hand the raw stream back for a TLS upgrade.
    pub fn into_inner(self) -> S {
        self.reader.into_inner().unsplit(self.writer)
    }

    /// Read one reply, following `-` continuation lines to the end.
    pub async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut lines = Vec::new();
        let mut code: u16 = 0;

        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(SmtpError::ConnectionClosed);
            }
            // Parse the prefix as bytes: the peer controls the line, and a
            // multibyte character straddling the code must not slice mid-char.
            let bytes = line.as_bytes();
            if bytes.len() < 4
                || !bytes[..3].iter().all(u8::is_ascii_digit)
                || (bytes[3] != b' ' && bytes[3] != b'-')
            {
                return Err(SmtpError::BadReply(line));
            }

            let reply_code = bytes[..3]
                .iter()
                .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));
            if code == 0 {
                code = reply_code;
            } else if code != reply_code {
                return Err(SmtpError::BadReply(format!(
                    "inconsistent reply codes: {} vs {}",
                    code, reply_code
                )));
            }

            let separator = bytes[3];
            lines.push(line[4..].trim_end().to_owned());

            // A space after the code marks the final line of the reply.
            if separator == b' ' {
                break;
            }
        }

        Ok(Reply { code, lines })
    }

    /// Send one command line and wait for the reply.
    pub async fn command(&mut self, cmd: &str) -> Result<Reply, SmtpError> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    pub async fn read_greeting(&mut self) -> Result<Reply, SmtpError> {
        self.read_reply().await
    }

    /// Announce our identity: EHLO, falling back to HELO when rejected.
    pub async fn hello(&mut self) -> Result<Reply, SmtpError> {
        let reply = self.command(&format!("EHLO {}", self.local_name)).await?;
        if reply.completed() {
            return Ok(reply);
        }
        let reply = self.command(&format!("HELO {}", self.local_name)).await?;
        if reply.completed() {
            Ok(reply)
        } else {
            Err(reply.rejected())
        }
    }

    pub async fn mail_from(&mut self, address: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("MAIL FROM:<{}>", address)).await?;
        if reply.completed() {
            Ok(())
        } else {
            Err(reply.rejected())
        }
    }

    pub async fn rcpt_to(&mut self, address: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("RCPT TO:<{}>", address)).await?;
        if reply.completed() {
            Ok(())
        } else {
            Err(reply.rejected())
        }
    }

    /// Send DATA, then the body with dot-stuffing, then the terminator.
    pub async fn data(&mut self, body: &[u8]) -> Result<(), SmtpError> {
        let reply = self.command("DATA").await?;
        if !reply.intermediate() {
            return Err(reply.rejected());
        }

        let mut rest = body;
        while !rest.is_empty() {
            let (line, tail) = match rest.iter().position(|&b| b == b'\n') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, &rest[rest.len()..]),
            };
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                self.writer.write_all(b".").await?;
            }
            self.writer.write_all(line).await?;
            self.writer.write_all(b"\r\n").await?;
            rest = tail;
        }

        self.writer.write_all(b".\r\n").await?;
        self.writer.flush().await?;

        let reply = self.read_reply().await?;
        if reply.completed() {
            Ok(())
        } else {
            Err(reply.rejected())
        }
    }

    pub async fn quit(&mut self) -> Result<Reply, SmtpError> {
        self.command("QUIT").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_parser_handles_continuation_lines() {
        let (mut server, client) = tokio::io::duplex(1024);
        server
            .write_all(b"250-mx.example.com\r\n250-PIPELINING\r\n250-STARTTLS\r\n250 DSN\r\n")
            .await
            .unwrap();

        let mut client = SmtpClient::new(client, "sender.local");
        let reply = client.read_reply().await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines.len(), 4);
        assert!(reply.completed());
        assert!(reply.advertises("STARTTLS"));
        assert!(reply.advertises("starttls"));
        assert!(!reply.advertises("AUTH"));
    }

    #[tokio::test]
    async fn reply_parser_rejects_multibyte_garbage_without_panicking() {
        for reply in ["25€ hi\r\n", "€50 hi\r\n", "2500 hi\r\n", "25\r\n"] {
            let (mut server, client) = tokio::io::duplex(1024);
            server.write_all(reply.as_bytes()).await.unwrap();

            let mut client = SmtpClient::new(client, "sender.local");
            assert!(
                matches!(client.read_reply().await, Err(SmtpError::BadReply(_))),
                "reply {:?} should be malformed",
                reply
            );
        }
    }

    #[tokio::test]
    async fn reply_parser_rejects_mixed_codes() {
        let (mut server, client) = tokio::io::duplex(1024);
        server
            .write_all(b"250-first\r\n550 second\r\n")
            .await
            .unwrap();

        let mut client = SmtpClient::new(client, "sender.local");
        assert!(matches!(
            client.read_reply().await,
            Err(SmtpError::BadReply(_))
        ));
    }

    #[tokio::test]
    async fn data_applies_dot_stuffing() {
        let (mut server, client) = tokio::io::duplex(4096);

        let send = tokio::spawn(async move {
            let mut client = SmtpClient::new(client, "sender.local");
            client.data(b".hidden\r\nplain\r\n").await
        });

        let mut reader = BufReader::new(&mut server);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "DATA\r\n");
        reader.get_mut().write_all(b"354 go\r\n").await.unwrap();

        let mut wire = Vec::new();
        for _ in 0..3 {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            wire.push(line.clone());
        }
        assert_eq!(wire, vec!["..hidden\r\n", "plain\r\n", ".\r\n"]);

        reader.get_mut().write_all(b"250 ok\r\n").await.unwrap();
        send.await.unwrap().unwrap();
    }
}
