use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::Local;
use tokio::sync::Mutex;

/// Escape control characters so client-supplied text is safe to print.
pub fn sanitize(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => result.push(c),
            '\r' | '\n' => result.push(' '),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Session log written to stdout and, when configured, appended to a file.
pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let writer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self { writer })
    }

    /// Log one line, tagged with a scope (peer address or "server").
    pub async fn log(&self, scope: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("{} {} {}\n", timestamp, scope, sanitize(message));

        print!("{}", line);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}
