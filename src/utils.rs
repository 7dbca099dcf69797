use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tag for records that belong to no session.
pub const PROCESS_TAG: &str = "-";

/// Mirror the SMTP dialogue (both directions).
pub const VERBOSE_DIALOGUE: u8 = 1;
/// Also mirror the message headers relayed during DATA.
pub const VERBOSE_HEADERS: u8 = 2;
/// Also mirror the message body.
pub const VERBOSE_BODY: u8 = 3;

/// Keeps printable ASCII and whitespace only.
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Escapes control and non-ASCII characters.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Error,
    Info,
    Debug,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

/// Session-tagged log writer: stdout plus an optional append-only file.
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    raw_display: bool,
    verbosity: u8,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbosity: u8) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self {
            writer,
            raw_display,
            verbosity,
        })
    }

    pub fn is_verbose(&self, level: u8) -> bool {
        self.verbosity >= level
    }

    pub async fn info(&self, tag: &str, message: &str) {
        self.log(Level::Info, tag, message).await;
    }

    pub async fn error(&self, tag: &str, message: &str) {
        self.log(Level::Error, tag, message).await;
    }

    /// Dialogue tracing, only written at `-v` and above.
    pub async fn debug(&self, tag: &str, message: &str) {
        if self.is_verbose(VERBOSE_DIALOGUE) {
            self.log(Level::Debug, tag, message).await;
        }
    }

    async fn log(&self, level: Level, tag: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let display_message = if self.raw_display {
            message.to_string()
        } else {
            filter_printable_chars(message)
        };

        print!("{} [{}] {} {}\n", timestamp, level.label(), tag, display_message);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_line = format!(
                "{} [{}] {} {}\n",
                timestamp,
                level.label(),
                tag,
                safe_log_string(message)
            );
            let _ = writer.write_all(file_line.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Writes `details` as a framed block, for multi-line content such as
    /// injected headers.
    pub async fn log_verbose(&self, tag: &str, title: &str, details: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "─".repeat(60);

        let display_details = if self.raw_display {
            details.to_string()
        } else {
            safe_log_string(details)
        };

        let verbose_log = format!(
            "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
            separator, timestamp, tag, title, separator, display_details, separator
        );

        print!("{}", verbose_log);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_log = format!(
                "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
                separator,
                timestamp,
                tag,
                title,
                separator,
                safe_log_string(details),
                separator
            );
            let _ = writer.write_all(file_log.as_bytes());
            let _ = writer.flush();
        }
    }
}
