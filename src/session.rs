use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Local};

/// XCLIENT placeholder for values the proxy does not know.
pub const UNAVAILABLE: &str = "[UNAVAILABLE]";

/// Hands out session ids for log correlation.
#[derive(Debug, Default)]
pub struct SessionIds {
    counter: AtomicU32,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Five or more digits, never `00000`.
    pub fn next(&self) -> String {
        loop {
            let id = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return format!("{:05}", id);
            }
        }
    }
}

/// What the proxy has learnt about one client connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_addr: SocketAddr,
    /// Argument of the last HELO/EHLO.
    pub helo: Option<String>,
    /// Argument of the last MAIL FROM, without the keyword.
    pub mail_from: Option<String>,
    pub esmtp: bool,
    pub tls_active: bool,
}

impl Session {
    pub fn new(id: String, client_addr: SocketAddr) -> Self {
        Self {
            id,
            client_addr,
            helo: None,
            mail_from: None,
            esmtp: false,
            tls_active: false,
        }
    }

    /// Forgets the current mail transaction.
    pub fn reset(&mut self) {
        self.mail_from = None;
    }

    pub fn client_name(&self) -> String {
        match &self.helo {
            Some(helo) if !helo.is_empty() => helo.clone(),
            _ => self.client_addr.ip().to_string(),
        }
    }

    /// The line telling a backend who the real client is.
    pub fn xclient_command(&self) -> String {
        let addr = match self.client_addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("IPV6:{}", ip),
        };
        format!("XCLIENT ADDR={} NAME={}\r\n", addr, UNAVAILABLE)
    }

    /// The reverse-path of the last MAIL FROM, `<>` when there was none.
    pub fn reverse_path(&self) -> &str {
        self.mail_from
            .as_deref()
            .and_then(|arg| arg.split_whitespace().next())
            .unwrap_or("<>")
    }

    pub fn return_path_header(&self) -> String {
        format!("Return-Path:{}\r\n", self.reverse_path())
    }

    pub fn received_header(&self, hostname: &str, now: DateTime<Local>) -> String {
        let protocol = match (self.esmtp, self.tls_active) {
            (_, true) => "ESMTPS",
            (true, false) => "ESMTP",
            (false, false) => "SMTP",
        };

        format!(
            "Received: from {} ([{}])\r\n\tby {} (Roundhouse) with {} id {};\r\n\t{}\r\n",
            self.client_name(),
            self.client_addr.ip(),
            hostname,
            protocol,
            self.id,
            now.to_rfc2822()
        )
    }
}

/// How the proxy treats one line from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Empty,
    StartTls,
    AuthLogin,
    /// Any other AUTH mechanism, forwarded as is.
    Auth,
    Ehlo(&'a str),
    Helo(&'a str),
    MailFrom(&'a str),
    Rset,
    Quit,
    Other,
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        line.get(prefix.len()..)
    } else {
        None
    }
}

/// Classifies a client line (without its terminator).
///
/// STARTTLS and AUTH LOGIN are checked before everything else since the
/// proxy handles them itself.
pub fn classify(line: &str) -> Command<'_> {
    if line.is_empty() {
        return Command::Empty;
    }
    if strip_prefix_ignore_case(line, "STARTTLS").is_some() {
        return Command::StartTls;
    }
    if strip_prefix_ignore_case(line, "AUTH LOGIN").is_some() {
        return Command::AuthLogin;
    }
    if strip_prefix_ignore_case(line, "AUTH").is_some() {
        return Command::Auth;
    }
    if let Some(arg) = strip_prefix_ignore_case(line, "EHLO") {
        return Command::Ehlo(arg.trim());
    }
    if let Some(arg) = strip_prefix_ignore_case(line, "HELO") {
        return Command::Helo(arg.trim());
    }
    if let Some(arg) = strip_prefix_ignore_case(line, "MAIL FROM:") {
        return Command::MailFrom(arg.trim());
    }
    if strip_prefix_ignore_case(line, "RSET").is_some() {
        return Command::Rset;
    }
    if strip_prefix_ignore_case(line, "QUIT").is_some() {
        return Command::Quit;
    }
    Command::Other
}

/// True for a `Return-Path:` header line.
pub fn is_return_path(line: &[u8]) -> bool {
    const NAME: &[u8] = b"return-path:";
    line.len() >= NAME.len() && line[..NAME.len()].eq_ignore_ascii_case(NAME)
}
