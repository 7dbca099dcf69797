//! One client session fanned out to every configured backend.
//!
//! The proxy never forwards a backend's reply text to the client. Every
//! client-visible reply is synthesized here, and backends whose replies
//! diverge from the others are dropped from the session.

use std::io;
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tokio::sync::watch;

use crate::auth::{self, AuthError};
use crate::backend::{BackendLink, BackendSet, LinkError, Transport};
use crate::client::{self, ClientConn};
use crate::config::ProxyConfig;
use crate::reply::{trim_eol, Reply};
use crate::session::{self, Command, Session};
use crate::utils::{Logger, VERBOSE_BODY, VERBOSE_HEADERS};

pub const SERVICE_UNAVAILABLE: &str = "421 service temporarily unavailable\r\n";
pub const SHUTTING_DOWN: &str = "421 service shutting down\r\n";
pub const CLOSING: &str = "221 closing connection\r\n";
pub const START_MAIL_INPUT: &str = "354 enter mail, end with \".\" on a line by itself\r\n";
pub const OK: &str = "250 OK\r\n";
pub const AUTH_OK: &str = "235 2.7.0 authentication successful\r\n";
pub const TLS_READY: &str = "220 OK\r\n";
pub const TLS_UNAVAILABLE: &str = "454 TLS not available\r\n";
pub const SASL_CONTINUE: &str = "334 \r\n";
pub const EMPTY_COMMAND: &str = "500 command unrecognized: \"\"\r\n";
pub const LINE_TOO_LONG: &str = "500 line too long\r\n";

const QUIT: &[u8] = b"QUIT\r\n";
const END_OF_DATA: &[u8] = b".\r\n";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no answer from any SMTP server")]
    NoBackends,

    #[error("required server #{index} {name} unavailable: {reason}")]
    RequiredBackend {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("server #{0} refused the session")]
    Refused(usize),

    #[error("AUTH LOGIN failed: {0}")]
    Auth(#[from] AuthError),

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("client error: {0}")]
    Client(#[from] io::Error),
}

impl SessionError {
    /// Failures the client is told about with a 421.
    pub fn is_quorum(&self) -> bool {
        matches!(
            self,
            SessionError::NoBackends
                | SessionError::RequiredBackend { .. }
                | SessionError::Refused(_)
        )
    }
}

/// How the backends answered one command, after divergent ones were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    /// At least one backend is waiting for the message.
    Data,
    /// Nobody accepted; the code is the lowest-index backend's.
    Rejected(u16),
}

/// Waits until the shutdown flag is raised. A dropped sender means no
/// shutdown will ever come.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct Multiplexer {
    config: Arc<ProxyConfig>,
    logger: Arc<Logger>,
    session: Session,
    client: ClientConn,
    backends: BackendSet,
    shutdown: watch::Receiver<bool>,
}

impl Multiplexer {
    pub fn new(
        config: Arc<ProxyConfig>,
        logger: Arc<Logger>,
        session: Session,
        stream: impl Transport + 'static,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let client = ClientConn::new(stream, config.timeout, session.id.clone(), logger.clone());
        Self {
            config,
            logger,
            session,
            client,
            backends: BackendSet::new(),
            shutdown,
        }
    }

    /// Runs the session to completion and closes every connection.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.serve().await;

        if let Err(e) = &result {
            self.logger
                .error(
                    &self.session.id,
                    &format!("client_addr={} {}", self.session.client_addr, e),
                )
                .await;
            if e.is_quorum() {
                let _ = self.client.send(SERVICE_UNAVAILABLE).await;
            }
        }

        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        self.connect_backends().await?;
        self.greet().await?;
        self.command_loop().await
    }

    async fn log_debug(&self, message: &str) {
        self.logger.debug(&self.session.id, message).await;
    }

    async fn log_info(&self, message: &str) {
        self.logger.info(&self.session.id, message).await;
    }

    async fn drop_backend(&mut self, index: usize, reason: &str) {
        let name = match self.backends.get(index) {
            Some(link) => link.name().to_string(),
            None => return,
        };
        if self.backends.disconnect(index).await {
            self.log_info(&format!("#{} disconnecting from {}: {}", index, name, reason))
                .await;
        }
    }

    async fn connect_backends(&mut self) -> Result<(), SessionError> {
        let link_timeout = self.config.link_timeout();
        let config = self.config.clone();

        for (index, addr) in config.backends.iter().enumerate() {
            self.log_debug(&format!("#{} connecting to {}", index, addr)).await;

            match BackendLink::connect(index, addr, config.connect_timeout, link_timeout).await {
                Ok(link) => self.backends.push(link),
                Err(e) => {
                    self.log_info(&format!("#{} connection to {} failed: {}", index, addr, e))
                        .await;
                    if config.require_all {
                        return Err(SessionError::RequiredBackend {
                            index,
                            name: addr.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    self.backends
                        .push(BackendLink::unreachable(index, addr.to_string(), link_timeout));
                }
            }
        }

        for index in self.backends.live_indices() {
            let welcome = match self.read_reply(index).await {
                Ok(reply) if reply.code == 220 => continue,
                Ok(reply) => format!("no welcome: {}", reply),
                Err(e) => format!("no welcome: {}", e),
            };

            if config.require_all {
                let name = self
                    .backends
                    .get(index)
                    .map(|link| link.name().to_string())
                    .unwrap_or_default();
                return Err(SessionError::RequiredBackend {
                    index,
                    name,
                    reason: welcome,
                });
            }
            self.drop_backend(index, &welcome).await;
        }

        if self.backends.live() == 0 {
            return Err(SessionError::NoBackends);
        }
        Ok(())
    }

    async fn greet(&mut self) -> Result<(), SessionError> {
        let greeting = format!(
            "220-{} Roundhouse/{} SMTP multiplexor\r\n220 session {} ready\r\n",
            self.config.hostname,
            env!("CARGO_PKG_VERSION"),
            self.session.id
        );
        self.client.send(&greeting).await?;

        let xclient = self.session.xclient_command();
        for (index, reply) in self.round(xclient.as_bytes()).await {
            if reply.code == 421 {
                return Err(SessionError::Refused(index));
            }
        }

        if self.backends.live() == 0 {
            return Err(SessionError::NoBackends);
        }
        Ok(())
    }

    async fn command_loop(&mut self) -> Result<(), SessionError> {
        let mut input = Vec::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    self.log_info("shutdown requested").await;
                    self.quit_backends().await;
                    self.client.send(SHUTTING_DOWN).await?;
                    return Ok(());
                }
                read = self.client.read_line(&mut input) => read?,
            };

            if read == 0 {
                self.log_info("client closed connection").await;
                return Ok(());
            }
            if client::is_overlong(&input) {
                self.log_info("client command line too long").await;
                self.client.send(LINE_TOO_LONG).await?;
                self.client.skip_line().await?;
                continue;
            }

            let line = String::from_utf8_lossy(trim_eol(&input)).into_owned();
            let command = session::classify(&line);
            match command {
                Command::Auth | Command::AuthLogin => self.log_debug("> AUTH (credentials hidden)").await,
                _ => self.log_debug(&format!("> {}", line)).await,
            }
            let forward = match command {
                Command::Empty => {
                    self.client.send(EMPTY_COMMAND).await?;
                    continue;
                }
                Command::StartTls => {
                    self.start_tls().await?;
                    continue;
                }
                Command::Quit => {
                    self.quit_backends().await;
                    self.client.send(CLOSING).await?;
                    return Ok(());
                }
                Command::AuthLogin => {
                    let credentials = auth::login_to_plain(&mut self.client, &line).await?;
                    self.log_debug(&format!(
                        "AUTH LOGIN rewritten to AUTH PLAIN, login length={}",
                        credentials.username().len()
                    ))
                    .await;
                    credentials.to_command().into_bytes()
                }
                Command::MailFrom(arg) => {
                    self.session.mail_from = Some(arg.to_string());
                    with_crlf(trim_eol(&input))
                }
                Command::Ehlo(name) | Command::Helo(name) => {
                    self.session.helo = Some(name.to_string());
                    self.session.esmtp = matches!(command, Command::Ehlo(_));
                    self.session.reset();
                    with_crlf(trim_eol(&input))
                }
                Command::Rset => {
                    self.session.reset();
                    with_crlf(trim_eol(&input))
                }
                Command::Auth | Command::Other => with_crlf(trim_eol(&input)),
            };

            let replies = self.round(&forward).await;
            let mut outcome = match command {
                Command::Auth | Command::AuthLogin => self.relay_sasl(replies).await?,
                _ => self.resolve(replies).await,
            };

            if outcome == Outcome::Data {
                outcome = self.relay_message().await?;
                self.session.reset();
            }

            if self.backends.live() == 0 {
                return Err(SessionError::NoBackends);
            }

            let reply = match (outcome, command) {
                (Outcome::Rejected(code), _) => rejection(code),
                (_, Command::Ehlo(name)) => self.capabilities(name),
                (_, Command::Helo(name)) => format!("250 {} Hello {}\r\n", self.config.hostname, name),
                (_, Command::AuthLogin) | (_, Command::Auth) => AUTH_OK.to_string(),
                _ => OK.to_string(),
            };
            self.client.send(&reply).await?;
        }
    }

    fn capabilities(&self, name: &str) -> String {
        let mut reply = format!("250-{} Hello {}\r\n", self.config.hostname, name);
        reply.push_str("250-AUTH PLAIN LOGIN\r\n");
        reply.push_str("250-PIPELINING\r\n");
        if self.config.starttls_configured() && !self.session.tls_active {
            reply.push_str("250-STARTTLS\r\n");
        }
        reply.push_str("250 8BITMIME\r\n");
        reply
    }

    /// STARTTLS ends at the proxy; the backends never see it.
    async fn start_tls(&mut self) -> Result<(), SessionError> {
        let acceptor = match &self.config.tls {
            Some(acceptor) if !self.session.tls_active => acceptor.clone(),
            _ => {
                self.client.send(TLS_UNAVAILABLE).await?;
                return Ok(());
            }
        };

        if self.client.has_pending_input() {
            self.log_info("refusing STARTTLS: client pipelined data after it").await;
            self.client.send(TLS_UNAVAILABLE).await?;
            return Ok(());
        }

        self.client.send(TLS_READY).await?;
        self.client
            .start_tls(&acceptor)
            .await
            .map_err(SessionError::Tls)?;

        self.session.tls_active = true;
        self.session.helo = None;
        self.session.reset();
        self.log_info("TLS session established").await;
        Ok(())
    }

    /// Carries on a SASL exchange while backends answer `334`. Backends
    /// answering anything else are dropped first, as they would take the
    /// client's response for a command. The client only ever sees an empty
    /// challenge; its responses are not logged.
    async fn relay_sasl(
        &mut self,
        mut replies: Vec<(usize, Reply)>,
    ) -> Result<Outcome, SessionError> {
        let mut input = Vec::new();

        loop {
            if !replies.iter().any(|(_, reply)| reply.code == 334) {
                return Ok(self.resolve(replies).await);
            }
            for (index, reply) in &replies {
                if reply.code != 334 {
                    self.diverge(*index, reply.code).await;
                }
            }

            self.client.send(SASL_CONTINUE).await?;
            if self.client.read_line(&mut input).await? == 0 {
                return Err(AuthError::Eof.into());
            }
            if client::is_overlong(&input) {
                return Err(AuthError::LineTooLong.into());
            }
            self.log_debug("> (AUTH response hidden)").await;

            replies = self.round(&with_crlf(trim_eol(&input))).await;
        }
    }

    /// Backends are not waited on after QUIT; many just drop the line.
    async fn quit_backends(&mut self) {
        self.broadcast(QUIT).await;
    }

    /// Writes to every live backend, dropping those that fail.
    async fn broadcast(&mut self, line: &[u8]) {
        for index in self.backends.live_indices() {
            let sent = match self.backends.get_mut(index) {
                Some(link) => link.send_line(line).await,
                None => continue,
            };
            if let Err(e) = sent {
                self.drop_backend(index, &e.to_string()).await;
            }
        }
    }

    async fn read_reply(&mut self, index: usize) -> Result<Reply, LinkError> {
        let link = self.backends.get_mut(index).ok_or(LinkError::Disconnected)?;
        let reply = link.read_reply().await?;
        for line in reply.lines() {
            self.log_debug(&format!("#{} < {}", index, line)).await;
        }
        Ok(reply)
    }

    /// One command round: write to every live backend in order, then read
    /// every reply. Links failing either step are dropped.
    async fn round(&mut self, line: &[u8]) -> Vec<(usize, Reply)> {
        self.broadcast(line).await;

        let mut replies = Vec::with_capacity(self.backends.live());
        for index in self.backends.live_indices() {
            match self.read_reply(index).await {
                Ok(reply) => replies.push((index, reply)),
                Err(e) => self.drop_backend(index, &e.to_string()).await,
            }
        }
        replies
    }

    /// Reduces a round's replies to one outcome. When some backends accept
    /// and others do not, the dissenters are sent QUIT and dropped.
    async fn resolve(&mut self, replies: Vec<(usize, Reply)>) -> Outcome {
        let data = replies.iter().any(|(_, reply)| reply.code == 354);
        let accepted = replies.iter().any(|(_, reply)| reply.is_positive());

        if !data && !accepted {
            return match replies.first() {
                Some((_, reply)) => Outcome::Rejected(reply.code),
                None => Outcome::Rejected(421),
            };
        }

        for (index, reply) in &replies {
            let diverged = if data {
                reply.code != 354
            } else {
                !reply.is_positive()
            };
            if diverged {
                self.diverge(*index, reply.code).await;
            }
        }

        if data {
            Outcome::Data
        } else {
            Outcome::Accepted
        }
    }

    /// Says QUIT to a backend that disagreed with the others and drops it.
    async fn diverge(&mut self, index: usize, code: u16) {
        if let Some(link) = self.backends.get_mut(index) {
            let _ = link.send_line(QUIT).await;
        }
        self.drop_backend(index, &format!("diverged with {}", code))
            .await;
    }

    /// The DATA phase: synthesized headers first, then the client's message
    /// line by line up to the lone dot.
    async fn relay_message(&mut self) -> Result<Outcome, SessionError> {
        self.client.send(START_MAIL_INPUT).await?;

        let headers = format!(
            "{}{}",
            self.session.return_path_header(),
            self.session.received_header(&self.config.hostname, Local::now())
        );
        if self.logger.is_verbose(VERBOSE_HEADERS) {
            self.logger
                .log_verbose(&self.session.id, "injected headers", headers.trim_end())
                .await;
        }
        self.broadcast(headers.as_bytes()).await;

        let mut input = Vec::new();
        let mut in_headers = true;
        let mut dropping = false;
        // false while inside a line longer than MAX_LINE
        let mut at_line_start = true;

        loop {
            if self.client.read_line(&mut input).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed connection during message",
                )
                .into());
            }

            let complete = input.ends_with(b"\n");
            let content = if complete { trim_eol(&input) } else { &input[..] };
            let continuation = !at_line_start;
            at_line_start = complete;

            if continuation {
                if !(in_headers && dropping) {
                    self.broadcast(&relayed(content, complete)).await;
                }
                continue;
            }

            if complete && content == b"." {
                break;
            }

            if in_headers {
                if content.is_empty() {
                    in_headers = false;
                    dropping = false;
                } else if dropping && content[0].is_ascii_whitespace() {
                    continue;
                } else {
                    dropping = session::is_return_path(content);
                    if dropping {
                        self.log_debug("dropping client Return-Path").await;
                        continue;
                    }
                }
                if self.logger.is_verbose(VERBOSE_HEADERS) {
                    self.log_debug(&format!("> {}", String::from_utf8_lossy(content)))
                        .await;
                }
            } else if self.logger.is_verbose(VERBOSE_BODY) {
                self.log_debug(&format!("> {}", String::from_utf8_lossy(content)))
                    .await;
            }

            self.broadcast(&relayed(content, complete)).await;
        }

        self.log_debug("> .").await;
        let replies = self.round(END_OF_DATA).await;
        Ok(self.resolve(replies).await)
    }

    async fn close(&mut self) {
        self.backends.disconnect_all().await;
        self.client.close().await;
        self.log_info(&format!(
            "session closed client_addr={}",
            self.session.client_addr
        ))
        .await;
    }
}

/// A message line as sent upstream: CRLF normalised, or raw bytes for a
/// piece of a line that goes on.
fn relayed(content: &[u8], complete: bool) -> Vec<u8> {
    if complete {
        with_crlf(content)
    } else {
        content.to_vec()
    }
}

fn with_crlf(content: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(content.len() + 2);
    line.extend_from_slice(content);
    line.extend_from_slice(b"\r\n");
    line
}

/// A client-visible rejection. Only the code is taken from the backend.
pub fn rejection(code: u16) -> String {
    format!("{} requested action not taken\r\n", code)
}
