use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ProxyConfig;
use crate::multiplexer::{shutdown_requested, Multiplexer};
use crate::session::{Session, SessionIds};
use crate::utils::{Logger, PROCESS_TAG};

/// Accepts clients on every configured interface and runs one
/// [`Multiplexer`] task per connection.
pub struct SmtpProxy {
    config: Arc<ProxyConfig>,
    logger: Arc<Logger>,
    ids: SessionIds,
    shutdown: watch::Sender<bool>,
}

/// Binds every interface. Done before daemonizing and dropping
/// privileges so port 25 can be used.
pub fn bind_listeners(interfaces: &[SocketAddr]) -> Result<Vec<std::net::TcpListener>> {
    interfaces
        .iter()
        .map(|addr| {
            let listener = std::net::TcpListener::bind(addr)
                .with_context(|| format!("Failed to bind to {}", addr))?;
            listener
                .set_nonblocking(true)
                .with_context(|| format!("Failed to configure listener {}", addr))?;
            Ok(listener)
        })
        .collect()
}

impl SmtpProxy {
    pub fn new(config: Arc<ProxyConfig>, logger: Arc<Logger>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            logger,
            ids: SessionIds::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Stops accepting and asks idle sessions to close.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Starts a session on an already accepted connection.
    fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, client_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let session = Session::new(self.ids.next(), client_addr);
        let logger = self.logger.clone();
        let tag = session.id.clone();
        let multiplexer = Multiplexer::new(
            self.config.clone(),
            self.logger.clone(),
            session,
            stream,
            self.shutdown.subscribe(),
        );

        sessions.spawn(async move {
            logger
                .info(&tag, &format!("client_addr={}", client_addr))
                .await;
            // errors are logged by the session itself
            let _ = multiplexer.run().await;
        });
    }

    async fn run_server(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        self.logger
            .info(PROCESS_TAG, &format!("listening on {}", local_addr))
            .await;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        self.spawn_session(&mut sessions, stream, client_addr);
                    }
                    Err(e) => {
                        self.logger
                            .error(PROCESS_TAG, &format!("accept error on {}: {}", local_addr, e))
                            .await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        self.logger
                            .error(PROCESS_TAG, &format!("session task failed: {}", e))
                            .await;
                    }
                }
            }
        }

        drop(listener);
        if !sessions.is_empty() {
            self.logger
                .info(
                    PROCESS_TAG,
                    &format!("{}: waiting for {} session(s) to finish", local_addr, sessions.len()),
                )
                .await;
        }
        while sessions.join_next().await.is_some() {}

        self.logger
            .info(PROCESS_TAG, &format!("stopped listening on {}", local_addr))
            .await;
        Ok(())
    }

    /// Serves every listener until [`SmtpProxy::shutdown`] is called and
    /// all sessions have drained.
    pub async fn run(self: Arc<Self>, listeners: Vec<std::net::TcpListener>) -> Result<()> {
        let mut servers = JoinSet::new();

        for listener in listeners {
            let listener = TcpListener::from_std(listener)?;
            let this = self.clone();
            servers.spawn(async move { this.run_server(listener).await });
        }

        while let Some(finished) = servers.join_next().await {
            if let Err(e) = finished? {
                self.logger
                    .error(PROCESS_TAG, &format!("server failed: {}", e))
                    .await;
            }
        }

        Ok(())
    }
}
