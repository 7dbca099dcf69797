mod daemon;

use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use roundhouse::utils::{Logger, PROCESS_TAG};
use roundhouse::{proxy, Opt, ProxyConfig, SmtpProxy};

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn serve(
    config: ProxyConfig,
    logger: Arc<Logger>,
    listeners: Vec<std::net::TcpListener>,
) -> Result<()> {
    let proxy = Arc::new(SmtpProxy::new(Arc::new(config), logger.clone()));

    logger
        .info(
            PROCESS_TAG,
            &format!("Roundhouse/{} SMTP multiplexor, pid {}", env!("CARGO_PKG_VERSION"), std::process::id()),
        )
        .await;
    for (index, backend) in proxy.config().backends.iter().enumerate() {
        logger.info(PROCESS_TAG, &format!("server #{} {}", index, backend)).await;
    }
    if proxy.config().require_all {
        logger.info(PROCESS_TAG, "all servers required for each session").await;
    }
    if proxy.config().starttls_configured() {
        logger.info(PROCESS_TAG, "STARTTLS enabled").await;
    }

    let signals = {
        let proxy = proxy.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            logger.info(PROCESS_TAG, "signal received, shutting down").await;
            proxy.shutdown();
        })
    };

    let result = proxy.run(listeners).await;
    signals.abort();
    result
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = match ProxyConfig::from_opt(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(2);
        }
    };

    let logger = Arc::new(Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)?);

    // Bind while still privileged; the daemon may switch user afterwards.
    let listeners = proxy::bind_listeners(&config.interfaces)?;

    if opt.daemon {
        daemon::daemonize(&opt)?;
    }

    // The runtime is only created now, in the daemonized child.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config, logger, listeners))
}
