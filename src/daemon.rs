use roundhouse::Opt;

/// Detaches from the terminal, writes the PID file, then drops to the
/// configured user and group. Listeners must already be bound.
#[cfg(unix)]
pub fn daemonize(opt: &Opt) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    eprintln!("[INFO] Starting daemon mode...");

    let mut daemonize = Daemonize::new()
        .pid_file(&opt.pid_file)
        .chown_pid_file(true)
        .working_directory("/")
        .umask(0o027);

    if let Some(user) = &opt.user {
        daemonize = daemonize.user(user.as_str());
    }
    if let Some(group) = &opt.group {
        daemonize = daemonize.group(group.as_str());
    }

    match daemonize.start() {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("[ERROR] Daemon startup: {}", e);
            Err(anyhow::anyhow!("Failed to start daemon mode"))
        }
    }
}

#[cfg(not(unix))]
pub fn daemonize(_opt: &Opt) -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode not supported on this platform, staying in foreground");
    Ok(())
}
