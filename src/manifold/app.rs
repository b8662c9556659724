use std::{sync::Arc, time::Duration};

use crate::manifold::{config, gate::Gate, listener, logging, tls};

pub async fn run(raw: config::RawConfig) -> anyhow::Result<()> {
    let cfg = config::Config::from_raw(raw)?;

    let _log_guard = logging::init(&cfg.logging)?;

    let gate = Arc::new(Gate::new(
        cfg.acl.clone(),
        cfg.token.clone(),
        cfg.ws_path.clone(),
    ));

    let acceptor = match &cfg.tls {
        Some(paths) => Some(tls::load_acceptor(&paths.cert, &paths.key)?),
        None => None,
    };

    let ln = listener::Listener::bind(cfg.port, gate, acceptor).await?;

    tracing::info!(
        port = cfg.port,
        path = %cfg.ws_path,
        tls = cfg.tls.is_some(),
        token = !cfg.token.is_empty(),
        "manifold: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut serve = tokio::spawn(ln.serve(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = &mut serve => {
            return res?;
        }
    }

    // Give the accept loop a moment to observe shutdown; nothing else needs
    // draining, sessions die with their connections.
    if tokio::time::timeout(Duration::from_secs(5), &mut serve)
        .await
        .is_err()
    {
        serve.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
