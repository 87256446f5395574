use ebars_backend::config::{load_ebars_config, Config};
use ebars_backend::logging::init_tracing;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level, "ebars-backend.log");

    let ebars = match load_ebars_config() {
        Ok(ebars) => ebars,
        Err(err) => {
            tracing::error!(error = %err, "invalid EBARS configuration");
            std::process::exit(1);
        }
    };

    let state = match ebars_backend::build_state(&config, ebars).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize store");
            std::process::exit(1);
        }
    };

    let app = ebars_backend::create_app(state);

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "bind listener failed");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, store = ?config.store, "ebars-backend listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("Graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
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
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
