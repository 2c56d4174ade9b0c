use fluxgate::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fluxgate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = fluxgate::app::load_state()?;
    let pool = fluxgate::accounts::AccountPool::from_config(&state.runtime);
    if pool.is_empty() {
        tracing::warn!("no upstream accounts configured; generation requests will fail");
    } else {
        tracing::info!(accounts = ?pool.indices(), model = %state.runtime.model, "account pool loaded");
    }

    let app = fluxgate::app::build_app(state.clone());
    let addr: std::net::SocketAddr =
        state
            .runtime
            .listen
            .parse()
            .map_err(|err: std::net::AddrParseError| {
                AppError::internal(format!("invalid listen address: {err}"))
            })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::internal(format!("listen failed: {err}")))?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::internal(format!("serve failed: {err}")))?;
    Ok(())
}
