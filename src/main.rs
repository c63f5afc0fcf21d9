use groupchat::{AppState, config::Config, db::Store, session::SessionCodec};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("groupchat=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("groupchat v{} starting", env!("CARGO_PKG_VERSION"));

    let store = Store::connect(&config.database_url, config.max_db_connections).await?;
    store.migrate().await?;
    tracing::info!(database_url = %config.database_url, "database ready");

    let (codec, ephemeral) = match config.jwt_secret.as_deref() {
        Some(secret) if !secret.is_empty() => (SessionCodec::new(secret.as_bytes(), config.token_ttl()), false),
        _ => {
            tracing::warn!("no jwt_secret configured, using a random one; tokens will not survive a restart");
            (SessionCodec::ephemeral(config.token_ttl()), true)
        }
    };

    let admin = store.ensure_admin(&config.admin_email).await?;
    tracing::info!(user_id = admin.id, email = %admin.email, role = ?admin.role, "bootstrap admin ready");
    // a random secret leaves no other way to obtain a first token
    if config.print_admin_token || ephemeral {
        let token = codec.issue(&admin)?;
        tracing::info!(email = %admin.email, %token, "admin session token");
    }

    let state = AppState::new(store.clone(), codec, config.send_queue_capacity);
    let app = groupchat::app(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
