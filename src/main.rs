use std::{net::SocketAddr, sync::Arc};

use axum::{routing::get, Router};
use tokio::{signal, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use optical_settlement as settlement;
use settlement::{
    clock::SystemClock, codes::RandomCodeGenerator,
    notifications::EventNotificationDispatcher,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = settlement::config::load_config()?;
    settlement::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = settlement::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        settlement::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(settlement::events::EventSender::new(event_tx));
    tokio::spawn(settlement::events::process_events(event_rx));

    // Aggregate app services used by HTTP handlers
    let services = settlement::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        Arc::new(SystemClock),
        Arc::new(RandomCodeGenerator),
        Arc::new(EventNotificationDispatcher::new(event_sender.clone())),
        cfg.settlement(),
    );

    let app_state = settlement::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        services,
    };

    let app = Router::<settlement::AppState>::new()
        .route("/", get(|| async { "optical-settlement up" }))
        .nest("/api/v1", settlement::api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("settlement-server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
    info!("Shutdown signal received");
}
