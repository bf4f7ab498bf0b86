use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use visit_scheduler::config::AppConfig;
use visit_scheduler::router;
use visit_scheduler::services::api::http::HttpVisitApi;
use visit_scheduler::services::api::VisitApi;
use visit_scheduler::services::messaging::webhook::WebhookNotifier;
use visit_scheduler::services::messaging::Notifier;
use visit_scheduler::state::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let api: Arc<dyn VisitApi> = Arc::new(HttpVisitApi::new(
        &config.api_base_url,
        config.request_timeout,
        config.retry_policy(),
    )?);
    tracing::info!(
        url = %config.api_base_url,
        timezone = config.timezone.name(),
        window_days = config.window_days,
        "using visit API"
    );

    let notifier: Option<Arc<dyn Notifier>> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "booking notifications enabled");
            Some(Arc::new(WebhookNotifier::new(url.clone(), config.request_timeout)?))
        }
        None => None,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let sweep_every = config.sweep_interval();
    let state = Arc::new(AppState::new(config, api, notifier));

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(state::sweep_idle_sessions(
        state.clone(),
        sweep_every,
        cancel.clone(),
    ));

    let app = router::build(state);

    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app).await;

    cancel.cancel();
    let _ = sweeper.await;
    served?;

    Ok(())
}
