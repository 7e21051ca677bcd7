use crate::{
    config::ServerConfig, model_service::ModelService, routes::api_routes,
    scoring::ScoringPipeline, telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct SharedState<M: ModelService> {
    pub pipeline: Arc<ScoringPipeline<M>>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router<M: ModelService>(state: SharedState<M>, body_limit_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes::<M>())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        state: SharedState<M>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let router = build_router(state, config.body_limit_bytes);
        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
