use crate::{
    config::Config,
    ort_service::OrtModelService,
    preprocessing::Preprocessor,
    scoring::ScoringPipeline,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::signal;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    config.model.validate().inspect_err(|_| {
        tracing::error!("Model files are missing, not starting the server");
    })?;

    let model_service = match OrtModelService::new(&config.model) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to load model: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let state = SharedState {
        pipeline: Arc::new(ScoringPipeline::new(model_service, Preprocessor::default())),
        metrics: Arc::new(Metrics::new()?),
    };

    let server = HttpServer::new(state, &config.server).await?;

    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
