use event_pipeline_service::config::LogFormat;
use event_pipeline_service::{shutdown_signal, Config, Supervisor};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        == Some(LogFormat::Json);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[actix_web::main]
async fn main() -> ExitCode {
    // Missing .env is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();
    init_tracing();

    tracing::info!("Starting event pipeline service");

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Configuration loading failed");
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let supervisor = match Supervisor::validate(config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "Startup validation failed, no worker started");
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match supervisor.run(shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("Event pipeline service shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Event pipeline service stopped with a worker fault");
            ExitCode::FAILURE
        }
    }
}
