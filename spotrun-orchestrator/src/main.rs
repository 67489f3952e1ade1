use clap::Parser;
use spotrun_orchestrator::cli::Cli;
use spotrun_orchestrator::error::exit_codes;
use spotrun_orchestrator::provider_manager::ProviderManager;
use spotrun_orchestrator::settings::{Mode, Settings};
use spotrun_orchestrator::Pipeline;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match Settings::from_cli(Cli::parse()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(e.exit_code());
        }
    };
    let market = match ProviderManager::get_provider(&settings.marketplace) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(e.exit_code());
        }
    };
    let mode = settings.mode;
    let report_path = settings.report_path.clone();
    let pipeline = Pipeline::new(settings, market);

    if mode == Mode::List {
        match pipeline.list().await {
            Ok(instances) => {
                println!("My instances ({})", instances.len());
                for inst in instances {
                    println!(
                        "  [{}] {} | ${:.3}/hr | {}{}",
                        inst.id,
                        inst.gpu_name.as_deref().unwrap_or("?"),
                        inst.price_per_hour.unwrap_or(0.0),
                        inst.status,
                        inst.label.map(|l| format!(" | {}", l)).unwrap_or_default()
                    );
                }
                return Ok(());
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                std::process::exit(e.exit_code());
            }
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let summary = pipeline.run(&cancel).await;

    if let Some(path) = report_path {
        let report = pipeline.to_report(&summary);
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!("⚠️ could not write report to {}: {}", path.display(), e);
                } else {
                    tracing::info!("[report] written to {}", path.display());
                }
            }
            Err(e) => tracing::warn!("⚠️ could not serialize report: {}", e),
        }
    }

    if summary.exit_code != exit_codes::SUCCESS {
        std::process::exit(summary.exit_code);
    }
    Ok(())
}

/// Ctrl-C or SIGTERM cancels the run; the pipeline still destroys the instance.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("⚠️ cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("⚠️ cannot listen for SIGTERM: {}", e);
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
    tracing::warn!("⚠️ interrupt received, cancelling run and destroying any instance");
    cancel.cancel();
}
