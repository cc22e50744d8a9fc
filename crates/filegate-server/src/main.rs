use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use filegate_api::{AppState, api_router};
use filegate_store::mount::MountStore;
use filegate_store::s3::{S3Config, S3ObjectStore};
use filegate_store::stats::StatsCache;
use filegate_store::traits::ObjectStore;
use filegate_upload::{SessionRegistry, UploadCoordinator, UploadSweeper};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filegate", about = "Browser-facing file gateway with chunked uploads")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    /// Storage backend: "s3" (endpoint configured via FILEGATE_S3_* env
    /// vars) or "mount" (a local directory).
    #[arg(long, default_value = "s3")]
    backend: String,

    #[arg(long, default_value = "./data")]
    mount_root: String,

    /// Upload sessions older than this are aborted by the sweeper.
    #[arg(long, default_value = "24")]
    session_max_age_hours: u64,

    #[arg(long, default_value = "3600")]
    sweep_interval_secs: u64,

    #[arg(long, default_value = "300")]
    stats_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("filegate=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    let store: Arc<dyn ObjectStore> = match cli.backend.as_str() {
        "s3" => {
            let config = S3Config::from_env();
            info!(endpoint = %config.endpoint, bucket = %config.bucket, "using s3 backend");
            Arc::new(S3ObjectStore::new(config)?)
        }
        "mount" => {
            let root = PathBuf::from(&cli.mount_root);
            info!(root = %root.display(), "using mount backend");
            Arc::new(MountStore::new(root).await?)
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown backend: {other} (expected \"s3\" or \"mount\")"),
            )
            .into());
        }
    };

    let registry = Arc::new(SessionRegistry::new());
    let coordinator = Arc::new(UploadCoordinator::new(Arc::clone(&store), registry));
    let stats = Arc::new(StatsCache::new(
        Arc::clone(&store),
        Duration::from_secs(cli.stats_ttl_secs),
    ));

    let sweeper = UploadSweeper::new(
        Arc::clone(&coordinator),
        Duration::from_secs(cli.session_max_age_hours * 3600),
    );
    let sweeper_handle = sweeper.spawn(Duration::from_secs(cli.sweep_interval_secs));
    info!(
        max_age_hours = cli.session_max_age_hours,
        interval_secs = cli.sweep_interval_secs,
        "session expiry sweeper enabled"
    );

    if cli.stats_ttl_secs > 0 {
        let stats_refresher = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_refresher.ttl());
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = stats_refresher.refresh_if_idle().await {
                    warn!(error = %err, "background stats refresh failed");
                }
            }
        });
    }

    let app = api_router(AppState {
        store,
        coordinator,
        stats,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("filegate listening on {addr}");
    axum::serve(listener, app).await?;

    sweeper_handle.shutdown().await;
    Ok(())
}
