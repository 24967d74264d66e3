use clap::Parser;
use remora_provisioner::{
    ApiClient, ClusterClient, ClusterEventRecorder, ConfigDriverFactory, Provisioner,
    ProvisionerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "remorad", about = "Dynamic storage provisioner for docker volume plugins")]
struct Cli {
    /// Cluster API server URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_url: String,

    /// Provisioner prefix this instance owns; storage classes whose
    /// provisioner begins with "<prefix>/" are handled here
    #[arg(long, default_value = "remora.dev")]
    provisioner: String,

    /// Leave plugin volumes alone and only manage cluster objects
    #[arg(long, default_value_t = false)]
    skip_plugin_volumes: bool,

    /// Container runtime socket used to resolve named V2 plugins
    #[arg(long, default_value = "")]
    docker_socket: String,

    /// Maximum in-flight provision chains
    #[arg(long, default_value_t = 4)]
    max_provisions: u32,

    /// Maximum in-flight delete chains
    #[arg(long, default_value_t = 10)]
    max_deletes: u32,

    /// Log chain status every few seconds
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(
        "starting remorad (provisioner={}, api={})",
        cli.provisioner, cli.api_url
    );

    let api = Arc::new(ApiClient::new(&cli.api_url));
    let cluster: Arc<dyn ClusterClient> = api.clone();

    let instance_id = Uuid::new_v4();
    let recorder = Arc::new(ClusterEventRecorder::new(
        Arc::clone(&cluster),
        format!("{}-{}", cli.provisioner, instance_id),
    ));
    let drivers = Arc::new(ConfigDriverFactory::new(cli.docker_socket.clone()));

    let mut config = ProvisionerConfig::new(&cli.provisioner);
    config.affect_plugin_vols = !cli.skip_plugin_volumes;
    config.debug = cli.debug;
    config.max_provisions = cli.max_provisions;
    config.max_deletes = cli.max_deletes;

    let provisioner = Arc::new(Provisioner::new(cluster, drivers, recorder, config));

    let token = CancellationToken::new();
    provisioner.start(api, token.clone()).await?;

    let sig = shutdown_signal().await;
    info!("Received {}, shutting down gracefully...", sig);
    token.cancel();

    // give informer tasks a moment to drain
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for either SIGINT (ctrl-c) or SIGTERM, returning which one fired.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}
