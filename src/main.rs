use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use composable_dra::cli::{env_file_from_args, format_dry_run, Args};
use composable_dra::client::{CdiClient, CredentialCache, IdentityTokenSource};
use composable_dra::cluster::{spawn_engine, Collaborators, EngineOptions, ReconciliationEngine};
use composable_dra::config::{
    Catalog, IdentitySecret, CONFIG_MAP_NAME, DRA_NAMESPACE, SECRET_NAME,
};
use composable_dra::context::RequestContext;
use composable_dra::kube::{ClusterApi, KubeClient, ResourceSlicePublisher};

#[tokio::main]
async fn main() {
    // The env file has to be loaded before clap reads the env-backed options
    let env_loaded = env_file_from_args(std::env::args())
        .map(|path| dotenvy::from_path(&path).map_err(|e| (path, e)));

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .init();

    if let Some(Err((path, e))) = env_loaded {
        error!("Failed to load env file {}: {}", path.display(), e);
        process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.to_config().context("Invalid options")?;

    let kube = KubeClient::try_default()
        .await
        .context("Failed to create cluster client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(kube.clone());
    let ctx = RequestContext::detached();

    let data = cluster
        .get_config_map(&ctx, DRA_NAMESPACE, CONFIG_MAP_NAME)
        .await
        .context("Cannot get config map for device config")?;
    let catalog = Catalog::from_config_map(data.as_ref())?;

    if args.dry_run {
        println!("{}", format_dry_run(&config, &catalog));
        return Ok(());
    }

    let secret = cluster
        .get_secret(&ctx, DRA_NAMESPACE, SECRET_NAME)
        .await
        .context("Cannot get identity secret")?;
    let identity = IdentitySecret::from_secret_data(secret.as_ref())?;

    // Token issuance goes through an unauthenticated copy of the client
    let base = CdiClient::new(&config, identity.certificate.as_deref())?;
    let source = IdentityTokenSource::new(Arc::new(base.clone()), cluster.clone());
    let credentials = Arc::new(CredentialCache::new(source));
    let cdi = Arc::new(base.with_credentials(credentials));

    let collaborators = Collaborators {
        cluster,
        inventory: cdi.clone(),
        policy: cdi,
        publisher: Arc::new(ResourceSlicePublisher::new(kube.client().clone())),
    };
    let engine = ReconciliationEngine::new(EngineOptions::from(&config), catalog, collaborators);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    info!(
        "Starting composable-dra: endpoint={}, tenant={}, cluster={}",
        config.cdi_endpoint, config.tenant_id, config.cluster_id
    );
    spawn_engine(engine, cancel)
        .await
        .context("Reconciliation engine task failed")??;

    info!("composable-dra stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
