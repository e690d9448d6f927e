use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use fleet_operator::config::{OperatorConfig, StoreBackend};
use fleet_operator::controller::{
    Context, DeploymentContext, OrchestrationSettings, ReconcileLoop, recover,
};
use fleet_operator::crd::{FleetCluster, FleetDeployment, FleetWorkspace};
use fleet_operator::health::{HealthState, run_health_server};
use fleet_operator::provision::{GitWorkdir, ScriptProvisioner};
use fleet_operator::resources::IngressSettings;
use fleet_operator::store::{
    Backup, BlobStore, FsBlobStore, KubeBackend, MemoryBackend, ObjectBackend, StoredObject,
    TokioClock, VersionedStore, restore_into, restore_latest, run_periodic_backup,
};

/// Lease configuration
const LEASE_NAME: &str = "fleet-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// How often the active job gauge is refreshed
const JOB_GAUGE_INTERVAL_SECS: u64 = 15;

/// Grace period for in-flight work to settle during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Kubernetes-backed when a client is available, in-process otherwise
fn backend<K: StoredObject>(
    client: &Option<Client>,
    api: impl FnOnce(Client) -> Api<K>,
) -> Arc<dyn ObjectBackend<K>> {
    match client {
        Some(client) => Arc::new(KubeBackend::new(api(client.clone()))),
        None => Arc::new(MemoryBackend::new()),
    }
}

/// Seed an in-memory store from its newest backup
async fn restore_store<K: StoredObject>(store: &VersionedStore<K>, blobs: &dyn BlobStore) {
    match restore_latest(blobs, store.kind()).await {
        Ok(Some(record)) => match restore_into(store, &record).await {
            Ok(restored) => info!(kind = store.kind(), restored, "Restored from backup"),
            Err(e) => error!(kind = store.kind(), error = %e, "Failed to restore from backup"),
        },
        Ok(None) => info!(kind = store.kind(), "No backup to restore"),
        Err(e) => error!(kind = store.kind(), error = %e, "Failed to read backups"),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let config = OperatorConfig::from_env()?;
    info!(
        namespace = %config.namespace,
        backend = ?config.store_backend,
        "Starting fleet-operator"
    );

    let health_state = Arc::new(HealthState::new());

    // Health checks answer even while waiting for leadership
    let health_handle = {
        let health_state = health_state.clone();
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let client = match config.store_backend {
        StoreBackend::Kube => {
            let client = Client::try_default().await?;
            info!("Connected to Kubernetes cluster");
            Some(client)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, changes since the last backup are lost on restart");
            None
        }
    };

    let lease_renewal_handle = match client {
        Some(ref client) => Some(acquire_leadership(client, &config.namespace).await),
        None => None,
    };

    let ns = config.namespace.clone();
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.backup_dir.clone()));

    let workspaces = VersionedStore::<FleetWorkspace>::start_with_backup(
        backend(&client, |c| Api::namespaced(c, &ns)),
        Some(blobs.clone()),
    )
    .await?;
    let clusters = VersionedStore::<FleetCluster>::start_with_backup(
        backend(&client, |c| Api::namespaced(c, &ns)),
        Some(blobs.clone()),
    )
    .await?;

    if client.is_none() {
        restore_store(&clusters, blobs.as_ref()).await;
        restore_store(&workspaces, blobs.as_ref()).await;
    }

    let provisioner = ScriptProvisioner::new(
        config.workdir.join("state"),
        config.provision_token.clone(),
    );
    let workdirs = GitWorkdir::new(
        config.template_repo.clone(),
        config.workdir.join("runs"),
        config.provision_token.clone(),
    );
    let ctx = Arc::new(Context::new(
        workspaces.clone(),
        clusters.clone(),
        Arc::new(provisioner),
        Arc::new(workdirs),
        OrchestrationSettings::from(&config),
        Some(health_state.clone()),
    ));

    let report = recover(&ctx).await;
    if report.failures > 0 {
        warn!(failures = report.failures, "Some interrupted work could not be restarted");
    }

    for (name, target) in [
        ("workspaces", workspaces.clone() as Arc<dyn Backup>),
        ("clusters", clusters.clone() as Arc<dyn Backup>),
    ] {
        tokio::spawn(run_periodic_backup(
            name.to_string(),
            target,
            config.backup_policy.clone(),
            Arc::new(TokioClock),
            Some(health_state.clone()),
        ));
    }

    let job_gauge_handle = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                ctx.record_active_jobs();
                tokio::time::sleep(Duration::from_secs(JOB_GAUGE_INTERVAL_SECS)).await;
            }
        })
    };

    let deployment_ctx = Arc::new(DeploymentContext {
        deployments: VersionedStore::<FleetDeployment>::start(backend(&client, |c| {
            Api::namespaced(c, &ns)
        }))
        .await?,
        services: VersionedStore::<Service>::start(backend(&client, |c| Api::namespaced(c, &ns)))
            .await?,
        workloads: VersionedStore::<Deployment>::start(backend(&client, |c| {
            Api::namespaced(c, &ns)
        }))
        .await?,
        ingresses: VersionedStore::<Ingress>::start(backend(&client, |c| Api::namespaced(c, &ns)))
            .await?,
        claims: VersionedStore::<PersistentVolumeClaim>::start(backend(&client, |c| {
            Api::namespaced(c, &ns)
        }))
        .await?,
        volumes: VersionedStore::<PersistentVolume>::start(backend(&client, Api::all)).await?,
        ingress: IngressSettings {
            root_domain: config.root_domain.clone(),
            certificate_arn: config.certificate_arn.clone(),
        },
        health_state: Some(health_state.clone()),
    });

    let reconcile_handle = tokio::spawn(ReconcileLoop::new(deployment_ctx).run());

    health_state.set_ready(true).await;
    info!("Operator is ready");

    let lease_future = async {
        match lease_renewal_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Lease renewal task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = reconcile_handle => {
            if let Err(e) = result {
                error!("Reconcile loop task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = job_gauge_handle => {
            if let Err(e) = result {
                error!("Job gauge task panicked: {}", e);
            }
        }
        // Renewal only exits via process::exit() or panic
        _ = lease_future => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;

            // Running jobs are not persisted; recovery replays them on the next start
            let running = ctx.workspace_worker.count_jobs() + ctx.cluster_worker.count_jobs();
            if running > 0 {
                warn!(running, "Shutting down with provisioning jobs in flight");
            }
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this instance holds the lease, then keep renewing it in the
/// background. Losing the lease exits the process so it re-enters election.
async fn acquire_leadership(client: &Client, namespace: &str) -> tokio::task::JoinHandle<()> {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    info!(holder_id = %holder_id, namespace, lease_name = LEASE_NAME, "Initializing leader election");

    let lock = lease_lock(client, namespace, &holder_id);
    info!("Waiting to acquire leadership...");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
