//! Service catalog API server operator
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig or in-cluster config)
//! svcat-apiserver-operator
//!
//! # Run with leader election and verbose logs
//! RUST_LOG=debug svcat-apiserver-operator --leader-election
//! ```

use clap::Parser;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ObjectReference, Pod, Service, ServiceAccount};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use std::sync::Arc;
use svcat_apiserver_operator::cluster::{ClusterApi, KubeClusterApi};
use svcat_apiserver_operator::config::OperatorSettings;
use svcat_apiserver_operator::config_observation::{default_observers, Listers};
use svcat_apiserver_operator::convergence::ApiServerWorkload;
use svcat_apiserver_operator::events::{EventRecorder, KubeEventRecorder};
use svcat_apiserver_operator::leader_election::{self, LeaderElector};
use svcat_apiserver_operator::queue::{Enqueuer, WorkQueue};
use svcat_apiserver_operator::watch::{named_only, EventRouter};
use svcat_apiserver_operator::{
    ConfigObserverReconciler, Controller, FinalizerKey, FinalizerReconciler, Image, ObserverKey,
    ServiceCatalogAPIServer, WorkloadKey, WorkloadReconciler,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONTROLLER_NAME: &str = "svcat-apiserver-operator";

/// Service catalog API server operator
#[derive(Parser, Debug)]
#[command(name = "svcat-apiserver-operator")]
#[command(version, about = "Operator for the service catalog API server")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Worker count per controller; a single worker always runs
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    workers: usize,

    #[command(flatten)]
    settings: OperatorSettings,
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn operator_config_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(ServiceCatalogAPIServer::api_version(&()).to_string()),
        kind: Some(ServiceCatalogAPIServer::kind(&()).to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn named(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={}", name))
}

fn spawn_controller<R>(
    controller: Controller<R>,
    workers: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    R: svcat_apiserver_operator::Reconciler,
{
    tokio::spawn(async move {
        let name = controller.name();
        if let Err(e) = controller.run(workers, shutdown.clone()).await {
            error!(controller = name, error = %e, "Controller stopped");
            shutdown.cancel();
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let settings = args.settings;
    settings.validate()?;

    info!(
        target_namespace = %settings.target_namespace,
        operator_config = %settings.operator_config_name,
        leader_election = args.leader_election,
        "Starting service catalog API server operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &ns,
            leader_election::detect_identity(),
        ));
        elector.acquire(&shutdown).await?;
        let renewer = Arc::clone(&elector);
        let token = shutdown.clone();
        tokio::spawn(async move { renewer.keep_renewed(token).await });
        Some(elector)
    } else {
        None
    };

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let recorder: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(
        client.clone(),
        CONTROLLER_NAME,
        operator_config_reference(&settings.operator_config_name),
    ));
    let target_ns = settings.target_namespace.clone();

    // Workload controller
    let workload_queue = WorkQueue::new("WorkloadController");
    let mut workload_router = EventRouter::new(
        Enqueuer::new(Arc::clone(&workload_queue), WorkloadKey),
        shutdown.clone(),
    );
    workload_router.watch(
        Api::<ServiceCatalogAPIServer>::all(client.clone()),
        named(&settings.operator_config_name),
    );
    workload_router.watch(
        Api::<ConfigMap>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    workload_router.watch(
        Api::<ServiceAccount>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    workload_router.watch(
        Api::<Service>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    workload_router.watch(
        Api::<DaemonSet>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    for config_ns in &settings.config_namespaces {
        workload_router.watch(
            Api::<ConfigMap>::namespaced(client.clone(), config_ns),
            watcher::Config::default(),
        );
    }
    workload_router.watch_filtered(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
        named_only::<Namespace>(target_ns.clone()),
    );
    workload_router.watch(
        Api::<Image>::all(client.clone()),
        named(&settings.image_config_name),
    );
    let workload = Controller::new(
        WorkloadReconciler::new(
            settings.clone(),
            Arc::clone(&cluster),
            Arc::clone(&recorder),
            Arc::new(ApiServerWorkload::new(client.clone(), settings.clone())),
        ),
        workload_queue,
        settings.sync_rate,
        settings.sync_burst,
    )
    .with_cache_syncs(workload_router.cache_syncs())
    .with_cache_sync_timeout(settings.cache_sync_timeout());

    // Finalizer controller
    let finalizer_queue = WorkQueue::new("FinalizerController");
    let mut finalizer_router = EventRouter::new(
        Enqueuer::new(Arc::clone(&finalizer_queue), FinalizerKey),
        shutdown.clone(),
    );
    let pods = finalizer_router.watch(
        Api::<Pod>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    let daemonsets = finalizer_router.watch(
        Api::<DaemonSet>::namespaced(client.clone(), &target_ns),
        watcher::Config::default(),
    );
    let finalizer = Controller::new(
        FinalizerReconciler::new(
            target_ns.clone(),
            Arc::clone(&cluster),
            Arc::clone(&recorder),
            Arc::new(pods),
            Arc::new(daemonsets),
        ),
        finalizer_queue,
        settings.sync_rate,
        settings.sync_burst,
    )
    .with_cache_syncs(finalizer_router.cache_syncs())
    .with_cache_sync_timeout(settings.cache_sync_timeout())
    .with_initial_key(FinalizerKey);

    // Config observer
    let observer_queue = WorkQueue::new("ConfigObserver");
    let mut observer_router = EventRouter::new(
        Enqueuer::new(Arc::clone(&observer_queue), ObserverKey),
        shutdown.clone(),
    );
    observer_router.watch(
        Api::<ServiceCatalogAPIServer>::all(client.clone()),
        named(&settings.operator_config_name),
    );
    let images = observer_router.watch(
        Api::<Image>::all(client.clone()),
        named(&settings.image_config_name),
    );
    let listers = Listers {
        image_config: Arc::new(images),
        image_config_name: settings.image_config_name.clone(),
    };
    let observer = Controller::new(
        ConfigObserverReconciler::new(
            settings.operator_config_name.clone(),
            Arc::clone(&cluster),
            Arc::clone(&recorder),
            listers,
            default_observers(),
        ),
        observer_queue,
        settings.sync_rate,
        settings.sync_burst,
    )
    .with_cache_syncs(observer_router.cache_syncs())
    .with_cache_sync_timeout(settings.cache_sync_timeout());

    let handles = vec![
        spawn_controller(workload, args.workers, shutdown.clone()),
        spawn_controller(finalizer, args.workers, shutdown.clone()),
        spawn_controller(observer, args.workers, shutdown.clone()),
    ];

    shutdown.cancelled().await;
    info!("Shutting down controllers");
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Controller task failed");
        }
    }

    // release the lease so a standby replica can take over immediately
    if let Some(elector) = &elector {
        elector.release().await;
    }

    info!("Service catalog API server operator stopped");
    Ok(())
}
