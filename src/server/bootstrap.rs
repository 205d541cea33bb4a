use crate::config::{self, RouterConfig, StoreBackend};
use crate::etcd::EtcdClient;
use crate::metrics::Metrics;
use crate::server;
use crate::store::{self, HealthStateStore, KvStore};
use crate::upstream::{HealthProber, PoolRegistry};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. `None` keeps the config value.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Router lifecycle: init → discover → seed → probe → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut cfg = RouterConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        cfg.app.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        cfg.app.admin_listen = admin_listen;
    }

    // Phase 1: infrastructure.
    let etcd = if cfg.needs_etcd() {
        Some(EtcdClient::connect(&cfg.etcd).await?)
    } else {
        None
    };
    let store = Arc::new(build_health_store(&cfg, etcd.as_ref()));

    // Phase 2: backend list, static servers plus etcd discovery.
    if let (true, Some(client)) = (cfg.discovery.enabled, etcd.as_ref()) {
        match config::etcd::load_discovered_servers(client, &cfg.discovery).await {
            Ok(discovered) => {
                cfg.servers = config::etcd::merge_servers(&cfg.servers, discovered);
            }
            Err(e) => tracing::error!("etcd: discovery failed, using static servers, error={}", e),
        }
    }

    // Phase 3: pools, seeded with whatever the store already knows.
    let registry = Arc::new(PoolRegistry::from_servers(&cfg.servers, store.clone())?);
    let seeded = registry.seed_from_store().await;
    tracing::info!(
        "upstream: registry built, pools={}, backends={}, seeded={}",
        registry.pools().count(),
        registry.backend_count(),
        seeded
    );

    let metrics = match Metrics::install() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::error!("metrics: recorder install failed, error={}", e);
            None
        }
    };

    let shutdown = CancellationToken::new();

    // Phase 4: background probing.
    if cfg.health_check.enabled {
        let prober = HealthProber::new(registry.clone(), &cfg.health_check)?;
        tokio::spawn(prober.run(shutdown.child_token()));
    } else {
        tracing::info!("health: prober disabled");
    }

    // Phase 5: admin and proxy servers.
    let listen = cfg.app.listen.clone();
    let admin_listen = cfg.app.admin_listen.clone();
    let state = server::RouterState::new(cfg, registry, metrics)?;

    tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.child_token();
        async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state, shutdown).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        }
    });

    tracing::info!("server: starting router, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.child_token();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });
    state.set_ready(true);

    // Phase 6: block until signal, then drain.
    wait_for_shutdown().await;
    state.set_ready(false);
    shutdown.cancel();

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn build_health_store(cfg: &RouterConfig, etcd: Option<&EtcdClient>) -> HealthStateStore {
    let kv: Arc<dyn KvStore> = match (cfg.health_store.backend, etcd) {
        (StoreBackend::Etcd, Some(client)) => Arc::new(store::EtcdKvStore::new(client.clone())),
        _ => Arc::new(store::MemoryKvStore::new()),
    };
    let store = HealthStateStore::new(kv, &cfg.health_store, store::generate_instance_id());
    tracing::info!(
        "store: health store ready, backend={}, reporter={}",
        store.backend_kind(),
        store.reporter()
    );
    store
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer thread must outlive `run`.
    std::mem::forget(guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: SIGTERM handler install failed, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
