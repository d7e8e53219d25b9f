use crate::{
    aggregate::{AggregateCache, CacheMetrics},
    core::{ConfigSource, ServiceRegistry, DESTINATION_POLICY, ROUTE_RULE},
    discovery::{DiscoveryMetrics, DiscoveryServer},
    index::{
        self, ClusterInfo, IndexMetrics, IngressSource, KubeConfigSource, KubeServiceRegistry,
        StatusSyncer,
    },
    k8s::{self, mesh::CONFIG_MAP_KEY, GoDuration, IngressMode, MeshConfig},
    vms::{HttpRegistry, PollConfig, VmRegistry},
    ConfigWatcher, Orchestrator, ProxyIdentity,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prometheus_client::registry::Registry;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tracing::{info, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "pilot", about = "A service mesh control plane", version)]
pub struct Args {
    #[clap(long, default_value = "mesh=info,warn", env = "PILOT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Where configuration and service data come from.
    #[clap(long, value_enum, default_value = "kubernetes")]
    adapter: Adapter,

    /// The namespace the pilot runs in.
    #[clap(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Restricts watches to a single namespace. All namespaces are watched
    /// when unset.
    #[clap(long)]
    watch_namespace: Option<String>,

    #[clap(long, default_value = "cluster.local")]
    domain_suffix: String,

    /// How often Kubernetes watches are restarted with a full listing.
    #[clap(long, default_value = "5m")]
    resync: GoDuration,

    /// The ConfigMap holding the mesh configuration.
    #[clap(long, default_value = "mesh")]
    mesh_config: String,

    /// Serves liveness, readiness and metrics.
    #[clap(long, default_value = "0.0.0.0:9093")]
    admin_addr: SocketAddr,

    /// How long each group of loops may take to complete its first sync.
    #[clap(long, default_value = "1m")]
    startup_timeout: GoDuration,

    /// How long loops may take to stop before they are aborted.
    #[clap(long, default_value = "10s")]
    shutdown_grace: GoDuration,

    /// The base URL of the VM registry.
    #[clap(long, env = "PILOT_VMS_URL")]
    vms_url: Option<String>,

    #[clap(long, env = "PILOT_VMS_TOKEN", hide_env_values = true)]
    vms_token: Option<String>,

    #[clap(long, default_value = "5s")]
    vms_poll: GoDuration,

    /// The number of change events buffered for each cache subscriber.
    #[clap(long, default_value_t = crate::aggregate::DEFAULT_SUBSCRIBER_CAPACITY)]
    subscriber_capacity: usize,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Adapter {
    Kubernetes,
    Vms,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves service registrations and configuration to proxies.
    Discovery {
        #[clap(long, default_value = "8080")]
        port: u16,

        /// Caches rendered responses until the next change.
        #[clap(long)]
        discovery_cache: bool,

        /// How often managed ingresses' statuses are reconciled.
        #[clap(long, default_value = "10s")]
        status_interval: GoDuration,

        /// Identifies this replica when electing the status writer.
        #[clap(long, env = "POD_NAME")]
        pod_name: Option<String>,
    },

    /// Watches the configuration of a single proxy.
    Sidecar {
        #[clap(long, env = "POD_IP")]
        pod_ip: IpAddr,

        /// Identifies the proxy's pod in the Kubernetes adapter.
        #[clap(long, env = "POD_NAME")]
        pod_name: Option<String>,

        /// Ports the proxy passes through untouched, such as health checks.
        #[clap(long, value_delimiter = ',')]
        passthrough: Vec<u16>,

        /// Writes each snapshot to this file.
        #[clap(long)]
        output: Option<PathBuf>,

        /// How long to wait for a burst of changes to settle.
        #[clap(long, default_value = "100ms")]
        debounce: GoDuration,
    },

    /// Prints the version and exits.
    Version,
}

struct Adapters {
    sources: Vec<Arc<dyn ConfigSource>>,
    registry: Arc<dyn ServiceRegistry>,
    kubernetes: Option<Kube>,
}

struct Kube {
    client: kube::Client,
    cluster: ClusterInfo,
    mesh: MeshConfig,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        if matches!(self.command, Command::Version) {
            println!("pilot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let Self {
            log_level,
            log_format,
            client,
            adapter,
            namespace,
            watch_namespace,
            domain_suffix,
            resync,
            mesh_config,
            admin_addr,
            startup_timeout,
            shutdown_grace,
            vms_url,
            vms_token,
            vms_poll,
            subscriber_capacity,
            command,
        } = self;

        log_format.try_init(log_level)?;

        let mut prom = <Registry>::default();
        let is_discovery = matches!(command, Command::Discovery { .. });
        let is_kubernetes = adapter == Adapter::Kubernetes;

        let Adapters {
            sources,
            registry,
            kubernetes,
        } = match adapter {
            Adapter::Kubernetes => {
                let client = kubert::client::ClientBuilder::from_args(client)
                    .with_metrics(kubert::client::ClientMetricsFamilies::register(
                        prom.sub_registry_with_prefix("kube"),
                    ))
                    .build()
                    .await?;
                index::crd::register(client.clone(), startup_timeout.into()).await?;
                let mesh = load_mesh_config(&client, &namespace, &mesh_config).await?;
                let cluster = ClusterInfo {
                    namespace: watch_namespace,
                    domain_suffix,
                    resync: resync.into(),
                };

                let metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
                let mut sources = vec![Arc::new(KubeConfigSource::new(
                    client.clone(),
                    cluster.clone(),
                    metrics.clone(),
                )) as Arc<dyn ConfigSource>];
                // Only discovery serves the rules derived from ingresses.
                if is_discovery {
                    sources.push(Arc::new(IngressSource::new(
                        client.clone(),
                        cluster.clone(),
                        &mesh,
                        metrics.clone(),
                    )));
                }
                let registry = Arc::new(KubeServiceRegistry::new(
                    client.clone(),
                    cluster.clone(),
                    metrics,
                ));
                Adapters {
                    sources,
                    registry,
                    kubernetes: Some(Kube {
                        client,
                        cluster,
                        mesh,
                    }),
                }
            }

            Adapter::Vms => {
                let Some(url) = vms_url else {
                    bail!("--vms-url is required by the vms adapter");
                };
                let poll = PollConfig {
                    interval: vms_poll.into(),
                    ..Default::default()
                };
                // The registry is both the sole config source and the service
                // registry.
                let vms = Arc::new(VmRegistry::new(HttpRegistry::new(&url, vms_token)?, poll));
                Adapters {
                    sources: vec![vms.clone() as Arc<dyn ConfigSource>],
                    registry: vms,
                    kubernetes: None,
                }
            }
        };
        info!(
            ?adapter,
            sources = sources.len(),
            "Adapters configured"
        );

        let cache = Arc::new(AggregateCache::new(
            sources,
            subscriber_capacity,
            CacheMetrics::register(prom.sub_registry_with_prefix("cache")),
        )?);
        cache.register_metrics(prom.sub_registry_with_prefix("cache"));

        let mut orchestrator = Orchestrator::new(startup_timeout.into(), shutdown_grace.into())
            .dependency("registry", Arc::new(registry.clone()))
            .dependency("config", cache.clone());

        match command {
            Command::Discovery {
                port,
                discovery_cache,
                status_interval,
                pod_name,
            } => {
                let server = DiscoveryServer::new(
                    SocketAddr::new([0, 0, 0, 0].into(), port),
                    cache.clone(),
                    registry.clone(),
                    discovery_cache,
                    DiscoveryMetrics::register(prom.sub_registry_with_prefix("discovery")),
                );
                orchestrator = orchestrator.consumer("discovery", Arc::new(server));

                if let Some(Kube {
                    client,
                    cluster,
                    mesh,
                }) = kubernetes
                {
                    if mesh.ingress_controller_mode != IngressMode::Off {
                        let hostname = match pod_name {
                            Some(name) => name,
                            None => std::env::var("HOSTNAME")
                                .context("either --pod-name or HOSTNAME must be set")?,
                        };
                        let lease = index::init_lease(client.clone(), &namespace, &hostname).await?;
                        let syncer = StatusSyncer::new(
                            client,
                            cluster,
                            mesh,
                            namespace,
                            hostname,
                            status_interval.into(),
                            lease,
                        );
                        orchestrator = orchestrator.consumer("ingress-status", Arc::new(syncer));
                    }
                }
            }

            Command::Sidecar {
                pod_ip,
                pod_name,
                passthrough,
                output,
                debounce,
            } => {
                let uid = pod_name
                    .filter(|_| is_kubernetes)
                    .map(|pod| format!("kubernetes://{pod}.{namespace}"));
                let proxy = ProxyIdentity {
                    address: pod_ip,
                    uid,
                    passthrough_ports: passthrough,
                };
                let mut watcher = ConfigWatcher::new(
                    cache.clone(),
                    registry.clone(),
                    proxy,
                    [ROUTE_RULE, DESTINATION_POLICY],
                    debounce.into(),
                );
                if let Some(path) = output {
                    watcher = watcher.with_output(path);
                }
                orchestrator = orchestrator.consumer("sidecar", Arc::new(watcher));
            }

            Command::Version => {}
        }

        let admin = kubert::AdminArgs { admin_addr }
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .with_context(|| format!("failed to bind admin server on {admin_addr}"))?;
        let ready = admin.readiness();
        let (shutdown, shutdown_rx) = kubert::shutdown::sigint_or_sigterm()?;
        let _admin = admin.spawn();

        let lifecycle = tokio::spawn(
            lifecycle(orchestrator, shutdown_rx, ready).instrument(tracing::info_span!("lifecycle")),
        );
        tokio::pin!(lifecycle);

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the loops to stop. A second signal aborts the wait.
        tokio::select! {
            res = shutdown.signaled() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = &mut lifecycle => return res?,
        }
        lifecycle.await?
    }
}

/// Starts the orchestrator's loops and, once the process is signaled, stops
/// them. Readiness is reported only while every loop is running.
async fn lifecycle(
    mut orchestrator: Orchestrator,
    shutdown: kubert::shutdown::Watch,
    ready: kubert::admin::Readiness,
) -> Result<()> {
    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    tokio::select! {
        res = orchestrator.start() => res?,
        release = &mut shutdown => {
            let res = orchestrator.shutdown().await;
            drop(release);
            return res.map_err(Into::into);
        }
    }

    ready.set(true);
    info!("Pilot running");

    let release = shutdown.await;
    ready.set(false);
    let res = orchestrator.shutdown().await;
    drop(release);
    res.map_err(Into::into)
}

/// Reads the mesh configuration from its ConfigMap, falling back to the
/// defaults when the ConfigMap or its key is absent.
async fn load_mesh_config(client: &kube::Client, ns: &str, name: &str) -> Result<MeshConfig> {
    let api = kube::Api::<k8s::ConfigMap>::namespaced(client.clone(), ns);
    let Some(cm) = api.get_opt(name).await? else {
        info!(%ns, %name, "Mesh ConfigMap not found; using defaults");
        return Ok(MeshConfig::default());
    };
    let Some(json) = cm.data.as_ref().and_then(|d| d.get(CONFIG_MAP_KEY)) else {
        info!(%ns, %name, key = CONFIG_MAP_KEY, "Mesh ConfigMap has no config; using defaults");
        return Ok(MeshConfig::default());
    };
    let mesh = MeshConfig::from_json(json)
        .with_context(|| format!("invalid mesh config in ConfigMap {ns}/{name}"))?;
    info!(mode = ?mesh.ingress_controller_mode, class = %mesh.ingress_class, "Loaded mesh config");
    Ok(mesh)
}
