use futures::StreamExt;
use mesh_pilot_core::{
    registry::ServiceInstance, ConfigObject, ConfigStoreCache, Controller, ServiceRegistry,
    StopSignal, Synced, SyncedTx,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

/// The configuration a single proxy needs: the merged objects of each watched
/// kind and the service instances hosted at the proxy's address.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProxySnapshot {
    pub version: u64,
    pub proxy: ProxyIdentity,
    pub configs: BTreeMap<String, Vec<Arc<ConfigObject>>>,
    pub instances: Vec<ServiceInstance>,
}

/// Describes the proxy a [`ConfigWatcher`] serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProxyIdentity {
    pub address: IpAddr,

    /// The proxy's workload, e.g. `kubernetes://<pod>.<namespace>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Inbound ports the proxy must not intercept.
    pub passthrough_ports: Vec<u16>,
}

/// Publishes a [`ProxySnapshot`] whenever the config cache or the service
/// registry changes.
///
/// Bursts of changes are debounced into a single snapshot. Each snapshot may
/// also be written to a file, replaced atomically, for a proxy agent to
/// reload.
pub struct ConfigWatcher {
    cache: Arc<dyn ConfigStoreCache>,
    registry: Arc<dyn ServiceRegistry>,
    proxy: ProxyIdentity,
    kinds: Vec<String>,
    debounce: Duration,
    output: Option<PathBuf>,
    tx: watch::Sender<Arc<ProxySnapshot>>,
    synced: SyncedTx,
}

// === impl ConfigWatcher ===

impl ConfigWatcher {
    pub fn new(
        cache: Arc<dyn ConfigStoreCache>,
        registry: Arc<dyn ServiceRegistry>,
        proxy: ProxyIdentity,
        kinds: impl IntoIterator<Item = impl ToString>,
        debounce: Duration,
    ) -> Self {
        let initial = ProxySnapshot {
            version: 0,
            proxy: proxy.clone(),
            configs: BTreeMap::new(),
            instances: vec![],
        };
        Self {
            cache,
            registry,
            proxy,
            kinds: kinds.into_iter().map(|k| k.to_string()).collect(),
            debounce,
            output: None,
            tx: watch::channel(Arc::new(initial)).0,
            synced: SyncedTx::default(),
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ProxySnapshot>> {
        self.tx.subscribe()
    }

    fn snapshot(&self) -> ProxySnapshot {
        let configs = self
            .kinds
            .iter()
            .map(|kind| (kind.clone(), self.cache.list(kind)))
            .collect();
        let instances = self
            .registry
            .host_instances(&HashSet::from([self.proxy.address]));
        ProxySnapshot {
            version: 0,
            proxy: self.proxy.clone(),
            configs,
            instances,
        }
    }

    /// Publishes a new snapshot if it differs from the last one.
    async fn publish(&self) {
        let mut next = self.snapshot();
        let prior = self.tx.borrow().clone();
        if prior.version > 0 && prior.configs == next.configs && prior.instances == next.instances {
            tracing::trace!(version = prior.version, "Snapshot unchanged");
            return;
        }
        next.version = prior.version + 1;
        let next = Arc::new(next);

        if let Some(path) = self.output.as_deref() {
            if let Err(error) = write(path, &next).await {
                tracing::warn!(path = %path.display(), %error, "Failed to write snapshot");
            }
        }
        tracing::debug!(
            version = next.version,
            instances = next.instances.len(),
            "Publishing snapshot"
        );
        self.tx.send_replace(next);
    }
}

#[async_trait::async_trait]
impl Controller for ConfigWatcher {
    async fn run(&self, stop: StopSignal) {
        let mut events = self.cache.subscribe();
        let mut revision = self.registry.revision();
        revision.mark_unchanged();

        self.publish().await;
        self.synced.mark();

        let shutdown = stop.signaled();
        tokio::pin!(shutdown);
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                release = &mut shutdown => {
                    drop(release);
                    return;
                }

                Some(_) = events.next() => {
                    deadline.get_or_insert_with(|| Instant::now() + self.debounce);
                }

                Ok(()) = revision.changed() => {
                    deadline.get_or_insert_with(|| Instant::now() + self.debounce);
                }

                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.publish().await;
                }
            }
        }
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

async fn write(path: &Path, snapshot: &ProxySnapshot) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Fixture;
    use mesh_pilot_core::ROUTE_RULE;

    const HOST: &str = "reviews.default.svc.cluster.local";
    const DEBOUNCE: Duration = Duration::from_millis(100);

    fn proxy(address: &str) -> ProxyIdentity {
        ProxyIdentity {
            address: address.parse().unwrap(),
            uid: None,
            passthrough_ports: vec![],
        }
    }

    fn watcher(fixture: &Arc<Fixture>) -> Arc<ConfigWatcher> {
        Arc::new(ConfigWatcher::new(
            fixture.clone(),
            fixture.clone(),
            proxy("10.0.0.1"),
            [ROUTE_RULE],
            DEBOUNCE,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn initial_snapshot_is_published_before_sync() {
        let fixture = Fixture::new();
        fixture.add_service(HOST, "10.0.0.1", "sa-reviews");
        fixture.add_service("ratings.default.svc.cluster.local", "10.0.0.2", "sa-ratings");
        fixture.add_rule("r1", 1);
        let watcher = watcher(&fixture);
        let snapshots = watcher.subscribe();

        let (signal, stop) = drain::channel();
        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run(stop).await }
        });
        watcher.synced().wait().await;

        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.configs[ROUTE_RULE].len(), 1);
        assert_eq!(snapshot.instances.len(), 1, "only local instances");
        assert_eq!(snapshot.instances[0].hostname, HOST);

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_debounced() {
        let fixture = Fixture::new();
        let watcher = watcher(&fixture);
        let mut snapshots = watcher.subscribe();

        let (signal, stop) = drain::channel();
        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run(stop).await }
        });
        watcher.synced().wait().await;
        snapshots.mark_unchanged();

        fixture.add_rule("r1", 1);
        fixture.add_rule("r2", 2);
        fixture.add_service(HOST, "10.0.0.1", "sa-reviews");
        tokio::time::sleep(DEBOUNCE / 2).await;
        assert!(!snapshots.has_changed().unwrap(), "still debouncing");

        tokio::time::sleep(DEBOUNCE).await;
        assert!(snapshots.has_changed().unwrap());
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.configs[ROUTE_RULE].len(), 2);
        assert_eq!(snapshot.instances.len(), 1);

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_snapshots_are_not_republished() {
        let fixture = Fixture::new();
        fixture.add_rule("r1", 1);
        let watcher = watcher(&fixture);
        watcher.publish().await;
        watcher.publish().await;
        assert_eq!(watcher.subscribe().borrow().version, 1);

        fixture.add_rule("r1", 2);
        watcher.publish().await;
        assert_eq!(watcher.subscribe().borrow().version, 2);
    }

    #[tokio::test]
    async fn snapshots_are_written_to_the_output() {
        let dir = std::env::temp_dir().join(format!("mesh-pilot-watcher-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("snapshot.json");

        let fixture = Fixture::new();
        fixture.add_rule("r1", 1);
        let identity = ProxyIdentity {
            uid: Some("kubernetes://reviews-v1.default".to_string()),
            passthrough_ports: vec![15000],
            ..proxy("10.0.0.9")
        };
        let watcher = ConfigWatcher::new(
            fixture.clone(),
            fixture.clone(),
            identity,
            [ROUTE_RULE],
            DEBOUNCE,
        )
        .with_output(&path);
        watcher.publish().await;

        let json: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["configs"][ROUTE_RULE][0]["name"], "r1");
        assert_eq!(json["proxy"]["uid"], "kubernetes://reviews-v1.default");
        assert_eq!(json["proxy"]["passthrough_ports"], serde_json::json!([15000]));
        assert!(!path.with_extension("tmp").exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
