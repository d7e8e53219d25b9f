use crate::client::{Error as ClientError, InstanceRecord, Registry, RuleRecord, Snapshot};
use mesh_pilot_core::{
    registry::{Catalog, Endpoint, Labels, Protocol, Service, ServiceInstance, ServicePort},
    store::Store,
    ConfigKey, ConfigObject, ConfigSource, Controller, Error, EventStream, ServiceAccounts,
    ServiceDiscovery, StopSignal, Synced, SyncedTx,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashSet},
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time};

#[derive(Clone, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// The longest delay between failed polls.
    pub max_backoff: Duration,
}

/// Mirrors a VM registry, both as a configuration source and as a service
/// registry.
///
/// Each successful poll replaces the mirrored state; changes are published as
/// the difference from the previous poll. Failed polls keep the last
/// snapshot and are retried with exponential backoff.
pub struct VmRegistry<R = crate::HttpRegistry> {
    registry: R,
    config: PollConfig,
    state: RwLock<State>,
    synced: SyncedTx,
    running: AtomicBool,
}

#[derive(Default)]
struct State {
    store: Store,
    catalog: Catalog,
}

// === impl PollConfig ===

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    /// The delay after `failures` consecutive failed polls.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// === impl VmRegistry ===

impl<R: Registry> VmRegistry<R> {
    pub const NAME: &'static str = "vms";

    pub fn new(registry: R, config: PollConfig) -> Self {
        Self {
            registry,
            config,
            state: RwLock::new(State::default()),
            synced: SyncedTx::default(),
            running: AtomicBool::new(false),
        }
    }

    async fn poll(&self) -> Result<usize, ClientError> {
        let snapshot = time::timeout(self.config.timeout, self.registry.fetch())
            .await
            .map_err(|_| ClientError::Timeout(self.config.timeout))??;
        let changes = self.state.write().apply(snapshot);
        Ok(changes)
    }
}

#[async_trait::async_trait]
impl<R: Registry> Controller for VmRegistry<R> {
    async fn run(&self, stop: StopSignal) {
        // The same mirror may be shared as a config source and a service
        // registry; only the first run polls.
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!("Already running");
            drop(stop.signaled().await);
            return;
        }

        let shutdown = stop.signaled();
        tokio::pin!(shutdown);

        let mut failures = 0u32;
        loop {
            let delay = tokio::select! {
                release = &mut shutdown => {
                    drop(release);
                    return;
                }

                res = self.poll() => match res {
                    Ok(changes) => {
                        if failures > 0 {
                            tracing::info!("Registry recovered");
                        }
                        failures = 0;
                        if self.synced.mark() {
                            tracing::info!("Synced");
                        }
                        tracing::debug!(changes, "Polled");
                        self.config.interval
                    }
                    Err(error) => {
                        failures = failures.saturating_add(1);
                        let backoff = self.config.backoff(failures);
                        tracing::warn!(%error, failures, ?backoff, "Failed to poll registry");
                        backoff
                    }
                },
            };

            tokio::select! {
                release = &mut shutdown => {
                    drop(release);
                    return;
                }
                () = time::sleep(delay) => {}
            }
        }
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

impl<R: Registry> ConfigSource for VmRegistry<R> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn list(&self, kind: &str) -> Result<Vec<Arc<ConfigObject>>, Error> {
        if !self.synced.is_synced() {
            return Err(Error::unavailable(Self::NAME, "registry has not been polled yet"));
        }
        Ok(self.state.read().store.list(kind))
    }

    fn kinds(&self) -> Vec<String> {
        self.state.read().store.kinds()
    }

    fn subscribe(&self) -> EventStream {
        self.state.read().store.subscribe()
    }
}

impl<R: Registry> ServiceDiscovery for VmRegistry<R> {
    fn services(&self) -> Vec<Service> {
        self.state.read().catalog.services()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.state.read().catalog.get_service(hostname)
    }

    fn instances(&self, hostname: &str, ports: &[&str], labels: &[Labels]) -> Vec<ServiceInstance> {
        self.state.read().catalog.instances(hostname, ports, labels)
    }

    fn host_instances(&self, addrs: &HashSet<IpAddr>) -> Vec<ServiceInstance> {
        self.state.read().catalog.host_instances(addrs)
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.state.read().catalog.subscribe()
    }
}

impl<R: Registry> ServiceAccounts for VmRegistry<R> {
    fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        self.state.read().catalog.service_accounts(hostname, ports)
    }
}

// === impl State ===

impl State {
    /// Replaces the mirrored state, returning the number of config changes.
    fn apply(&mut self, Snapshot { instances, rules }: Snapshot) -> usize {
        let objects = rules.iter().map(to_object).collect::<Vec<_>>();
        let changes = self.store.replace(|_| true, objects);

        let services = to_services(&instances);
        self.catalog
            .replace(services, instances.iter().map(to_instance));
        changes
    }
}

fn to_object(rule: &RuleRecord) -> ConfigObject {
    ConfigObject::new(
        ConfigKey::new(&rule.kind, &rule.namespace, &rule.name),
        revision(&rule.spec),
        rule.spec.clone(),
    )
}

/// The registry does not version its rules, so the revision is derived from
/// the content.
fn revision(spec: &serde_json::Value) -> String {
    let mut hasher = ahash::AHasher::default();
    spec.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn to_instance(rec: &InstanceRecord) -> ServiceInstance {
    let protocol = Protocol::from_port_name(rec.protocol.as_deref().unwrap_or(&rec.port_name));
    ServiceInstance {
        endpoint: Endpoint {
            address: rec.address,
            port: rec.port,
            service_port: ServicePort {
                name: rec.port_name.clone(),
                port: rec.service_port,
                protocol,
            },
        },
        hostname: rec.service.clone(),
        labels: rec.labels.clone(),
        service_account: rec.service_account.clone(),
    }
}

/// Derives one service per hostname from the ports its instances expose.
fn to_services(records: &[InstanceRecord]) -> Vec<Service> {
    let mut services = BTreeMap::<&str, Service>::new();
    for rec in records {
        let svc = services.entry(rec.service.as_str()).or_insert_with(|| Service {
            hostname: rec.service.clone(),
            address: None,
            ports: vec![],
            external_name: None,
        });
        svc.address = svc.address.or(rec.service_address);
        let port = to_instance(rec).endpoint.service_port;
        if !svc.ports.contains(&port) {
            svc.ports.push(port);
        }
    }
    services
        .into_values()
        .map(|mut svc| {
            svc.ports.sort_by_key(|p| p.port);
            svc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use http::StatusCode;
    use mesh_pilot_core::ChangeEvent;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    /// Replays scripted poll results; `None` fails the poll. Once the script
    /// is exhausted every poll fails.
    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<Option<Snapshot>>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Registry for Arc<Script> {
        async fn fetch(&self) -> Result<Snapshot, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.steps
                .lock()
                .pop_front()
                .flatten()
                .ok_or(ClientError::Status(StatusCode::SERVICE_UNAVAILABLE))
        }
    }

    fn script(steps: impl IntoIterator<Item = Option<Snapshot>>) -> Arc<Script> {
        Arc::new(Script {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn rule(name: &str, precedence: i32) -> RuleRecord {
        RuleRecord {
            kind: "route-rule".to_string(),
            namespace: "vm".to_string(),
            name: name.to_string(),
            spec: json!({ "precedence": precedence }),
        }
    }

    fn instance(addr: &str, port_name: &str, service_port: u16, sa: &str) -> InstanceRecord {
        InstanceRecord {
            service: "billing.vm.svc.cluster.local".to_string(),
            service_address: Some("10.200.0.1".parse().unwrap()),
            service_port,
            port_name: port_name.to_string(),
            protocol: None,
            address: addr.parse().unwrap(),
            port: 8000 + service_port,
            labels: Labels::default(),
            service_account: Some(sa.to_string()),
        }
    }

    fn snapshot(rules: Vec<RuleRecord>, instances: Vec<InstanceRecord>) -> Option<Snapshot> {
        Some(Snapshot { instances, rules })
    }

    fn config() -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    fn key(name: &str) -> ConfigKey {
        ConfigKey::new("route-rule", "vm", name)
    }

    fn drain_events(events: &mut EventStream) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| events.next().now_or_never().flatten()).collect()
    }

    fn start(vms: &Arc<VmRegistry<Arc<Script>>>) -> (drain::Signal, tokio::task::JoinHandle<()>) {
        let (signal, stop) = drain::channel();
        let task = tokio::spawn({
            let vms = vms.clone();
            async move { vms.run(stop).await }
        });
        (signal, task)
    }

    #[test]
    fn backoff_doubles_up_to_the_limit() {
        let config = config();
        assert_eq!(config.backoff(1), Duration::from_secs(5));
        assert_eq!(config.backoff(2), Duration::from_secs(10));
        assert_eq!(config.backoff(3), Duration::from_secs(20));
        assert_eq!(config.backoff(4), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn unpolled_registry_is_unavailable() {
        let vms = VmRegistry::new(script([]), config());
        assert!(matches!(
            vms.list("route-rule"),
            Err(Error::SourceUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_publish_differences() {
        let registry = script([
            snapshot(vec![rule("a", 1), rule("b", 1)], vec![]),
            snapshot(vec![rule("a", 2), rule("c", 1)], vec![]),
        ]);
        let vms = Arc::new(VmRegistry::new(registry, config()));
        let mut events = vms.subscribe();
        let (signal, task) = start(&vms);

        vms.synced().wait().await;
        let listed = vms.list("route-rule").unwrap();
        assert_eq!(listed.iter().map(|o| o.key.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        time::sleep(Duration::from_secs(6)).await;
        let evs = drain_events(&mut events);
        let summary = evs
            .iter()
            .map(|ev| match ev {
                ChangeEvent::Added(o) => format!("+{}", o.key.name),
                ChangeEvent::Updated(o) => format!("~{}", o.key.name),
                ChangeEvent::Deleted(k) => format!("-{}", k.name),
            })
            .collect::<Vec<_>>();
        assert_eq!(summary, ["+a", "+b", "~a", "+c", "-b"]);
        assert_eq!(vms.state.read().store.get(&key("a")).unwrap().spec["precedence"], 2);

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_polls_keep_the_last_snapshot() {
        let registry = script([
            snapshot(vec![rule("a", 1)], vec![instance("192.168.0.1", "http", 80, "vm-a")]),
            None,
            None,
            snapshot(vec![], vec![]),
        ]);
        let vms = Arc::new(VmRegistry::new(registry.clone(), config()));
        let (signal, task) = start(&vms);
        vms.synced().wait().await;

        // Polls at 5s and 10s fail; the next is delayed until 20s.
        time::sleep(Duration::from_secs(19)).await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
        assert_eq!(vms.list("route-rule").unwrap().len(), 1);
        assert_eq!(vms.services().len(), 1);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 4);
        assert!(vms.list("route-rule").unwrap().is_empty());
        assert!(vms.services().is_empty());

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn instances_form_services() {
        let registry = script([snapshot(
            vec![],
            vec![
                instance("192.168.0.1", "grpc", 90, "vm-b"),
                instance("192.168.0.1", "http", 80, "vm-a"),
                instance("192.168.0.2", "http", 80, "vm-b"),
            ],
        )]);
        let vms = Arc::new(VmRegistry::new(registry, config()));
        let revision = vms.revision();
        let (signal, task) = start(&vms);
        vms.synced().wait().await;

        assert_eq!(*revision.borrow(), 1);
        let svc = vms
            .get_service("billing.vm.svc.cluster.local")
            .expect("service must exist");
        assert_eq!(svc.address, Some("10.200.0.1".parse().unwrap()));
        assert_eq!(
            svc.ports.iter().map(|p| (p.port, p.protocol)).collect::<Vec<_>>(),
            [(80, Protocol::Http), (90, Protocol::Grpc)]
        );
        assert_eq!(
            vms.service_accounts("billing.vm.svc.cluster.local", &["http"]),
            ["vm-a", "vm-b"]
        );
        let addrs = ["192.168.0.1".parse().unwrap()].into_iter().collect();
        assert_eq!(vms.host_instances(&addrs).len(), 2);

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_run_polls() {
        let registry = script([snapshot(vec![], vec![])]);
        let vms = Arc::new(VmRegistry::new(registry.clone(), config()));
        let (signal, stop) = drain::channel();
        let first = tokio::spawn({
            let (vms, stop) = (vms.clone(), stop.clone());
            async move { vms.run(stop).await }
        });
        let second = tokio::spawn({
            let vms = vms.clone();
            async move { vms.run(stop).await }
        });
        vms.synced().wait().await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);

        signal.drain().await;
        first.await.unwrap();
        second.await.unwrap();
    }
}
