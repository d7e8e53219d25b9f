use mesh_pilot_core::{
    registry::{Catalog, Endpoint, Labels, Protocol, Service, ServiceInstance, ServicePort},
    store::Store,
    ConfigKey, ConfigObject, ConfigStoreCache, Controller, EventStream, ServiceAccounts,
    ServiceDiscovery, StopSignal, Synced, SyncedTx, ROUTE_RULE,
};
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::watch;

/// A loop whose sync and exit are controlled by the test.
#[derive(Default)]
pub(crate) struct TestLoop {
    synced: SyncedTx,
    started: AtomicBool,
    exit_early: bool,
    ignore_stop: bool,
}

impl TestLoop {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A loop that is synced as soon as it exists.
    pub(crate) fn ready() -> Arc<Self> {
        let ctl = Self::default();
        ctl.synced.mark();
        Arc::new(ctl)
    }

    /// A loop that returns immediately without syncing.
    pub(crate) fn exiting() -> Arc<Self> {
        Arc::new(Self {
            exit_early: true,
            ..Default::default()
        })
    }

    /// A loop that never returns, holding the stop signal.
    pub(crate) fn ignoring_stop() -> Arc<Self> {
        Arc::new(Self {
            ignore_stop: true,
            ..Default::default()
        })
    }

    pub(crate) fn sync(&self) {
        self.synced.mark();
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Controller for TestLoop {
    async fn run(&self, stop: StopSignal) {
        self.started.store(true, Ordering::SeqCst);
        if self.exit_early {
            return;
        }
        if self.ignore_stop {
            let _stop = stop;
            futures::future::pending::<()>().await;
        } else {
            drop(stop.signaled().await);
        }
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

/// A config cache and service registry backed by in-memory state.
#[derive(Default)]
pub(crate) struct Fixture {
    store: RwLock<Store>,
    catalog: RwLock<Catalog>,
}

impl Fixture {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add_service(&self, hostname: &str, addr: &str, service_account: &str) {
        let port = ServicePort {
            name: "http".to_string(),
            port: 9080,
            protocol: Protocol::Http,
        };
        let mut catalog = self.catalog.write();
        catalog.upsert_service(Service {
            hostname: hostname.to_string(),
            address: None,
            ports: vec![port.clone()],
            external_name: None,
        });
        catalog.set_instances(
            hostname,
            vec![ServiceInstance {
                endpoint: Endpoint {
                    address: addr.parse().expect("valid address"),
                    port: 8080,
                    service_port: port,
                },
                hostname: hostname.to_string(),
                labels: Labels::default(),
                service_account: Some(service_account.to_string()),
            }],
        );
    }

    pub(crate) fn add_rule(&self, name: &str, precedence: i32) {
        self.store.write().apply(ConfigObject::new(
            ConfigKey::new(ROUTE_RULE, "default", name),
            precedence,
            serde_json::json!({ "precedence": precedence }),
        ));
    }
}

#[async_trait::async_trait]
impl Controller for Fixture {
    async fn run(&self, stop: StopSignal) {
        drop(stop.signaled().await);
    }

    fn synced(&self) -> Synced {
        Synced::ready()
    }
}

impl ConfigStoreCache for Fixture {
    fn get(&self, key: &ConfigKey) -> Option<Arc<ConfigObject>> {
        self.store.read().get(key)
    }

    fn list(&self, kind: &str) -> Vec<Arc<ConfigObject>> {
        self.store.read().list(kind)
    }

    fn subscribe(&self) -> EventStream {
        self.store.read().subscribe()
    }
}

impl ServiceDiscovery for Fixture {
    fn services(&self) -> Vec<Service> {
        self.catalog.read().services()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.catalog.read().get_service(hostname)
    }

    fn instances(&self, hostname: &str, ports: &[&str], labels: &[Labels]) -> Vec<ServiceInstance> {
        self.catalog.read().instances(hostname, ports, labels)
    }

    fn host_instances(&self, addrs: &HashSet<IpAddr>) -> Vec<ServiceInstance> {
        self.catalog.read().host_instances(addrs)
    }

    fn revision(&self) -> watch::Receiver<u64> {
        self.catalog.read().subscribe()
    }
}

impl ServiceAccounts for Fixture {
    fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        self.catalog.read().service_accounts(hostname, ports)
    }
}
