use futures::StreamExt;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use mesh_pilot_core::{
    registry::{Service, ServiceInstance},
    ConfigObject, ConfigStoreCache, Controller, ServiceRegistry, StopSignal, Synced, SyncedTx,
};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::Serialize;
use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

/// Serves JSON snapshots of the merged configuration and the service
/// registry over HTTP/1.
///
/// - `GET /v1/registration` lists every service with its instances.
/// - `GET /v1/registration/{hostname}` describes one service, including the
///   identities of its workloads.
/// - `GET /v1/config/{kind}` lists the configuration objects of a kind.
pub struct DiscoveryServer {
    addr: SocketAddr,
    handler: Arc<Handler>,
    synced: SyncedTx,
}

#[derive(Clone, Debug, Default)]
pub struct DiscoveryMetrics {
    requests: Family<RequestLabels, Counter>,
    cache_hits: Counter,
    cache_misses: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    route: &'static str,
    status: u16,
}

struct Handler {
    cache: Arc<dyn ConfigStoreCache>,
    registry: Arc<dyn ServiceRegistry>,
    /// Rendered responses by path, when caching is enabled.
    responses: Option<Mutex<Responses>>,
    metrics: DiscoveryMetrics,
}

/// Rendered response bodies, valid for one generation of the cache and the
/// registry.
#[derive(Debug, Default)]
struct Responses {
    generation: u64,
    bodies: HashMap<String, Bytes>,
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Registration,
    Service(&'a str),
    Config(&'a str),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    service: Service,
    instances: Vec<ServiceInstance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_accounts: Option<Vec<String>>,
}

// === impl DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of discovery requests by route and status",
            requests.clone(),
        );

        let cache_hits = Counter::default();
        prom.register(
            "cache_hits",
            "Count of requests served from the response cache",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        prom.register(
            "cache_misses",
            "Count of cacheable requests that were rendered",
            cache_misses.clone(),
        );

        Self {
            requests,
            cache_hits,
            cache_misses,
        }
    }
}

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(
        addr: SocketAddr,
        cache: Arc<dyn ConfigStoreCache>,
        registry: Arc<dyn ServiceRegistry>,
        cache_responses: bool,
        metrics: DiscoveryMetrics,
    ) -> Self {
        Self {
            addr,
            handler: Arc::new(Handler {
                cache,
                registry,
                responses: cache_responses.then(Default::default),
                metrics,
            }),
            synced: SyncedTx::default(),
        }
    }
}

#[async_trait::async_trait]
impl Controller for DiscoveryServer {
    async fn run(&self, stop: StopSignal) {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(addr = %self.addr, %error, "Failed to bind discovery server");
                return;
            }
        };
        tracing::info!(addr = %self.addr, "Discovery server listening");
        self.synced.mark();

        let mut events = self.handler.cache.subscribe();
        let mut revision = self.handler.registry.revision();
        let shutdown = stop.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                release = &mut shutdown => {
                    drop(release);
                    return;
                }

                res = listener.accept() => {
                    let io = match res {
                        Ok((io, _)) => io,
                        Err(error) => {
                            tracing::warn!(%error, "Failed to accept connection");
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let svc = service_fn(move |req| {
                        let rsp = handler.handle(&req);
                        async move { Ok::<_, Infallible>(rsp) }
                    });
                    tokio::spawn(async move {
                        if let Err(error) = http1::Builder::new()
                            .serve_connection(TokioIo::new(io), svc)
                            .await
                        {
                            tracing::debug!(%error, "Connection failed");
                        }
                    });
                }

                Some(_) = events.next() => self.handler.invalidate(),

                Ok(()) = revision.changed() => self.handler.invalidate(),
            }
        }
    }

    fn synced(&self) -> Synced {
        self.synced.subscribe()
    }
}

// === impl Handler ===

impl Handler {
    fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        let Some(route) = Route::parse(path) else {
            return self.respond("unknown", StatusCode::NOT_FOUND, Bytes::new());
        };
        let name = route.name();
        if *req.method() != Method::GET {
            return self.respond(name, StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
        }

        let generation = match self.cached(path) {
            Some(Ok(body)) => return self.respond(name, StatusCode::OK, body),
            Some(Err(generation)) => Some(generation),
            None => None,
        };

        match self.render(&route) {
            Ok(Some(body)) => {
                let body = Bytes::from(body);
                if let Some(generation) = generation {
                    self.store(path, generation, body.clone());
                }
                self.respond(name, StatusCode::OK, body)
            }
            Ok(None) => self.respond(name, StatusCode::NOT_FOUND, Bytes::new()),
            Err(error) => {
                tracing::warn!(%path, %error, "Failed to render response");
                self.respond(name, StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
            }
        }
    }

    fn render(&self, route: &Route<'_>) -> serde_json::Result<Option<Vec<u8>>> {
        match *route {
            Route::Registration => {
                let registrations = self
                    .registry
                    .services()
                    .into_iter()
                    .map(|service| Registration {
                        instances: self.registry.instances(&service.hostname, &[], &[]),
                        service,
                        service_accounts: None,
                    })
                    .collect::<Vec<_>>();
                serde_json::to_vec(&registrations).map(Some)
            }
            Route::Service(hostname) => {
                let Some(service) = self.registry.get_service(hostname) else {
                    return Ok(None);
                };
                let registration = Registration {
                    instances: self.registry.instances(hostname, &[], &[]),
                    service_accounts: Some(self.registry.service_accounts(hostname, &[])),
                    service,
                };
                serde_json::to_vec(&registration).map(Some)
            }
            Route::Config(kind) => {
                let objects: Vec<Arc<ConfigObject>> = self.cache.list(kind);
                serde_json::to_vec(&objects).map(Some)
            }
        }
    }

    fn respond(&self, route: &'static str, status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
        self.metrics
            .requests
            .get_or_create(&RequestLabels {
                route,
                status: status.as_u16(),
            })
            .inc();
        let mut rsp = Response::new(Full::new(body));
        *rsp.status_mut() = status;
        if status == StatusCode::OK {
            rsp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        rsp
    }

    /// Looks up a cached body. A miss returns the generation the rendered
    /// body must be stored under. `None` when caching is disabled.
    fn cached(&self, path: &str) -> Option<Result<Bytes, u64>> {
        let responses = self.responses.as_ref()?.lock();
        match responses.bodies.get(path) {
            Some(body) => {
                self.metrics.cache_hits.inc();
                Some(Ok(body.clone()))
            }
            None => {
                self.metrics.cache_misses.inc();
                Some(Err(responses.generation))
            }
        }
    }

    /// Caches a body rendered during `generation`, unless a change has
    /// invalidated the cache since.
    fn store(&self, path: &str, generation: u64, body: Bytes) {
        let Some(responses) = self.responses.as_ref() else {
            return;
        };
        let mut responses = responses.lock();
        if responses.generation == generation {
            responses.bodies.insert(path.to_string(), body);
        }
    }

    fn invalidate(&self) {
        if let Some(responses) = self.responses.as_ref() {
            let mut responses = responses.lock();
            responses.generation += 1;
            responses.bodies.clear();
        }
    }
}

// === impl Route ===

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path == "/v1/registration" {
            return Some(Self::Registration);
        }
        if let Some(hostname) = path.strip_prefix("/v1/registration/") {
            return (!hostname.contains('/')).then_some(Self::Service(hostname));
        }
        let kind = path.strip_prefix("/v1/config/")?;
        (!kind.is_empty() && !kind.contains('/')).then_some(Self::Config(kind))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Service(_) => "service",
            Self::Config(_) => "config",
        }
    }
}
