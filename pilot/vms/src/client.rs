use http::{
    header::{ACCEPT, AUTHORIZATION},
    Request, StatusCode, Uri,
};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use mesh_pilot_core::registry::Labels;
use serde::{de::DeserializeOwned, Deserialize};
use std::net::IpAddr;

/// A workload registered with the VM registry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// The fully qualified hostname of the service the instance backs.
    pub service: String,
    #[serde(default)]
    pub service_address: Option<IpAddr>,
    pub service_port: u16,
    pub port_name: String,
    #[serde(default)]
    pub protocol: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub service_account: Option<String>,
}

/// A configuration object stored in the VM registry.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RuleRecord {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub spec: serde_json::Value,
}

/// Everything the registry knows at one point in time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub instances: Vec<InstanceRecord>,
    pub rules: Vec<RuleRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid registry URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("request failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response: {0}")]
    Body(#[from] hyper::Error),

    #[error("registry responded with {0}")]
    Status(StatusCode),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("registry did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

/// Fetches snapshots from a VM registry.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, Error>;
}

/// A registry reached over plain HTTP/1.
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    client: Client<HttpConnector, Empty<Bytes>>,
    base: String,
    token: Option<String>,
}

// === impl HttpRegistry ===

impl HttpRegistry {
    pub const INSTANCES_PATH: &'static str = "/api/v1/instances";
    pub const RULES_PATH: &'static str = "/api/v1/rules";

    /// Creates a client for the registry at `base`, e.g. `http://registry:8080`.
    pub fn new(base: &str, token: Option<String>) -> Result<Self, Error> {
        // Validate eagerly so that a bad flag fails at startup.
        base.parse::<Uri>()?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let uri = format!("{}{path}", self.base).parse::<Uri>()?;
        let mut req = Request::get(uri).header(ACCEPT, "application/json");
        if let Some(token) = self.token.as_deref() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let rsp = self.client.request(req.body(Empty::new())?).await?;
        if !rsp.status().is_success() {
            return Err(Error::Status(rsp.status()));
        }
        let body = rsp.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait::async_trait]
impl Registry for HttpRegistry {
    async fn fetch(&self) -> Result<Snapshot, Error> {
        let (instances, rules) =
            tokio::try_join!(self.get(Self::INSTANCES_PATH), self.get(Self::RULES_PATH))?;
        Ok(Snapshot { instances, rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::{server::conn::http1, service::service_fn, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;

    /// Serves canned registry responses, rejecting requests without the
    /// expected token.
    async fn serve(token: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (io, _) = listener.accept().await.unwrap();
                let svc = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let authorized = req
                        .headers()
                        .get(AUTHORIZATION)
                        .map(|v| v == format!("Bearer {token}").as_str())
                        .unwrap_or(false);
                    let (status, body) = match (authorized, req.uri().path()) {
                        (false, _) => (StatusCode::UNAUTHORIZED, String::new()),
                        (true, HttpRegistry::INSTANCES_PATH) => (
                            StatusCode::OK,
                            serde_json::json!([{
                                "service": "billing.vm.svc.cluster.local",
                                "servicePort": 80,
                                "portName": "http",
                                "address": "192.168.0.10",
                                "port": 8080,
                                "labels": { "zone": "a" },
                            }])
                            .to_string(),
                        ),
                        (true, HttpRegistry::RULES_PATH) => (
                            StatusCode::OK,
                            serde_json::json!([{
                                "kind": "route-rule",
                                "namespace": "vm",
                                "name": "billing",
                                "spec": { "precedence": 1 },
                            }])
                            .to_string(),
                        ),
                        (true, _) => (StatusCode::NOT_FOUND, String::new()),
                    };
                    let mut rsp = Response::new(Full::new(Bytes::from(body)));
                    *rsp.status_mut() = status;
                    Ok::<_, Infallible>(rsp)
                });
                tokio::spawn(http1::Builder::new().serve_connection(TokioIo::new(io), svc));
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn fetches_instances_and_rules() {
        let base = serve("s3cr3t").await;
        let registry = HttpRegistry::new(&base, Some("s3cr3t".to_string())).unwrap();
        let snapshot = registry.fetch().await.expect("fetch must succeed");

        assert_eq!(snapshot.instances.len(), 1);
        let inst = &snapshot.instances[0];
        assert_eq!(inst.service, "billing.vm.svc.cluster.local");
        assert_eq!(inst.address, "192.168.0.10".parse::<IpAddr>().unwrap());
        assert_eq!(inst.labels.get("zone").map(String::as_str), Some("a"));
        assert_eq!(inst.service_account, None);

        assert_eq!(snapshot.rules.len(), 1);
        assert_eq!(snapshot.rules[0].spec["precedence"], 1);
    }

    #[tokio::test]
    async fn rejected_requests_fail() {
        let base = serve("s3cr3t").await;
        let registry = HttpRegistry::new(&base, None).unwrap();
        match registry.fetch().await {
            Err(Error::Status(status)) => assert_eq!(status, StatusCode::UNAUTHORIZED),
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn invalid_base_is_rejected() {
        assert!(matches!(
            HttpRegistry::new("http://bad host", None),
            Err(Error::Uri(_))
        ));
    }
}
