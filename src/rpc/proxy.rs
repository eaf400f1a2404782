use std::{
    error::Error,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::{header, Body, Method, Request, Response};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::debug;

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The bundler's own method surface, lowercase to canonical casing.
/// Everything not listed here is proxied verbatim to the upstream node.
const BUNDLER_METHODS: &[(&str, &str)] = &[
    ("eth_senduseroperation", "eth_sendUserOperation"),
    ("eth_estimateuseroperationgas", "eth_estimateUserOperationGas"),
    ("eth_getuseroperationreceipt", "eth_getUserOperationReceipt"),
    ("eth_getuseroperationbyhash", "eth_getUserOperationByHash"),
    ("eth_supportedentrypoints", "eth_supportedEntryPoints"),
    ("eth_chainid", "eth_chainId"),
    ("debug_bundler_clearstate", "debug_bundler_clearState"),
    ("debug_bundler_dumpmempool", "debug_bundler_dumpMempool"),
    ("debug_bundler_sendbundlenow", "debug_bundler_sendBundleNow"),
    ("debug_bundler_setbundlingmode", "debug_bundler_setBundlingMode"),
    ("debug_bundler_setreputation", "debug_bundler_setReputation"),
    ("debug_bundler_dumpreputation", "debug_bundler_dumpReputation"),
    ("system_health", "system_health"),
];

fn canonical_bundler_method(method: &str) -> Option<&'static str> {
    let lowered = method.to_lowercase();
    BUNDLER_METHODS
        .iter()
        .find(|(lower, _)| *lower == lowered)
        .map(|(_, canonical)| *canonical)
}

/// Tower layer in front of the JSON-RPC server that inspects each request's
/// method: bundler methods are normalized to their canonical casing and
/// dispatched locally, anything else is forwarded to the upstream node.
#[derive(Clone)]
pub struct MethodProxyLayer {
    upstream_url: String,
    client: reqwest::Client,
}

impl MethodProxyLayer {
    pub fn new(upstream_url: String) -> Self {
        Self {
            upstream_url,
            client: reqwest::Client::new(),
        }
    }
}

impl<S> Layer<S> for MethodProxyLayer {
    type Service = MethodProxy<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MethodProxy {
            inner,
            upstream_url: self.upstream_url.clone(),
            client: self.client.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MethodProxy<S> {
    inner: S,
    upstream_url: String,
    client: reqwest::Client,
}

impl<S> Service<Request<Body>> for MethodProxy<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + 'static,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let client = self.client.clone();
        let upstream_url = self.upstream_url.clone();

        Box::pin(async move {
            // Non-POST requests (e.g. the GET /health rewrite target) go
            // straight through.
            if req.method() != Method::POST {
                return inner.call(req).await.map_err(Into::into);
            }

            let (parts, body) = req.into_parts();
            let bytes = hyper::body::to_bytes(body).await?;

            let Ok(mut envelope) = serde_json::from_slice::<Value>(&bytes) else {
                // Unparseable body: the RPC server answers with -32700.
                let req = Request::from_parts(parts, Body::from(bytes));
                return inner.call(req).await.map_err(Into::into);
            };
            let method = envelope
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string);

            let Some(method) = method else {
                // Batches and envelopes without a method are not proxied.
                let req = Request::from_parts(parts, Body::from(bytes));
                return inner.call(req).await.map_err(Into::into);
            };

            if let Some(canonical) = canonical_bundler_method(&method) {
                envelope["method"] = Value::String(canonical.to_string());
                let rewritten = serde_json::to_vec(&envelope)?;
                let mut req = Request::from_parts(parts, Body::from(rewritten));
                req.headers_mut().remove(header::CONTENT_LENGTH);
                return inner.call(req).await.map_err(Into::into);
            }

            // Unknown bundler-namespace methods are answered locally with
            // method-not-found instead of leaking to the node.
            if method.to_lowercase().starts_with("debug_bundler_") {
                let req = Request::from_parts(parts, Body::from(bytes));
                return inner.call(req).await.map_err(Into::into);
            }

            debug!("Proxying {method} to upstream node");
            let id = envelope.get("id").cloned().unwrap_or(Value::Null);
            match forward_upstream(&client, &upstream_url, bytes.to_vec()).await {
                Ok(upstream_body) => json_response(upstream_body),
                Err(error) => {
                    debug!("Upstream request for {method} failed: {error}");
                    let body = serde_json::to_vec(&serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32603,
                            "message": format!("upstream request failed: {error}"),
                        },
                    }))?;
                    json_response(body)
                }
            }
        })
    }
}

async fn forward_upstream(
    client: &reqwest::Client,
    url: &str,
    body: Vec<u8>,
) -> Result<Vec<u8>, reqwest::Error> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    Ok(response.bytes().await?.to_vec())
}

fn json_response(body: Vec<u8>) -> Result<Response<Body>, BoxError> {
    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(Into::into)
}
