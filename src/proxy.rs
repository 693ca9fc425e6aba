//! Compression/cache proxy
//!
//! Local reverse proxy placed between the tunnel and the application when
//! gzip is requested, so tunnel bandwidth carries compressed bodies.
//! Optionally tags responses as publicly cacheable and serves repeat GETs for
//! script assets from an in-process cache.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to start proxy server: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Host and port of the local application to front.
    pub target_host: String,
    /// Tag responses as cacheable and keep script assets in memory.
    pub cache: bool,
}

/// A running proxy. Dropping the server leaves the task running; call
/// [`ProxyServer::shutdown`] to stop it.
pub struct ProxyServer {
    pub host: String,
    handle: JoinHandle<()>,
}

impl ProxyServer {
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

struct CachedResponse {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    gzipped: Bytes,
}

struct ProxyState {
    target_host: String,
    cache_enabled: bool,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CachedResponse>>,
}

/// Start the proxy on an ephemeral local port, returning its host:port.
pub async fn start_server(options: ProxyOptions) -> Result<ProxyServer, ProxyError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let state = Arc::new(ProxyState {
        target_host: options.target_host,
        cache_enabled: options.cache,
        http: reqwest::Client::new(),
        cache: Mutex::new(HashMap::new()),
    });
    let app = Router::new().fallback(proxy_request).with_state(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(ProxyServer {
        host: format!("localhost:{}", port),
        handle,
    })
}

fn is_script_path(path: &str) -> bool {
    path.ends_with(".js")
}

fn gzip(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}

fn bad_gateway() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

fn build_response(
    status: StatusCode,
    content_type: Option<&HeaderValue>,
    cacheable: bool,
    gzipped: Bytes,
) -> Response {
    let mut response = Response::new(Body::from(gzipped));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type.clone());
    }
    if cacheable && status.is_success() {
        response.headers_mut().insert(
            CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=3600"),
        );
    }
    response
}

async fn proxy_request(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let cache_key = path_and_query.clone();
    let serve_from_cache =
        state.cache_enabled && method == Method::GET && is_script_path(uri.path());

    if serve_from_cache {
        let cache = state.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&cache_key) {
            return build_response(
                cached.status,
                cached.content_type.as_ref(),
                true,
                cached.gzipped.clone(),
            );
        }
    }

    let upstream_url = format!("http://{}{}", state.target_host, path_and_query);
    let mut forward = HeaderMap::new();
    for (name, value) in &headers {
        if name == HOST || name == CONNECTION {
            continue;
        }
        forward.append(name.clone(), value.clone());
    }
    forward.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    let request = state
        .http
        .request(method, &upstream_url)
        .headers(forward)
        .body(body);

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(_) => return bad_gateway(),
    };
    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    let upstream_body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => return bad_gateway(),
    };

    let Some(gzipped) = gzip(&upstream_body) else {
        return bad_gateway();
    };
    let gzipped = Bytes::from(gzipped);

    if serve_from_cache && status.is_success() {
        let mut cache = state.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            cache_key,
            CachedResponse {
                status,
                content_type: content_type.clone(),
                gzipped: gzipped.clone(),
            },
        );
    }

    build_response(status, content_type.as_ref(), state.cache_enabled, gzipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use httpmock::prelude::*;
    use std::io::Read;

    fn gunzip(bytes: &[u8]) -> String {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    }

    async fn get(url: &str) -> (reqwest::StatusCode, HeaderMap, Vec<u8>) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap().to_vec();
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_proxies_and_compresses_body() {
        let origin = MockServer::start_async().await;
        origin
            .mock_async(|when, then| {
                when.method(GET).path("/index.html");
                then.status(200)
                    .header("content-type", "text/html")
                    .body("<h1>hello</h1>");
            })
            .await;

        let server = start_server(ProxyOptions {
            target_host: origin.address().to_string(),
            cache: false,
        })
        .await
        .unwrap();

        let (status, headers, body) =
            get(&format!("http://{}/index.html", server.host)).await;
        assert_eq!(status, 200);
        assert_eq!(
            headers.get(CONTENT_ENCODING).map(|v| v.as_bytes()),
            Some(b"gzip".as_ref())
        );
        assert_eq!(gunzip(&body), "<h1>hello</h1>");
        assert_eq!(headers.get(CACHE_CONTROL), None);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_cache_serves_script_without_second_fetch() {
        let origin = MockServer::start_async().await;
        let script = origin
            .mock_async(|when, then| {
                when.method(GET).path("/app.js");
                then.status(200)
                    .header("content-type", "application/javascript")
                    .body("console.log(1);");
            })
            .await;

        let server = start_server(ProxyOptions {
            target_host: origin.address().to_string(),
            cache: true,
        })
        .await
        .unwrap();
        let url = format!("http://{}/app.js", server.host);

        let (_, headers, body) = get(&url).await;
        assert_eq!(
            headers.get(CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(b"public, max-age=3600".as_ref())
        );
        assert_eq!(gunzip(&body), "console.log(1);");

        let (_, _, again) = get(&url).await;
        assert_eq!(gunzip(&again), "console.log(1);");
        script.assert_calls_async(1).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_origin_yields_bad_gateway() {
        let server = start_server(ProxyOptions {
            target_host: "127.0.0.1:1".to_string(),
            cache: false,
        })
        .await
        .unwrap();
        let (status, _, _) = get(&format!("http://{}/", server.host)).await;
        assert_eq!(status, 502);
        server.shutdown();
    }
}
