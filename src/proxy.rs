use crate::config::Config;
use crate::error::ProxyError;
use crate::exec::ShellExecutor;
use crate::fetch::{internal_url, FetchLimits, UpstreamFetcher};
use crate::landing::{serve_favicon, LandingPage};
use crate::resolver::{Clock, ContainerResolver, SystemClock};
use crate::response;
use crate::rewrite::{RewriteContext, Rewriter, PROXY_PATH_PREFIX};
use crate::runtime::ContainerRuntime;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Methods answered by the proxy; only GET and HEAD reach a container
const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

/// Maximum DNS hostname length
const MAX_HOSTNAME_LEN: usize = 253;

/// A logical `host:port` target named in a `/proxy/...` path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Downstream path with query, always starting with `/`
    pub path_and_query: String,
}

impl Target {
    /// Parse `/proxy/<host>:<port>[/<path>]`; anything else is not a target
    pub fn from_path(path: &str, query: Option<&str>) -> Option<Self> {
        let rest = path.strip_prefix(PROXY_PATH_PREFIX)?;
        let (host_port, remainder) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = host_port.rsplit_once(':')?;
        if !is_valid_hostname(host) || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let port: u16 = port.parse().ok()?;

        let path_and_query = match query {
            Some(q) => format!("{}?{}", remainder, q),
            None => remainder.to_string(),
        };

        Some(Self {
            host: host.to_string(),
            port,
            path_and_query,
        })
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path_and_query)
    }
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= MAX_HOSTNAME_LEN
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Everything needed to answer requests, shared by all connections
pub struct ProxyState {
    resolver: ContainerResolver,
    fetcher: UpstreamFetcher,
    rewriter: Rewriter,
    landing: LandingPage,
    request_timeout: Duration,
    fallback_origin: String,
}

impl ProxyState {
    pub fn new(config: &Config, shell: Arc<dyn ShellExecutor>) -> Self {
        Self::with_clock(config, shell, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, shell: Arc<dyn ShellExecutor>, clock: Arc<dyn Clock>) -> Self {
        let runtime = ContainerRuntime::new(
            shell,
            config.runtime.command.clone(),
            config.runtime.container_prefix.clone(),
            config.runtime.exec_timeout(),
        );
        let limits = FetchLimits {
            connect_timeout: Duration::from_secs(config.runtime.fetch_connect_timeout_secs),
            max_time: Duration::from_secs(config.runtime.fetch_max_time_secs),
        };

        Self {
            fetcher: UpstreamFetcher::new(&runtime, limits),
            rewriter: Rewriter::new(&config.runtime.container_prefix),
            landing: LandingPage::new(runtime.clone(), config.ports.clone()),
            resolver: ContainerResolver::with_clock(runtime, config.resolver.cache_ttl(), clock),
            request_timeout: config.server.request_timeout(),
            fallback_origin: format!("http://{}:{}", config.server.bind, config.server.port),
        }
    }

    /// Override the pipeline timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &ContainerResolver {
        &self.resolver
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Route one request. Always produces exactly one response.
    pub async fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

        let method = req.method();
        let mut response = if method == Method::OPTIONS {
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .expect("valid response with StatusCode enum")
        } else if method == Method::GET || method == Method::HEAD {
            self.route(req, &request_id).await
        } else {
            // Upstream fetches carry no request body
            debug!(method = %method, request_id = %request_id, "Rejecting method that cannot be proxied");
            let mut response = ProxyError::MethodNotAllowed(method.to_string()).to_response();
            response
                .headers_mut()
                .insert(hyper::header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
            response
        };

        let headers = response.headers_mut();
        apply_cors(headers);
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        response
    }

    async fn route<B>(&self, req: &Request<B>, request_id: &str) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        if path == "/favicon.ico" || path == "/favicon.svg" {
            return serve_favicon();
        }

        let Some(target) = Target::from_path(path, req.uri().query()) else {
            return self.landing.serve().await;
        };

        let origin = self.proxy_origin(req);
        let started = Instant::now();

        match tokio::time::timeout(self.request_timeout, self.proxy(&target, &origin)).await {
            Ok(Ok(response)) => {
                debug!(
                    upstream = %target,
                    request_id,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Proxied request"
                );
                response
            }
            Ok(Err(e)) => {
                warn!(upstream = %target, request_id, error = %e, "Proxy request failed");
                e.to_response()
            }
            Err(_) => {
                // The pipeline future is dropped here, which cancels any running command
                warn!(
                    upstream = %target,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs_f64(),
                    "Proxy request timed out"
                );
                ProxyError::Timeout(self.request_timeout).to_response()
            }
        }
    }

    /// Resolve, fetch, parse and rewrite one target
    async fn proxy(&self, target: &Target, origin: &str) -> Result<Response<Full<Bytes>>, ProxyError> {
        let host_port = target.host_port();

        let container = match self.resolver.resolve(&target.host).await {
            Some(container) => container,
            None => {
                return Err(match self.resolver.key_for(&target.host).cluster() {
                    Some(cluster) => ProxyError::ClusterNotRunning {
                        cluster: cluster.to_string(),
                    },
                    None => ProxyError::NoContainer { target: host_port },
                });
            }
        };

        let url = internal_url(&host_port, &target.path_and_query);
        let raw = self
            .fetcher
            .fetch(&container, &url)
            .await
            .map_err(|source| ProxyError::Fetch {
                container: container.clone(),
                source,
            })?;

        let upstream = response::parse(&raw);
        if !(200..600).contains(&upstream.status) {
            return Err(ProxyError::InvalidResponse(format!(
                "unexpected status {}",
                upstream.status
            )));
        }
        let status = StatusCode::from_u16(upstream.status)
            .map_err(|e| ProxyError::InvalidResponse(e.to_string()))?;

        let ctx = RewriteContext::new(origin, host_port);
        let headers = self.rewriter.forward_headers(&upstream, &ctx);
        let body = if upstream.is_html() {
            match self.rewriter.rewrite_body(&upstream.body, &ctx) {
                Cow::Borrowed(_) => upstream.body.clone(),
                Cow::Owned(rewritten) => Bytes::from(rewritten),
            }
        } else {
            upstream.body.clone()
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => debug!(header = %name, "Dropping invalid upstream header"),
            }
        }
        Ok(response)
    }

    /// External base URL of the proxy as seen by the browser
    fn proxy_origin<B>(&self, req: &Request<B>) -> String {
        req.headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| {
                !h.is_empty()
                    && h.len() <= MAX_HOSTNAME_LEN
                    && h.chars().all(|c| {
                        c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']')
                    })
            })
            .map(|h| format!("http://{}", h))
            .unwrap_or_else(|| self.fallback_origin.clone())
    }
}

fn apply_cors(headers: &mut hyper::HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
}

/// The HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ProxyState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(state.handle(&req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
