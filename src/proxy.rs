//! Proxy server implementation
//! An http->https upgrade listener, a TLS-terminating listener with
//! SNI certificate selection, and the per-request dispatcher

use crate::certs::CertStore;
use crate::headers::DecoratorChain;
use crate::routes::{Outcome, RouteTable};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    routes: Arc<RouteTable>,
    certs: Arc<CertStore>,
    decorators: DecoratorChain,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, routes: Arc<RouteTable>, certs: Arc<CertStore>) -> Self {
        Self {
            config,
            routes,
            certs,
            decorators: DecoratorChain::standard(),
        }
    }

    /// Start both listeners and serve until one of them fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;
        let https_addr: SocketAddr = format!("0.0.0.0:{}", self.config.https_port).parse()?;

        info!(
            "Proxy server starting on HTTP:{} / HTTPS:{}",
            self.config.http_port, self.config.https_port
        );

        let redirector = tokio::spawn(Self::run_redirect_server(http_addr));
        let dispatcher = tokio::spawn(self.run_tls_server(https_addr));

        let (redirector, dispatcher) = tokio::try_join!(redirector, dispatcher)?;
        redirector?;
        dispatcher?;
        Ok(())
    }

    /// Run the insecure listener. Every request is answered with a 301 to
    /// the secure equivalent of the same host and path; no routing happens
    /// here.
    async fn run_redirect_server(addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP upgrade listener on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(Self::upgrade_redirect);

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Answer one insecure request with its https equivalent, host header
    /// kept verbatim
    async fn upgrade_redirect(req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        let host = req.headers().get(HOST).and_then(|h| h.to_str().ok());

        let response = match host {
            Some(host) => {
                let path = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                Self::redirect_response(&format!("https://{}{}", host, path))
            }
            None => Self::error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        Ok(response)
    }

    /// Run the TLS-terminating listener. Certificates are selected per
    /// connection from the store by the requested server name.
    async fn run_tls_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.certs.clone());
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(addr).await?;
        info!("HTTPS listener on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = self.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", remote_addr, e);
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.dispatch(req, remote_addr).await }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(io, service)
                    .await
                {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle one secure request end to end
    async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let mut response = match self.process_request(req, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request error: {}", e);
                Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };

        // Every outcome carries the marker header and corrected redirects
        self.decorators.apply(response.headers_mut());

        Ok(response)
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let host = match host_without_port(req.headers()) {
            Some(h) => h,
            None => {
                return Ok(Self::error_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Host header",
                ))
            }
        };
        let path = req.uri().path().to_string();

        debug!("{} {}{} from {}", req.method(), host, path, remote_addr);

        match self.routes.resolve(&host, &path) {
            Outcome::Redirect(mut target) => {
                // The redirect keeps the original query string as well
                if let Some(query) = req.uri().query() {
                    target.push('?');
                    target.push_str(query);
                }
                Ok(Self::redirect_response(&target))
            }
            Outcome::Forward(backend) => Ok(Self::forward_request(req, backend, remote_addr).await),
            Outcome::NotFound => Ok(Self::error_response(StatusCode::NOT_FOUND, "No such url!")),
        }
    }

    /// Relay the request to a backend. Forward failures are logged and
    /// surfaced as 502; they never take the proxy down.
    async fn forward_request(
        req: Request<Incoming>,
        backend: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        match Self::try_forward(req, backend, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                error!("Forward to {} failed: {}", backend, e);
                Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn try_forward(
        req: Request<Incoming>,
        backend: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let stream = TcpStream::connect(backend)
            .await
            .with_context(|| format!("failed to connect to backend {}", backend))?;

        let (parts, body) = req.into_parts();

        let body_bytes = body
            .collect()
            .await
            .context("failed to read request body")?
            .to_bytes();

        let uri: Uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .context("invalid request URI")?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11);

        // Copy headers
        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }

        // The backend sees the original host plus forwarding headers
        builder = builder.header(HOST, &original_host);
        builder = builder.header("X-Forwarded-For", remote_addr.ip().to_string());
        builder = builder.header("X-Forwarded-Host", &original_host);
        builder = builder.header("X-Forwarded-Proto", "https");

        let proxy_req = builder
            .body(Full::new(body_bytes))
            .context("failed to build proxy request")?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("failed to establish connection to backend")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let response = sender
            .send_request(proxy_req)
            .await
            .context("failed to send request to backend")?;

        let (parts, body) = response.into_parts();

        let body_bytes = body
            .collect()
            .await
            .context("failed to read backend response")?
            .to_bytes();

        let mut builder = Response::builder().status(parts.status);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        builder
            .body(Self::full_body(body_bytes))
            .map_err(|e| anyhow!("failed to build response: {}", e))
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Self::full_body(Bytes::from(message.to_string())))
            .unwrap()
    }

    /// Create redirect response
    fn redirect_response(location: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("Location", location)
            .body(Self::empty_body())
            .unwrap()
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }
}

/// The request's host with any port suffix stripped, for routing lookups
fn host_without_port(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
}
