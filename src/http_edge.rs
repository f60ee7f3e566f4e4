//! HTTP edge (§4.8): virtual-host routing into the forward registry,
//! request rewriting, and reverse proxying over a freshly opened SSH
//! channel through a connection-pooled HTTP client.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tower_service::Service;

use crate::config::{Config, TlsConfig};
use crate::fingerprint::ForwardInfo;
use crate::registry::ForwardRegistry;
use crate::ssh::opener::ChannelStream;

/// `Via` header written on every forwarded request (§4.8 step 5).
const VIA: &str = "rssh";

/// Backend certificate verifier for upstreams bound with the `s` flag
/// (`ForwardInfo::https`). The backend is an arbitrary service the tunnel's
/// owner chose to expose, not a publicly trusted endpoint with a CA-issued
/// certificate the gateway could check against — there is no root store to
/// validate against, so the handshake is performed for transport framing
/// only and any certificate is accepted. This mirrors what "treat upstream
/// as HTTPS" can mean for a backend behind NAT: speak TLS to it, don't
/// authenticate it.
#[derive(Debug)]
struct AcceptAnyCert {
    supported_schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            supported_schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

static UPSTREAM_TLS_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

fn upstream_tls_connector() -> TlsConnector {
    UPSTREAM_TLS_CONNECTOR
        .get_or_init(|| {
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

/// The stream a forwarded request is actually dialed over: either the raw
/// SSH-channel byte pipe, or that same pipe wrapped in a client-side TLS
/// handshake when the binding's `info.https` flag is set (§3, §4.8 step 5).
enum UpstreamStream {
    Plain(ChannelStream),
    Tls(Box<TlsStream<ChannelStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

type EdgeBody = BoxBody<Bytes, hyper::Error>;

fn full_body(bytes: impl Into<Bytes>) -> EdgeBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<EdgeBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("status and empty header set always build a valid response")
}

/// A just-opened channel stream plus whether it should be dialed in plain
/// or speak TLS, and the SNI/verification name to use if so.
struct PreparedUpstream {
    stream: ChannelStream,
    https: bool,
    host: String,
}

/// A one-shot connector: hands out the single prepared stream placed in its
/// slot — dialed plain or wrapped in a client TLS handshake per the
/// binding's `https` flag — then the slot is empty until refilled. Pairing
/// one connector with one pooled [`Client`] is what makes
/// `pool_max_idle_per_host(0)` safe — the client never needs to dial more
/// than once per forwarded request.
#[derive(Clone)]
struct PreparedConnector {
    slot: Arc<Mutex<Option<PreparedUpstream>>>,
}

impl Service<Uri> for PreparedConnector {
    type Response = UpstreamStream;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let slot = self.slot.clone();
        Box::pin(async move {
            let prepared = slot.lock().unwrap().take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "no prepared stream")
            })?;

            if !prepared.https {
                return Ok(UpstreamStream::Plain(prepared.stream));
            }

            let server_name = ServerName::try_from(prepared.host).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
            })?;
            let tls_stream = upstream_tls_connector()
                .connect(server_name, prepared.stream)
                .await?;
            Ok(UpstreamStream::Tls(Box::new(tls_stream)))
        })
    }
}

struct PooledClient {
    client: Client<PreparedConnector, Incoming>,
    slot: Arc<Mutex<Option<PreparedUpstream>>>,
}

impl PooledClient {
    fn new() -> Self {
        let slot = Arc::new(Mutex::new(None));
        let connector = PreparedConnector { slot: slot.clone() };
        // One-shot per request: every forwarded request's backing stream is
        // distinct, so keep-alive pooling inside the legacy client would
        // only ever find a dead connection (§9).
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);
        Self { client, slot }
    }

    fn prepare(&self, stream: ChannelStream, info: &ForwardInfo) {
        *self.slot.lock().unwrap() = Some(PreparedUpstream {
            stream,
            https: info.https,
            host: info.host.clone(),
        });
    }

    fn reset(&self) {
        *self.slot.lock().unwrap() = None;
    }
}

/// Concurrent acquire/release pool of [`PooledClient`]s. Reuses the client's
/// header arenas across requests; never reuses the backing connection.
#[derive(Clone, Default)]
pub struct ClientPool {
    idle: Arc<Mutex<Vec<PooledClient>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> PooledClient {
        self.idle
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(PooledClient::new)
    }

    fn release(&self, client: PooledClient) {
        client.reset();
        self.idle.lock().unwrap().push(client);
    }
}

/// Shared state every accepted HTTP(S) connection's service closes over.
pub struct EdgeState {
    pub registry: ForwardRegistry,
    pub config: &'static Config,
    pub pool: ClientPool,
}

/// Splits the `Host` header into exactly 3 dot-separated labels, returning
/// the first as the subdomain. Anything else is a malformed host (§4.8
/// step 2); ports are not stripped, matching the original implementation's
/// raw-header split. An empty first label (`Host: .example.com`) still
/// counts as 3 labels and is passed through — it fails downstream at
/// `registry.resolve("")` with a 502, not here with a 400, matching the
/// original's literal `len(urlParts) != 3` check.
fn extract_subdomain(host: &str) -> Option<&str> {
    let mut labels = host.split('.');
    let first = labels.next()?;
    let second = labels.next();
    let third = labels.next();
    let fourth = labels.next();
    match (second, third, fourth) {
        (Some(_), Some(_), None) => Some(first),
        _ => None,
    }
}

fn set_header(req: &mut Request<Incoming>, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        req.headers_mut().insert(name, value);
    }
}

async fn handle(
    mut req: Request<Incoming>,
    state: Arc<EdgeState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<EdgeBody>, Infallible> {
    if state.config.ssl_redirect && !is_tls {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let location = format!("https://{host}{path}");
        let mut resp = text_response(StatusCode::PERMANENT_REDIRECT, Vec::new());
        if let Ok(value) = HeaderValue::from_str(&location) {
            resp.headers_mut().insert(hyper::header::LOCATION, value);
        }
        return Ok(resp);
    }

    let host_header = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(subdomain) = extract_subdomain(&host_header) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "subdomain required"));
    };

    let opener = match state.registry.resolve(subdomain) {
        Ok(opener) => opener,
        Err(e) => return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string())),
    };

    let opened = match opener.open(&client_addr.to_string()).await {
        Ok(opened) => opened,
        Err(e) => return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string())),
    };
    let info = opened.info;
    let remote_addr = opened.stream.remote_addr();

    set_header(&mut req, hyper::header::VIA, VIA);
    set_header(
        &mut req,
        HeaderName::from_static("x-forwarded-for"),
        &client_addr.ip().to_string(),
    );
    set_header(
        &mut req,
        HeaderName::from_static("x-forwarded-host"),
        &host_header,
    );
    set_header(
        &mut req,
        HeaderName::from_static("x-forwarded-proto"),
        if is_tls { "https" } else { "http" },
    );
    set_header(&mut req, hyper::header::HOST, &info.host);

    if info.rewrite_origin && req.headers().contains_key(hyper::header::ORIGIN) {
        set_header(&mut req, hyper::header::ORIGIN, &info.host);
    }

    let scheme = if info.https { "https" } else { "http" };
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();
    let new_uri: Uri = format!("{scheme}://{}{path}", info.host)
        .parse()
        .unwrap_or_else(|_| req.uri().clone());
    *req.uri_mut() = new_uri;

    debug!(
        "proxying {} {} host={} subdomain={}",
        req.method(),
        host_header,
        info.host,
        subdomain
    );

    let client = state.pool.acquire();
    client.prepare(opened.stream, &info);
    let result = client.client.request(req).await;
    state.pool.release(client);

    let mut response = match result {
        Ok(resp) => resp.map(|body| body.boxed()),
        Err(e) => {
            warn!("upstream request to subdomain {subdomain} failed: {e}");
            return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    if !state.config.web_hide_info {
        if let Ok(value) = HeaderValue::from_str(&remote_addr.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-source"), value);
        }
    }

    Ok(response)
}

/// Serves one accepted TCP connection's HTTP/1.1 traffic.
async fn serve_stream<S>(stream: S, remote_addr: SocketAddr, state: Arc<EdgeState>, is_tls: bool)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle(req, state.clone(), remote_addr, is_tls));
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("http connection from {remote_addr} closed: {e}");
    }
}

/// Runs the plain-HTTP listener. Never returns except on a fatal bind error.
pub async fn run_http(addr: SocketAddr, state: Arc<EdgeState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("http edge listening on {addr}");
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("http accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(serve_stream(stream, remote_addr, state, false));
    }
}

fn load_tls_config(tls: &TlsConfig) -> std::io::Result<rustls::ServerConfig> {
    let cert_bytes = std::fs::read(&tls.cert_file)?;
    let key_bytes = std::fs::read(&tls.key_file)?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::read_one(&mut key_bytes.as_slice())?
        .and_then(|item| match item {
            Item::Pkcs1Key(key) => Some(rustls::pki_types::PrivateKeyDer::Pkcs1(key)),
            Item::Pkcs8Key(key) => Some(rustls::pki_types::PrivateKeyDer::Pkcs8(key)),
            Item::Sec1Key(key) => Some(rustls::pki_types::PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found in KEY_FILE")
        })?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Runs the TLS-terminated HTTP listener. TLS termination is a thin,
/// swappable layer: once the handshake completes the plaintext bytes feed
/// the same [`handle`] service as the plain listener (§1).
pub async fn run_https(
    addr: SocketAddr,
    state: Arc<EdgeState>,
    tls: &TlsConfig,
) -> std::io::Result<()> {
    let server_config = load_tls_config(tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(addr).await?;
    info!("https edge listening on {addr}");
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("https accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve_stream(tls_stream, remote_addr, state, true).await,
                Err(e) => error!("tls handshake with {remote_addr} failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_subdomain_requires_exactly_three_labels() {
        assert_eq!(extract_subdomain("sub.example.com"), Some("sub"));
        assert_eq!(extract_subdomain("example.com"), None);
        assert_eq!(extract_subdomain("a.b.c.d"), None);
        assert_eq!(extract_subdomain(""), None);
    }

    #[test]
    fn extract_subdomain_does_not_strip_port() {
        assert_eq!(extract_subdomain("sub.example.com:8443"), Some("sub"));
    }

    #[test]
    fn extract_subdomain_passes_through_empty_first_label() {
        // Still 3 labels per the original's literal split-and-count rule;
        // an empty subdomain fails later at `registry.resolve("")` with a
        // 502, not here with a 400.
        assert_eq!(extract_subdomain(".example.com"), Some(""));
    }
}
