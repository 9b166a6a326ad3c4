use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use socket2::{Domain, Protocol, Socket, Type};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::settings::EngineSettings;
use crate::proxy::access_log::AccessLogger;

use super::connection::ConnectionTracker;
use super::http_entry::{HttpEntry, InboundRequest};
use super::tls::{extract_ja3_from_client_hello, extract_ja4_from_client_hello};
use crate::storage::fingerprint_store::FingerprintStore;

/// Accepts TCP connections, terminates TLS, sniffs JA3/JA4 off the raw
/// ClientHello before the handshake (§4.1), and hands every request to
/// [`HttpEntry`]. The plain-HTTP listener only ever issues the
/// HTTPS redirect (§9: no plaintext phishing traffic is served).
pub struct ProxyServer {
    settings: Arc<EngineSettings>,
    tls_config: Arc<rustls::ServerConfig>,
    entry: Arc<HttpEntry>,
    connections: Arc<ConnectionTracker>,
    fingerprints: Arc<FingerprintStore>,
    access_log: Option<Arc<AccessLogger>>,
}

impl ProxyServer {
    pub fn new(
        settings: Arc<EngineSettings>,
        tls_config: Arc<rustls::ServerConfig>,
        entry: Arc<HttpEntry>,
        connections: Arc<ConnectionTracker>,
        fingerprints: Arc<FingerprintStore>,
        access_log: Option<Arc<AccessLogger>>,
    ) -> Self {
        Self {
            settings,
            tls_config,
            entry,
            connections,
            fingerprints,
            access_log,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let https_addr = &self.settings.bind_https;
        let http_addr = &self.settings.bind_http;

        let https_listener = bind_tcp_listener(https_addr)?;
        let https_listener = TcpListener::from_std(https_listener)?;
        info!(addr = %https_addr, "HTTPS listener started");

        let http_listener = bind_tcp_listener(http_addr)?;
        let http_listener = TcpListener::from_std(http_listener)?;
        info!(addr = %http_addr, "HTTP listener started (redirect-to-HTTPS)");

        let tls_acceptor = TlsAcceptor::from(Arc::clone(&self.tls_config));
        let max_connections = self.settings.max_connections as u64;

        let cleanup_connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                cleanup_connections.cleanup_stale(Duration::from_secs(3600));
            }
        });

        let _http_redirect_handle = tokio::spawn(run_http_redirect(http_listener));

        info!("mirrorgate proxy is ready to accept connections");

        loop {
            let (stream, peer_addr) = match https_listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            let peer_ip = peer_addr.ip();

            if self.connections.active_count() >= max_connections {
                debug!(client_ip = %peer_ip, "Max connections reached, dropping");
                drop(stream);
                continue;
            }

            let acceptor = tls_acceptor.clone();
            let entry = Arc::clone(&self.entry);
            let connections = Arc::clone(&self.connections);
            let fingerprints = Arc::clone(&self.fingerprints);
            let access_log = self.access_log.clone();

            tokio::spawn(async move {
                let result = handle_tls_connection(
                    stream,
                    acceptor,
                    entry,
                    connections,
                    fingerprints.clone(),
                    access_log,
                    peer_addr,
                )
                .await;

                fingerprints.forget(peer_addr);

                if let Err(err) = result {
                    debug!(client_ip = %peer_ip, error = %err, "TLS connection handling ended with error");
                }
            });
        }
    }
}

fn bind_tcp_listener(addr: &str) -> Result<std::net::TcpListener, Box<dyn std::error::Error>> {
    let sock_addr: std::net::SocketAddr = addr.parse()?;

    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(8192)?;

    Ok(socket.into())
}

async fn handle_tls_connection(
    stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    entry: Arc<HttpEntry>,
    connections: Arc<ConnectionTracker>,
    fingerprints: Arc<FingerprintStore>,
    access_log: Option<Arc<AccessLogger>>,
    peer_addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let peer_ip = peer_addr.ip();

    let mut peek_buf = [0u8; 1500];
    let peek_len = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let (ja3, ja4) = if peek_len > 0 {
        (
            extract_ja3_from_client_hello(&peek_buf[..peek_len]),
            extract_ja4_from_client_hello(&peek_buf[..peek_len]),
        )
    } else {
        (None, None)
    };

    if let (Some(ja3), Some(ja4)) = (&ja3, &ja4) {
        debug!(client_ip = %peer_ip, ja3 = %ja3, ja4 = %ja4, "TLS fingerprint extracted");
        fingerprints.store(peer_addr, ja3.clone(), ja4.clone());
    }

    let tls_stream = tls_acceptor.accept(stream).await.map_err(|err| {
        debug!(client_ip = %peer_ip, error = %err, "TLS handshake failed");
        err
    })?;

    let conn_id = connections.register(peer_ip, ja3.clone());
    let _guard = ConnectionGuard { connections: Arc::clone(&connections), id: conn_id };

    debug!(client_ip = %peer_ip, connection_id = conn_id, "TLS connection established");

    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;

    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let entry = Arc::clone(&entry);
        let connections = Arc::clone(&connections);
        let access_log = access_log.clone();
        async move {
            connections.increment_requests(conn_id);
            let started = Instant::now();
            let served = serve_one(&entry, req, peer_addr).await;

            if let Some(logger) = &access_log {
                logger.log(
                    peer_ip,
                    &served.method,
                    &served.path,
                    &served.host,
                    served.response.status().as_u16(),
                    "proxied",
                    started.elapsed().as_micros() as u64,
                    &served.user_agent,
                    None,
                    &conn_id.to_string(),
                );
            }

            Ok::<_, hyper::Error>(served.response)
        }
    });

    let conn = http1::Builder::new().keep_alive(true).serve_connection(io, service);

    if let Err(err) = conn.await {
        debug!(client_ip = %peer_ip, connection_id = conn_id, error = %err, "HTTP connection error");
    }

    Ok(())
}

/// Converts one hyper request into an [`InboundRequest`], runs it through
/// [`HttpEntry::handle`], and converts the [`crate::proxy::http_entry::EntryResponse`]
/// back into a hyper response. Multi-valued response headers (notably
/// repeated `Set-Cookie`) are split back out of the engine-wide
/// newline-joined convention here, the one place that convention ends.
struct ServedRequest {
    response: Response<Full<Bytes>>,
    method: String,
    path: String,
    host: String,
    user_agent: String,
}

async fn serve_one(entry: &HttpEntry, req: Request<Incoming>, remote_addr: std::net::SocketAddr) -> ServedRequest {
    let method = req.method().as_str().to_string();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();

    let mut headers = std::collections::HashMap::new();
    let mut host = uri.host().map(str::to_string).unwrap_or_default();
    for (name, value) in req.headers().iter() {
        let name_lc = name.as_str().to_lowercase();
        let Ok(value) = value.to_str() else { continue };
        if name_lc == "host" && host.is_empty() {
            host = value.split(':').next().unwrap_or(value).to_string();
        }
        headers
            .entry(name_lc)
            .and_modify(|existing: &mut String| {
                existing.push('\n');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    let user_agent = headers.get("user-agent").cloned().unwrap_or_default();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => Vec::new(),
    };

    let inbound = InboundRequest {
        method: method.clone(),
        host: host.clone(),
        path: path.clone(),
        query,
        headers,
        body,
        remote_addr,
    };

    let entry_resp = match AssertUnwindSafe(entry.handle(inbound)).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic_err) => {
            error!(error = %panic_message(&panic_err), "panic recovered in request pipeline; connection stays alive");
            crate::proxy::http_entry::EntryResponse { status: 500, headers: std::collections::HashMap::new(), body: Vec::new() }
        }
    };

    let mut builder = Response::builder().status(entry_resp.status);
    for (name, value) in &entry_resp.headers {
        for line in value.split('\n') {
            builder = builder.header(name.as_str(), line);
        }
    }
    let response = builder.body(Full::new(Bytes::from(entry_resp.body))).unwrap_or_else(|_| {
        Response::builder().status(502).body(Full::new(Bytes::new())).expect("static 502 response is valid")
    });

    ServedRequest { response, method, path, host, user_agent }
}

async fn run_http_redirect(listener: TcpListener) {
    loop {
        let (mut stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("HTTP redirect listener accept error: {}", err);
                continue;
            }
        };

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut total = 0usize;

            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => return,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let raw = String::from_utf8_lossy(&buf[..total]);
            let mut host = String::new();
            let mut path = String::from("/");

            for (i, line) in raw.lines().enumerate() {
                if i == 0 {
                    let mut parts = line.split_whitespace();
                    let _method = parts.next();
                    if let Some(p) = parts.next() {
                        path = p.to_string();
                    }
                } else if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("host") {
                        host = value.trim().to_string();
                    }
                }
            }

            let redirect_host = host.split(':').next().unwrap_or(&host);
            let location = format!("https://{}{}", redirect_host, path);
            let body = format!(
                "<html><body><h1>301 Moved Permanently</h1><p><a href=\"{loc}\">{loc}</a></p></body></html>",
                loc = location
            );

            let response = format!(
                "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
                location = location,
                len = body.len(),
                body = body,
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;

            debug!(client_ip = %peer_addr.ip(), redirect_to = %location, "HTTP -> HTTPS redirect");
        });
    }
}

/// Downcasts a caught panic payload to a loggable string (§7 "Panic anywhere
/// in the pipeline: recover, log stack, return a generic error to the
/// client, keep the server alive"), the same `&str`/`String` downcast order
/// the pack's `catch_panic` layer uses.
fn panic_message(err: &Box<dyn Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ConnectionGuard {
    connections: Arc<ConnectionTracker>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(self.id);
    }
}
