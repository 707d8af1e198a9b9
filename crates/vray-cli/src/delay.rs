//! Outbound delay measurement
//!
//! Times an HTTP GET of the test URL sent through a local SOCKS5
//! listener, i.e. through the proxy outbound the core is running.
//! HTTPS targets are wrapped in rustls.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Delay measurement errors
#[derive(Debug, thiserror::Error)]
pub enum DelayError {
    #[error("Invalid test URL: {0}")]
    InvalidUrl(String),

    #[error("Proxy connection failed: {0}")]
    Proxy(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status: {0}")]
    Status(StatusCode),
}

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// GET `test_url` through the SOCKS5 proxy at `proxy`, returning the
/// time until response headers arrive
pub async fn measure_through_socks(proxy: SocketAddr, test_url: &str) -> Result<Duration, DelayError> {
    let url = Url::parse(test_url).map_err(|e| DelayError::InvalidUrl(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| DelayError::InvalidUrl(format!("{}: no host", test_url)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| DelayError::InvalidUrl(format!("{}: no port", test_url)))?;

    let tls = match url.scheme() {
        "https" => true,
        "http" => false,
        other => return Err(DelayError::InvalidUrl(format!("unsupported scheme {}", other))),
    };

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let began = Instant::now();

    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| DelayError::Proxy(format!("{}: {}", proxy, e)))?;
    socks5_connect(&mut stream, &host, port).await?;

    let status = if tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| DelayError::Tls(format!("invalid server name {}", host)))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| DelayError::Tls(e.to_string()))?;

        send_get(tls_stream, &host, &target).await?
    } else {
        send_get(stream, &host, &target).await?
    };

    let elapsed = began.elapsed();
    debug!("GET {} -> {} in {:?}", test_url, status, elapsed);

    if status.is_success() {
        Ok(elapsed)
    } else {
        Err(DelayError::Status(status))
    }
}

/// SOCKS5 no-auth CONNECT to `host:port`
async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), DelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = |e: std::io::Error| DelayError::Proxy(e.to_string());

    stream.write_all(&[SOCKS_VERSION, 1, NO_AUTH]).await.map_err(io)?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io)?;
    if choice != [SOCKS_VERSION, NO_AUTH] {
        return Err(DelayError::Proxy(format!("method negotiation refused: {:?}", choice)));
    }

    let name = host.as_bytes();
    let len = u8::try_from(name.len()).map_err(|_| DelayError::Proxy(format!("host too long: {}", host)))?;

    let mut request = Vec::with_capacity(7 + name.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, len]);
    request.extend_from_slice(name);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(io)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io)?;
    if reply[1] != 0x00 {
        return Err(DelayError::Proxy(format!("connect rejected with code {}", reply[1])));
    }

    // Skip the bound address
    let skip = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut n = [0u8; 1];
            stream.read_exact(&mut n).await.map_err(io)?;
            usize::from(n[0]) + 2
        }
        other => return Err(DelayError::Proxy(format!("unknown address type {}", other))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await.map_err(io)?;
    Ok(())
}

async fn send_get<S>(stream: S, host: &str, target: &str) -> Result<StatusCode, DelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| DelayError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header(HOST, host)
        .header(USER_AGENT, concat!("vray/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| DelayError::Http(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| DelayError::Http(e.to_string()))?;
    Ok(response.status())
}
