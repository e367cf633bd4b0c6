// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Sends assembled requests to the target and collects what comes back.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use url::Url;

use super::framing::response_complete;
use super::tls::{build_connector, TlsMode};
use super::transform::{is_head_request, RequestTransformer};
use super::types::{AggregatedRawResponse, HttpMessageAndTimestamp, UniqueRequestKey};
use crate::constants::READ_BUFFER_SIZE;
use crate::errors::{Error, Result};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("invalid TLS server name: {0}")]
    ServerName(String),
    #[error("failed to send request: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read response: {0}")]
    Read(#[source] std::io::Error),
    #[error("target closed the connection without responding")]
    EmptyResponse,
    #[error("no complete response within {0:?}")]
    Timeout(Duration),
    #[error("replay transport is shut down")]
    TransportClosed,
    #[error("replay task failed: {0}")]
    Task(String),
}

/// Replays one assembled request. Implementations must tolerate concurrent calls; failures are
/// reported through the returned future.
pub trait ReplayExecutor: Send + Sync + 'static {
    fn submit(
        &self,
        key: &UniqueRequestKey,
        request: &HttpMessageAndTimestamp,
    ) -> BoxFuture<'static, std::result::Result<AggregatedRawResponse, ReplayError>>;

    /// Releases transport resources. Called once every finalization has completed.
    fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub target: Url,
    pub tls_mode: TlsMode,
    pub authorization: Option<String>,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
}

struct Inner {
    host: String,
    port: u16,
    server_name: Option<ServerName<'static>>,
    tls: Option<TlsConnector>,
    transformer: RequestTransformer,
    timeout: Duration,
    permits: Semaphore,
}

/// Opens a fresh connection to the target per request, over TLS for `https` targets.
#[derive(Clone)]
pub struct TargetReplayExecutor {
    inner: Arc<Inner>,
}

impl TargetReplayExecutor {
    pub fn new(settings: TargetSettings) -> Result<Self> {
        let target = &settings.target;
        let host = match target.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::InvalidTarget(format!("hostname not present: {target}"))),
        };
        let port = target
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidTarget(format!("port not present: {target}")))?;

        let (tls, server_name) = if target.scheme() == "https" {
            let name = ServerName::try_from(host.clone())
                .map_err(|e| Error::InvalidTarget(format!("{host}: {e}")))?;
            (Some(build_connector(settings.tls_mode)?), Some(name))
        } else {
            (None, None)
        };

        debug!(
            "replaying against {host}:{port} (tls: {}, timeout: {:?}, concurrency: {})",
            tls.is_some(),
            settings.request_timeout,
            settings.max_concurrent_requests
        );

        Ok(Self {
            inner: Arc::new(Inner {
                host,
                port,
                server_name,
                tls,
                transformer: RequestTransformer::new(target, settings.authorization),
                timeout: settings.request_timeout,
                permits: Semaphore::new(settings.max_concurrent_requests.max(1)),
            }),
        })
    }
}

impl ReplayExecutor for TargetReplayExecutor {
    fn submit(
        &self,
        key: &UniqueRequestKey,
        request: &HttpMessageAndTimestamp,
    ) -> BoxFuture<'static, std::result::Result<AggregatedRawResponse, ReplayError>> {
        let inner = self.inner.clone();
        let key = key.clone();
        let bytes = inner.transformer.transform(&request.to_bytes());
        async move {
            let _permit = inner
                .permits
                .acquire()
                .await
                .map_err(|_| ReplayError::TransportClosed)?;
            trace!("{key}: sending {} bytes", bytes.len());
            match tokio::time::timeout(inner.timeout, inner.exchange(&bytes)).await {
                Ok(res) => res,
                Err(_) => Err(ReplayError::Timeout(inner.timeout)),
            }
        }
        .boxed()
    }

    fn shutdown(&self) {
        debug!("closing replay transport");
        self.inner.permits.close();
    }
}

impl Inner {
    async fn exchange(&self, request: &[u8]) -> std::result::Result<AggregatedRawResponse, ReplayError> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => TcpStream::connect(SocketAddr::new(ip, self.port)).await,
            Err(_) => TcpStream::connect(addr.as_str()).await,
        }
        .map_err(|source| ReplayError::Connect {
            addr: addr.clone(),
            source,
        })?;
        tcp.set_nodelay(true).map_err(|source| ReplayError::Connect { addr, source })?;

        match (&self.tls, &self.server_name) {
            (Some(connector), Some(name)) => {
                let stream = connector
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(ReplayError::Tls)?;
                send_and_collect(stream, request).await
            }
            (Some(_), None) => Err(ReplayError::ServerName(self.host.clone())),
            _ => send_and_collect(tcp, request).await,
        }
    }
}

async fn send_and_collect<S>(
    mut stream: S,
    request: &[u8],
) -> std::result::Result<AggregatedRawResponse, ReplayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut response = AggregatedRawResponse::builder();
    stream.write_all(request).await.map_err(ReplayError::Write)?;
    stream.flush().await.map_err(ReplayError::Write)?;

    let head_request = is_head_request(request);
    let mut received = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            // keep what arrived; the cause marks the response as cut short
            Err(e) if !received.is_empty() => {
                debug!("read ended with {e} after {} bytes", received.len());
                response.add_error_cause(ReplayError::Read(e));
                break;
            }
            Err(e) => return Err(ReplayError::Read(e)),
        };
        if n == 0 {
            break;
        }
        response.add_response_packet(&buf[..n]);
        received.extend_from_slice(&buf[..n]);
        if response_complete(&received, head_request) {
            break;
        }
    }

    if received.is_empty() {
        return Err(ReplayError::EmptyResponse);
    }
    Ok(response.build())
}
