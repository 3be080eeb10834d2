//! Client for the allocation service, used by the CLI and the CNI shim.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;

use crate::server::service::service_codec;
use crate::server::{ServiceRequest, ServiceResponse};

/// Where the daemon is listening.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

/// One-request-per-connection client. The service protocol allows request
/// pipelining on a connection; these callers never need it.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    endpoint: Endpoint,
}

impl ServiceClient {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Tcp(addr.into()),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Unix(path.into()),
        }
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let bytes = postcard::to_stdvec(&request).context("failed to encode request")?;

        let frame = match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("failed to connect to {addr}"))?;
                exchange(stream, bytes).await?
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("failed to connect to {}", path.display()))?;
                exchange(stream, bytes).await?
            }
        };

        postcard::from_bytes(&frame).context("failed to decode response")
    }
}

async fn exchange<S>(stream: S, bytes: Vec<u8>) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, service_codec());
    framed.send(bytes.into()).await.context("failed to send request")?;
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame.to_vec()),
        Some(Err(err)) => Err(err).context("failed to read response"),
        None => bail!("daemon closed the connection before responding"),
    }
}
