//! Outbound side: one TCP connection per call, bounded by a timeout.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;
use update_engine::error::UpdateError;
use update_engine::rpc::{RpcRequest, RpcResponse, Transport};

use crate::frame_codec;

/// Transport used to send requests to a remote role.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        TcpTransport { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn exchange(&self, payload: Bytes) -> Result<RpcResponse, UpdateError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| UpdateError::Transport(format!("connect to {} failed: {e}", self.addr)))?;
        let mut framed = Framed::new(stream, frame_codec());

        framed
            .send(payload)
            .await
            .map_err(|e| UpdateError::Transport(format!("send to {} failed: {e}", self.addr)))?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| UpdateError::Transport(format!("{} closed the connection", self.addr)))?
            .map_err(|e| UpdateError::Transport(format!("receive from {} failed: {e}", self.addr)))?;

        serde_json::from_slice(&frame)
            .map_err(|e| UpdateError::Transport(format!("malformed response from {}: {e}", self.addr)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError> {
        let method = request.method();
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        debug!(addr = %self.addr, method, "sending request");

        tokio::time::timeout(self.timeout, self.exchange(payload))
            .await
            .map_err(|_| {
                UpdateError::Timeout(format!(
                    "{method} to {} did not complete within {:?}",
                    self.addr, self.timeout
                ))
            })?
    }
}
