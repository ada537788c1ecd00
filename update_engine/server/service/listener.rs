//! Inbound side: a supervised tokio task that accepts framed JSON requests and
//! hands them to one role's [`RpcHandler`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use update_engine::error::UpdateError;
use update_engine::rpc::{FaultKind, RpcFault, RpcHandler, RpcRequest, RpcResponse};

use crate::frame_codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SocketAddr),
    /// A second start on a running listener. Benign; nothing changes.
    AlreadyRunning(SocketAddr),
}

impl StartOutcome {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            StartOutcome::Started(addr) | StartOutcome::AlreadyRunning(addr) => *addr,
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Serves one role until [`RpcListener::stop`] is called or the listener is
/// dropped.
pub struct RpcListener {
    addr: SocketAddr,
    handler: Arc<dyn RpcHandler>,
    running: Mutex<Option<Running>>,
}

impl RpcListener {
    pub fn new(addr: SocketAddr, handler: Arc<dyn RpcHandler>) -> Self {
        RpcListener {
            addr,
            handler,
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<StartOutcome, UpdateError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                info!(addr = %current.local_addr, "listener already running");
                return Ok(StartOutcome::AlreadyRunning(current.local_addr));
            }
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| UpdateError::Transport(format!("cannot listen on {}: {e}", self.addr)))?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, self.handler.clone(), shutdown_rx));

        info!(addr = %local_addr, "listening for requests");
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(StartOutcome::Started(local_addr))
    }

    /// Stops accepting, closes open connections and waits for the task.
    /// Returns false if the listener was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            warn!(error = %e, "listener task ended abnormally");
        }
        info!(addr = %running.local_addr, "listener stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|running| running.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            // Also fires when the sender is dropped with the listener.
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> io::Result<()> {
    let mut framed = Framed::new(stream, frame_codec());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<RpcRequest>(&frame) {
            Ok(request) => handler.handle(request).await,
            Err(e) => RpcResponse::Fault(RpcFault::new(
                FaultKind::Schema,
                format!("malformed request: {e}"),
            )),
        };
        let encoded = serde_json::to_vec(&response).map_err(io::Error::other)?;
        framed.send(Bytes::from(encoded)).await?;
    }
    Ok(())
}
