//! Control channel server.
//!
//! Bound to `127.0.0.1` on an OS-assigned port. Each accepted connection
//! holds one of [`ControlConfig::MAX_CONNECTIONS`] slots for as long as it
//! stays open; connections beyond that are closed immediately. Calls on one
//! connection are answered in order. Calls on different connections reach
//! the [`IpcDispatch`] concurrently, so the dispatcher decides how to
//! serialize them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::protocol::{
    read_frame, write_frame, IpcError, IpcRequest, IpcResponse, INVALID_REQUEST,
    JSONRPC_VERSION, PARSE_ERROR,
};
use crate::config::ControlConfig;
use crate::error::{ProcessError, Result};

/// Executes control channel method calls.
#[async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: Value) -> std::result::Result<Value, ProcessError>;
}

/// A running control server. Dropping it stops the server.
#[derive(Debug)]
pub struct IpcServerHandle {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&mut self) {
        self.stop.send_replace(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Accept loop state of a control server.
pub struct IpcServer<D> {
    listener: TcpListener,
    dispatch: Arc<D>,
    slots: Arc<Semaphore>,
    stop: watch::Receiver<bool>,
}

impl<D: IpcDispatch> IpcServer<D> {
    /// Bind a local port and serve `dispatch` until the handle is shut
    /// down or dropped.
    pub async fn start(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let server = Self {
            listener,
            dispatch,
            slots: Arc::new(Semaphore::new(ControlConfig::MAX_CONNECTIONS)),
            stop: stop_rx,
        };
        let task = tokio::spawn(server.serve());
        info!("Control channel listening on {}", addr);

        Ok(IpcServerHandle {
            addr,
            stop: stop_tx,
            task: Some(task),
        })
    }

    async fn serve(self) {
        let mut stop = self.stop.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Control connection task panicked: {}", e);
                        }
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Control channel accept failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(slot) = self.slots.clone().try_acquire_owned() else {
                        warn!(
                            "Refusing control connection from {}: {} already open",
                            peer,
                            ControlConfig::MAX_CONNECTIONS
                        );
                        continue;
                    };

                    let dispatch = self.dispatch.clone();
                    let stop = self.stop.clone();
                    connections.spawn(async move {
                        let _slot = slot;
                        if let Err(e) = serve_connection(stream, peer, dispatch.as_ref(), stop).await {
                            debug!("Control connection {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }

        connections.shutdown().await;
        info!("Control channel closed");
    }
}

async fn serve_connection<D: IpcDispatch>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatch: &D,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    debug!("Control connection from {}", peer);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame?,
            _ = stop.changed() => None,
        };
        let Some(frame) = frame else {
            debug!("Control connection {} closed", peer);
            return Ok(());
        };

        let response = answer(&frame, dispatch).await;
        write_frame(&mut writer, &serde_json::to_vec(&response)?).await?;
    }
}

async fn answer<D: IpcDispatch>(frame: &[u8], dispatch: &D) -> IpcResponse {
    let mut request: IpcRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            return IpcResponse::failed(None, IpcError::new(PARSE_ERROR, format!("Parse error: {}", e)))
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        let message = format!("Invalid Request: unsupported jsonrpc version {:?}", request.jsonrpc);
        return IpcResponse::failed(request.id, IpcError::new(INVALID_REQUEST, message));
    }

    let params = request.take_params();
    match dispatch.dispatch(&request.method, params).await {
        Ok(value) => IpcResponse::ok(request.id, value),
        Err(e) => {
            debug!("Control call {} failed: {}", request.method, e);
            IpcResponse::failed(request.id, IpcError::from(&e))
        }
    }
}
