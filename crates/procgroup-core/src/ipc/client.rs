//! Control channel client.
//!
//! One TCP connection per client. Calls from concurrent tasks queue on a
//! tokio `Mutex`, so each request is answered before the next is written.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::ControlConfig;
use crate::error::{ProcessError, Result};

#[derive(Debug)]
struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    last_id: u64,
}

/// Connection to a controller's control channel.
#[derive(Debug)]
pub struct IpcClient {
    addr: SocketAddr,
    connection: Mutex<Connection>,
}

impl IpcClient {
    /// Connect within [`ControlConfig::CONNECT_TIMEOUT`].
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = match tokio::time::timeout(ControlConfig::CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(controller_unreachable(addr, e)),
            Err(_) => return Err(controller_unreachable(addr, "connect timed out")),
        };
        stream.set_nodelay(true)?;
        debug!("Connected to controller at {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            connection: Mutex::new(Connection {
                reader,
                writer,
                last_id: 0,
            }),
        })
    }

    /// Call `method` on the controller.
    ///
    /// An error answer comes back as [`ProcessError::Rpc`] carrying the
    /// controller's code.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut connection = self.connection.lock().await;
        connection.last_id += 1;
        let id = connection.last_id;

        let request = serde_json::to_vec(&IpcRequest::call(id, method, params))?;
        write_frame(&mut connection.writer, &request)
            .await
            .map_err(|e| controller_unreachable(self.addr, e))?;

        let frame = read_frame(&mut connection.reader)
            .await
            .map_err(|e| controller_unreachable(self.addr, e))?
            .ok_or_else(|| controller_unreachable(self.addr, "connection closed"))?;

        let response: IpcResponse = serde_json::from_slice(&frame)?;
        if response.id != Some(Value::from(id)) {
            return Err(ProcessError::Decode {
                message: format!("response id {:?} does not answer request {}", response.id, id),
            });
        }
        response.into_result()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn controller_unreachable(addr: SocketAddr, cause: impl std::fmt::Display) -> ProcessError {
    ProcessError::transport(format!("controller at {} is unreachable: {}", addr, cause))
}
