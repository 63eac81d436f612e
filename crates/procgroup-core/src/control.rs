//! The interactive controller application.
//!
//! [`ControllerApp`] runs on rank 0. It starts the control channel server
//! and executes the requests it receives one at a time against the process
//! module, so the group only ever sees one protocol in flight.
//!
//! Methods:
//!
//! | method        | params                    | result                                  |
//! |---------------|---------------------------|-----------------------------------------|
//! | `status`      | none                      | `{partition_id, partition_count, role}` |
//! | `dispatch`    | `{destination, commands}` | `{executed}`                            |
//! | `gather`      | `{kind, object}`          | merged snapshot                         |
//! | `load_module` | `{name}`                  | `{loaded}`                              |
//! | `exit`        | none                      | `{exited}`, then the app returns 0      |

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::error::{ProcessError, Result};
use crate::ipc::{IpcDispatch, IpcServer};
use crate::module::{Application, Destination, ProcessModule};
use crate::stream::{Command, CommandStream, ObjectId};

/// A parsed control channel call.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Status,
    Dispatch {
        destination: Destination,
        commands: Vec<Command>,
    },
    Gather {
        kind: String,
        object: ObjectId,
    },
    LoadModule {
        name: String,
    },
    Exit,
}

#[derive(Deserialize)]
struct DispatchParams {
    destination: Destination,
    #[serde(default)]
    commands: Vec<Command>,
}

#[derive(Deserialize)]
struct GatherParams {
    kind: String,
    object: ObjectId,
}

#[derive(Deserialize)]
struct LoadModuleParams {
    name: String,
}

fn params<T: for<'de> Deserialize<'de>>(method: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ProcessError::InvalidParams {
        message: format!("{}: {}", method, e),
    })
}

impl ControlRequest {
    pub fn parse(method: &str, value: serde_json::Value) -> Result<Self> {
        let request = match method {
            "status" => ControlRequest::Status,
            "dispatch" => {
                let p: DispatchParams = params(method, value)?;
                ControlRequest::Dispatch {
                    destination: p.destination,
                    commands: p.commands,
                }
            }
            "gather" => {
                let p: GatherParams = params(method, value)?;
                ControlRequest::Gather {
                    kind: p.kind,
                    object: p.object,
                }
            }
            "load_module" => {
                let p: LoadModuleParams = params(method, value)?;
                ControlRequest::LoadModule { name: p.name }
            }
            "exit" => ControlRequest::Exit,
            _ => {
                return Err(ProcessError::UnknownMethod {
                    method: method.to_string(),
                })
            }
        };
        Ok(request)
    }

    /// Run this request against the controller's module.
    pub async fn execute(self, module: &mut ProcessModule) -> Result<serde_json::Value> {
        match self {
            ControlRequest::Status => Ok(json!({
                "partition_id": module.partition_id(),
                "partition_count": module.partition_count(),
                "role": module.role(),
            })),
            ControlRequest::Dispatch {
                destination,
                commands,
            } => {
                let mut stream = CommandStream::new();
                for command in commands {
                    stream.push(command)?;
                }
                let executed = stream.len();
                if destination.broadcasts() {
                    module.dispatch_to_workers_and_self(&mut stream).await?;
                } else {
                    module.dispatch_to_self_only(&mut stream)?;
                }
                Ok(json!({ "executed": executed }))
            }
            ControlRequest::Gather { kind, object } => {
                match module.gather_information(&kind, object).await? {
                    Some(info) => info.to_json(),
                    None => Ok(serde_json::Value::Null),
                }
            }
            ControlRequest::LoadModule { name } => {
                let loaded = module.load_module(&name).await?;
                Ok(json!({ "loaded": loaded }))
            }
            ControlRequest::Exit => {
                module.exit().await?;
                Ok(json!({ "exited": true }))
            }
        }
    }
}

type Job = (ControlRequest, oneshot::Sender<Result<serde_json::Value>>);

/// Forwards control channel calls to the controller loop.
struct QueueDispatch {
    jobs: mpsc::Sender<Job>,
}

#[async_trait]
impl IpcDispatch for QueueDispatch {
    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ProcessError> {
        let request = ControlRequest::parse(method, params)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.jobs
            .send((request, reply_tx))
            .await
            .map_err(|_| ProcessError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ProcessError::ChannelClosed)?
    }
}

/// Controller application serving the control channel until `exit`.
#[derive(Debug, Default)]
pub struct ControllerApp {
    ready: Option<oneshot::Sender<SocketAddr>>,
    shutdown: Option<oneshot::Receiver<()>>,
}

impl ControllerApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the control channel address once it is listening.
    pub fn with_ready_signal(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Stop serving when `shutdown` fires (or its sender is dropped).
    pub fn with_shutdown(mut self, shutdown: oneshot::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

#[async_trait]
impl Application for ControllerApp {
    async fn run(&mut self, module: &mut ProcessModule) -> Result<i32> {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<Job>(ControlConfig::REQUEST_QUEUE_DEPTH);
        let mut server = IpcServer::start(Arc::new(QueueDispatch { jobs: jobs_tx })).await?;

        if let Some(ready) = self.ready.take() {
            if ready.send(server.addr()).is_err() {
                debug!("Nobody is waiting for the control address");
            }
        }
        info!("Controller ready, control channel on {}", server.addr());

        let mut shutdown = self.shutdown.take();
        loop {
            let job = match shutdown.as_mut() {
                Some(signal) => tokio::select! {
                    job = jobs_rx.recv() => job,
                    _ = signal => {
                        info!("Controller asked to stop");
                        None
                    }
                },
                None => jobs_rx.recv().await,
            };
            let Some((request, reply)) = job else {
                break;
            };

            let is_exit = request == ControlRequest::Exit;
            let result = request.execute(module).await;
            if let Err(e) = &result {
                warn!("Control request failed: {}", e);
            }
            if reply.send(result).is_err() {
                debug!("Control client went away before the reply");
            }
            if is_exit {
                break;
            }
        }

        server.shutdown();
        Ok(0)
    }
}
