//! Procgroup Core - coordination of a group of cooperating processes.
//!
//! Rank 0 of the group is the interactive controller; every other rank is
//! a worker that replays the command streams the controller sends it.
//! Results that need a global view are captured on every process and
//! merged at root.
//!
//! # Example
//!
//! ```rust,ignore
//! use procgroup_core::{Application, Destination, GroupConfig, ProcessModule};
//!
//! struct Build;
//!
//! #[async_trait::async_trait]
//! impl Application for Build {
//!     async fn run(&mut self, module: &mut ProcessModule) -> procgroup_core::Result<i32> {
//!         module.stream_mut().new_object("PointCloud", ObjectId(1))?;
//!         module.send_stream(Destination::Server).await?;
//!         let info = module.gather_information("DataInformation", ObjectId(1)).await?;
//!         println!("{:?}", info.map(|i| i.to_json()));
//!         Ok(0)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> procgroup_core::Result<()> {
//!     let config = GroupConfig::from_env()?;
//!     let status = ProcessModule::start(&config, &mut Build).await?;
//!     std::process::exit(status);
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod information;
pub mod interpreter;
pub mod ipc;
pub mod module;
pub mod objects;
pub mod rmi;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::{ControlConfig, EnvConfig, GroupConfig, TransportConfig};
pub use control::{ControlRequest, ControllerApp};
pub use error::{ProcessError, Result};
pub use information::{
    Bounds, ClassNameInformation, DataInformation, Information, InformationRegistry,
};
pub use interpreter::{shared, Extension, Interpreter, ObjectInterpreter, ServerObject, SharedInterpreter};
pub use ipc::{IpcClient, IpcServer};
pub use module::{Application, Destination, ModuleLoadReport, ProcessModule, ProcessRole};
pub use objects::PointCloud;
pub use rmi::{RemoteCallHandler, RmiRegistry};
pub use stream::{Command, CommandStream, ObjectId, Value};
pub use transport::{
    local_group, LocalGroupTransport, LoopbackTransport, Rank, RemoteCall, Tag, TcpTransport,
    Transport, TransportStats, CONTROLLER_RANK,
};
