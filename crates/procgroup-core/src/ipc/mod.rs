//! Control channel of the controller process.
//!
//! JSON-RPC 2.0 over length-prefixed TCP frames on `127.0.0.1`. The
//! controller serves it with [`IpcServer`] while its [`crate::ControllerApp`]
//! runs; tools outside the group reach it with [`IpcClient`].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{IpcError, IpcRequest, IpcResponse, Outcome};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
