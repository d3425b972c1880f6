//! Newline-delimited JSON IPC server: the control surface a GUI or CLI
//! front-end uses to query status, pause/resume users, and tail logs
//! without linking against this crate directly.

mod handler;
mod protocol;
mod server;

pub use protocol::{IpcRequest, IpcResponse};
pub use server::IpcServer;
