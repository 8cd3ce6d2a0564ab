//! Stratum v1 protocol server

pub mod client;
pub mod protocol;
pub mod server;

pub use client::Session;
pub use protocol::{RpcNotification, RpcRequest, RpcResponse, StratumError};
pub use server::{AuthorizeFn, AuthorizeOutcome, ServerState, StratumServer};
