//! Stratum mining pool engine
//!
//! Serves stratum v1 work derived from daemon block templates, validates
//! submitted shares, adapts per-connection difficulty and submits solved
//! blocks back to the daemons.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unused_lifetimes,
    unused_qualifications,
    clippy::all
)]
#![forbid(unsafe_code)]

pub mod algo;
pub mod config;
pub mod daemon;
pub mod error;
pub mod job_manager;
pub mod merkle;
pub mod pool;
pub mod stratum;
pub mod template;
pub mod transactions;
pub mod util;
pub mod vardiff;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use job_manager::{JobManager, ShareData, ShareEvent};
pub use pool::Pool;
pub use stratum::{AuthorizeFn, AuthorizeOutcome, StratumServer};
pub use template::BlockTemplate;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
