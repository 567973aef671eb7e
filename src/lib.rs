//! Queued geocoding of tabular files.
//!
//! Clients drive projects through the [`project::ProjectStore`]; a
//! [`server::serve`] pool claims queued projects and runs their pipeline,
//! reading inputs from and writing outputs to [`storage::Storage`].

pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod kv;
pub mod monitor;
pub mod pipeline;
pub mod project;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
