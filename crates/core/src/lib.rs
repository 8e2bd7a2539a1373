#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! Shared foundations for the stagehand workspace: the core error type,
//! layered configuration and JSON helpers.

pub mod config;
pub mod error;
pub mod json;
pub mod result;

pub use config::{Config, load_config};
pub use error::Error;
pub use json::JsonMap;
pub use result::{Result, ResultExt};
