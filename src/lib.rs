#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Stagehand
//!
//! Stage-ordered setup orchestration with supervised plugins, an in-process
//! tool bus and telemetry-driven remediation.
//!
//! This library re-exports the workspace crates and adds the pieces a host
//! application needs to start them: [`logging::init_tracing`] and the
//! [`Stagehand`] runtime that builds and injects the shared services.

pub use stagehand_core;
pub use stagehand_setup;
pub use stagehand_telemetry;
pub use stagehand_toolbus;

pub mod logging;
pub mod prelude;
pub mod runtime;

pub use runtime::Stagehand;
