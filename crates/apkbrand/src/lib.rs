//! Rebrands a shared base APK per tenant: new launcher label, optional new
//! package identity, launcher icon and embedded credentials, then rebuilds,
//! aligns, signs, verifies and publishes it under a unique download name.
//!
//! [`pipeline::Pipeline`] is the entry point; everything else is a stage or
//! the bookkeeping around one.

pub mod apk;
pub mod cli;
pub mod config;
pub mod error;
pub mod logo;
pub mod pipeline;
pub mod process;
pub mod publisher;
pub mod registry;
pub mod rewrite;
pub mod utils;
pub mod workspace;

pub use error::{BuildError, ErrorCode};
pub use pipeline::{Outcome, Pipeline};
