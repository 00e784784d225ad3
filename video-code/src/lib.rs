//! video-code library crate.
//!
//! Asynchronous orchestration of QR video encoding jobs.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod storage;

pub use error::{Error, Result};
