//! Core domain types and traits for the Stageline pipeline runner.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Pipeline, stage and job definitions
//! - The pipeline status state machine
//! - Executor trait and job types

pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;

pub use error::{Error, Result};
pub use id::ResourceId;
