//! `runway-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the shared error model.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ProjectId, RunId, UserId};
