//! # keel-common
//!
//! Shared types for the Keel networking stack.
//!
//! This crate provides functionality used across the Keel crates:
//! - The error taxonomy returned by every driver operation
//! - Validated network and endpoint identifiers
//! - Decoding of untyped option maps into typed configuration

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod options;

pub use error::{Disposition, ErrorKind, KeelError, KeelResult};
pub use id::{EndpointId, NetworkId};
pub use options::{OptionModel, Options, labels};
