//! TFS Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, file name codec and
//! configuration shared by the TFS client, the wire protocol and the
//! reference cluster.

pub mod checksum;
pub mod config;
pub mod error;
pub mod name;
pub mod types;

pub use checksum::{ChecksumCalculator, suffix_hash};
pub use config::{ClientConfig, LogConfig};
pub use error::{Error, ErrorCategory, Result};
pub use name::{FsName, NameKind};
pub use types::*;
