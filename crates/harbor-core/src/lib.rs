//! Core types and utilities for harbor.
//!
//! This crate provides the foundational types used throughout the harbor
//! app orchestrator:
//!
//! - **Identifiers**: validated application names and the host identifier
//! - **Host identity**: the host's derived DNS domain
//! - **Host size**: the ordinal size scale applications declare minimums against
//! - **Error types**: parse errors for the types above
//!
//! # Example
//!
//! ```
//! use harbor_core::{AppName, HostIdentity, HostSize};
//!
//! let name = AppName::new("filebrowser").unwrap();
//! assert_eq!(name.as_str(), "filebrowser");
//!
//! let identity = HostIdentity::derive(b"host public key", "harbor.example");
//! assert!(identity.domain().ends_with(".harbor.example"));
//!
//! assert!(HostSize::Xs < HostSize::L);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod ids;
pub mod size;

pub use error::{CoreError, Result};
pub use identity::HostIdentity;
pub use ids::{AppName, HostId, IdError};
pub use size::HostSize;
