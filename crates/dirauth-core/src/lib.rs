//! # dirauth-core
//!
//! Core types shared by the directory authentication crates.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy separating directory outages from rejected credentials

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
