//! # Kedge Platform
//!
//! Core platform types for the Kedge secure-transport stack.
//!
//! This crate provides the unified error types (`KedgeError`, `KedgeResult`)
//! shared by every Kedge crate.
//!
//! # Examples
//!
//! ```
//! use kedge_platform::{KedgeError, KedgeResult};
//!
//! fn example_function() -> KedgeResult<String> {
//!     Ok("Hello, Kedge!".to_string())
//! }
//!
//! # fn main() -> KedgeResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Kedge!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KedgeError, KedgeResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
