//! # TideSync Testkit
//!
//! Test utilities for TideSync.
//!
//! This crate provides:
//! - [`TestSetup`], a registered setup in a temporary directory
//! - [`TestData`] and generators for keys and objects
//! - [`CountingResolver`], which counts merge invocations
//! - [`FailingResolver`], which fails a few merges before succeeding
//! - [`LockedKeyStore`], a key store that cannot be opened
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tidesync_testkit::{generate_data, TestData, TestSetup};
//!
//! # async fn example() {
//! let setup = TestSetup::new("device-a").unwrap();
//! setup.store.save_typed(&generate_data(1)).await.unwrap();
//! assert_eq!(setup.store.count_of::<TestData>().await.unwrap(), 1);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod key_stores;
pub mod resolvers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::key_stores::*;
    pub use crate::resolvers::*;
}

pub use fixtures::*;
pub use generators::*;
pub use key_stores::*;
pub use resolvers::*;
