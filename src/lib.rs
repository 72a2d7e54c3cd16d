//! # kwaai-core
//!
//! Root crate that re-exports the workspace's model-weight loading crate.
//!
//! ## Crates
//!
//! - [`kwaai_inference`]: GPU-resident model weight loading pipeline plus
//!   the simple GGUF/SafeTensors convenience loaders it builds on.

pub use kwaai_inference as inference;

/// KwaaiNet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
