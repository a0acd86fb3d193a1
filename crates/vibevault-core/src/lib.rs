//! # vibevault-core
//!
//! Core types, traits, and abstractions for the VibeVault link-enrichment
//! pipeline.
//!
//! This crate provides the data structures and repository traits the other
//! VibeVault crates depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;
pub mod url_utils;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, FetchError, Result};
pub use models::*;
pub use traits::*;
pub use url_utils::{extract_domain, normalize_url, parse_link_url};
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};
