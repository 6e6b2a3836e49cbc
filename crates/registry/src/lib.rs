//! Fatbuildr artifact registry
//!
//! Publishes signed build artifacts per format and distribution, and guards
//! access to the registry and the build service with scoped API tokens.

pub mod models;
pub mod publisher;
pub mod tokens;

pub use models::{BuildResult, Manifest, PublishedFile, RegistryAccess, RegistryEntry};
pub use publisher::Publisher;
pub use tokens::{IssuedToken, TokenRecord, TokenStore};
