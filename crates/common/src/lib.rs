pub mod artifact;
pub mod build;
pub mod environment;
pub mod error;
pub mod scope;

pub use artifact::{
    ArtifactDefinition, Checksum, ChecksumAlgorithm, PackageFormat, SourceLocation, SourceOrigin,
    DEFINITION_FILE,
};
pub use build::{BuildState, BuiltArtifact};
pub use environment::{host_architecture, EnvKey, IsolationOverride, IsolationPolicy};
pub use error::{Error, Result};
pub use scope::TokenScope;
