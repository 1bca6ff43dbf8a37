//! Configuration module for the driftless engine.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `driftless.yaml`
//! - Validation of declared resources
//! - Computing attribute hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DriftlessConfig, ExecutionConfig, PlaceholderPolicy, ProjectConfig, ProviderConfig,
    StateBackend, StateConfig, DEFAULT_TOKEN_ENV,
};
pub use parser::{find_config_file, ConfigParser, CONFIG_ENV, DEFAULT_CONFIG_FILES};
pub use validator::{is_placeholder, ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
