//! Process configuration and bot definitions.
//!
//! - [`FleetConfig`]: the process-wide settings, loaded by [`ConfigLoader`]
//! - [`DefinitionSource`]: where bot definitions come from;
//!   [`FsDefinitionSource`] reads one file per bot from a directory

pub mod definitions;
pub mod loader;
pub mod schema;
pub mod validation;

pub use definitions::{
    DefinitionSource, FsDefinitionSource, is_ignored_file, is_shared_fragment, substitute_env,
};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    FleetConfig, LifecycleConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, PathsConfig,
    PluginsConfig, RateLimitConfig, SpanEventConfig, SupervisorConfig, WatcherConfig,
};
pub use validation::{validate_config, validate_definition, validate_definitions};
