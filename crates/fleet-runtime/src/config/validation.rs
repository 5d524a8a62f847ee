//! Configuration and definition validation.

use std::collections::HashSet;

use fleet_core::{BotDefinition, RateLimitPolicy};

use super::schema::{FleetConfig, LogOutput};
use crate::error::{ConfigError, ConfigResult};

/// Validates the process configuration.
pub fn validate_config(config: &FleetConfig) -> ConfigResult<()> {
    let supervisor = &config.supervisor;
    if supervisor.base_delay_ms == 0 {
        return Err(ConfigError::validation(
            "supervisor.base_delay_ms must be greater than 0",
        ));
    }
    if supervisor.max_delay_ms < supervisor.base_delay_ms {
        return Err(ConfigError::validation(
            "supervisor.max_delay_ms must be at least supervisor.base_delay_ms",
        ));
    }
    if supervisor.max_attempts == 0 {
        return Err(ConfigError::validation(
            "supervisor.max_attempts must be at least 1",
        ));
    }
    if supervisor.window_secs == 0 {
        return Err(ConfigError::validation(
            "supervisor.window_secs must be greater than 0",
        ));
    }

    if config.lifecycle.drain_timeout_ms == 0 || config.lifecycle.stop_grace_ms == 0 {
        return Err(ConfigError::validation(
            "lifecycle timeouts must be greater than 0",
        ));
    }

    if config.watcher.debounce_ms == 0 {
        return Err(ConfigError::validation(
            "watcher.debounce_ms must be greater than 0",
        ));
    }

    if config.logging.output == LogOutput::File && config.logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is 'file'",
        ));
    }

    Ok(())
}

/// Validates one bot definition.
///
/// When `file_stem` is given the definition's id must equal it.
pub fn validate_definition(def: &BotDefinition, file_stem: Option<&str>) -> ConfigResult<()> {
    if def.id.is_empty() {
        return Err(ConfigError::validation("bot id must not be empty"));
    }
    if def.id.chars().any(char::is_whitespace) {
        return Err(ConfigError::validation(format!(
            "bot id '{}' must not contain whitespace",
            def.id
        )));
    }
    if def.id.starts_with(['_', '.']) {
        return Err(ConfigError::validation(format!(
            "bot id '{}' must not start with '_' or '.'",
            def.id
        )));
    }
    if let Some(stem) = file_stem
        && stem != def.id
    {
        return Err(ConfigError::validation(format!(
            "bot id '{}' does not match its file name '{stem}'",
            def.id
        )));
    }

    let mut seen = HashSet::new();
    for spec in &def.plugins {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::validation(format!(
                "bot '{}' declares a plugin with an empty name",
                def.id
            )));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::validation(format!(
                "bot '{}' declares plugin '{}' more than once",
                def.id, spec.name
            )));
        }
    }

    validate_rate_limit(&def.id, &def.rate_limit)
}

fn validate_rate_limit(bot_id: &str, policy: &RateLimitPolicy) -> ConfigResult<()> {
    if !policy.enabled {
        return Ok(());
    }
    if policy.rate == 0 || policy.burst == 0 || policy.period_secs == 0 {
        return Err(ConfigError::validation(format!(
            "bot '{bot_id}': rate_limit rate, burst and period_secs must be greater than 0"
        )));
    }
    Ok(())
}

/// Validates a set of definitions, including id uniqueness.
pub fn validate_definitions<'a, I>(defs: I) -> ConfigResult<()>
where
    I: IntoIterator<Item = &'a BotDefinition>,
{
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.id.as_str()) {
            return Err(ConfigError::DuplicateBotId(def.id.clone()));
        }
        validate_definition(def, None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::PluginSpec;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&FleetConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_supervisor_settings() {
        let mut config = FleetConfig::default();
        config.supervisor.max_delay_ms = 10;
        assert!(validate_config(&config).is_err());

        let mut config = FleetConfig::default();
        config.supervisor.max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_file_output_requires_path() {
        let mut config = FleetConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_definition_id_rules() {
        let def = BotDefinition::new("support bot", "t");
        assert!(validate_definition(&def, None).is_err());

        let def = BotDefinition::new("support", "t");
        assert!(validate_definition(&def, Some("support")).is_ok());
        assert!(validate_definition(&def, Some("sales")).is_err());
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let def = BotDefinition::new("a", "t")
            .with_plugin(PluginSpec::named("help"))
            .with_plugin(PluginSpec::named("help"));
        assert!(validate_definition(&def, None).is_err());
    }

    #[test]
    fn test_zero_burst_rejected_unless_disabled() {
        let mut def = BotDefinition::new("a", "t");
        def.rate_limit.burst = 0;
        assert!(validate_definition(&def, None).is_err());

        def.rate_limit.enabled = false;
        assert!(validate_definition(&def, None).is_ok());
    }

    #[test]
    fn test_duplicate_bot_ids() {
        let defs = [BotDefinition::new("a", "t"), BotDefinition::new("a", "u")];
        assert!(matches!(
            validate_definitions(&defs),
            Err(ConfigError::DuplicateBotId(id)) if id == "a"
        ));
    }
}
