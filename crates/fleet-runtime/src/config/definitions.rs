//! Bot definition sources.
//!
//! [`FsDefinitionSource`] reads one file per bot from a directory:
//!
//! ```text
//! bots/
//! ├── _defaults.yaml   shared fragment merged under every definition
//! ├── support.yaml     id: support
//! └── sales.toml       id: sales
//! ```
//!
//! Every string value may reference the environment as `${VAR}` or
//! `${VAR:-fallback}`. An unset variable without a fallback becomes an empty
//! string. Substitution runs on the parsed document, before the typed
//! definition is extracted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use figment::Figment;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

use fleet_core::BotDefinition;

use super::loader::merge_config_file;
use super::validation::validate_definition;
use crate::error::{ConfigError, ConfigResult};

/// Where the orchestrator gets definitions from.
pub trait DefinitionSource: Send + Sync {
    /// Reads the current definition for `bot_id`. `Ok(None)` means the
    /// definition no longer exists.
    fn load(&self, bot_id: &str) -> ConfigResult<Option<BotDefinition>>;

    /// Every id the source currently defines, sorted.
    fn list_ids(&self) -> ConfigResult<Vec<String>>;
}

// =============================================================================
// Environment substitution
// =============================================================================

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

/// Replaces `${VAR}` / `${VAR:-fallback}` in one string using `lookup`.
pub fn substitute_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_REF
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(fallback)) => fallback.as_str().to_string(),
                (None, None) => {
                    warn!(variable = name, "Environment variable not set, substituting empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Applies [`substitute_with`] to every string in `value`, recursively.
pub fn substitute_env(value: &mut Value) {
    substitute_value(value, &|name| std::env::var(name).ok());
}

fn substitute_value(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) if s.contains("${") => *s = substitute_with(s, lookup),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_value(v, lookup)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_value(v, lookup)),
        _ => {}
    }
}

// =============================================================================
// FsDefinitionSource
// =============================================================================

const SHARED_STEM: &str = "_defaults";

fn supported_extensions() -> &'static [&'static str] {
    &[
        #[cfg(feature = "yaml-config")]
        "yaml",
        #[cfg(feature = "yaml-config")]
        "yml",
        #[cfg(feature = "toml-config")]
        "toml",
    ]
}

/// Returns `true` for editor swap files, hidden files and the like.
pub fn is_ignored_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.starts_with('.') || name.ends_with('~') || name.ends_with(".swp") || name.ends_with(".tmp")
}

/// `true` for files in the definitions directory whose name starts with `_`;
/// they are merged into, or shared by, every definition.
pub fn is_shared_fragment(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_'))
}

#[derive(Debug, Clone)]
pub struct FsDefinitionSource {
    dir: PathBuf,
}

impl FsDefinitionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The definition file for `bot_id`, if one exists.
    pub fn definition_path(&self, bot_id: &str) -> Option<PathBuf> {
        supported_extensions()
            .iter()
            .map(|ext| self.dir.join(format!("{bot_id}.{ext}")))
            .find(|p| p.is_file())
    }

    /// Maps a changed path to the bot id it defines.
    pub fn bot_id_for(&self, path: &Path) -> Option<String> {
        if is_ignored_file(path) || is_shared_fragment(path) {
            return None;
        }
        let ext = path.extension()?.to_str()?;
        if !supported_extensions().contains(&ext) {
            return None;
        }
        path.file_stem()?.to_str().map(str::to_string)
    }

    fn shared_path(&self) -> Option<PathBuf> {
        supported_extensions()
            .iter()
            .map(|ext| self.dir.join(format!("{SHARED_STEM}.{ext}")))
            .find(|p| p.is_file())
    }

    fn read(&self, bot_id: &str, path: &Path) -> ConfigResult<BotDefinition> {
        let mut figment = Figment::new();
        if let Some(shared) = self.shared_path() {
            figment = merge_config_file(figment, &shared)?;
        }
        figment = merge_config_file(figment, path)?;

        let mut value: Value = figment.extract()?;
        let Value::Object(map) = &mut value else {
            return Err(ConfigError::Parse(format!(
                "{}: expected a mapping at the top level",
                path.display()
            )));
        };
        map.entry("id")
            .or_insert_with(|| Value::String(bot_id.to_string()));

        substitute_env(&mut value);
        let def: BotDefinition = serde_json::from_value(value)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        validate_definition(&def, Some(bot_id))?;
        Ok(def)
    }
}

impl DefinitionSource for FsDefinitionSource {
    fn load(&self, bot_id: &str) -> ConfigResult<Option<BotDefinition>> {
        let Some(path) = self.definition_path(bot_id) else {
            debug!(bot_id, dir = %self.dir.display(), "No definition file");
            return Ok(None);
        };
        self.read(bot_id, &path).map(Some)
    }

    fn list_ids(&self) -> ConfigResult<Vec<String>> {
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "Definitions directory does not exist");
            return Ok(Vec::new());
        }
        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file()
                && let Some(id) = self.bot_id_for(&path)
            {
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().collect())
    }
}
