//! Declarative bot definitions.
//!
//! A [`BotDefinition`] is an immutable snapshot: a change on disk produces a
//! new snapshot, it never mutates the one a running bot was built from. All
//! fields except `id` have defaults so that a minimal definition is just an id
//! and a credential.

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// BotDefinition
// =============================================================================

/// Everything the orchestrator needs to build and run one bot.
#[derive(Debug, Clone, Deserialize)]
pub struct BotDefinition {
    /// Unique key across all definitions; also the definition file stem.
    pub id: String,

    /// Display name. Falls back to the id when empty.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Platform credential, after `${VAR}` substitution.
    #[serde(default, alias = "token")]
    pub credential: Credentials,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: DeliveryMode,

    /// Plugins in declaration order.
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,

    #[serde(default)]
    pub access: AccessRules,

    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
}

impl BotDefinition {
    /// Creates a minimal enabled definition with no plugins.
    pub fn new(id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            credential: Credentials::new(credential),
            enabled: true,
            mode: DeliveryMode::default(),
            plugins: Vec::new(),
            access: AccessRules::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    /// Appends a plugin spec.
    pub fn with_plugin(mut self, spec: PluginSpec) -> Self {
        self.plugins.push(spec);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Returns `true` if an enabled plugin with this name is declared.
    pub fn uses_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.enabled && p.name == name)
    }

    /// Whether switching from `previous` to `self` needs a new platform
    /// connection rather than a hot swap of the handler graph.
    pub fn requires_reconnect(&self, previous: &BotDefinition) -> bool {
        self.mode != previous.mode || self.credential != previous.credential
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Credentials
// =============================================================================

/// A platform credential.
///
/// Held as a [`SecretString`] so it never ends up in logs or `Debug` output.
/// Cloning shares the same secret allocation.
#[derive(Clone)]
pub struct Credentials(Arc<SecretString>);

impl Credentials {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::new(value.into())))
    }

    /// Returns the raw credential for handing to the messaging client.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credentials(<empty>)")
        } else {
            f.write_str("Credentials(<redacted>)")
        }
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

// =============================================================================
// DeliveryMode
// =============================================================================

/// How the platform delivers updates to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Polling,
    Webhook,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling => f.write_str("polling"),
            Self::Webhook => f.write_str("webhook"),
        }
    }
}

// =============================================================================
// PluginSpec
// =============================================================================

/// One entry of a definition's plugin list.
///
/// Accepts either a bare name (`- help`) or a table
/// (`- { name: start, depends_on: [help], config: {...} }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PluginSpecRepr")]
pub struct PluginSpec {
    pub name: String,
    pub enabled: bool,
    /// Opaque configuration handed to the plugin's factory and `on_load`.
    pub config: Map<String, Value>,
    /// Extra dependencies on top of the ones the plugin descriptor declares.
    pub depends_on: Vec<String>,
}

impl PluginSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config: Map::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PluginSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        config: Map<String, Value>,
        #[serde(default)]
        depends_on: Vec<String>,
    },
}

impl From<PluginSpecRepr> for PluginSpec {
    fn from(repr: PluginSpecRepr) -> Self {
        match repr {
            PluginSpecRepr::Name(name) => Self::named(name),
            PluginSpecRepr::Full {
                name,
                enabled,
                config,
                depends_on,
            } => Self {
                name,
                enabled,
                config,
                depends_on,
            },
        }
    }
}

// =============================================================================
// AccessRules
// =============================================================================

/// Per-bot user access lists.
///
/// User ids are compared as strings; numeric ids in the definition are
/// accepted and converted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccessRules {
    /// When non-empty, only these users may interact with the bot.
    #[serde(default, deserialize_with = "user_ids")]
    pub allowed_users: Vec<String>,
    /// Always rejected, even when also allowed.
    #[serde(default, deserialize_with = "user_ids")]
    pub blocked_users: Vec<String>,
    #[serde(default, deserialize_with = "user_ids")]
    pub admin_users: Vec<String>,
}

impl AccessRules {
    /// Returns `true` if `user_id` may interact with the bot.
    pub fn permits(&self, user_id: &str) -> bool {
        if self.blocked_users.iter().any(|u| u == user_id) {
            return false;
        }
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_users.iter().any(|u| u == user_id)
    }
}

fn user_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UserId {
        Int(i64),
        Str(String),
    }

    let ids = Vec::<UserId>::deserialize(deserializer)?;
    Ok(ids
        .into_iter()
        .map(|id| match id {
            UserId::Int(n) => n.to_string(),
            UserId::Str(s) => s,
        })
        .collect())
}

// =============================================================================
// RateLimitPolicy
// =============================================================================

/// Token-bucket policy applied per (bot, user).
///
/// `rate` tokens are refilled every `period_secs`; at most `burst` tokens are
/// held at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Optional reply sent to a user whose message was dropped.
    #[serde(default)]
    pub notice: Option<String>,
}

impl RateLimitPolicy {
    /// Tokens refilled per second.
    pub fn refill_per_sec(&self) -> f64 {
        if self.period_secs == 0 {
            return self.rate as f64;
        }
        self.rate as f64 / self.period_secs as f64
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: default_rate(),
            burst: default_burst(),
            period_secs: default_period_secs(),
            notice: None,
        }
    }
}

fn default_rate() -> u32 {
    30
}

fn default_burst() -> u32 {
    10
}

fn default_period_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_definition_gets_defaults() {
        let def: BotDefinition = serde_json::from_value(json!({
            "id": "alpha",
            "token": "123:abc",
        }))
        .unwrap();

        assert_eq!(def.display_name(), "alpha");
        assert!(def.enabled);
        assert_eq!(def.mode, DeliveryMode::Polling);
        assert_eq!(def.credential.expose(), "123:abc");
        assert_eq!(def.rate_limit.rate, 30);
        assert_eq!(def.rate_limit.burst, 10);
        assert!(def.plugins.is_empty());
    }

    #[test]
    fn test_plugin_list_accepts_names_and_tables() {
        let def: BotDefinition = serde_json::from_value(json!({
            "id": "a",
            "plugins": [
                "help",
                { "name": "start", "depends_on": ["help"], "config": { "greeting": "hi" } },
                { "name": "echo", "enabled": false },
            ],
        }))
        .unwrap();

        assert_eq!(def.plugins[0], PluginSpec::named("help"));
        assert_eq!(def.plugins[1].depends_on, vec!["help".to_string()]);
        assert_eq!(def.plugins[1].config["greeting"], json!("hi"));
        assert!(!def.plugins[2].enabled);
        assert!(def.uses_plugin("start"));
        assert!(!def.uses_plugin("echo"));
    }

    #[test]
    fn test_access_rules_accept_numeric_ids() {
        let rules: AccessRules = serde_json::from_value(json!({
            "allowed_users": [42, "7"],
            "blocked_users": [7],
            "admin_users": ["42"],
        }))
        .unwrap();

        assert!(rules.permits("42"));
        assert!(!rules.permits("7"));
        assert!(!rules.permits("99"));
        assert!(rules.is_admin("42"));
    }

    #[test]
    fn test_empty_allow_list_permits_everyone_not_blocked() {
        let rules = AccessRules {
            blocked_users: vec!["bad".into()],
            ..Default::default()
        };
        assert!(rules.permits("anyone"));
        assert!(!rules.permits("bad"));
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let def = BotDefinition::new("a", "super-secret");
        let rendered = format!("{def:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_reconnect_needed_only_for_connection_changes() {
        let old = BotDefinition::new("a", "t1");
        let mut new = old.clone().with_plugin(PluginSpec::named("help"));
        assert!(!new.requires_reconnect(&old));

        new.credential = Credentials::new("t2");
        assert!(new.requires_reconnect(&old));
    }

    #[test]
    fn test_refill_rate_per_second() {
        let policy = RateLimitPolicy {
            rate: 30,
            period_secs: 60,
            ..Default::default()
        };
        assert!((policy.refill_per_sec() - 0.5).abs() < f64::EPSILON);
    }
}
