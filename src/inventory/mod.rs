// Host resolution: turn env=/hosts=/host= selectors into concrete targets

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::output::errors::PfError;

/// Entry that selects the local machine instead of an SSH host
pub const LOCAL_ENTRY: &str = "@local";

/// Default SSH port for entries without one
pub const DEFAULT_PORT: u16 = 22;

/// One execution destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Local,
    Remote { user: String, host: String, port: u16 },
}

impl Target {
    pub fn remote(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Target::Remote {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }

    /// Stable identifier used to prefix this target's output lines
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "{}", LOCAL_ENTRY),
            Target::Remote { user, host, port } => write!(f, "{}@{}:{}", user, host, port),
        }
    }
}

/// An alias value: either a list of entries or one comma-separated string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AliasValue {
    List(Vec<String>),
    Csv(String),
}

impl AliasValue {
    /// Flatten into individual host entries
    pub fn entries(&self) -> Vec<String> {
        match self {
            AliasValue::List(items) => items.iter().flat_map(|s| split_csv(s)).collect(),
            AliasValue::Csv(csv) => split_csv(csv),
        }
    }
}

/// Static alias table mapping an environment name to host entries
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct EnvAliases(IndexMap<String, AliasValue>);

impl EnvAliases {
    pub fn new() -> Self {
        EnvAliases(IndexMap::new())
    }

    pub fn with_alias(mut self, name: impl Into<String>, value: AliasValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AliasValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AliasValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for EnvAliases {
    /// Only the `local` alias
    fn default() -> Self {
        EnvAliases::new().with_alias("local", AliasValue::List(vec![LOCAL_ENTRY.to_string()]))
    }
}

/// A host selection token from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSelector {
    /// `env=<alias>`
    Env(String),
    /// `hosts=<csv>`
    Hosts(String),
    /// `host=<entry>`
    Host(String),
}

impl HostSelector {
    /// Recognize `env=`, `hosts=` and `host=` tokens
    pub fn parse(token: &str) -> Option<Self> {
        let (key, value) = token.split_once('=')?;
        match key {
            "env" => Some(HostSelector::Env(value.trim().to_string())),
            "hosts" => Some(HostSelector::Hosts(value.to_string())),
            "host" => Some(HostSelector::Host(value.trim().to_string())),
            _ => None,
        }
    }
}

/// Fallbacks for entries that omit the user or port
///
/// The default user is the invoking login; `None` makes bare hosts an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDefaults {
    pub user: Option<String>,
    pub port: u16,
}

impl Default for HostDefaults {
    fn default() -> Self {
        HostDefaults {
            user: Some(login_user(|key| std::env::var(key).ok())),
            port: DEFAULT_PORT,
        }
    }
}

/// `$USER`, then `$LOGNAME`, then `root`
fn login_user(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|key| lookup(key))
        .find(|user| !user.trim().is_empty())
        .unwrap_or_else(|| "root".to_string())
}

/// Resolves selectors against an injected alias table
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    aliases: EnvAliases,
    defaults: HostDefaults,
}

impl HostResolver {
    pub fn new(aliases: EnvAliases) -> Self {
        HostResolver {
            aliases,
            defaults: HostDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: HostDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn aliases(&self) -> &EnvAliases {
        &self.aliases
    }

    /// Expand selectors into a deduplicated, order-preserving target list
    pub fn resolve(&self, selectors: &[HostSelector]) -> Result<Vec<Target>, PfError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for selector in selectors {
            let entries = match selector {
                HostSelector::Env(alias) => self
                    .aliases
                    .get(alias)
                    .ok_or_else(|| PfError::HostResolution {
                        entry: format!("env={}", alias),
                        message: format!("unknown environment '{}'", alias),
                        suggestion: Some(self.known_aliases_hint()),
                    })?
                    .entries(),
                HostSelector::Hosts(csv) => split_csv(csv),
                HostSelector::Host(entry) => vec![entry.clone()],
            };

            for entry in entries {
                let target = self.parse_entry(&entry)?;
                if seen.insert(target.clone()) {
                    targets.push(target);
                } else {
                    debug!(target = %target, "dropping duplicate target");
                }
            }
        }

        if targets.is_empty() {
            return Err(PfError::NoTargets);
        }

        Ok(targets)
    }

    /// Parse `user@host:port`, `user@host`, `host` or `@local`
    pub fn parse_entry(&self, entry: &str) -> Result<Target, PfError> {
        let entry = entry.trim();
        if entry == LOCAL_ENTRY {
            return Ok(Target::Local);
        }

        let invalid = |message: &str| PfError::HostResolution {
            entry: entry.to_string(),
            message: message.to_string(),
            suggestion: Some("Use user@host:port, user@host or @local".to_string()),
        };

        let (user, rest) = match entry.split_once('@') {
            Some((user, rest)) => (Some(user), rest),
            None => (None, entry),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| invalid("invalid port"))?;
                (host, port)
            }
            None => (rest, self.defaults.port),
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid("missing host name"));
        }

        let user = match user {
            Some("") => return Err(invalid("empty user name")),
            Some(user) => user.to_string(),
            None => self
                .defaults
                .user
                .clone()
                .ok_or_else(|| invalid("no user given and no default user configured"))?,
        };

        Ok(Target::remote(user, host, port))
    }

    fn known_aliases_hint(&self) -> String {
        let names: Vec<&str> = self.aliases.iter().map(|(k, _)| k).collect();
        if names.is_empty() {
            "No environments are configured".to_string()
        } else {
            format!("Known environments: {}", names.join(", "))
        }
    }
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
