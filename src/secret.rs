//! Origin secret configuration and per-host resolution.

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

///
/// Reference to an origin certificate secret, written as `<namespace>/<name>`.
///
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for SecretRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(SecretRef::new(namespace, name))
            }
            _ => Err(Error::InvalidSecretRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for SecretRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SecretRef> for String {
    fn from(value: SecretRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

///
/// A set of host rules that share one origin secret. A rule is either an exact host name or
/// a wildcard of the form `*.example.com`, which matches any name below `example.com`.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretGroup {
    pub hosts: Vec<String>,
    pub secret: SecretRef,
}

///
/// The origin secret configuration file.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginSecrets {
    #[serde(default)]
    pub groups: Vec<SecretGroup>,
}

impl OriginSecrets {
    pub fn from_yaml(source: &str) -> Result<Self> {
        let secrets: OriginSecrets = serde_yaml::from_str(source)?;
        for group in &secrets.groups {
            if group.hosts.is_empty() {
                return Err(Error::ConfigError(format!(
                    "secret group for `{}` does not list any hosts",
                    group.secret
                )));
            }
            for host in &group.hosts {
                HostRule::parse(host)?;
            }
        }
        Ok(secrets)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostRule {
    Exact(String),
    /// Holds the parent domain, without the leading `*.`.
    Wildcard(String),
}

impl HostRule {
    fn parse(rule: &str) -> Result<Self> {
        let rule = normalize_host(rule);
        if let Some(parent) = rule.strip_prefix("*.") {
            if parent.is_empty() || parent.contains('*') {
                return Err(Error::ConfigError(format!("invalid wildcard host rule `{rule}`")));
            }
            return Ok(HostRule::Wildcard(parent.to_string()));
        }
        if rule.is_empty() || rule.contains('*') {
            return Err(Error::ConfigError(format!("invalid host rule `{rule}`")));
        }
        Ok(HostRule::Exact(rule))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

///
/// Picks the origin secret for a host.
///
/// Exact rules are consulted first across all groups, then wildcard rules (the longest
/// matching parent domain wins, ties go to the earlier group), then the default secret.
///
#[derive(Clone, Debug, Default)]
pub struct SecretResolver {
    groups: Vec<(Vec<HostRule>, SecretRef)>,
    default: Option<SecretRef>,
}

impl SecretResolver {
    pub fn new(groups: &[SecretGroup], default: Option<SecretRef>) -> Result<Self> {
        let groups = groups
            .iter()
            .map(|g| {
                let rules = g.hosts.iter().map(|h| HostRule::parse(h)).collect::<Result<Vec<_>>>()?;
                Ok((rules, g.secret.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { groups, default })
    }

    pub fn resolve(&self, host: &str) -> Result<&SecretRef> {
        let host = normalize_host(host);

        let exact = self.groups.iter().find(|(rules, _)| {
            rules
                .iter()
                .any(|rule| matches!(rule, HostRule::Exact(exact) if *exact == host))
        });
        if let Some((_, secret)) = exact {
            return Ok(secret);
        }

        let mut best: Option<(usize, &SecretRef)> = None;
        for (rules, secret) in &self.groups {
            for rule in rules {
                let HostRule::Wildcard(parent) = rule else {
                    continue;
                };
                let below_parent = host
                    .strip_suffix(parent.as_str())
                    .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'));
                if below_parent && best.is_none_or(|(len, _)| parent.len() > len) {
                    best = Some((parent.len(), secret));
                }
            }
        }
        if let Some((_, secret)) = best {
            return Ok(secret);
        }

        self.default.as_ref().ok_or(Error::NoOriginSecret { host })
    }

    /// Returns true if `secret` is the default secret or belongs to a group.
    pub fn references(&self, secret: &SecretRef) -> bool {
        self.default.as_ref() == Some(secret) || self.groups.iter().any(|(_, s)| s == secret)
    }
}
