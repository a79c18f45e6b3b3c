//! Command registry: the immutable catalog of permitted commands.
//!
//! Built once at startup from descriptors (config `registry.commands` and the optional
//! `registry.file`), then shared as `Arc<Registry>` and only ever read. A command that
//! is not in the registry cannot be executed.

mod descriptor;
mod loader;

pub use descriptor::{ArgRuleDescriptor, CommandDescriptor, RedactDescriptor, RegistryFile};
pub use loader::{load_registry, load_registry_file};

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::ratelimit::RateLimitConfig;
use crate::request::Role;
use crate::validator::DenyList;

/// Placeholder written in place of masked arguments.
pub const REDACTED: &str = "[REDACTED]";

/// Errors raised while compiling descriptors into a registry. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("command name must not be empty")]
    EmptyName,
    #[error("command {0}: binary must not be empty")]
    EmptyBinary(String),
    #[error("duplicate command: {0}")]
    Duplicate(String),
    #[error("command {command}: invalid argument pattern: {source}")]
    InvalidPattern {
        command: String,
        #[source]
        source: regex::Error,
    },
    #[error("command {0}: timeoutMs must be greater than zero")]
    ZeroTimeout(String),
    #[error("command {command}: fixed argument {index} contains dangerous pattern {pattern:?}")]
    DangerousFixedArg {
        command: String,
        index: usize,
        pattern: String,
    },
    #[error("command {command}: invalid rate limit: {reason}")]
    InvalidRateLimit { command: String, reason: String },
}

/// Compiled caller-argument rule.
#[derive(Debug, Clone)]
pub enum ArgRule {
    None,
    Any,
    Enum(Vec<String>),
    Pattern(Regex),
}

impl ArgRule {
    fn compile(command: &str, d: &ArgRuleDescriptor) -> Result<Self, RegistryError> {
        Ok(match d {
            ArgRuleDescriptor::None => ArgRule::None,
            ArgRuleDescriptor::Any => ArgRule::Any,
            ArgRuleDescriptor::Enum { values } => ArgRule::Enum(values.clone()),
            ArgRuleDescriptor::Pattern { regex } => {
                let anchored = format!("^(?:{})$", regex);
                let re = Regex::new(&anchored).map_err(|source| RegistryError::InvalidPattern {
                    command: command.to_string(),
                    source,
                })?;
                ArgRule::Pattern(re)
            }
        })
    }

    /// True when `arg` is an acceptable caller argument under this rule.
    pub fn permits(&self, arg: &str) -> bool {
        match self {
            ArgRule::None => false,
            ArgRule::Any => true,
            ArgRule::Enum(values) => values.iter().any(|v| v == arg),
            ArgRule::Pattern(re) => re.is_match(arg),
        }
    }
}

/// Which caller arguments are masked before they reach the audit trail.
#[derive(Debug, Clone, Default)]
pub struct Redaction {
    flags: Vec<String>,
    positions: HashSet<usize>,
    all: bool,
}

impl Redaction {
    fn from_descriptor(d: &RedactDescriptor) -> Self {
        Self {
            flags: d.flags.clone(),
            positions: d.positions.iter().copied().collect(),
            all: d.all,
        }
    }

    /// Mask everything.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Return a copy of `args` with sensitive values replaced by [`REDACTED`].
    pub fn apply(&self, args: &[String]) -> Vec<String> {
        if self.all {
            return args.iter().map(|_| REDACTED.to_string()).collect();
        }
        let mut out = Vec::with_capacity(args.len());
        let mut mask_next = false;
        for (i, arg) in args.iter().enumerate() {
            if mask_next || self.positions.contains(&i) {
                out.push(REDACTED.to_string());
                mask_next = false;
                continue;
            }
            if let Some(flag) = self.flags.iter().find(|f| arg.starts_with(f.as_str())) {
                let rest = &arg[flag.len()..];
                if rest.is_empty() {
                    out.push(arg.clone());
                    mask_next = true;
                    continue;
                }
                if rest.starts_with('=') {
                    out.push(format!("{}={}", flag, REDACTED));
                    continue;
                }
            }
            out.push(arg.clone());
        }
        out
    }
}

/// Static definition of one permitted command. Never mutated after load.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: Option<String>,
    pub binary: String,
    pub fixed_args: Vec<String>,
    pub arg_rule: ArgRule,
    pub max_args: usize,
    pub min_role: Role,
    pub timeout: Duration,
    pub streaming: bool,
    pub redaction: Redaction,
    pub rate_limit: Option<RateLimitConfig>,
}

impl CommandSpec {
    fn compile(d: &CommandDescriptor, deny: &DenyList) -> Result<Self, RegistryError> {
        let name = d.name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if d.binary.trim().is_empty() {
            return Err(RegistryError::EmptyBinary(name.to_string()));
        }
        if d.timeout_ms == 0 {
            return Err(RegistryError::ZeroTimeout(name.to_string()));
        }
        for (index, arg) in d.fixed_args.iter().enumerate() {
            if let Some(pattern) = deny.find(arg) {
                return Err(RegistryError::DangerousFixedArg {
                    command: name.to_string(),
                    index,
                    pattern: pattern.to_string(),
                });
            }
        }
        if let Some(rl) = &d.rate_limit {
            rl.validate().map_err(|reason| RegistryError::InvalidRateLimit {
                command: name.to_string(),
                reason,
            })?;
        }
        Ok(Self {
            name: name.to_string(),
            description: d.description.clone(),
            binary: d.binary.trim().to_string(),
            fixed_args: d.fixed_args.clone(),
            arg_rule: ArgRule::compile(name, &d.args)?,
            max_args: d.max_args,
            min_role: d.min_role,
            timeout: Duration::from_millis(d.timeout_ms),
            streaming: d.streaming,
            redaction: Redaction::from_descriptor(&d.redact),
            rate_limit: d.rate_limit.clone(),
        })
    }
}

/// Immutable, name-keyed catalog of command specs. Lookups need no synchronization.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    commands: BTreeMap<String, CommandSpec>,
}

impl Registry {
    /// Compile descriptors. Fails on the first invalid or duplicate entry.
    pub fn from_descriptors(
        descriptors: &[CommandDescriptor],
        deny: &DenyList,
    ) -> Result<Self, RegistryError> {
        let mut commands = BTreeMap::new();
        for d in descriptors {
            let spec = CommandSpec::compile(d, deny)?;
            if commands.contains_key(&spec.name) {
                return Err(RegistryError::Duplicate(spec.name));
            }
            commands.insert(spec.name.clone(), spec);
        }
        Ok(Self { commands })
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// Command names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: &str) -> CommandDescriptor {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn pattern_rule_is_anchored() {
        let d = descriptor(
            r#"{ "name": "get", "binary": "tool", "args": { "kind": "pattern", "regex": "[0-9]+" } }"#,
        );
        let spec = CommandSpec::compile(&d, &DenyList::baseline()).unwrap();
        assert!(spec.arg_rule.permits("42"));
        assert!(!spec.arg_rule.permits("42abc"));
        assert!(!spec.arg_rule.permits("x42"));
    }

    #[test]
    fn none_rule_rejects_every_argument() {
        assert!(!ArgRule::None.permits(""));
        assert!(!ArgRule::None.permits("anything"));
    }

    #[test]
    fn rejects_duplicates_and_bad_entries() {
        let deny = DenyList::baseline();
        let a = descriptor(r#"{ "name": "a", "binary": "x" }"#);
        let err = Registry::from_descriptors(&[a.clone(), a], &deny).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(n) if n == "a"));

        let bad_re = descriptor(
            r#"{ "name": "b", "binary": "x", "args": { "kind": "pattern", "regex": "(" } }"#,
        );
        assert!(matches!(
            Registry::from_descriptors(&[bad_re], &deny),
            Err(RegistryError::InvalidPattern { .. })
        ));

        let zero = descriptor(r#"{ "name": "c", "binary": "x", "timeoutMs": 0 }"#);
        assert!(matches!(
            Registry::from_descriptors(&[zero], &deny),
            Err(RegistryError::ZeroTimeout(_))
        ));

        let fixed = descriptor(r#"{ "name": "d", "binary": "x", "fixedArgs": ["a;b"] }"#);
        assert!(matches!(
            Registry::from_descriptors(&[fixed], &deny),
            Err(RegistryError::DangerousFixedArg { index: 0, .. })
        ));
    }

    #[test]
    fn redaction_masks_flags_positions_and_inline_values() {
        let r = Redaction::from_descriptor(&RedactDescriptor {
            flags: vec!["--token".into()],
            positions: vec![0],
            all: false,
        });
        let args: Vec<String> = ["secret-id", "--token", "abc", "--token=xyz", "--name", "n"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            r.apply(&args),
            vec![
                REDACTED,
                "--token",
                REDACTED,
                "--token=[REDACTED]",
                "--name",
                "n"
            ]
        );
        assert_eq!(Redaction::all().apply(&args[..2]), vec![REDACTED, REDACTED]);
    }

    #[test]
    fn names_are_sorted() {
        let deny = DenyList::baseline();
        let reg = Registry::from_descriptors(
            &[
                descriptor(r#"{ "name": "zeta", "binary": "x" }"#),
                descriptor(r#"{ "name": "alpha", "binary": "x" }"#),
            ],
            &deny,
        )
        .unwrap();
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
        assert_eq!(reg.len(), 2);
    }
}
