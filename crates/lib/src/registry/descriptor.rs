//! Command descriptor (`commands.json` / `registry.commands`) for the permitted-command catalog.
//!
//! A descriptor is the serialized form of one command: which binary runs, which leading
//! arguments are fixed, what the caller may append, who may call it, and how long it may
//! run. The registry compiles descriptors into [`super::CommandSpec`] once at startup.

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitConfig;
use crate::request::Role;

/// Root structure of a registry file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryFile {
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
}

/// One permitted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommandDescriptor {
    /// Identifier callers use (e.g. "list-items").
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Binary to run (e.g. "inventory-cli"). Resolved via PATH when it has no separator.
    pub binary: String,
    /// Arguments always passed first (e.g. the tool's subcommand). Not subject to the caller's rule.
    #[serde(default)]
    pub fixed_args: Vec<String>,
    /// What the caller may append after the fixed arguments.
    #[serde(default)]
    pub args: ArgRuleDescriptor,
    /// Upper bound on caller-supplied arguments.
    #[serde(default = "default_max_args")]
    pub max_args: usize,
    /// Minimum role; omitted means admin.
    #[serde(default)]
    pub min_role: Role,
    /// Wall-clock limit in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// When true, output may be streamed to the caller while the process runs.
    #[serde(default)]
    pub streaming: bool,
    /// Which caller arguments are masked in audit records.
    #[serde(default)]
    pub redact: RedactDescriptor,
    /// Per-command override of the global rate limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Allowed shape of each caller-supplied argument. Every argument must match as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ArgRuleDescriptor {
    /// No caller arguments at all.
    #[default]
    None,
    /// Any argument that passes the dangerous-pattern deny-list.
    Any,
    /// One of a fixed set of literal values.
    Enum { values: Vec<String> },
    /// Regular expression, implicitly anchored at both ends.
    Pattern { regex: String },
}

/// Audit redaction: flags whose value is masked, and positional indices (0-based, caller args only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedactDescriptor {
    /// e.g. ["--token"]: masks the next argument, or the value part of `--token=...`.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub positions: Vec<usize>,
    /// Mask every caller argument.
    #[serde(default)]
    pub all: bool,
}

fn default_max_args() -> usize {
    16
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_are_least_privilege() {
        let d: CommandDescriptor =
            serde_json::from_str(r#"{ "name": "x", "binary": "true" }"#).unwrap();
        assert_eq!(d.min_role, Role::Admin);
        assert_eq!(d.args, ArgRuleDescriptor::None);
        assert_eq!(d.max_args, 16);
        assert_eq!(d.timeout_ms, 30_000);
        assert!(!d.streaming);
        assert!(d.rate_limit.is_none());
    }

    #[test]
    fn parses_tagged_arg_rules() {
        let f: RegistryFile = serde_json::from_str(
            r#"{ "commands": [
                { "name": "a", "binary": "a", "args": { "kind": "enum", "values": ["x", "y"] } },
                { "name": "b", "binary": "b", "args": { "kind": "pattern", "regex": "[a-z]+" } },
                { "name": "c", "binary": "c", "args": { "kind": "any" }, "minRole": "viewer" }
            ] }"#,
        )
        .unwrap();
        assert_eq!(
            f.commands[0].args,
            ArgRuleDescriptor::Enum {
                values: vec!["x".into(), "y".into()]
            }
        );
        assert_eq!(
            f.commands[1].args,
            ArgRuleDescriptor::Pattern {
                regex: "[a-z]+".into()
            }
        );
        assert_eq!(f.commands[2].min_role, Role::Viewer);
    }

    #[test]
    fn rejects_unknown_fields() {
        let r = serde_json::from_str::<CommandDescriptor>(
            r#"{ "name": "x", "binary": "true", "shell": true }"#,
        );
        assert!(r.is_err());
    }
}
