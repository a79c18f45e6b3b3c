//! Request validation: whitelist lookup, role sufficiency, argument checks.
//!
//! Accept or reject only. Arguments are never rewritten or sanitized: every caller
//! argument must pass both the dangerous-pattern deny-list and the command's own rule.
//! The validator does not write audit records; the gate does that with its verdict.

use std::sync::Arc;

use crate::config::ValidatorConfig;
use crate::registry::{CommandSpec, Registry};
use crate::request::{ExecutionRequest, Role};

/// Minimum deny-list: traversal, command chaining, substitution, redirection, line breaks.
const BASELINE_DENY: &[&str] = &[
    "..", ";", "|", "&", "`", "$(", "${", ">", "<", "\n", "\r", "\0",
];

/// Why a request was rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("insufficient role: {command} requires {required}, actor has {actual}")]
    InsufficientRole {
        command: String,
        required: Role,
        actual: Role,
    },
    #[error("too many arguments for {command}: {count} > {max}")]
    TooManyArguments {
        command: String,
        count: usize,
        max: usize,
    },
    #[error("dangerous pattern {pattern:?} in argument {index}")]
    DangerousPattern { index: usize, pattern: String },
    #[error("argument {index} not allowed for {command}")]
    ArgumentNotAllowed { command: String, index: usize },
}

impl ValidationError {
    /// Short machine-readable reason used in responses and audit records.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::UnknownCommand(_) => "unknown_command",
            ValidationError::InsufficientRole { .. } => "insufficient_role",
            ValidationError::TooManyArguments { .. } => "too_many_arguments",
            ValidationError::DangerousPattern { .. } => "dangerous_pattern",
            ValidationError::ArgumentNotAllowed { .. } => "argument_not_allowed",
        }
    }
}

/// Substrings that reject an argument wherever they appear.
#[derive(Debug, Clone)]
pub struct DenyList {
    patterns: Vec<String>,
}

impl Default for DenyList {
    fn default() -> Self {
        Self::baseline()
    }
}

impl DenyList {
    pub fn baseline() -> Self {
        Self {
            patterns: BASELINE_DENY.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Baseline plus configured extras; `replaceBaseline` drops the baseline (extras only).
    pub fn from_config(config: &ValidatorConfig) -> Self {
        let mut list = if config.replace_baseline {
            log::warn!("validator: baseline deny-list replaced by configuration");
            Self {
                patterns: Vec::new(),
            }
        } else {
            Self::baseline()
        };
        for p in &config.extra_deny_patterns {
            if !p.is_empty() && !list.patterns.iter().any(|q| q == p) {
                list.patterns.push(p.clone());
            }
        }
        list
    }

    /// First pattern contained in `arg`, if any.
    pub fn find(&self, arg: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| arg.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Checks requests against the registry and the deny-list.
#[derive(Debug, Clone)]
pub struct Validator {
    registry: Arc<Registry>,
    deny: DenyList,
}

impl Validator {
    pub fn new(registry: Arc<Registry>, deny: DenyList) -> Self {
        Self { registry, deny }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Authorize the request, returning the command spec it resolved to.
    ///
    /// Order: lookup, role, argument count, deny-list over every argument, then the
    /// command's allow rule. The first failure rejects the whole request.
    pub fn validate(&self, req: &ExecutionRequest) -> Result<&CommandSpec, ValidationError> {
        let spec = self
            .registry
            .get(req.command())
            .ok_or_else(|| ValidationError::UnknownCommand(req.command().to_string()))?;

        let role = req.actor().role;
        if !role.satisfies(spec.min_role) {
            return Err(ValidationError::InsufficientRole {
                command: spec.name.clone(),
                required: spec.min_role,
                actual: role,
            });
        }

        let args = req.args();
        if args.len() > spec.max_args {
            return Err(ValidationError::TooManyArguments {
                command: spec.name.clone(),
                count: args.len(),
                max: spec.max_args,
            });
        }

        for (index, arg) in args.iter().enumerate() {
            if let Some(pattern) = self.deny.find(arg) {
                return Err(ValidationError::DangerousPattern {
                    index,
                    pattern: pattern.to_string(),
                });
            }
        }

        if let Some(index) = args.iter().position(|a| !spec.arg_rule.permits(a)) {
            return Err(ValidationError::ArgumentNotAllowed {
                command: spec.name.clone(),
                index,
            });
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandDescriptor;
    use crate::request::Actor;

    fn validator() -> Validator {
        let descriptors: Vec<CommandDescriptor> = serde_json::from_str(
            r#"[
                { "name": "list-items", "binary": "echo", "minRole": "viewer", "timeoutMs": 5000,
                  "args": { "kind": "pattern", "regex": "--[a-z]+|[A-Za-z0-9_./-]+" } },
                { "name": "delete-items", "binary": "echo", "minRole": "admin",
                  "args": { "kind": "enum", "values": ["--all", "--dry-run"] } },
                { "name": "status", "binary": "echo", "minRole": "viewer" }
            ]"#,
        )
        .unwrap();
        let deny = DenyList::baseline();
        let registry = Registry::from_descriptors(&descriptors, &deny).unwrap();
        Validator::new(Arc::new(registry), deny)
    }

    fn req(role: Role, command: &str, args: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(
            Actor::new("u1", role),
            command,
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn viewer_may_list_items() {
        let v = validator();
        let spec = v.validate(&req(Role::Viewer, "list-items", &[])).unwrap();
        assert_eq!(spec.name, "list-items");
    }

    #[test]
    fn unknown_command_is_rejected() {
        let v = validator();
        assert_eq!(
            v.validate(&req(Role::Admin, "rm", &["-rf"])).unwrap_err(),
            ValidationError::UnknownCommand("rm".into())
        );
    }

    #[test]
    fn viewer_cannot_delete_items() {
        let v = validator();
        let err = v
            .validate(&req(Role::Viewer, "delete-items", &[]))
            .unwrap_err();
        assert_eq!(err.reason(), "insufficient_role");
        assert!(err.to_string().starts_with("insufficient role"));
        assert!(v.validate(&req(Role::Admin, "delete-items", &["--all"])).is_ok());
    }

    #[test]
    fn traversal_is_a_dangerous_pattern() {
        let v = validator();
        let err = v
            .validate(&req(Role::Viewer, "list-items", &["--path", "../../etc"]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DangerousPattern {
                index: 1,
                pattern: "..".into()
            }
        );
        assert!(err.to_string().starts_with("dangerous pattern"));
    }

    #[test]
    fn dangerous_patterns_rejected_for_every_command() {
        let v = validator();
        for bad in ["../x", "a;b", "`id`", "$(id)", "a|b", "a && b", "x > y", "${HOME}", "a\nb"] {
            for (role, command) in [
                (Role::Viewer, "list-items"),
                (Role::Admin, "delete-items"),
                (Role::Viewer, "status"),
            ] {
                let err = v.validate(&req(role, command, &[bad])).unwrap_err();
                assert_eq!(err.reason(), "dangerous_pattern", "{:?} via {}", bad, command);
            }
        }
    }

    #[test]
    fn arguments_outside_the_rule_are_rejected() {
        let v = validator();
        assert!(matches!(
            v.validate(&req(Role::Admin, "delete-items", &["--force"])),
            Err(ValidationError::ArgumentNotAllowed { index: 0, .. })
        ));
        assert!(matches!(
            v.validate(&req(Role::Viewer, "status", &["x"])),
            Err(ValidationError::ArgumentNotAllowed { index: 0, .. })
        ));
    }

    #[test]
    fn too_many_arguments() {
        let v = validator();
        let many: Vec<&str> = std::iter::repeat("a").take(17).collect();
        assert!(matches!(
            v.validate(&req(Role::Viewer, "list-items", &many)),
            Err(ValidationError::TooManyArguments { count: 17, max: 16, .. })
        ));
    }

    #[test]
    fn configured_patterns_extend_the_baseline() {
        let config = ValidatorConfig {
            extra_deny_patterns: vec!["--exec".into(), ";".into()],
            replace_baseline: false,
        };
        let deny = DenyList::from_config(&config);
        assert_eq!(deny.find("--exec=foo"), Some("--exec"));
        assert_eq!(deny.find("a;b"), Some(";"));
        assert_eq!(deny.patterns().iter().filter(|p| p.as_str() == ";").count(), 1);

        let only_extras = DenyList::from_config(&ValidatorConfig {
            extra_deny_patterns: vec!["--exec".into()],
            replace_baseline: true,
        });
        assert_eq!(only_extras.find("a;b"), None);
    }
}
