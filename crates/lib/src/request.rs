//! Request-side types: actors, the role hierarchy, and the immutable execution request.
//!
//! The identity collaborator supplies `(actor id, role)` after authentication; this crate
//! trusts that tuple as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of an actor. Ordered: a higher role satisfies every requirement of a lower one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only operations.
    Viewer,
    /// Day-to-day mutations.
    Operator,
    /// Everything, including destructive commands. Default minimum for commands that omit `minRole`.
    #[default]
    Admin,
}

impl Role {
    /// True when an actor holding `self` may run a command that requires `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Authenticated identity on whose behalf a command is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// One invocation request. Fields are private so the request cannot change once built;
/// `with_correlation_id` consumes the value and is meant for construction time only.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: String,
    actor: Actor,
    command: String,
    args: Vec<String>,
    submitted_at: DateTime<Utc>,
    correlation_id: String,
}

impl ExecutionRequest {
    /// Build a request with a fresh id. The correlation id defaults to the request id.
    pub fn new(actor: Actor, command: impl Into<String>, args: Vec<String>) -> Self {
        let id = format!("req-{}", uuid::Uuid::new_v4());
        Self {
            correlation_id: id.clone(),
            id,
            actor,
            command: command.into(),
            args,
            submitted_at: Utc::now(),
        }
    }

    /// Attach the caller's tracing id (ignored when blank).
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let c = correlation_id.into();
        let c = c.trim();
        if !c.is_empty() {
            self.correlation_id = c.to_string();
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_roles_satisfy_lower_requirements_only() {
        assert!(Role::Admin.satisfies(Role::Viewer));
        assert!(Role::Admin.satisfies(Role::Operator));
        assert!(Role::Operator.satisfies(Role::Viewer));
        assert!(Role::Viewer.satisfies(Role::Viewer));
        assert!(!Role::Viewer.satisfies(Role::Operator));
        assert!(!Role::Operator.satisfies(Role::Admin));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Viewer".parse::<Role>(), Ok(Role::Viewer));
        assert_eq!(" ADMIN ".parse::<Role>(), Ok(Role::Admin));
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn correlation_id_defaults_to_request_id() {
        let req = ExecutionRequest::new(Actor::new("u1", Role::Viewer), "list-items", vec![]);
        assert!(req.id().starts_with("req-"));
        assert_eq!(req.correlation_id(), req.id());

        let req = req.with_correlation_id("trace-42");
        assert_eq!(req.correlation_id(), "trace-42");

        let req = req.with_correlation_id("   ");
        assert_eq!(req.correlation_id(), "trace-42");
    }
}
