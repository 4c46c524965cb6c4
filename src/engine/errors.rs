use thiserror::Error;

/// Errors that can arise while resolving, executing or persisting experience commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around JSON errors (templates, state documents).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapper around IO errors (content directories, templates).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// The experience's world template is missing or unreadable. Fatal for that experience.
    #[error("world template not found for {experience_id}: {path}")]
    TemplateNotFound { experience_id: String, path: String },

    /// A single command file could not be parsed.
    #[error("malformed command definition {file}: {reason}")]
    MalformedCommandDefinition { file: String, reason: String },

    /// Admin command attempted without admin capability.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A state mutation failed validation and was dropped.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The interpreter exhausted its retry or an admin handler failed.
    #[error("command execution failed: {detail}")]
    CommandExecutionFailed { message: String, detail: String },

    /// No experience with this id is configured.
    #[error("unknown experience: {0}")]
    UnknownExperience(String),

    /// No experience bound to the conversation and none selected.
    #[error("no experience selected")]
    ExperienceRequired,

    /// Invalid identifiers or experience configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (task join errors, poisoned locks, unexpected conditions)
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind reported in message responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Sled(_) | EngineError::Bincode(_) | EngineError::Io(_) => "storage",
            EngineError::Json(_) => "serialization",
            EngineError::NotFound(_) => "not_found",
            EngineError::SchemaMismatch { .. } => "schema_mismatch",
            EngineError::TemplateNotFound { .. } => "template_not_found",
            EngineError::MalformedCommandDefinition { .. } => "malformed_command_definition",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::CommandExecutionFailed { .. } => "command_execution_failed",
            EngineError::UnknownExperience(_) => "unknown_experience",
            EngineError::ExperienceRequired => "experience_required",
            EngineError::Config(_) => "configuration",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Configuration-level failures are surfaced to operators and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::TemplateNotFound { .. }
                | EngineError::UnknownExperience(_)
                | EngineError::Config(_)
        )
    }

    pub(crate) fn execution_failed(message: &str, detail: impl Into<String>) -> Self {
        EngineError::CommandExecutionFailed {
            message: message.to_string(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            EngineError::Forbidden("x".into()).kind(),
            "forbidden"
        );
        assert_eq!(
            EngineError::execution_failed("take lamp", "timeout").kind(),
            "command_execution_failed"
        );
        assert!(EngineError::TemplateNotFound {
            experience_id: "demo".into(),
            path: "world.json".into()
        }
        .is_configuration());
        assert!(!EngineError::InvariantViolation("gone".into()).is_configuration());
    }
}
