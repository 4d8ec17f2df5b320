use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{ExecutionError, ExecutionErrorKind};

/// The database could not be reached or refused the credentials.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("missing connection field: {0}")]
    MissingField(&'static str),
    #[error("connection timed out after {0}s")]
    Timeout(u64),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("failed to connect to PostgreSQL: {0}")]
    Database(String),
}

/// A catalog query failed while building the schema snapshot.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to read schema `{namespace}`: {message}")]
pub struct IntrospectionError {
    pub namespace: String,
    pub message: String,
}

/// The language-model call itself failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned no content")]
    EmptyResponse,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error("model response is not a usable query ({reason}): {response}")]
    Malformed { reason: String, response: String },
    #[error("generated SQL could not be parsed: {0}")]
    Unparseable(String),
    #[error("generated SQL contains {0} statements, expected exactly one")]
    MultipleStatements(usize),
    #[error("generated SQL references unknown relation \"{0}\"")]
    UnknownIdentifier(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NarrationError {
    #[error("could not narrate the result: {0}")]
    Model(#[from] LlmError),
}

/// Every way a turn can fail, as seen by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("request is empty")]
    EmptyRequest,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Narration(#[from] NarrationError),
}

/// Serializable tag recorded on errored transcript entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyRequest,
    Connection,
    Introspection,
    Generation,
    UnknownRelation,
    Syntax,
    OtherExecution,
    Narration,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::EmptyRequest => ErrorKind::EmptyRequest,
            PipelineError::Connection(_) => ErrorKind::Connection,
            PipelineError::Introspection(_) => ErrorKind::Introspection,
            PipelineError::Generation(_) => ErrorKind::Generation,
            PipelineError::Execution(e) => match e.kind {
                ExecutionErrorKind::UnknownRelation => ErrorKind::UnknownRelation,
                ExecutionErrorKind::Syntax => ErrorKind::Syntax,
                ExecutionErrorKind::Other => ErrorKind::OtherExecution,
            },
            PipelineError::Narration(_) => ErrorKind::Narration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_kind_mapping() {
        let err = PipelineError::from(ExecutionError::from_message(
            "relation \"customers\" does not exist",
        ));
        assert_eq!(err.kind(), ErrorKind::UnknownRelation);
        assert_eq!(err.to_string(), "relation \"customers\" does not exist");

        let err = PipelineError::from(ExecutionError::from_message(
            "syntax error at or near \"form\"",
        ));
        assert_eq!(err.kind(), ErrorKind::Syntax);

        let err = PipelineError::from(ExecutionError::from_message("division by zero"));
        assert_eq!(err.kind(), ErrorKind::OtherExecution);
    }

    #[test]
    fn test_generation_error_wraps_model_error() {
        let err = PipelineError::from(GenerationError::from(LlmError::EmptyResponse));
        assert_eq!(err.kind(), ErrorKind::Generation);
        assert_eq!(err.to_string(), "model returned no content");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UnknownRelation).unwrap();
        assert_eq!(json, "\"unknown_relation\"");
    }
}
