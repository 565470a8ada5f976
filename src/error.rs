//! Engine error types.
//!
//! Visibility queries never fail; they degrade to "nothing visible". Errors
//! only surface from the fallible edges: JSON interchange, definition
//! syntax, and mutations that name a token the zone does not hold.

use std::fmt;

use thiserror::Error;

use crate::types::{LightSourceId, TokenId};

/// One problem found while parsing a sight or light definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{} definition error(s): {}", .0.len(), join_issues(.0))]
    Syntax(Vec<SyntaxIssue>),

    #[error("unknown token {0}")]
    UnknownToken(TokenId),

    #[error("unknown light source {0}")]
    UnknownLightSource(LightSourceId),
}

fn join_issues(issues: &[SyntaxIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
