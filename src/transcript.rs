use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// Failure details attached to an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for TurnError {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: u64,
    pub role: Speaker,
    pub text: String,
    /// The statement that ran (or was attempted) for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
    /// Raw result rows, kept when narration failed after a successful execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<serde_json::Value>,
}

impl ConversationTurn {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Append-only conversation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<ConversationTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.turns.last().map(|t| t.id + 1).unwrap_or(1)
    }

    fn push(&mut self, mut turn: ConversationTurn) -> &ConversationTurn {
        turn.id = self.next_id();
        let index = self.turns.len();
        self.turns.push(turn);
        &self.turns[index]
    }

    pub fn push_user(&mut self, text: &str) -> &ConversationTurn {
        self.push(ConversationTurn {
            id: 0,
            role: Speaker::User,
            text: text.to_string(),
            sql: None,
            timestamp: Utc::now(),
            error: None,
            rows: None,
        })
    }

    pub fn push_answer(&mut self, text: String, sql: Option<String>) -> &ConversationTurn {
        self.push(ConversationTurn {
            id: 0,
            role: Speaker::Assistant,
            text,
            sql,
            timestamp: Utc::now(),
            error: None,
            rows: None,
        })
    }

    pub fn push_error(
        &mut self,
        error: &PipelineError,
        sql: Option<String>,
        rows: Option<serde_json::Value>,
    ) -> &ConversationTurn {
        self.push(ConversationTurn {
            id: 0,
            role: Speaker::Assistant,
            text: format!("Error: {}", error),
            sql,
            timestamp: Utc::now(),
            error: Some(TurnError::from(error)),
            rows,
        })
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    /// The most recent statement that was executed or attempted.
    pub fn last_sql(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| t.sql.as_deref())
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgchat")
            .join("transcript.json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let transcript: Transcript = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(transcript)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
