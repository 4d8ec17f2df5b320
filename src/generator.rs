//! Natural language to a single PostgreSQL statement.
//!
//! The rules in the prompt (quoted identifiers, schema-only names, one
//! statement) are requests to the model, not checks. Nothing here retries:
//! an unusable response is returned as a [`GenerationError`].

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::llm::{CompletionRequest, LanguageModel, PromptMessage, ResponseFormat};

const SYSTEM_PROMPT: &str = "You are a PostgreSQL query generator. You translate a user's \
request into exactly one syntactically correct PostgreSQL statement that only uses the \
tables and columns of the schema you are given. You answer with JSON only.";

fn user_prompt(schema: &str, request: &str) -> String {
    format!(
        r#"Schema Context:
{schema}

User Request:
"{request}"

MANDATORY REQUIREMENTS:
1. Quote ALL identifiers: wrap every table and column name in double quotes
   - Tables: "user", "orders", "products"
   - Columns: "Name", "userId", "created_at"
2. Exact schema match: only use tables and columns that exist in the schema above
3. PostgreSQL syntax with lowercase keywords
4. No assumptions about column types, constraints or relationships not in the schema
5. Exactly one statement

STATEMENT PATTERNS:
- select "column1", "column2" from "table_name" where "condition_column" = 'value'
- insert into "table_name" ("col1", "col2") values ('val1', 'val2')
- update "table_name" set "column" = 'value' where "id" = 123
- delete from "table_name" where "column" = 'value'

ERROR PREVENTION:
- String literals in single quotes
- Match the exact case of names in the schema
- No backticks and no square brackets around identifiers

RESPONSE FORMAT:
Return only this JSON object:
{{ "query": "your-sql-query-here" }}
If the request cannot be answered with this schema, return:
{{ "query": "", "clarification": "what you need from the user" }}"#
    )
}

const EMPTY_SCHEMA_NOTE: &str = "(the schema contains no tables)";

/// A statement produced by the model, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedQuery {
    pub sql: String,
}

/// What the model gave back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Query(GeneratedQuery),
    /// The model could not map the request onto the schema and asked for more.
    Clarification(String),
}

pub fn build_request(schema_text: &str, request: &str) -> CompletionRequest {
    let schema = if schema_text.trim().is_empty() {
        EMPTY_SCHEMA_NOTE
    } else {
        schema_text
    };
    let user = user_prompt(schema, request.trim());

    CompletionRequest {
        messages: vec![PromptMessage::system(SYSTEM_PROMPT), PromptMessage::user(user)],
        format: ResponseFormat::Json,
    }
}

/// Strip a surrounding markdown code block (with optional language tag).
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !(trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6) {
        return trimmed;
    }
    let mut inner = &trimmed[3..trimmed.len() - 3];
    if let Some(newline) = inner.find('\n') {
        let tag = inner[..newline].trim();
        if !tag.contains(' ') && !tag.starts_with('{') {
            inner = &inner[newline + 1..];
        }
    }
    inner.trim()
}

fn non_empty_str<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse the model's JSON answer.
pub fn parse_response(response: &str) -> Result<Generation, GenerationError> {
    let malformed = |reason: String| GenerationError::Malformed {
        reason,
        response: response.to_string(),
    };

    let candidate = strip_code_fence(response);
    let value: serde_json::Value =
        serde_json::from_str(candidate).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

    if !value.is_object() {
        return Err(malformed("expected a JSON object".to_string()));
    }

    if let Some(sql) = non_empty_str(&value, "query") {
        return Ok(Generation::Query(GeneratedQuery {
            sql: sql.to_string(),
        }));
    }
    if let Some(clarification) = non_empty_str(&value, "clarification") {
        return Ok(Generation::Clarification(clarification.to_string()));
    }
    Err(malformed("no \"query\" field".to_string()))
}

pub async fn generate_query<M>(
    model: &M,
    schema_text: &str,
    request: &str,
) -> Result<Generation, GenerationError>
where
    M: LanguageModel + ?Sized,
{
    let completion = build_request(schema_text, request);
    debug!(prompt = %completion.messages[1].content, "query generation prompt");

    let response = model.complete(completion).await?;
    debug!(response = %response, "query generation response");

    match parse_response(&response) {
        Ok(generation) => {
            if let Generation::Query(query) = &generation {
                info!(sql = %query.sql, "query generated");
            } else {
                info!("model asked for clarification");
            }
            Ok(generation)
        }
        Err(e) => {
            warn!("unusable generation response: {}", e);
            Err(e)
        }
    }
}
