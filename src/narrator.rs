use tracing::{debug, info};

use crate::db::QueryResult;
use crate::error::{LlmError, NarrationError};
use crate::export;
use crate::llm::{CompletionRequest, LanguageModel, PromptMessage, ResponseFormat};

fn narration_prompt(sql: &str, result: &str, omitted: &str) -> String {
    format!(
        r#"Given the PostgreSQL query: "{sql}" and its result: {result}
{omitted}Generate a human-like response in conversational English that explains the results. Be concise and natural, like you're explaining to a colleague.

Examples:
- "I found 25 customers in the database"
- "Your total revenue for 2023 is $45,230"
- "There are 3 products with low inventory"

Keep it under 100 words and be specific about the numbers/data found."#
    )
}

/// Render the result for the prompt, keeping at most `max_rows` rows.
fn result_for_prompt(result: &QueryResult, max_rows: usize) -> (String, usize) {
    let value = export::to_json(result);
    match value {
        serde_json::Value::Array(mut rows) if rows.len() > max_rows => {
            let omitted = rows.len() - max_rows;
            rows.truncate(max_rows);
            (serde_json::Value::Array(rows).to_string(), omitted)
        }
        other => (other.to_string(), 0),
    }
}

pub fn build_request(sql: &str, result: &QueryResult, max_rows: usize) -> CompletionRequest {
    let (rendered, omitted) = result_for_prompt(result, max_rows);
    let omitted_note = if omitted > 0 {
        format!(
            "(only the first {} of {} rows are shown; {} more were returned)\n",
            max_rows, result.row_count, omitted
        )
    } else {
        String::new()
    };
    let prompt = narration_prompt(sql, &rendered, &omitted_note);

    CompletionRequest {
        messages: vec![PromptMessage::user(prompt)],
        format: ResponseFormat::Text,
    }
}

/// Explain a successful result in prose. Only the model call can fail here.
pub async fn narrate<M>(
    model: &M,
    sql: &str,
    result: &QueryResult,
    max_rows: usize,
) -> Result<String, NarrationError>
where
    M: LanguageModel + ?Sized,
{
    let request = build_request(sql, result, max_rows);
    debug!(prompt = %request.messages[0].content, "narration prompt");

    let text = model.complete(request).await?;
    let text = text.trim();
    if text.is_empty() {
        return Err(NarrationError::Model(LlmError::EmptyResponse));
    }

    info!(words = text.split_whitespace().count(), "result narrated");
    Ok(text.to_string())
}
