use crate::db::{CellValue, QueryResult};
use unicode_width::UnicodeWidthStr;

/// Rows as JSON objects keyed by column name, in column order.
pub fn to_records(result: &QueryResult) -> Vec<serde_json::Map<String, serde_json::Value>> {
    result
        .rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for (i, cell) in row.iter().enumerate() {
                let col_name = result
                    .columns
                    .get(i)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("column_{}", i));
                obj.insert(col_name, cell_to_json(cell));
            }
            obj
        })
        .collect()
}

/// The result as a JSON value: an array of records, or `{"affected_rows": n}`
/// for statements that return no rows.
pub fn to_json(result: &QueryResult) -> serde_json::Value {
    match result.affected_rows {
        Some(affected) if result.rows.is_empty() => {
            serde_json::json!({ "affected_rows": affected })
        }
        _ => serde_json::Value::Array(
            to_records(result)
                .into_iter()
                .map(serde_json::Value::Object)
                .collect(),
        ),
    }
}

/// Plain aligned table for terminal output.
pub fn to_text_table(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return match result.affected_rows {
            Some(n) => format!("({} rows affected)\n", n),
            None => "(no rows)\n".to_string(),
        };
    }

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.name.width()).collect();
    for row in &result.rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.display_width());
            }
        }
    }

    let mut output = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| pad(&c.name, *w))
        .collect();
    output.push_str(header.join(" | ").trim_end());
    output.push('\n');

    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&rule.join("-+-"));
    output.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| pad(&cell.display(), *w))
            .collect();
        output.push_str(cells.join(" | ").trim_end());
        output.push('\n');
    }

    let noun = if result.row_count == 1 { "row" } else { "rows" };
    output.push_str(&format!("({} {})\n", result.row_count, noun));
    output
}

fn pad(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.width());
    format!("{}{}", text, " ".repeat(fill))
}

pub fn cell_to_json(cell: &CellValue) -> serde_json::Value {
    match cell {
        CellValue::Null => serde_json::Value::Null,
        CellValue::Bool(b) => serde_json::Value::Bool(*b),
        CellValue::Int16(i) => serde_json::json!(*i),
        CellValue::Int32(i) => serde_json::json!(*i),
        CellValue::Int64(i) => serde_json::json!(*i),
        CellValue::Float32(f) => serde_json::json!(*f),
        CellValue::Float64(f) => serde_json::json!(*f),
        CellValue::Json(j) => j.clone(),
        CellValue::Array(arr) => {
            let items: Vec<serde_json::Value> = arr.iter().map(cell_to_json).collect();
            serde_json::Value::Array(items)
        }
        other => serde_json::Value::String(other.display()),
    }
}
