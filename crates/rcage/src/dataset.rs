//! Dataset to R code generation
//!
//! Turns JSON rows into an R `data.frame` literal so a dataset can be bound
//! in a session without touching the file system.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde_json::Value;

use crate::types::Row;

/// Variable the dataset is bound to when none is given
pub const DEFAULT_DATA_VARIABLE: &str = "data";

const RESERVED_WORDS: &[&str] = &[
    "if",
    "else",
    "repeat",
    "while",
    "function",
    "for",
    "in",
    "next",
    "break",
    "TRUE",
    "FALSE",
    "NULL",
    "Inf",
    "NaN",
    "NA",
    "NA_integer_",
    "NA_real_",
    "NA_character_",
    "NA_complex_",
];

/// `data.frame()` arguments a column must not be named after
const DATA_FRAME_ARGUMENTS: &[&str] = &[
    "stringsAsFactors",
    "check.names",
    "check.rows",
    "row.names",
    "fix.empty.names",
];

/// Make `name` usable as a bare R symbol.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`. A result that is
/// empty or does not start with a letter gets an `X` prefix, and reserved
/// words get a trailing `_`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if !sanitized.starts_with(|c: char| c.is_ascii_alphabetic()) {
        sanitized.insert(0, 'X');
    }
    if RESERVED_WORDS.contains(&sanitized.as_str()) {
        sanitized.push('_');
    }
    sanitized
}

/// Escape `value` as the body of a double-quoted R string literal
pub fn escape_r_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            // R strings cannot hold NUL
            '\0' => {}
            c if c.is_control() => {
                let _ = write!(escaped, "\\u{{{:04x}}}", c as u32);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render `value` as an R string literal, quotes included
pub fn r_string_literal(value: &str) -> String {
    format!("\"{}\"", escape_r_string(value))
}

/// Generate R code binding `rows` to `variable` as a `data.frame`.
///
/// Columns come from the first row, in its key order. Values missing from
/// later rows become `NA`.
pub fn generate_data_load(rows: &[Row], variable: &str) -> String {
    let variable = sanitize_identifier(variable);

    let Some(first) = rows.first().filter(|row| !row.is_empty()) else {
        return format!("{variable} <- data.frame()\n");
    };

    let mut code = format!("{variable} <- data.frame(\n");
    for (key, name) in first.keys().zip(unique_column_names(first)) {
        let values: Vec<String> = rows.iter().map(|row| r_value(row.get(key))).collect();
        let _ = writeln!(code, "  {name} = c({}),", values.join(", "));
    }
    code.push_str("  stringsAsFactors = FALSE\n)\n");
    code
}

/// Column names as they appear in the generated `data.frame`
pub fn column_names(rows: &[Row]) -> Vec<String> {
    rows.first().map(unique_column_names).unwrap_or_default()
}

/// Columns whose first-row value is a number, as named in the `data.frame`
pub fn numeric_columns(rows: &[Row]) -> Vec<String> {
    rows.first()
        .map(|row| {
            row.values()
                .zip(unique_column_names(row))
                .filter(|(value, _)| value.is_number())
                .map(|(_, name)| name)
                .collect()
        })
        .unwrap_or_default()
}

/// Sanitized names for the keys of `row`, in key order.
///
/// Names that collide with an earlier column or with a `data.frame()`
/// argument get a `_2`, `_3`, ... suffix.
fn unique_column_names(row: &Row) -> Vec<String> {
    let mut taken: HashSet<String> = DATA_FRAME_ARGUMENTS.iter().map(|s| s.to_string()).collect();
    row.keys()
        .map(|key| {
            let base = sanitize_identifier(key);
            let mut name = base.clone();
            let mut n = 2;
            while taken.contains(&name) {
                name = format!("{base}_{n}");
                n += 1;
            }
            taken.insert(name.clone());
            name
        })
        .collect()
}

fn r_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NA".to_owned(),
        Some(Value::Bool(true)) => "TRUE".to_owned(),
        Some(Value::Bool(false)) => "FALSE".to_owned(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => r_string_literal(s),
        Some(nested @ (Value::Array(_) | Value::Object(_))) => {
            r_string_literal(&nested.to_string())
        }
    }
}
