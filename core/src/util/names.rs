//! Entity name utilities
//!
//! Table and model names double as SQL identifiers and file stems, so they are
//! normalized the same way everywhere.
use std::path::Path;

/// Derive a table name from a source file path.
///
/// Example: `/data/Sales Q1.csv` → `sales_q1`
pub fn table_name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    sanitize_entity_name(&stem)
}

/// Sanitize a user supplied name so it is usable as an identifier.
///
/// Rules:
/// - Keep only letters, numbers and underscores
/// - Convert to lowercase
/// - Collapse consecutive underscores
/// - Strip leading/trailing underscores
/// - Prefix names starting with a digit with `t_`
/// - Limit to 64 characters
pub fn sanitize_entity_name(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    while sanitized.contains("__") {
        sanitized = sanitized.replace("__", "_");
    }

    sanitized = sanitized.trim_matches('_').to_string();

    if sanitized
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        sanitized = format!("t_{sanitized}");
    }

    if sanitized.len() > 64 {
        let end = sanitized
            .char_indices()
            .take_while(|(i, _)| *i < 64)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        sanitized.truncate(end);
    }

    if sanitized.is_empty() {
        "untitled".to_string()
    } else {
        sanitized
    }
}

/// File name backing a model's query text.
pub fn model_file_name(name: &str) -> String {
    format!("{name}.sql")
}
