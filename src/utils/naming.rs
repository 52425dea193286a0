use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex"))
}

/// Lowercases and strips a human label down to `[a-z0-9_-]`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = unsafe_chars().replace_all(name.trim(), "-");
    let cleaned = cleaned.trim_matches('-').to_ascii_lowercase();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

/// `<name>_<YYYY-MM-DD_HH_MM_SS>_<8 hex>.<extension>`
pub fn artifact_file_name(name: &str, at: DateTime<Utc>, extension: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}.{}",
        sanitize_name(name),
        at.format("%Y-%m-%d_%H_%M_%S"),
        &suffix[..8],
        extension
    )
}
