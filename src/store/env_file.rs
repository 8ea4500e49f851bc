// Minimal .env codec for the gemini-cli native file
//
// Parse accepts KEY=VALUE lines, skips blanks and # comments, and strips
// one layer of surrounding quotes. Render emits entries in alphabetical
// order, which keeps diffs stable across rewrites.

/// Parse `.env` text into key/value pairs in file order.
pub fn parse_env(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        entries.push((key.to_string(), value.to_string()));
    }
    entries
}

/// Render entries as `.env` text, sorted alphabetically by key.
pub fn render_env(entries: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (key, value) in sorted {
        // Quote values containing whitespace or #
        if value.chars().any(|c| c.is_whitespace() || c == '#') {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        } else {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}
