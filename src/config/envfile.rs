//! Key-value env file parsing.
//!
//! `KEY=value` lines, `#` comments, optional single/double quotes around
//! values. A value that is empty or still contains the distribution
//! placeholder counts as unset.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

/// Keys containing this substring were never filled in by the user.
const PLACEHOLDER: &str = "your-api-key-here";

pub fn parse(content: &str) -> HashMap<String, String> {
    let line_re = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$").unwrap();
    let mut map = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let key = caps[1].to_string();
        let mut value = caps[2].to_string();

        // Strip one layer of matching quotes.
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }

        // Trailing inline comment (unquoted values only).
        if let Some(idx) = value.find(" #") {
            value = value[..idx].trim_end().to_string();
        }

        map.insert(key, value);
    }

    map
}

pub fn load(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => {
            log::warn!("failed to read env file {:?}: {}", path, e);
            HashMap::new()
        }
    }
}

/// Treat empty/placeholder values as unset.
pub fn lookup<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key)
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty() && !v.contains(PLACEHOLDER))
}
