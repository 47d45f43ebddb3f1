//! Environment variable expansion for `env` steps.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .unwrap_or_else(|e| unreachable!("static pattern is valid: {e}"))
    })
}

/// Expands `$VAR` and `${VAR}` against `env`. Unset variables expand to
/// the empty string.
#[must_use]
pub fn expand(value: &str, env: &BTreeMap<String, String>) -> String {
    var_pattern()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Splits a `PATH`-style value into its non-empty entries.
#[must_use]
pub fn split_search_path(value: &str) -> Vec<String> {
    value
        .split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Maps a search path into a host root.
///
/// Every entry is first looked up under `root`, then on the host, so
/// executables installed into the root shadow host ones.
#[must_use]
pub fn rooted_search_path(root: &Path, value: &str) -> String {
    let entries = split_search_path(value);
    entries
        .iter()
        .filter_map(|entry| super::fs::rooted(root, Path::new(entry)).ok())
        .map(|p| p.display().to_string())
        .chain(entries.iter().cloned())
        .collect::<Vec<_>>()
        .join(":")
}
