const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest file name, in characters, the namer produces for any file of an
/// item (sidecar names included).
pub const NAME_LIMIT: usize = 240;

/// Makes one rendered path segment safe to use as a directory or file stem.
pub fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep: Option<char> = None;

    for ch in value.chars() {
        let ch = if is_disallowed_char(ch) { '_' } else { ch };
        if is_collapse_separator(ch) {
            if prev_sep == Some(ch) {
                continue;
            }
            prev_sep = Some(ch);
        } else {
            prev_sep = None;
        }
        out.push(ch);
    }

    let mut out = out
        .trim_matches(|c: char| c == ' ' || c == '.')
        .trim_end_matches(['_', '-'])
        .to_string();

    if out.is_empty() {
        out = "untitled".to_string();
    }

    if is_windows_reserved(&out) {
        out.push_str("_file");
    }

    out
}

/// Shortens `stem` so that `stem` plus `reserve` extra characters fits in
/// [`NAME_LIMIT`]. `_`-separated tokens are dropped from the end first.
pub fn truncate_stem(stem: &str, reserve: usize) -> String {
    if stem.chars().count() + reserve <= NAME_LIMIT {
        return stem.to_string();
    }

    let mut tokens: Vec<&str> = stem.split('_').collect();
    while tokens.len() > 1 {
        tokens.pop();
        let candidate = tokens.join("_");
        if candidate.chars().count() + reserve <= NAME_LIMIT {
            return candidate;
        }
    }

    stem.chars()
        .take(NAME_LIMIT.saturating_sub(reserve).max(1))
        .collect()
}

fn is_collapse_separator(ch: char) -> bool {
    matches!(ch, '_' | '-' | ' ')
}

fn is_disallowed_char(ch: char) -> bool {
    matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        || ch == '\0'
        || ch.is_control()
}

fn is_windows_reserved(value: &str) -> bool {
    let stem = value
        .split('.')
        .next()
        .unwrap_or(value)
        .to_ascii_uppercase();
    WINDOWS_RESERVED_NAMES
        .iter()
        .any(|reserved| reserved == &stem)
}
