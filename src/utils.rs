/// Shared utility functions

/// Safely truncate a string at a UTF-8 boundary
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() { return s; }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// First `max_chars` characters of `s` on a single line, with "..." appended
/// when anything was cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    let flat: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &flat[..end]),
        None => flat,
    }
}
