//! Escaping for values embedded in single-quoted filter graph fields.
//! Raw text must be escaped exactly once; escaping already escaped text
//! doubles every backslash.

/// Characters escaped by [`escape_text`], in the order they are processed.
const ESCAPED: [char; 5] = ['\\', '"', ':', '\'', '*'];

/// Escape caption text for a quoted drawtext field.
/// Backslash goes first so the backslashes introduced by the later steps
/// are never escaped a second time.
pub fn escape_text(raw: &str) -> String {
    ESCAPED.iter().fold(raw.to_string(), |acc, c| {
        acc.replace(*c, &format!("\\{c}"))
    })
}

/// Inverse of [`escape_text`]: drop the backslash in front of every escaped
/// character.
pub fn unescape_text(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape a file-system path for a `fontfile=` field.
/// Windows separators become forward slashes before escaping, so a drive
/// letter ends up as `C\:/...` on every platform.
pub fn escape_path(path: &str) -> String {
    escape_text(&path.replace('\\', "/"))
}
