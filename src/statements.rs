//! Statement extraction from the editable query buffer.
//!
//! The buffer is a list of lines. Statements are delimited by a separator
//! token (`;` unless the profile says otherwise). Separators are matched as
//! plain text; quotes and comments are not interpreted.

/// Every non-empty statement in the buffer, trimmed, in buffer order.
pub fn extract_all<S: AsRef<str>>(lines: &[S], separator: &str) -> Vec<String> {
    let text = lines
        .iter()
        .map(|line| line.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    if separator.is_empty() {
        let whole = text.trim();
        return if whole.is_empty() {
            Vec::new()
        } else {
            vec![whole.to_string()]
        };
    }
    text.split(separator)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(String::from)
        .collect()
}

/// The statement surrounding line `cursor_line`, trimmed.
///
/// Scanning backwards, the nearest earlier line holding a separator bounds
/// the statement: only its text after the last separator is kept. Scanning
/// forwards from the cursor line, the first line holding a separator ends
/// the statement and only its text before the first separator is kept. If
/// the cursor line itself holds a separator it ends the statement.
///
/// A cursor past the end of the buffer yields an empty string.
pub fn extract_at_cursor<S: AsRef<str>>(lines: &[S], separator: &str, cursor_line: usize) -> String {
    if cursor_line >= lines.len() {
        return String::new();
    }
    if separator.is_empty() {
        return extract_all(lines, separator).pop().unwrap_or_default();
    }

    let mut before: Vec<&str> = Vec::new();
    for line in lines[..cursor_line].iter().rev() {
        let line = line.as_ref();
        match line.rfind(separator) {
            Some(pos) => {
                let tail = &line[pos + separator.len()..];
                if !tail.trim().is_empty() {
                    before.push(tail);
                }
                break;
            }
            None => before.push(line),
        }
    }
    before.reverse();

    let mut statement = before;
    let current = lines[cursor_line].as_ref();
    match current.find(separator) {
        Some(pos) => statement.push(&current[..pos]),
        None => {
            statement.push(current);
            for line in &lines[cursor_line + 1..] {
                let line = line.as_ref();
                match line.find(separator) {
                    Some(pos) => {
                        statement.push(&line[..pos]);
                        break;
                    }
                    None => statement.push(line),
                }
            }
        }
    }

    statement.join("\n").trim().to_string()
}
