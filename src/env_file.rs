//! `.env` support for the binary.
//!
//! One `KEY=value` per line, optionally prefixed with `export`. Values may be
//! bare (a `#` starts a comment), single-quoted (taken literally) or
//! double-quoted (`\n`, `\r`, `\t`, `\\` and `\"` escapes).

use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: String,
    pub value: String,
}

/// Parses a whole file body. Errors carry the 1-based line number.
pub fn parse(contents: &str) -> Result<Vec<Assignment>, String> {
    let mut assignments = Vec::new();
    for (number, line) in (1..).zip(contents.lines()) {
        if let Some(assignment) = parse_line(line).map_err(|e| format!("line {}: {}", number, e))? {
            assignments.push(assignment);
        }
    }
    Ok(assignments)
}

/// Reads `path` and exports every assignment not already set in the process
/// environment. Returns how many variables were set.
pub fn load(path: &Path) -> Result<usize, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let assignments = parse(&contents).map_err(|e| format!("{}: {}", path.display(), e))?;

    let mut applied = 0;
    for Assignment { key, value } in assignments {
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Called before the logger and the worker thread exist.
        unsafe {
            std::env::set_var(&key, value);
        }
        applied += 1;
    }
    Ok(applied)
}

fn parse_line(line: &str) -> Result<Option<Assignment>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = match line.strip_prefix("export ") {
        Some(rest) => rest.trim_start(),
        None => line,
    };

    let Some((key, raw)) = line.split_once('=') else {
        return Err("missing '=' in assignment".to_string());
    };
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some(Assignment {
        key: key.to_string(),
        value: parse_value(raw)?,
    }))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    let (value, rest) = if let Some(body) = raw.strip_prefix('"') {
        unescape_until_quote(body)?
    } else if let Some(body) = raw.strip_prefix('\'') {
        body.split_once('\'')
            .map(|(value, rest)| (value.to_string(), rest))
            .ok_or_else(|| "unterminated single-quoted value".to_string())?
    } else {
        let bare = raw.split_once('#').map_or(raw, |(value, _)| value);
        return Ok(bare.trim_end().to_string());
    };

    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(value)
    } else {
        Err(format!("unexpected characters after closing quote: {}", rest))
    }
}

/// Decodes a double-quoted body and returns it with whatever follows the closing quote.
fn unescape_until_quote(body: &str) -> Result<(String, &str), String> {
    let mut value = String::with_capacity(body.len());
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &body[i + 1..])),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            other => value.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}
