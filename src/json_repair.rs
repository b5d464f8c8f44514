//! Best-effort repair of AI text output into JSON.
//!
//! Models wrap JSON in markdown fences, emit typographic quotes, write `N/A`
//! for missing values and leave trailing commas. One repair pass handles those
//! before the second parse; anything still unparseable is kept as opaque text.
//! Text inside string literals is never rewritten, except a value that is
//! exactly `"N/A"`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::payload::ParsedOutput;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n?").expect("valid regex"));
static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n?[ \t]*```\s*$").expect("valid regex"));

/// Parses AI text, applying the repair pass if the first parse fails.
pub fn parse_ai_json(text: &str) -> ParsedOutput {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return ParsedOutput::Json { value };
    }

    let cleaned = repair(text);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => ParsedOutput::Json { value },
        Err(err) => {
            tracing::warn!(error = %err, "AI output is not valid JSON after repair");
            ParsedOutput::Opaque { text: cleaned }
        }
    }
}

/// Applies the repair steps in order and returns the cleaned text.
pub fn repair(text: &str) -> String {
    let cleaned = normalize_quotes(&strip_fences(text));
    rewrite_tokens(&cleaned).trim().to_string()
}

/// Replaces `N/A` values with `null` and drops trailing commas, skipping over
/// string literals.
fn rewrite_tokens(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                let end = string_end(&chars, i);
                let literal: String = chars[i..end].iter().collect();
                let is_key = next_significant(&chars, end) == Some(':');
                if !is_key && literal.eq_ignore_ascii_case("\"n/a\"") {
                    out.push_str("null");
                } else {
                    out.push_str(&literal);
                }
                i = end;
            }
            ',' if matches!(next_significant(&chars, i + 1), Some('}' | ']')) => i += 1,
            _ if is_bare_na(&chars[i..]) => {
                out.push_str("null");
                i += 3;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the closing quote of the literal opening at `start`.
fn string_end(chars: &[char], start: usize) -> usize {
    let mut escaped = false;
    for (offset, &c) in chars[start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return start + offset + 2;
        }
    }
    chars.len()
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars.get(from..)?.iter().copied().find(|c| !c.is_whitespace())
}

fn is_bare_na(chars: &[char]) -> bool {
    matches!(chars, [n, '/', a, ..] if n.eq_ignore_ascii_case(&'n') && a.eq_ignore_ascii_case(&'a'))
}

fn strip_fences(text: &str) -> String {
    let without_open = FENCE_OPEN.replace(text, "");
    FENCE_CLOSE.replace(&without_open, "").into_owned()
}

fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repairs_fenced_output_with_na_and_trailing_comma() {
        let text = "```json\n{\"a\": \"N/A\",}\n```";
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Json {
                value: json!({"a": null})
            }
        );
    }

    #[test]
    fn valid_json_is_untouched() {
        let text = r#"{"note": "N/A is fine inside text"}"#;
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Json {
                value: json!({"note": "N/A is fine inside text"})
            }
        );
    }

    #[test]
    fn smart_quotes_become_plain() {
        let text = "{\u{201C}name\u{201D}: \u{201C}Ada\u{201D}}";
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Json {
                value: json!({"name": "Ada"})
            }
        );
    }

    #[test]
    fn bare_na_in_arrays() {
        let text = "[N/A, 1, N/A]";
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Json {
                value: json!([null, 1, null])
            }
        );
    }

    #[test]
    fn string_contents_survive_repair() {
        let text = r#"{"note": "a, N/A, b", "list": "x,]", "N/A": "n/a", "esc": "q\",N/A",}"#;
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Json {
                value: json!({
                    "note": "a, N/A, b",
                    "list": "x,]",
                    "N/A": null,
                    "esc": "q\",N/A"
                })
            }
        );
    }

    #[test]
    fn unrecoverable_text_is_kept_opaque() {
        let text = "```\nSorry, I cannot help with that.\n```";
        assert_eq!(
            parse_ai_json(text),
            ParsedOutput::Opaque {
                text: "Sorry, I cannot help with that.".to_string()
            }
        );
    }
}
