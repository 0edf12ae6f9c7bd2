//! Parsing of raw step output into records.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Object keys tried, in order, when a JSON list holds objects.
const RECORD_KEYS: &[&str] = &["prompt", "text", "title", "value", "content"];

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").unwrap())
}

/// Expected shape of a step's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A JSON array of strings or objects, possibly wrapped in prose or a
    /// code fence. One record per element.
    JsonList,
    /// A JSON object, returned as a single compact record.
    JsonObject,
    /// The whole output as a single record.
    PlainText,
}

impl OutputFormat {
    /// Parse raw output into records. Never returns an empty list.
    pub fn parse(&self, raw: &str) -> Result<Vec<String>> {
        let records = match self {
            Self::JsonList => parse_json_list(raw)?,
            Self::JsonObject => vec![parse_json_object(raw)?.to_string()],
            Self::PlainText => {
                let text = unfence(raw).trim().to_string();
                if text.is_empty() { vec![] } else { vec![text] }
            }
        };

        if records.is_empty() {
            return Err(Error::parse("output contained no records"));
        }
        Ok(records)
    }
}

/// Strip a surrounding code fence, if any.
fn unfence(raw: &str) -> &str {
    fence_regex()
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
}

/// Slice from the first `open` to the last `close` delimiter.
fn delimited(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_json_list(raw: &str) -> Result<Vec<String>> {
    let body = delimited(unfence(raw), '[', ']')
        .ok_or_else(|| Error::parse("no JSON array found in output"))?;
    let values: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("invalid JSON array: {}", e)))?;

    values
        .into_iter()
        .map(|value| match value {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Object(map) => RECORD_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .ok_or_else(|| Error::parse("list object has no text field")),
            other => Err(Error::parse(format!("unexpected list element: {}", other))),
        })
        .filter(|record| !matches!(record, Ok(s) if s.is_empty()))
        .collect()
}

fn parse_json_object(raw: &str) -> Result<Value> {
    let body = delimited(unfence(raw), '{', '}')
        .ok_or_else(|| Error::parse("no JSON object found in output"))?;
    serde_json::from_str(body).map_err(|e| Error::parse(format!("invalid JSON object: {}", e)))
}

/// Clean-up applied to parsed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
    /// Remove wrapping quotes.
    StripQuotes,
    /// Collapse runs of whitespace into single spaces.
    CollapseWhitespace,
    /// Split into unique `#tag` tokens.
    Hashtags,
}

impl PostProcess {
    pub fn apply(&self, records: Vec<String>) -> Vec<String> {
        match self {
            Self::StripQuotes => records
                .into_iter()
                .map(|r| {
                    r.trim()
                        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'))
                        .trim()
                        .to_string()
                })
                .collect(),
            Self::CollapseWhitespace => records
                .into_iter()
                .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect(),
            Self::Hashtags => {
                let mut seen = HashSet::new();
                records
                    .iter()
                    .flat_map(|r| r.split(|c: char| c.is_whitespace() || c == ','))
                    .map(|token| {
                        token
                            .chars()
                            .filter(|c| c.is_alphanumeric() || *c == '_')
                            .collect::<String>()
                    })
                    .filter(|tag| !tag.is_empty())
                    .filter(|tag| seen.insert(tag.to_lowercase()))
                    .map(|tag| format!("#{}", tag))
                    .collect()
            }
        }
    }
}

/// Render records as a numbered list for use in a follow-up prompt.
pub fn numbered(records: &[String]) -> String {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| format!("{}. {}", i + 1, record))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_list_in_prose_and_fence() {
        let raw =
            "Here you go:\n```json\n[\"a red sky\", {\"prompt\": \"a blue sea\"}]\n```\nEnjoy!";
        let records = OutputFormat::JsonList.parse(raw).unwrap();
        assert_eq!(records, vec!["a red sky", "a blue sea"]);
    }

    #[test]
    fn test_json_list_rejects_garbage() {
        assert!(matches!(
            OutputFormat::JsonList.parse("no list here"),
            Err(Error::Parse(_))
        ));
        assert!(OutputFormat::JsonList.parse("[1, 2").is_err());
        assert!(OutputFormat::JsonList.parse("[]").is_err());
        assert!(OutputFormat::JsonList.parse("[{\"other\": 1}]").is_err());
    }

    #[test]
    fn test_json_object() {
        let records = OutputFormat::JsonObject
            .parse("Score: {\"hook\": 8, \"overall\": 7}")
            .unwrap();
        let value: Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(value["overall"], 7);
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            OutputFormat::PlainText.parse("  Neon Hearts \n").unwrap(),
            vec!["Neon Hearts"]
        );
        assert!(OutputFormat::PlainText.parse("   ").is_err());
    }

    #[test]
    fn test_post_process() {
        let quoted = PostProcess::StripQuotes.apply(vec!["\"Neon Hearts\"".into()]);
        assert_eq!(quoted, vec!["Neon Hearts"]);

        let collapsed = PostProcess::CollapseWhitespace.apply(vec!["a  b\n c".into()]);
        assert_eq!(collapsed, vec!["a b c"]);

        let tags = PostProcess::Hashtags.apply(vec!["#music, #NightDrive synthwave #music".into()]);
        assert_eq!(tags, vec!["#music", "#NightDrive", "#synthwave"]);
    }

    #[test]
    fn test_numbered() {
        let text = numbered(&["a".to_string(), "b".to_string()]);
        assert_eq!(text, "1. a\n2. b");
    }
}
