//! Classifying the text a vision model sends back.
//!
//! Models are asked for a single JSON object, but in practice we get code
//! fences, chatty preambles, truncated output and occasionally no JSON at all.
//! We resolve each reply exactly once into a [`ModelReply`].

use std::sync::LazyLock;

use regex::Regex;

use super::fields::ExtractedFields;
use crate::prelude::*;

/// Markdown code fences, with an optional language tag.
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z]*").expect("failed to compile regex"));

/// A model reply, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// We found and parsed a JSON object.
    Parsed(ExtractedFields),

    /// We found something that looked like JSON, but could not parse it, even
    /// after repair.
    Malformed {
        /// The full text of the reply.
        raw_text: String,
        /// The parse error.
        error: String,
    },

    /// The reply contained no JSON object at all. We return every field as
    /// `UNKNOWN`, and keep the text.
    Unstructured(ExtractedFields),
}

impl ModelReply {
    /// Classify the text of a model reply.
    pub fn classify(text: &str) -> Self {
        let Some(block) = extract_json_block(text) else {
            return ModelReply::Unstructured(ExtractedFields::unknown(text.to_owned()));
        };
        trace!(%block, "Extracted JSON block");
        match serde_json::from_str::<Value>(&block) {
            Ok(Value::Object(object)) => {
                let mut fields = ExtractedFields::from_json_object(&object);
                if fields.raw_text.is_empty() {
                    fields.raw_text = text.to_owned();
                }
                ModelReply::Parsed(fields)
            }
            Ok(other) => ModelReply::Malformed {
                raw_text: text.to_owned(),
                error: format!("expected a JSON object, found {other}"),
            },
            Err(err) => ModelReply::Malformed {
                raw_text: text.to_owned(),
                error: err.to_string(),
            },
        }
    }
}

/// Find the JSON object in a model reply.
///
/// We strip code fences, then take everything from the first `{` to the last
/// `}`. If there is no closing brace after the opening one, the reply was
/// probably truncated, so we take the rest of the text and close it off with a
/// `rawText` field holding the whole reply.
///
/// Returns `None` if there is no `{` at all.
pub fn extract_json_block(text: &str) -> Option<String> {
    let cleaned = CODE_FENCE.replace_all(text, "");
    let start = cleaned.find('{')?;
    let rest = &cleaned[start..];
    let block = match rest.rfind('}') {
        Some(end) => rest[..=end].trim(),
        None => rest.trim(),
    };
    if block.ends_with('}') {
        Some(block.to_owned())
    } else {
        debug!("Repairing truncated JSON block");
        let block = block.trim_end_matches(',');
        Some(format!(
            "{},\"rawText\": {}}}",
            block,
            Value::String(text.to_owned()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::fields::{FieldName, UNKNOWN};

    #[test]
    fn reply_without_json_is_unstructured() {
        let text = "Sorry, I can't read this label. It looks blurry.";
        match ModelReply::classify(text) {
            ModelReply::Unstructured(fields) => {
                assert_eq!(fields.raw_text, text);
                for name in FieldName::ALL {
                    assert_eq!(fields.get(name), UNKNOWN);
                }
            }
            other => panic!("expected unstructured reply, got {other:?}"),
        }
    }

    #[test]
    fn fenced_reply_is_parsed() {
        let text = "Here you go:\n```json\n{\"barcodeNumber\": \"123\", \"rawText\": \"abc\"}\n```\n";
        match ModelReply::classify(text) {
            ModelReply::Parsed(fields) => {
                assert_eq!(fields.barcode_number, "123");
                assert_eq!(fields.raw_text, "abc");
                assert_eq!(fields.sender_name, UNKNOWN);
            }
            other => panic!("expected parsed reply, got {other:?}"),
        }
    }

    #[test]
    fn missing_raw_text_uses_reply() {
        let text = r#"{"contents": "Shirt*2"}"#;
        let ModelReply::Parsed(fields) = ModelReply::classify(text) else {
            panic!("expected parsed reply");
        };
        assert_eq!(fields.raw_text, text);
        assert_eq!(fields.contents, "Shirt*2");
    }

    #[test]
    fn truncated_reply_is_repaired() {
        let text = r#"{"barcodeNumber": "123", "senderName": "ACME","#;
        let block = extract_json_block(text).unwrap();
        assert!(block.ends_with('}'));
        let ModelReply::Parsed(fields) = ModelReply::classify(text) else {
            panic!("expected repaired reply to parse");
        };
        assert_eq!(fields.barcode_number, "123");
        assert_eq!(fields.sender_name, "ACME");
        assert_eq!(fields.raw_text, text);
    }

    #[test]
    fn broken_json_is_malformed() {
        let text = r#"{"barcodeNumber": "123" "senderName": }"#;
        assert!(matches!(
            ModelReply::classify(text),
            ModelReply::Malformed { .. }
        ));
    }

    #[test]
    fn trailing_chatter_is_ignored() {
        let text = "{\"price\": \"5 KWD\"}\nLet me know if you need anything else!";
        assert_eq!(
            extract_json_block(text).as_deref(),
            Some("{\"price\": \"5 KWD\"}")
        );
    }
}
