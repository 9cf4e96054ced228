use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PLACEHOLDER_TITLE: &str = "Untitled stock photo";

/// Token counts as reported by a provider. Field availability differs per
/// provider: OpenAI reports all three, Gemini reports prompt and total only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub prompt: Option<u64>,
    pub completion: Option<u64>,
    pub total: Option<u64>,
}

/// One image's generated metadata, produced by a provider and consumed by
/// the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: String,
    pub tags: Vec<String>,
    pub token_info: Option<TokenInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub record: MetadataRecord,
    pub corrections: Vec<String>,
}

/// Repairs a raw provider record so the tag/title invariants hold no matter
/// what the model returned. Never fails, and applying it to an already
/// normalized record is a no-op.
pub fn normalize_record(raw: &Value, max_tags: usize) -> NormalizedRecord {
    let mut corrections = Vec::new();

    let title = match raw.get("title").and_then(Value::as_str) {
        Some(title) if !title.trim().is_empty() => title.trim().to_string(),
        _ => {
            corrections.push(format!(
                "title missing or not a string; substituted \"{PLACEHOLDER_TITLE}\""
            ));
            PLACEHOLDER_TITLE.to_string()
        }
    };

    let raw_tags: &[Value] = match raw.get("tags").and_then(Value::as_array) {
        Some(tags) => tags,
        None => {
            corrections.push("tags missing or not an array; substituted empty list".to_string());
            &[]
        }
    };

    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for tag in raw_tags {
        let Some(tag) = tag.as_str() else {
            continue;
        };
        let normalized = tag.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.clone()) {
            tags.push(normalized);
        }
    }
    if tags.len() > max_tags {
        corrections.push(format!(
            "{} tags exceeded the limit of {max_tags}; truncated",
            tags.len()
        ));
        tags.truncate(max_tags);
    }

    NormalizedRecord {
        record: MetadataRecord {
            title,
            tags,
            token_info: None,
        },
        corrections,
    }
}
