use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Vision provider selected by the `aiModel` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gpt,
    Gemini,
}

impl ProviderKind {
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "gpt",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "OpenAI",
            ProviderKind::Gemini => "Gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gpt" => Some(ProviderKind::Gpt),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

/// Fixed per-provider model menus. The menu is the only validation a model
/// identifier gets; the provider's live capability list is never consulted.
#[derive(Debug, Clone)]
pub struct ModelMenu {
    entries: IndexMap<ProviderKind, Vec<String>>,
}

impl ModelMenu {
    pub fn new() -> Self {
        let mut entries = IndexMap::new();
        entries.insert(
            ProviderKind::Gpt,
            vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gpt-4.1".to_string(),
                "gpt-4.1-mini".to_string(),
            ],
        );
        entries.insert(
            ProviderKind::Gemini,
            vec![
                "gemini-2.0-flash".to_string(),
                "gemini-2.0-flash-lite".to_string(),
                "gemini-1.5-pro".to_string(),
                "gemini-1.5-flash".to_string(),
            ],
        );
        Self { entries }
    }

    pub fn options(&self, provider: ProviderKind) -> &[String] {
        self.entries
            .get(&provider)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, provider: ProviderKind, model: &str) -> bool {
        self.options(provider)
            .iter()
            .any(|candidate| candidate == model.trim())
    }

    pub fn default_model(&self, provider: ProviderKind) -> &str {
        self.options(provider)
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }
}

impl Default for ModelMenu {
    fn default() -> Self {
        Self::new()
    }
}
