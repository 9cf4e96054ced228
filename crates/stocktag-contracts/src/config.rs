use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{ModelMenu, ProviderKind};

pub const DEFAULT_CONFIG_FILE: &str = "stocktag.json";

/// Persistent tool configuration, one JSON object in the working directory.
///
/// The struct is always total: loading a partial file merges recognized keys
/// over defaults, and keys this version does not understand are carried in
/// `extra` so a round trip never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "inputDir")]
    pub input_dir: String,
    #[serde(rename = "outputDir")]
    pub output_dir: String,
    #[serde(rename = "maxTitleChars")]
    pub max_title_chars: u32,
    #[serde(rename = "maxTags")]
    pub max_tags: u32,
    #[serde(rename = "gptApiKey")]
    pub gpt_api_key: String,
    #[serde(rename = "geminiApiKey")]
    pub gemini_api_key: String,
    #[serde(rename = "aiModel")]
    pub ai_model: ProviderKind,
    #[serde(rename = "geminiModel")]
    pub gemini_model: String,
    #[serde(rename = "gptModel")]
    pub gpt_model: String,
    #[serde(rename = "showTokens")]
    pub show_tokens: bool,
    pub delay: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let menu = ModelMenu::new();
        Self {
            input_dir: String::new(),
            output_dir: String::new(),
            max_title_chars: 200,
            max_tags: 45,
            gpt_api_key: String::new(),
            gemini_api_key: String::new(),
            ai_model: ProviderKind::Gpt,
            gemini_model: menu.default_model(ProviderKind::Gemini).to_string(),
            gpt_model: menu.default_model(ProviderKind::Gpt).to_string(),
            show_tokens: false,
            delay: 10.0,
            extra: Map::new(),
        }
    }
}

impl AppConfig {
    /// Loads the config file. A missing file silently yields defaults; an
    /// unreadable or malformed file yields defaults plus a warning for the
    /// caller to surface.
    pub fn load(path: &Path) -> (Self, Option<String>) {
        if !path.exists() {
            return (Self::default(), None);
        }
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                return (
                    Self::default(),
                    Some(format!(
                        "config file {} unreadable ({err}); using defaults",
                        path.display()
                    )),
                );
            }
        };
        match serde_json::from_str::<Self>(&raw) {
            Ok(config) => (config, None),
            Err(err) => (
                Self::default(),
                Some(format!(
                    "config file {} malformed ({err}); using defaults",
                    path.display()
                )),
            ),
        }
    }

    /// Writes the config as pretty JSON. Called after every setter; the menu
    /// layer reports failures but never aborts on them.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// API key for the active provider, `None` when unset.
    pub fn active_api_key(&self) -> Option<&str> {
        let key = match self.ai_model {
            ProviderKind::Gpt => self.gpt_api_key.trim(),
            ProviderKind::Gemini => self.gemini_api_key.trim(),
        };
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// Model identifier for the active provider.
    pub fn active_model(&self) -> &str {
        match self.ai_model {
            ProviderKind::Gpt => self.gpt_model.as_str(),
            ProviderKind::Gemini => self.gemini_model.as_str(),
        }
    }
}
