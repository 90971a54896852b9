use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::llm::{LlmText, LlmVision};
use super::local::LocalLlm;
use super::prompts::Languages;
use super::tesseract::Tesseract;
use super::Adapter;
use crate::providers::{OpenAI, ProviderKind, build_provider, get_env, resolve_key};

/// A backend named in settings or on the command line, e.g. `gemini`,
/// `openai-ocr:gpt-4o`, `openai-text`, `tesseract:jpn+eng` or `local:sakura-14b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSpec {
    /// Detect and translate in one call.
    Vision {
        provider: ProviderKind,
        model: Option<String>,
    },
    /// Vision model used for detection only.
    VisionOcr {
        provider: ProviderKind,
        model: Option<String>,
    },
    Text {
        provider: ProviderKind,
        model: Option<String>,
    },
    Tesseract {
        languages: Option<String>,
    },
    Local {
        model: Option<String>,
    },
}

impl FromStr for AdapterSpec {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("adapter name is empty");
        }
        let (head, arg) = match value.split_once(':') {
            Some((head, arg)) => (head.trim(), Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
            None => (value, None),
        };
        let head = head.to_ascii_lowercase();
        match head.as_str() {
            "tesseract" => return Ok(AdapterSpec::Tesseract { languages: arg }),
            "local" => return Ok(AdapterSpec::Local { model: arg }),
            _ => {}
        }
        let (name, mode) = match head.rsplit_once('-') {
            Some((name, mode)) if matches!(mode, "ocr" | "text") => (name, Some(mode)),
            _ => (head.as_str(), None),
        };
        let provider = ProviderKind::from_name(name)
            .ok_or_else(|| anyhow!("unknown adapter '{}'", value))?;
        Ok(match mode {
            Some("ocr") => AdapterSpec::VisionOcr { provider, model: arg },
            Some(_) => AdapterSpec::Text { provider, model: arg },
            None => AdapterSpec::Vision { provider, model: arg },
        })
    }
}

impl fmt::Display for AdapterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (head, arg) = match self {
            AdapterSpec::Vision { provider, model } => (provider.as_str().to_string(), model),
            AdapterSpec::VisionOcr { provider, model } => (format!("{}-ocr", provider.as_str()), model),
            AdapterSpec::Text { provider, model } => (format!("{}-text", provider.as_str()), model),
            AdapterSpec::Tesseract { languages } => ("tesseract".to_string(), languages),
            AdapterSpec::Local { model } => ("local".to_string(), model),
        };
        match arg {
            Some(arg) => write!(f, "{}:{}", head, arg),
            None => write!(f, "{}", head),
        }
    }
}

/// Everything adapter construction needs besides the adapter name.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub languages: Languages,
    pub openai_key: Option<String>,
    pub gemini_key: Option<String>,
    pub local_base_url: String,
    pub local_model: String,
    pub tesseract_languages: String,
    /// Size class name to pixel size, for vision detectors.
    pub font_sizes: BTreeMap<String, u32>,
}

impl BuildContext {
    pub fn new(languages: Languages) -> Self {
        Self {
            languages,
            openai_key: None,
            gemini_key: None,
            local_base_url: "http://127.0.0.1:8080/v1".to_string(),
            local_model: "local-model".to_string(),
            tesseract_languages: "eng".to_string(),
            font_sizes: BTreeMap::new(),
        }
    }

    fn key_for(&self, provider: ProviderKind) -> Result<String> {
        let override_key = match provider {
            ProviderKind::OpenAI => self.openai_key.as_deref(),
            ProviderKind::Gemini => self.gemini_key.as_deref(),
        };
        resolve_key(provider, override_key)
    }
}

/// Construct one adapter. API keys are looked up here, so a missing key fails
/// configuration rather than the first call.
pub fn build_adapter(
    spec: &AdapterSpec,
    context: &BuildContext,
    client: &reqwest::Client,
) -> Result<Adapter> {
    let name = spec.to_string();
    let adapter = match spec {
        AdapterSpec::Vision { provider, model } => {
            let key = context.key_for(*provider)?;
            let provider = build_provider(*provider, key, model.clone(), client.clone());
            Adapter::MultiModal(Arc::new(
                LlmVision::new(name, provider, context.languages.clone())
                    .with_font_sizes(context.font_sizes.clone()),
            ))
        }
        AdapterSpec::VisionOcr { provider, model } => {
            let key = context.key_for(*provider)?;
            let provider = build_provider(*provider, key, model.clone(), client.clone());
            Adapter::OcrOnly(Arc::new(
                LlmVision::new(name, provider, context.languages.clone())
                    .with_font_sizes(context.font_sizes.clone()),
            ))
        }
        AdapterSpec::Text { provider, model } => {
            let key = context.key_for(*provider)?;
            let provider = build_provider(*provider, key, model.clone(), client.clone());
            Adapter::TranslateOnly(Arc::new(LlmText::new(name, provider, context.languages.clone())))
        }
        AdapterSpec::Tesseract { languages } => {
            let languages = languages
                .clone()
                .unwrap_or_else(|| context.tesseract_languages.clone());
            Adapter::OcrOnly(Arc::new(Tesseract::new(languages)))
        }
        AdapterSpec::Local { model } => {
            let model = model.clone().unwrap_or_else(|| context.local_model.clone());
            let key = get_env("LOCAL_LLM_API_KEY").unwrap_or_default();
            let client = OpenAI::new(key, client.clone())
                .with_base_url(context.local_base_url.clone())
                .with_model(model);
            Adapter::TranslateOnly(Arc::new(LocalLlm::new(client, context.languages.clone())))
        }
    };
    Ok(adapter)
}
