use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tera::{Context as TeraContext, Tera};

use crate::geometry::BBoxPx;
use crate::glossary::Glossary;
use crate::providers::ToolSpec;

pub(crate) const DETECT_TOOL: &str = "report_text_blocks";
pub(crate) const TRANSLATE_TOOL: &str = "deliver_translation";

/// Size classes a detector may report, smallest first.
pub(crate) const SIZE_CLASSES: [&str; 5] = ["very_small", "small", "medium", "large", "very_large"];

const DETECT_TEMPLATE: &str = include_str!("prompts/detect_prompt.tera");
const TRANSLATE_TEMPLATE: &str = include_str!("prompts/translate_prompt.tera");
const LOCAL_TEMPLATE: &str = include_str!("prompts/local_prompt.tera");

/// Language pair an adapter is configured for. `source_lang` may be `auto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Languages {
    pub source_lang: String,
    pub target_lang: String,
}

impl Languages {
    pub fn new(source_lang: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }

    fn insert_into(&self, context: &mut TeraContext) {
        let source = self.source_lang.trim();
        context.insert(
            "source_lang",
            if source.is_empty() { "auto" } else { source },
        );
        context.insert("target_lang", self.target_lang.trim());
    }
}

#[derive(Serialize)]
struct Region {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

pub(crate) struct DetectPrompt<'a> {
    pub(crate) languages: &'a Languages,
    pub(crate) translate: bool,
    pub(crate) glossary: &'a Glossary,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) region_hint: Option<BBoxPx>,
}

pub(crate) fn render_detect_prompt(prompt: &DetectPrompt<'_>) -> Result<String> {
    let mut context = TeraContext::new();
    prompt.languages.insert_into(&mut context);
    context.insert("translate", &prompt.translate);
    context.insert("width", &prompt.width);
    context.insert("height", &prompt.height);
    let region = prompt.region_hint.map(|bbox| Region {
        x0: bbox.x,
        y0: bbox.y,
        x1: bbox.right(),
        y1: bbox.bottom(),
    });
    context.insert("region", &region);
    context.insert("glossary", &prompt.glossary.prompt_segment());
    context.insert("tool_name", DETECT_TOOL);
    context.insert("size_classes", &SIZE_CLASSES.map(|name| format!("\"{}\"", name)).join(", "));
    Tera::one_off(DETECT_TEMPLATE, &context, false)
        .with_context(|| "failed to render detection prompt")
}

pub(crate) fn render_translate_prompt(languages: &Languages, glossary: &Glossary) -> Result<String> {
    let mut context = TeraContext::new();
    languages.insert_into(&mut context);
    context.insert("glossary", &glossary.prompt_segment());
    context.insert("tool_name", TRANSLATE_TOOL);
    Tera::one_off(TRANSLATE_TEMPLATE, &context, false)
        .with_context(|| "failed to render translation prompt")
}

pub(crate) fn render_local_prompt(languages: &Languages, glossary: &Glossary) -> Result<String> {
    let mut context = TeraContext::new();
    languages.insert_into(&mut context);
    context.insert("glossary", &glossary.prompt_segment());
    Tera::one_off(LOCAL_TEMPLATE, &context, false)
        .with_context(|| "failed to render local translation prompt")
}

pub(crate) fn detect_tool_spec(translate: bool) -> ToolSpec {
    let mut properties = json!({
        "bbox": {
            "type": "array",
            "items": {"type": "integer"},
            "description": "[x0, y0, x1, y1] in image pixels"
        },
        "text": {"type": "string"},
        "orientation": {
            "type": "string",
            "enum": ["horizontal", "vertical_rtl", "vertical_ltr"]
        },
        "angle": {"type": "number"},
        "confidence": {"type": "number"},
        "font_size_category": {
            "type": "string",
            "enum": SIZE_CLASSES
        }
    });
    let mut required = vec!["bbox", "text"];
    if translate {
        properties["translation"] = json!({"type": "string"});
        required.push("translation");
    }
    ToolSpec {
        name: DETECT_TOOL.to_string(),
        description: "Report the text regions found in the image.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "blocks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": required
                    }
                }
            },
            "required": ["blocks"]
        }),
    }
}

pub(crate) fn translate_tool_spec() -> ToolSpec {
    ToolSpec {
        name: TRANSLATE_TOOL.to_string(),
        description: "Return the translation.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "translation": {"type": "string"}
            },
            "required": ["translation"]
        }),
    }
}
