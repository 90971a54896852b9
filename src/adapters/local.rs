use super::prompts::{Languages, render_local_prompt};
use super::{AdapterFuture, ProviderResult, TranslateAdapter};
use crate::error::from_anyhow;
use crate::glossary::Glossary;
use crate::providers::{OpenAI, Provider};

/// Translation through a self-hosted model behind an OpenAI-compatible
/// chat-completions endpoint. Replies are plain text, no tool calls.
pub struct LocalLlm {
    name: String,
    client: OpenAI,
    languages: Languages,
}

impl LocalLlm {
    pub fn new(client: OpenAI, languages: Languages) -> Self {
        Self {
            name: format!("local:{}", client.model()),
            client,
            languages,
        }
    }
}

impl TranslateAdapter for LocalLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        Box::pin(async move {
            let prompt = match render_local_prompt(&self.languages, &glossary.matching(text)) {
                Ok(prompt) => prompt,
                Err(err) => return ProviderResult::failure(from_anyhow(&self.name, err)),
            };
            let reply = self
                .client
                .clone()
                .append_system_input(prompt)
                .append_user_input(text.to_string())
                .complete_text()
                .await;
            match reply {
                Ok(translation) => ProviderResult::success(strip_wrapping(&translation)),
                Err(err) => ProviderResult::failure(from_anyhow(&self.name, err)),
            }
        })
    }
}

/// Local models like to quote their answer or prefix it with a label.
fn strip_wrapping(reply: &str) -> String {
    let mut text = reply.trim();
    for label in ["Translation:", "translation:", "译文：", "译文:"] {
        if let Some(rest) = text.strip_prefix(label) {
            text = rest.trim_start();
        }
    }
    for (open, close) in [('"', '"'), ('「', '」'), ('“', '”')] {
        if text.chars().count() >= 2 && text.starts_with(open) && text.ends_with(close) {
            let inner = &text[open.len_utf8()..text.len() - close.len_utf8()];
            if !inner.contains(open) && !inner.contains(close) {
                text = inner.trim();
            }
        }
    }
    text.to_string()
}
