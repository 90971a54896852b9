use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source_term: String,
    pub target_term: String,
}

/// Ordered source-term to target-term table.
///
/// Source terms are unique. Re-inserting a source keeps its original position
/// and replaces the target, so the last write for a term always wins.
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    entries: Vec<GlossaryEntry>,
    index: HashMap<String, usize>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut glossary = Self::new();
        glossary.import(pairs);
        glossary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.index
            .get(source.trim())
            .map(|&idx| self.entries[idx].target_term.as_str())
    }

    pub fn entries(&self) -> &[GlossaryEntry] {
        &self.entries
    }

    /// Insert or overwrite. Returns the previous target when the source existed.
    /// Blank sources or targets are ignored.
    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) -> Option<String> {
        let source = source.into().trim().to_string();
        let target = target.into().trim().to_string();
        if source.is_empty() || target.is_empty() {
            return None;
        }
        if let Some(&idx) = self.index.get(&source) {
            return Some(std::mem::replace(&mut self.entries[idx].target_term, target));
        }
        self.index.insert(source.clone(), self.entries.len());
        self.entries.push(GlossaryEntry {
            source_term: source,
            target_term: target,
        });
        None
    }

    pub fn remove(&mut self, source: &str) -> Option<String> {
        let idx = self.index.remove(source.trim())?;
        let removed = self.entries.remove(idx);
        for position in self.index.values_mut() {
            if *position > idx {
                *position -= 1;
            }
        }
        Some(removed.target_term)
    }

    pub fn import<I, S, T>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        for (source, target) in pairs {
            self.insert(source, target);
        }
    }

    pub fn export(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|entry| (entry.source_term.clone(), entry.target_term.clone()))
            .collect()
    }

    /// Parse `source->target` lines. Text after `#` is a comment; other lines are skipped.
    pub fn parse(text: &str) -> Self {
        let pairs = text.lines().filter_map(parse_line);
        Self::from_pairs(pairs)
    }

    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}->{}\n", entry.source_term, entry.target_term))
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read glossary: {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())
            .with_context(|| format!("failed to write glossary: {}", path.display()))
    }

    /// Entries whose source term occurs in `text`, in glossary order.
    pub fn matching(&self, text: &str) -> Self {
        let pairs = self
            .entries
            .iter()
            .filter(|entry| text.contains(entry.source_term.as_str()))
            .map(|entry| (entry.source_term.clone(), entry.target_term.clone()));
        Self::from_pairs(pairs)
    }

    /// Glossary block for translation prompts; empty when there are no entries.
    pub fn prompt_segment(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut segment = String::from(
            "Strictly adhere to the following glossary if terms are present:\n<glossary>\n",
        );
        segment.push_str(&self.to_text());
        segment.push_str("</glossary>\n");
        segment
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (source, rest) = line.split_once("->")?;
    let target = rest.split('#').next().unwrap_or_default();
    let source = source.trim();
    let target = target.trim();
    if source.is_empty() || target.is_empty() {
        return None;
    }
    Some((source.to_string(), target.to_string()))
}
