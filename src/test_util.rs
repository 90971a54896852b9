//! Scripted adapters for unit tests. Each call consumes the next step.

use image::RgbaImage;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::{
    AdapterFuture, MultiModalAdapter, OcrAdapter, ProviderResult, RawRegion, TranslateAdapter,
};
use crate::block::TextBlock;
use crate::error::Error;
use crate::geometry::BBoxPx;
use crate::glossary::Glossary;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Regions(Vec<RawRegion>),
    Blocks(Vec<TextBlock>),
    Translation(String),
    Fail(Error),
    Delay(Duration, Box<Step>),
}

impl Step {
    pub(crate) fn fail(provider: &str, cause: &str) -> Self {
        Step::Fail(Error::adapter(provider, cause))
    }

    pub(crate) fn after(delay: Duration, step: Step) -> Self {
        Step::Delay(delay, Box::new(step))
    }
}

async fn settle(mut step: Step) -> Step {
    while let Step::Delay(delay, next) = step {
        tokio::time::sleep(delay).await;
        step = *next;
    }
    step
}

fn unexpected<T>(name: &str, step: &Step) -> ProviderResult<T> {
    ProviderResult::failure(Error::adapter(name, format!("unexpected script step {:?}", step)))
}

struct Script {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl Script {
    fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.steps.lock().expect("script lock");
        steps
            .pop_front()
            .unwrap_or_else(|| Step::fail(&self.name, "script exhausted"))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn play_regions(name: &str, step: Step) -> ProviderResult<Vec<RawRegion>> {
    match settle(step).await {
        Step::Regions(regions) => ProviderResult::success(regions),
        Step::Fail(error) => ProviderResult::failure(error),
        other => unexpected(name, &other),
    }
}

async fn play_translation(name: &str, step: Step) -> ProviderResult<String> {
    match settle(step).await {
        Step::Translation(text) => ProviderResult::success(text),
        Step::Fail(error) => ProviderResult::failure(error),
        other => unexpected(name, &other),
    }
}

pub(crate) struct ScriptedOcr {
    script: Script,
}

impl ScriptedOcr {
    pub(crate) fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            script: Script::new(name, steps),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.script.calls()
    }
}

impl OcrAdapter for ScriptedOcr {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn detect(&self, _image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        let step = self.script.next();
        Box::pin(play_regions(&self.script.name, step))
    }
}

/// Translates by lookup; text with no entry fails.
pub(crate) struct ScriptedTranslate {
    name: String,
    answers: HashMap<String, Step>,
    calls: AtomicUsize,
}

impl ScriptedTranslate {
    pub(crate) fn new<I, K>(name: &str, answers: I) -> Self
    where
        I: IntoIterator<Item = (K, Step)>,
        K: Into<String>,
    {
        Self {
            name: name.to_string(),
            answers: answers.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranslateAdapter for ScriptedTranslate {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate<'a>(&'a self, text: &'a str, _glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .answers
            .get(text)
            .cloned()
            .unwrap_or_else(|| Step::fail(&self.name, "no scripted answer"));
        Box::pin(play_translation(&self.name, step))
    }
}

pub(crate) struct ScriptedMultiModal {
    script: Script,
}

impl ScriptedMultiModal {
    pub(crate) fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            script: Script::new(name, steps),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.script.calls()
    }
}

impl MultiModalAdapter for ScriptedMultiModal {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn detect(&self, _image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        let step = self.script.next();
        Box::pin(play_regions(&self.script.name, step))
    }

    fn translate<'a>(&'a self, _text: &'a str, _glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        let step = self.script.next();
        Box::pin(play_translation(&self.script.name, step))
    }

    fn detect_and_translate<'a>(
        &'a self,
        _image: Arc<RgbaImage>,
        _region_hint: Option<BBoxPx>,
        _glossary: &'a Glossary,
    ) -> AdapterFuture<'a, Vec<TextBlock>> {
        let step = self.script.next();
        Box::pin(async move {
            match settle(step).await {
                Step::Blocks(blocks) => ProviderResult::success(blocks),
                Step::Fail(error) => ProviderResult::failure(error),
                other => unexpected(&self.script.name, &other),
            }
        })
    }
}

pub(crate) fn region(text: &str, x: u32, y: u32, w: u32, h: u32) -> RawRegion {
    RawRegion::new(text, BBoxPx { x, y, w, h })
}
