use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Detecting,
    Translating,
    Merging,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ImageState {
    Done,
    Failed { reason: Error },
}

impl ImageState {
    pub fn is_done(&self) -> bool {
        matches!(self, ImageState::Done)
    }

    pub fn stage(&self) -> Stage {
        match self {
            ImageState::Done => Stage::Done,
            ImageState::Failed { .. } => Stage::Failed,
        }
    }
}

/// Final report for one image. Non-fatal failures end up in `diagnostics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSummary {
    pub image_id: Uuid,
    pub state: ImageState,
    pub blocks_ok: usize,
    pub blocks_failed: usize,
    pub diagnostics: Vec<Error>,
}

impl ImageSummary {
    pub(crate) fn failed(image_id: Uuid, reason: Error, diagnostics: Vec<Error>) -> Self {
        Self {
            image_id,
            state: ImageState::Failed { reason },
            blocks_ok: 0,
            blocks_failed: 0,
            diagnostics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage {
        image_id: Uuid,
        stage: Stage,
        blocks_done: usize,
        blocks_total: usize,
    },
    /// One per image. A second one for the same image supersedes the first;
    /// it is sent only when writing a finished image's output fails.
    Finished(ImageSummary),
    /// Images in a terminal state out of the whole batch.
    Batch { finished: usize, total: usize },
}

/// Optional progress channel. A dropped receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn stage(&self, image_id: Uuid, stage: Stage, blocks_done: usize, blocks_total: usize) {
        self.send(ProgressEvent::Stage {
            image_id,
            stage,
            blocks_done,
            blocks_total,
        });
    }

    pub(crate) fn finished(&self, summary: &ImageSummary) {
        self.stage(
            summary.image_id,
            summary.state.stage(),
            summary.blocks_ok + summary.blocks_failed,
            summary.blocks_ok + summary.blocks_failed,
        );
        self.send(ProgressEvent::Finished(summary.clone()));
    }

    pub(crate) fn send(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
