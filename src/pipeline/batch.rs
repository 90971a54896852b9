use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::progress::{ImageSummary, ProgressEvent, ProgressSink, Stage};
use super::Pipeline;
use crate::error::Error;
use crate::glossary::Glossary;
use crate::session::Session;

/// Process every session with at most `workers` images in flight.
///
/// Summaries come back in input order. A failed image never stops its
/// siblings; after cancellation, images that have not started are reported
/// as `Failed{Cancelled}` without touching any adapter.
pub async fn run_batch(
    pipeline: Arc<Pipeline>,
    sessions: Vec<Arc<Session>>,
    glossary: Arc<Glossary>,
    workers: usize,
    cancel: CancellationToken,
    progress: ProgressSink,
) -> Vec<ImageSummary> {
    let total = sessions.len();
    let workers = workers.max(1);
    info!(images = total, workers, "starting batch");
    for session in &sessions {
        progress.stage(session.id(), Stage::Idle, 0, 0);
    }

    let semaphore = Arc::new(Semaphore::new(workers));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();
    for (index, session) in sessions.iter().cloned().enumerate() {
        let pipeline = Arc::clone(&pipeline);
        let glossary = Arc::clone(&glossary);
        let semaphore = Arc::clone(&semaphore);
        let finished = Arc::clone(&finished);
        let cancel = cancel.clone();
        let progress = progress.clone();
        tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let summary = match permit {
                Some(_permit) if !cancel.is_cancelled() => {
                    pipeline
                        .process(&session, &glossary, &cancel, &progress)
                        .await
                }
                _ => {
                    let summary = ImageSummary::failed(session.id(), Error::Cancelled, Vec::new());
                    progress.finished(&summary);
                    summary
                }
            };
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            progress.send(ProgressEvent::Batch {
                finished: done,
                total,
            });
            (index, summary)
        });
    }

    let mut summaries: Vec<Option<ImageSummary>> = vec![None; total];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, summary)) => summaries[index] = Some(summary),
            Err(err) => warn!(error = %err, "pipeline task aborted"),
        }
    }

    summaries
        .into_iter()
        .zip(&sessions)
        .map(|(summary, session)| {
            summary.unwrap_or_else(|| {
                let summary = ImageSummary::failed(
                    session.id(),
                    Error::adapter("pipeline", "task aborted"),
                    Vec::new(),
                );
                progress.finished(&summary);
                summary
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Adapter;
    use crate::pipeline::{AdapterChain, ImageState};
    use crate::test_util::{ScriptedOcr, ScriptedTranslate, Step, region};
    use image::RgbaImage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sessions(count: usize) -> Vec<Arc<Session>> {
        (0..count)
            .map(|_| Arc::new(Session::new(RgbaImage::new(64, 64))))
            .collect()
    }

    fn translate() -> Adapter {
        Adapter::TranslateOnly(Arc::new(ScriptedTranslate::new(
            "remote",
            [("猫", Step::Translation("cat".to_string()))],
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_images_still_finish_once() {
        let ocr = Arc::new(ScriptedOcr::new(
            "slow",
            (0..4)
                .map(|_| {
                    Step::after(
                        Duration::from_secs(1),
                        Step::Regions(vec![region("猫", 0, 0, 20, 20)]),
                    )
                })
                .collect(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            AdapterChain::new(Adapter::OcrOnly(ocr.clone())).with_translate(translate()),
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summaries = run_batch(
            pipeline,
            sessions(4),
            Arc::new(Glossary::new()),
            1,
            cancel,
            ProgressSink::new(tx),
        )
        .await;

        let done = summaries.iter().filter(|s| s.state.is_done()).count();
        let cancelled = summaries
            .iter()
            .filter(|s| {
                s.state
                    == ImageState::Failed {
                        reason: Error::Cancelled,
                    }
            })
            .count();
        assert_eq!((done, cancelled), (1, 3));
        // the second image was in flight when the token fired
        assert_eq!(ocr.calls(), 2);

        let mut finished = 0;
        let mut last_batch = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::Finished(_) => finished += 1,
                ProgressEvent::Batch { finished: n, total } => last_batch = Some((n, total)),
                _ => {}
            }
        }
        assert_eq!(finished, 4);
        assert_eq!(last_batch, Some((4, 4)));
    }

    #[tokio::test]
    async fn zero_workers_still_makes_progress() {
        let ocr = Arc::new(ScriptedOcr::new(
            "ocr",
            vec![Step::Regions(vec![region("猫", 0, 0, 20, 20)])],
        ));
        let pipeline = Arc::new(Pipeline::new(
            AdapterChain::new(Adapter::OcrOnly(ocr)).with_translate(translate()),
        ));
        let summaries = run_batch(
            pipeline,
            sessions(1),
            Arc::new(Glossary::new()),
            0,
            CancellationToken::new(),
            ProgressSink::disabled(),
        )
        .await;
        assert!(summaries[0].state.is_done());
    }
}
