mod common;

use common::{BrokenOcr, FixedOcr, TableTranslate, region, session};
use llm_image_translator::{
    Adapter, AdapterChain, BlockStatus, Error, Glossary, ImageState, Pipeline, ProgressEvent,
    ProgressSink, Stage, run_batch,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn translator() -> Adapter {
    Adapter::TranslateOnly(Arc::new(TableTranslate::new(
        "dictionary",
        &[("猫", "cat"), ("犬", "dog")],
    )))
}

#[tokio::test]
async fn ocr_fallback_reaches_done_and_records_primary_failure() {
    let fallback = Arc::new(FixedOcr::new(
        "tesseract",
        vec![region("猫", 10, 10, 40, 20)],
    ));
    let chain = AdapterChain::new(Adapter::OcrOnly(Arc::new(BrokenOcr("gemini"))))
        .with_fallback_ocr(Adapter::OcrOnly(fallback.clone()))
        .with_translate(translator());
    let pipeline = Pipeline::new(chain);
    let session = session(200, 100);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let summary = pipeline
        .process(
            &session,
            &Glossary::new(),
            &CancellationToken::new(),
            &ProgressSink::new(tx),
        )
        .await;

    assert_eq!(summary.state, ImageState::Done);
    assert_eq!((summary.blocks_ok, summary.blocks_failed), (1, 0));
    assert_eq!(fallback.calls(), 1);
    assert_eq!(summary.diagnostics.len(), 1);
    assert!(matches!(
        &summary.diagnostics[0],
        Error::AdapterFailure { provider, .. } if provider == "gemini"
    ));
    let blocks = session.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].original_text, "猫");
    assert_eq!(blocks[0].translated_text, "cat");

    let mut stages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Stage { stage, .. } = event {
            if stages.last() != Some(&stage) {
                stages.push(stage);
            }
        }
    }
    assert_eq!(
        stages,
        vec![
            Stage::Detecting,
            Stage::Translating,
            Stage::Merging,
            Stage::Done
        ]
    );
}

#[tokio::test]
async fn untranslatable_block_does_not_fail_the_image() {
    let ocr = FixedOcr::new(
        "ocr",
        vec![region("猫", 10, 10, 40, 20), region("鳥", 10, 60, 40, 20)],
    );
    let pipeline = Pipeline::new(
        AdapterChain::new(Adapter::OcrOnly(Arc::new(ocr))).with_translate(translator()),
    );
    let session = session(200, 100);

    let summary = pipeline
        .process(
            &session,
            &Glossary::new(),
            &CancellationToken::new(),
            &ProgressSink::disabled(),
        )
        .await;

    assert!(summary.state.is_done());
    assert_eq!((summary.blocks_ok, summary.blocks_failed), (1, 1));
    let blocks = session.blocks();
    assert_eq!(blocks[0].status, BlockStatus::Ok);
    assert!(matches!(blocks[1].status, BlockStatus::PartialFailure { .. }));
    assert_eq!(blocks[1].original_text, "鳥");
    assert!(blocks[1].translated_text.is_empty());
}

#[tokio::test]
async fn split_line_is_translated_once_as_a_whole() {
    let ocr = FixedOcr::new(
        "ocr",
        vec![region("吾輩は", 10, 10, 60, 20), region("猫である", 75, 10, 80, 20)],
    );
    let translate = TableTranslate::new("dictionary", &[("吾輩は猫である", "I am a cat")]);
    let pipeline = Pipeline::new(
        AdapterChain::new(Adapter::OcrOnly(Arc::new(ocr)))
            .with_translate(Adapter::TranslateOnly(Arc::new(translate))),
    );
    let session = session(200, 100);

    let summary = pipeline
        .process(
            &session,
            &Glossary::new(),
            &CancellationToken::new(),
            &ProgressSink::disabled(),
        )
        .await;

    assert!(summary.state.is_done());
    assert!(summary.diagnostics.is_empty());
    let blocks = session.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].original_text, "吾輩は猫である");
    assert_eq!(blocks[0].translated_text, "I am a cat");
    assert_eq!(blocks[0].status, BlockStatus::Ok);
}

#[tokio::test]
async fn glossary_overrides_reach_the_translator() {
    let ocr = FixedOcr::new("ocr", vec![region("猫", 10, 10, 40, 20)]);
    let pipeline = Pipeline::new(
        AdapterChain::new(Adapter::OcrOnly(Arc::new(ocr))).with_translate(translator()),
    );
    let session = session(200, 100);
    let glossary = Glossary::from_pairs([("猫", "cat"), ("猫", "kitty")]);

    let summary = pipeline
        .process(
            &session,
            &glossary,
            &CancellationToken::new(),
            &ProgressSink::disabled(),
        )
        .await;

    assert!(summary.state.is_done());
    assert_eq!(session.blocks()[0].translated_text, "kitty");
}

#[tokio::test]
async fn one_failing_image_leaves_the_rest_of_the_batch_done() {
    let ocr = Arc::new(
        FixedOcr::new("ocr", vec![region("犬", 4, 4, 30, 20)]).failing_on_width(103),
    );
    let pipeline = Arc::new(Pipeline::new(
        AdapterChain::new(Adapter::OcrOnly(ocr.clone())).with_translate(translator()),
    ));
    let sessions: Vec<_> = (0..5).map(|i| session(100 + i, 80)).collect();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let summaries = run_batch(
        pipeline,
        sessions.clone(),
        Arc::new(Glossary::new()),
        2,
        CancellationToken::new(),
        ProgressSink::new(tx),
    )
    .await;

    assert_eq!(summaries.len(), 5);
    assert_eq!(ocr.calls(), 5);
    for (index, (summary, session)) in summaries.iter().zip(&sessions).enumerate() {
        assert_eq!(summary.image_id, session.id());
        if index == 3 {
            assert!(matches!(summary.state, ImageState::Failed { .. }));
            assert!(session.is_empty());
        } else {
            assert!(summary.state.is_done(), "image {} should be done", index);
            assert_eq!(session.blocks()[0].translated_text, "dog");
        }
    }

    let mut finished = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ProgressEvent::Finished(_)) {
            finished += 1;
        }
    }
    assert_eq!(finished, 5);
}

#[tokio::test]
async fn cancelled_batch_never_calls_an_adapter() {
    let ocr = Arc::new(FixedOcr::new("ocr", vec![region("猫", 4, 4, 30, 20)]));
    let pipeline = Arc::new(Pipeline::new(
        AdapterChain::new(Adapter::OcrOnly(ocr.clone())).with_translate(translator()),
    ));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summaries = run_batch(
        pipeline,
        (0..3).map(|_| session(64, 64)).collect(),
        Arc::new(Glossary::new()),
        2,
        cancel,
        ProgressSink::disabled(),
    )
    .await;

    assert_eq!(ocr.calls(), 0);
    assert!(summaries.iter().all(|summary| summary.state
        == ImageState::Failed {
            reason: Error::Cancelled
        }));
}
