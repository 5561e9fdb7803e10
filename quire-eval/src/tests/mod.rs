use crate::batch::BatchOutcome;
use crate::document::Document;
use crate::error::Error;
use crate::evaluator::{EvalState, Evaluator};
use crate::settings::Settings;

use async_trait::async_trait;
use pretty_assertions::{assert_eq, assert_matches};
use quire_activity::SubscribeOptions;
use quire_output::{
    OutputContext, RenderCompletion, RenderOptions, Renderer, RendererFamily, Surface,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Records every text it renders, and the completion of each of its own
/// invocations.
///
/// `fail...` fails, `wait` blocks on `gate` and then returns without a
/// checkpoint, `pause` sleeps until stopped, anything else is printed.
#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    completions: Arc<Mutex<Vec<String>>>,
    gate: Arc<Notify>,
}

impl Recorder {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn completions(&self) -> Vec<String> {
        self.completions.lock().unwrap().clone()
    }

    async fn wait_for(&self, text: &str) {
        while !self.log().iter().any(|entry| entry == text) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Renderer<str> for Recorder {
    fn type_name(&self) -> &str {
        "record"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Text
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        text: &str,
        options: &RenderOptions,
    ) -> Result<Surface, quire_output::Error> {
        self.log.lock().unwrap().push(text.to_string());
        let completions = self.completions.clone();
        ocx.render_completions().subscribe(
            move |completion: &RenderCompletion| {
                if completion.renderer.type_name == "record" {
                    let text = completion.value.as_str().unwrap_or_default().to_string();
                    completions.lock().unwrap().push(text);
                }
            },
            SubscribeOptions::default(),
        )?;
        match text {
            text if text.starts_with("fail") => Err(quire_output::Error::render("record", "boom")),
            "wait" => {
                self.gate.notified().await;
                Ok(ocx.surface().clone())
            }
            "pause" => {
                ocx.sleep(Duration::from_secs(3600)).await?;
                Ok(ocx.surface().clone())
            }
            text => ocx.print(text, options).await,
        }
    }
}

fn document(cells: &[(&str, &str)]) -> Document {
    let cells: Vec<_> = cells
        .iter()
        .enumerate()
        .map(|(n, (kind, text))| json!({"id": format!("c{}", n + 1), "kind": kind, "text": text}))
        .collect();
    Document::from_snapshot(&json!({ "cells": cells }).to_string()).unwrap()
}

fn recording(texts: &[&str]) -> (Evaluator, Recorder) {
    let cells: Vec<_> = texts.iter().map(|text| ("record", *text)).collect();
    let evaluator = Evaluator::new(document(&cells), Settings::default());
    let recorder = Recorder::default();
    evaluator
        .session()
        .renderers()
        .add(Arc::new(recorder.clone()))
        .unwrap();
    (evaluator, recorder)
}

fn record_eval_states(evaluator: &Evaluator) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    evaluator
        .eval_states()
        .subscribe(
            move |state: &EvalState| {
                sink.lock()
                    .unwrap()
                    .push(format!("{}:{}", state.cell, state.evaluating))
            },
            SubscribeOptions::default(),
        )
        .unwrap();
    events
}

fn output_text(evaluator: &Evaluator, id: &str) -> String {
    evaluator.cell(id).unwrap().output().text_content()
}

#[tokio::test(start_paused = true)]
async fn batch_halts_on_mid_batch_failure() {
    let (evaluator, recorder) = recording(&["1", "2", "fail", "4"]);

    let err = evaluator.evaluate_all().await.unwrap_err();
    assert!(!err.is_stopped());
    assert_eq!(recorder.log(), ["1", "2", "fail"]);
    assert_eq!(output_text(&evaluator, "c3"), "record: boom");
    assert_eq!(output_text(&evaluator, "c4"), "");

    let completion = evaluator.last_batch_completion().unwrap();
    assert_eq!(
        completion.outcome(),
        Some(BatchOutcome::Failed("record: boom".to_string()))
    );
    assert!(
        tokio::time::timeout(Duration::from_secs(60), completion.resolved())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn batch_resolves_after_every_completion() {
    let (evaluator, recorder) = recording(&["1", "2", "3"]);
    let events = record_eval_states(&evaluator);

    let completion = evaluator.evaluate_all().await.unwrap();
    assert_eq!(completion.outcome(), None);
    assert!(evaluator.is_evaluating());

    completion.resolved().await;
    events.lock().unwrap().push("resolved".to_string());
    recorder.completions.lock().unwrap().push("resolved".to_string());

    assert_eq!(recorder.completions(), ["1", "2", "3", "resolved"]);

    assert_eq!(
        *events.lock().unwrap(),
        ["c1:true", "c1:false", "c2:true", "c2:false", "c3:true", "c3:false", "resolved"]
    );
    assert_eq!(output_text(&evaluator, "c2"), "2");
    assert!(!evaluator.is_evaluating());
}

#[tokio::test]
async fn stop_during_render_turns_success_into_cancellation() {
    let (evaluator, recorder) = recording(&["wait"]);
    let cell = evaluator.cell("c1").unwrap();

    let running = tokio::spawn({
        let evaluator = evaluator.clone();
        let cell = cell.clone();
        async move { evaluator.evaluate_cell(&cell).await }
    });
    recorder.wait_for("wait").await;

    assert!(evaluator.can_stop_cell(&cell));
    let tree = evaluator.activity_tree();
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].label, "output-context");

    evaluator.stop_cell(&cell);
    recorder.gate.notify_one();

    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_stopped());
    assert!(!evaluator.can_stop_cell(&cell));
    assert_eq!(output_text(&evaluator, "c1"), "stopped");
    assert!(evaluator.activity_tree().children.is_empty());
}

#[tokio::test]
async fn external_stop_halts_batch() {
    let (evaluator, recorder) = recording(&["1", "pause", "3"]);

    let running = tokio::spawn({
        let evaluator = evaluator.clone();
        async move { evaluator.evaluate_all().await }
    });
    recorder.wait_for("pause").await;
    evaluator.stop();

    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_stopped());
    assert_eq!(recorder.log(), ["1", "pause"]);
    assert_eq!(
        evaluator.last_batch_completion().unwrap().outcome(),
        Some(BatchOutcome::Stopped)
    );
    assert!(!evaluator.activity().is_stopped());
}

#[tokio::test]
async fn evaluate_before_stops_at_the_target() {
    let (evaluator, recorder) = recording(&["1", "2", "3"]);

    let completion = evaluator.evaluate_before("c2").await.unwrap();
    completion.resolved().await;
    assert_eq!(recorder.log(), ["1"]);

    assert_matches!(
        evaluator.evaluate_before("missing").await,
        Err(Error::CellNotFound(id)) if id == "missing"
    );
}

#[tokio::test]
async fn global_state_is_shared_within_and_reset_between_batches() {
    let evaluator = Evaluator::new(
        document(&[("script", "set n 1"), ("script", "get n")]),
        Settings::default(),
    );
    evaluator.evaluate_all().await.unwrap();
    assert_eq!(output_text(&evaluator, "c2"), "1");

    let second = evaluator.cell("c2").unwrap();
    evaluator.evaluate_batch(&[second], None).await.unwrap();
    assert_eq!(output_text(&evaluator, "c2"), "1null");
}

#[tokio::test]
async fn reset_before_render_replaces_previous_output() {
    let evaluator = Evaluator::new(document(&[("script", "print x")]), Settings::default());
    let cell = evaluator.cell("c1").unwrap();
    evaluator.evaluate_cell(&cell).await.unwrap();
    evaluator.evaluate_cell(&cell).await.unwrap();
    assert_eq!(cell.output().text_content(), "xx");

    evaluator.update_settings(Settings {
        reset_before_render: true,
        ..Settings::default()
    });
    evaluator.evaluate_cell(&cell).await.unwrap();
    assert_eq!(cell.output().text_content(), "x");
    let output = &cell.output().children()[0];
    assert_eq!(output.attr("data-source-element").as_deref(), Some("c1"));
    assert_eq!(output.attr("data-source-media-type").as_deref(), Some("text/script"));
}

#[tokio::test(start_paused = true)]
async fn background_work_keeps_cell_running_until_stopped() {
    let evaluator = Evaluator::new(
        document(&[("script", "bg 50 later\nbg 5000 never")]),
        Settings::default(),
    );
    let events = record_eval_states(&evaluator);
    let cell = evaluator.cell("c1").unwrap();

    evaluator.evaluate_cell(&cell).await.unwrap();
    assert!(evaluator.can_stop_cell(&cell));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cell.output().text_content(), "later\n");
    assert!(evaluator.is_evaluating());

    evaluator.stop();
    assert!(!evaluator.can_stop_cell(&cell));
    assert_eq!(*events.lock().unwrap(), ["c1:true", "c1:false"]);
}

#[tokio::test(start_paused = true)]
async fn background_work_ends_cell_when_done() {
    let evaluator = Evaluator::new(document(&[("script", "bg 10 later")]), Settings::default());
    let events = record_eval_states(&evaluator);
    let cell = evaluator.cell("c1").unwrap();

    evaluator.evaluate_cell(&cell).await.unwrap();
    assert!(evaluator.is_evaluating());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cell.output().text_content(), "later\n");
    assert!(!evaluator.is_evaluating());
    assert!(!evaluator.can_stop_cell(&cell));
    assert_eq!(*events.lock().unwrap(), ["c1:true", "c1:false"]);
}

#[tokio::test]
async fn commands_dispatch_to_the_evaluator() {
    let (evaluator, recorder) = recording(&["1", "2"]);

    assert!(!evaluator.perform_command("frobnicate", Some("c1")).await.unwrap());
    assert!(!evaluator.perform_command("eval", None).await.unwrap());
    assert!(!evaluator.perform_command("eval", Some("missing")).await.unwrap());

    assert!(evaluator.perform_command("eval", Some("c2")).await.unwrap());
    assert_eq!(recorder.log(), ["2"]);

    assert!(evaluator.perform_command("duplicate", Some("c1")).await.unwrap());
    assert!(evaluator.perform_command("move-up", Some("c2")).await.unwrap());
    assert!(evaluator.perform_command("move-up", Some("c2")).await.unwrap());
    assert!(!evaluator.perform_command("move-up", Some("c2")).await.unwrap());
    let ids: Vec<_> = evaluator
        .document()
        .cells()
        .iter()
        .map(|cell| cell.id().to_string())
        .collect();
    assert_eq!(ids, ["c2", "c1", "cell-1"]);

    assert!(evaluator.perform_command("delete", Some("cell-1")).await.unwrap());
    assert_eq!(evaluator.document().len(), 2);

    assert!(evaluator.perform_command("reset-all", None).await.unwrap());
    assert_eq!(output_text(&evaluator, "c2"), "");
    assert!(!evaluator.perform_command("eval", Some("c1")).await.unwrap());
    assert_eq!(recorder.log(), ["2"]);
}
