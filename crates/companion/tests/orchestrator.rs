use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use companion::analysis::{
    AnalysisFailure, AnalysisRequest, AnalysisResult, CodeAnalysis, GeneralAnalysis,
};
use companion::api::{Analyzer, Target};
use companion::capture;
use companion::config::{AnalysisConfig, ProviderKind};
use companion::events::{self, Event, EventReceiver};
use companion::prepare::ImageContent;
use companion::state::{Mode, Selection};
use companion::{Orchestrator, Settings};
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
struct Call {
    mode: Mode,
    images: Vec<String>,
    previous_context: Option<String>,
}

struct FakeAnalyzer {
    target: Option<Target>,
    /// When set, every call waits for one permit.
    gate: Option<Arc<Semaphore>>,
    fail: AtomicBool,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    seen: Mutex<Vec<Call>>,
}

impl FakeAnalyzer {
    fn new() -> Self {
        Self {
            target: Some(Target {
                provider: ProviderKind::Local,
                model: "fake".into(),
            }),
            gate: None,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<Call> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    fn resolve(&self, _selection: &Selection) -> Option<Target> {
        self.target.clone()
    }

    async fn analyze(
        &self,
        _target: &Target,
        request: AnalysisRequest,
        mode: Mode,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.seen.lock().push(Call {
            mode,
            images: request.images.iter().map(|i| i.data.clone()).collect(),
            previous_context: request.previous_context.clone(),
        });

        if let Some(ref gate) = self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(AnalysisFailure::classify(mode, "API server error. Try again."));
        }
        Ok(match mode {
            Mode::Code => AnalysisResult::Code(CodeAnalysis {
                code: format!("fn call_{n}() {{}}"),
                summary: format!("Run {n}"),
                time_complexity: "O(n)".into(),
                space_complexity: "O(1)".into(),
                language: "Rust".into(),
            }),
            Mode::General => AnalysisResult::General(GeneralAnalysis {
                answer: format!("Answer {n}"),
                explanation: "Because.".into(),
                test: "Check it.".into(),
            }),
        })
    }
}

struct Harness {
    orchestrator: Orchestrator,
    analyzer: Arc<FakeAnalyzer>,
    events: EventReceiver,
    _dir: tempfile::TempDir,
}

fn harness(analyzer: FakeAnalyzer) -> Harness {
    harness_with(analyzer, 2, Duration::from_millis(10))
}

fn harness_with(analyzer: FakeAnalyzer, max_slots: usize, debounce: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        screenshot_dir: dir.path().join("shots"),
        max_slots,
        max_width: 64,
        debounce,
        hide_delay: Duration::ZERO,
        mode: Mode::Code,
        prompts: AnalysisConfig::default(),
    };
    let analyzer = Arc::new(analyzer);
    let (tx, rx) = events::channel();
    Harness {
        orchestrator: Orchestrator::new(settings, analyzer.clone(), tx),
        analyzer,
        events: rx,
        _dir: dir,
    }
}

fn png(shade: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(16, 16, Rgba([shade, shade, shade, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Base64 payload the analyzer receives for a screenshot of `shade`.
fn payload(shade: u8) -> String {
    ImageContent::png(&capture::normalize(&png(shade), 64).unwrap()).data
}

async fn wait_for(rx: &mut EventReceiver, pred: impl Fn(&Event) -> bool) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

fn is_result(event: &Event) -> bool {
    matches!(event, Event::AnalysisResult(_))
}

#[tokio::test]
async fn second_capture_triggers_and_wrap_extends_context() {
    let mut h = harness(FakeAnalyzer::new());

    let first = h.orchestrator.ingest(png(10)).await.unwrap();
    assert_eq!(first.index, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 0);

    h.orchestrator.ingest(png(20)).await.unwrap();
    let Event::AnalysisResult(markdown) = wait_for(&mut h.events, is_result).await else {
        unreachable!()
    };
    assert!(markdown.contains("fn call_1"));
    let context = h.orchestrator.previous_context(Mode::Code).unwrap();
    assert!(context.contains("call_1"));

    // Ring is full and a result exists: one more capture wraps to slot 1 and
    // triggers on its own.
    let wrapped = h.orchestrator.ingest(png(30)).await.unwrap();
    assert_eq!(wrapped.index, 1);
    wait_for(&mut h.events, is_result).await;

    let seen = h.analyzer.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].images, vec![payload(10), payload(20)]);
    assert_eq!(seen[0].previous_context, None);
    assert_eq!(seen[1].images, vec![payload(30), payload(20)]);
    assert_eq!(seen[1].previous_context.as_deref(), Some(context.as_str()));
}

#[tokio::test]
async fn triggers_while_running_coalesce_into_one_rerun() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FakeAnalyzer::gated(gate.clone()));

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_until(|| h.analyzer.calls() == 1).await;

    h.orchestrator.ingest(png(30)).await.unwrap();
    for _ in 0..3 {
        assert!(h.orchestrator.request_analysis().is_none());
    }
    let snap = h.orchestrator.snapshot();
    assert!(snap.running);
    assert!(snap.rerun_requested);

    gate.add_permits(2);
    wait_until(|| !h.orchestrator.snapshot().running).await;

    assert_eq!(h.analyzer.calls(), 2);
    assert_eq!(h.analyzer.max_active.load(Ordering::SeqCst), 1);
    let seen = h.analyzer.seen();
    assert_eq!(seen[1].images, vec![payload(30), payload(20)]);
    assert!(seen[1].previous_context.is_some());
}

#[tokio::test]
async fn modes_keep_separate_context() {
    let mut h = harness(FakeAnalyzer::new());

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_for(&mut h.events, is_result).await;
    let code_context = h.orchestrator.previous_context(Mode::Code).unwrap();

    h.orchestrator.set_mode(Mode::General);
    wait_for(&mut h.events, |e| *e == Event::ModeChanged(Mode::General)).await;
    assert_eq!(h.orchestrator.previous_context(Mode::General), None);

    // No general context yet, so a single capture does not trigger.
    h.orchestrator.ingest(png(30)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 1);

    wait_until(|| !h.orchestrator.snapshot().running).await;
    h.orchestrator.request_analysis().unwrap().await.unwrap();
    let seen = h.analyzer.seen();
    assert_eq!(seen[1].mode, Mode::General);
    assert_eq!(seen[1].previous_context, None);

    let general_context = h.orchestrator.previous_context(Mode::General).unwrap();
    assert!(general_context.contains("Answer 2"));
    assert_eq!(h.orchestrator.previous_context(Mode::Code), Some(code_context));
}

#[tokio::test]
async fn result_landing_after_reset_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness(FakeAnalyzer::gated(gate.clone()));

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_until(|| h.analyzer.calls() == 1).await;

    h.orchestrator.reset();
    assert_eq!(h.orchestrator.snapshot().count, 0);

    gate.add_permits(1);
    wait_for(&mut h.events, |e| matches!(e, Event::Status(s) if s.contains("Discarded"))).await;
    wait_until(|| !h.orchestrator.snapshot().running).await;

    assert_eq!(h.orchestrator.previous_context(Mode::Code), None);
    while let Ok(event) = h.events.try_recv() {
        assert!(!is_result(&event), "late result was delivered: {event:?}");
    }
}

#[tokio::test]
async fn missing_target_skips_the_call() {
    let mut h = harness(FakeAnalyzer {
        target: None,
        ..FakeAnalyzer::new()
    });

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::Status(s) if s.contains("No AI model"))).await;
    wait_until(|| !h.orchestrator.snapshot().running).await;

    assert_eq!(h.analyzer.calls(), 0);
    assert_eq!(h.orchestrator.snapshot().count, 2);
    assert_eq!(h.orchestrator.previous_context(Mode::Code), None);
}

#[tokio::test]
async fn failure_keeps_previous_context() {
    let mut h = harness(FakeAnalyzer::new());

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_for(&mut h.events, is_result).await;
    let context = h.orchestrator.previous_context(Mode::Code).unwrap();

    h.analyzer.fail.store(true, Ordering::SeqCst);
    wait_until(|| !h.orchestrator.snapshot().running).await;
    h.orchestrator.request_analysis().unwrap().await.unwrap();

    let Event::AnalysisResult(markdown) = wait_for(&mut h.events, is_result).await else {
        unreachable!()
    };
    assert!(markdown.starts_with("## Analysis Failed"));
    assert!(markdown.contains("API server error"));
    assert_eq!(h.orchestrator.previous_context(Mode::Code), Some(context));
}

#[tokio::test]
async fn manual_trigger_needs_a_screenshot() {
    let mut h = harness(FakeAnalyzer::new());

    assert!(h.orchestrator.request_analysis().is_none());
    wait_for(&mut h.events, |e| matches!(e, Event::Status(s) if s.contains("No screenshots"))).await;
    assert_eq!(h.analyzer.calls(), 0);

    let slot = h.orchestrator.ingest(png(10)).await.unwrap();
    let Event::ImageAdded { slot: index, data_url, .. } =
        wait_for(&mut h.events, |e| matches!(e, Event::ImageAdded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(index, slot.index);
    assert!(data_url.starts_with("data:image/png;base64,"));

    h.orchestrator.request_analysis().unwrap().await.unwrap();
    assert_eq!(h.analyzer.calls(), 1);
    assert_eq!(h.analyzer.seen()[0].images.len(), 1);
}

#[tokio::test]
async fn mode_switch_cancels_pending_analysis() {
    let h = harness(FakeAnalyzer::new());

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    assert!(h.orchestrator.snapshot().debounce_pending);
    h.orchestrator.set_mode(Mode::General);
    assert!(!h.orchestrator.snapshot().debounce_pending);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 0);
}

#[tokio::test]
async fn single_capture_after_reset_waits_for_a_full_ring() {
    let mut h = harness(FakeAnalyzer::new());

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    wait_for(&mut h.events, is_result).await;
    wait_until(|| !h.orchestrator.snapshot().running).await;

    h.orchestrator.reset();
    let slot = h.orchestrator.ingest(png(30)).await.unwrap();
    assert_eq!(slot.index, 1);
    assert!(!h.orchestrator.snapshot().debounce_pending);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 1);
}

#[tokio::test]
async fn rapid_captures_share_one_scheduled_analysis() {
    let mut h = harness_with(FakeAnalyzer::new(), 1, Duration::from_millis(200));

    for shade in [10, 20, 30] {
        h.orchestrator.ingest(png(shade)).await.unwrap();
    }
    wait_for(&mut h.events, is_result).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.analyzer.calls(), 1);
    assert_eq!(h.analyzer.seen()[0].images, vec![payload(30)]);
}

#[tokio::test]
async fn reset_cancels_a_scheduled_analysis() {
    let h = harness_with(FakeAnalyzer::new(), 2, Duration::from_millis(50));

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    assert!(h.orchestrator.snapshot().debounce_pending);

    h.orchestrator.reset();
    assert!(!h.orchestrator.snapshot().debounce_pending);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.analyzer.calls(), 0);
}

#[tokio::test]
async fn unreadable_screenshots_fail_without_calling_the_provider() {
    let mut h = harness_with(FakeAnalyzer::new(), 2, Duration::from_secs(60));

    h.orchestrator.ingest(png(10)).await.unwrap();
    h.orchestrator.ingest(png(20)).await.unwrap();
    for slot in h.orchestrator.snapshot().slots {
        std::fs::write(&slot.path, b"").unwrap();
    }

    h.orchestrator.request_analysis().unwrap().await.unwrap();
    let Event::AnalysisResult(markdown) = wait_for(&mut h.events, is_result).await else {
        unreachable!()
    };
    assert!(markdown.starts_with("## Analysis Failed"));
    assert!(markdown.contains("None of the captured screenshots could be read"));
    assert!(markdown.contains("Could not read screenshots"));
    assert_eq!(h.analyzer.calls(), 0);
    assert_eq!(h.orchestrator.previous_context(Mode::Code), None);
}

#[tokio::test]
async fn run_admitted_before_reset_never_starts() {
    let mut h = harness(FakeAnalyzer::new());

    h.orchestrator.ingest(png(10)).await.unwrap();
    let worker = h.orchestrator.request_analysis().unwrap();
    h.orchestrator.reset();
    worker.await.unwrap();

    assert_eq!(h.analyzer.calls(), 0);
    assert!(!h.orchestrator.snapshot().running);
    while let Ok(event) = h.events.try_recv() {
        assert!(!is_result(&event), "stale run delivered: {event:?}");
    }
}

#[tokio::test]
async fn undecodable_capture_is_rejected_before_the_ring() {
    let mut h = harness(FakeAnalyzer::new());

    assert!(h.orchestrator.ingest(b"not an image".to_vec()).await.is_err());
    wait_for(&mut h.events, |e| {
        matches!(e, Event::Status(s) if s.contains("Screenshot rejected"))
    })
    .await;
    assert_eq!(h.orchestrator.snapshot().count, 0);
}
