//! Capture/analysis controller.
//!
//! Owns the screenshot ring, the per-mode previous analysis and the
//! single-flight analysis worker. All state sits behind one mutex that is
//! never held across an await; the shell talks to it through the public
//! methods and listens on the event channel.
//!
//! Must be used from inside a tokio runtime: captures and triggers spawn
//! tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisFailure, AnalysisRequest, FailureKind, UNKNOWN_LANGUAGE};
use crate::api::Analyzer;
use crate::capture::{self, CaptureError, ScreenCapturer};
use crate::config::{AnalysisConfig, Config, ProviderKind};
use crate::events::{Event, EventSender};
use crate::logging::SessionLog;
use crate::prepare::{self, ImageContent};
use crate::prompt;
use crate::slots::{self, CaptureRing, CaptureSlot};
use crate::state::{Admission, Flight, Mode, PreviousAnalysis, Selection};

#[derive(Debug, Clone)]
pub struct Settings {
    pub screenshot_dir: PathBuf,
    pub max_slots: usize,
    pub max_width: u32,
    /// Delay between a qualifying capture and the analysis it triggers.
    pub debounce: Duration,
    /// Pause before capturing so a just-hidden overlay is gone.
    pub hide_delay: Duration,
    pub mode: Mode,
    pub prompts: AnalysisConfig,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            screenshot_dir: config.screenshot_directory(),
            max_slots: config.capture.slots,
            max_width: config.capture.max_width,
            debounce: Duration::from_millis(config.capture.debounce_ms),
            hide_delay: Duration::from_millis(config.capture.hide_delay_ms),
            mode: config.analysis.mode,
            prompts: config.analysis.clone(),
        }
    }
}

/// Point-in-time view of the controller, for status displays.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub mode: Mode,
    pub selection: Selection,
    pub slots: Vec<CaptureSlot>,
    pub count: usize,
    pub max_slots: usize,
    pub running: bool,
    pub rerun_requested: bool,
    pub has_context: bool,
    pub debounce_pending: bool,
}

struct Inner {
    ring: CaptureRing,
    previous: PreviousAnalysis,
    flight: Flight,
    mode: Mode,
    selection: Selection,
    /// Bumped on reset; runs started under an older epoch are stale.
    epoch: u64,
    debounce: Option<JoinHandle<()>>,
    debounce_seq: u64,
}

impl Inner {
    fn cancel_debounce(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
            debug!("Cancelled scheduled analysis");
        }
    }

    /// `None` when there is nothing to analyze.
    fn admit(&mut self) -> Option<Admission> {
        if self.ring.is_empty() {
            None
        } else {
            Some(self.flight.admit())
        }
    }
}

/// Ring full, or extending an existing result one screenshot at a time.
fn should_auto_analyze(count: usize, max_slots: usize, has_context: bool) -> bool {
    count == max_slots || (count == 1 && has_context)
}

#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<Mutex<Inner>>,
    /// Serializes ingests between slot reservation and commit.
    ingest_lock: Arc<tokio::sync::Mutex<()>>,
    analyzer: Arc<dyn Analyzer>,
    capturer: Option<Arc<dyn ScreenCapturer>>,
    events: EventSender,
    session_log: Option<SessionLog>,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(settings: Settings, analyzer: Arc<dyn Analyzer>, events: EventSender) -> Self {
        let inner = Inner {
            ring: CaptureRing::new(&settings.screenshot_dir, settings.max_slots),
            previous: PreviousAnalysis::default(),
            flight: Flight::default(),
            mode: settings.mode,
            selection: Selection::default(),
            epoch: 0,
            debounce: None,
            debounce_seq: 0,
        };
        Self {
            state: Arc::new(Mutex::new(inner)),
            ingest_lock: Arc::new(tokio::sync::Mutex::new(())),
            analyzer,
            capturer: None,
            events,
            session_log: None,
            settings: Arc::new(settings),
        }
    }

    pub fn with_capturer(mut self, capturer: Arc<dyn ScreenCapturer>) -> Self {
        self.capturer = Some(capturer);
        self
    }

    pub fn with_session_log(mut self, log: Option<SessionLog>) -> Self {
        self.session_log = log;
        self
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            mode: state.mode,
            selection: state.selection.clone(),
            slots: state.ring.slots().to_vec(),
            count: state.ring.count(),
            max_slots: state.ring.max_slots(),
            running: state.flight.is_running(),
            rerun_requested: state.flight.rerun_requested(),
            has_context: state.previous.get(state.mode).is_some(),
            debounce_pending: state.debounce.is_some(),
        }
    }

    pub fn previous_context(&self, mode: Mode) -> Option<String> {
        self.state.lock().previous.get(mode).map(str::to_string)
    }

    // --- Capture ---

    /// Take a screenshot with the configured capturer and add it to the ring.
    pub async fn capture(&self) -> Result<CaptureSlot, CaptureError> {
        let Some(capturer) = self.capturer.clone() else {
            return Err(CaptureError::NoCommand);
        };
        if !self.settings.hide_delay.is_zero() {
            tokio::time::sleep(self.settings.hide_delay).await;
        }
        let bytes = match capturer.capture().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Screenshot failed: {e}");
                self.events.status(format!("Screenshot failed: {e}"));
                return Err(e);
            }
        };
        self.ingest(bytes).await
    }

    /// Add an already captured image to the ring, then apply the
    /// auto-analysis policy.
    pub async fn ingest(&self, bytes: Vec<u8>) -> Result<CaptureSlot, CaptureError> {
        let max_width = self.settings.max_width;
        let normalized =
            match tokio::task::spawn_blocking(move || capture::normalize(&bytes, max_width)).await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
        let png = match normalized {
            Ok(png) => png,
            Err(e) => {
                warn!("Rejected screenshot: {e}");
                self.events.status(format!("Screenshot rejected: {e}"));
                return Err(e);
            }
        };

        let _serial = self.ingest_lock.lock().await;
        let path = self.state.lock().ring.reserve();
        if let Err(e) = slots::write_file(&path, &png).await {
            warn!("{e}");
            self.events.status(format!("Could not save screenshot: {e}"));
            return Err(e.into());
        }

        let (slot, auto) = {
            let mut state = self.state.lock();
            let slot = state.ring.commit(path);
            let has_context = state.previous.get(state.mode).is_some();
            let auto = should_auto_analyze(state.ring.count(), state.ring.max_slots(), has_context);
            (slot, auto)
        };

        self.events.emit(Event::ImageAdded {
            slot: slot.index,
            path: slot.path.clone(),
            data_url: ImageContent::png(&png).data_url(),
        });
        self.events.status(format!(
            "Screenshot saved to slot {}/{}",
            slot.index, self.settings.max_slots
        ));

        if auto {
            self.schedule_analysis();
        }
        Ok(slot)
    }

    // --- Triggers ---

    /// Run an analysis after the debounce delay. A newer schedule replaces
    /// one that has not fired yet.
    pub fn schedule_analysis(&self) {
        let mut state = self.state.lock();
        state.cancel_debounce();
        state.debounce_seq += 1;
        let seq = state.debounce_seq;

        let this = self.clone();
        let delay = self.settings.debounce;
        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (admission, epoch) = {
                let mut state = this.state.lock();
                if state.debounce_seq != seq {
                    return;
                }
                state.debounce = None;
                (state.admit(), state.epoch)
            };
            debug!("Debounce elapsed, triggering analysis");
            this.launch(admission, epoch);
        }));
    }

    /// Manual trigger. Returns the worker handle if this call started one.
    pub fn request_analysis(&self) -> Option<JoinHandle<()>> {
        let (admission, epoch) = {
            let mut state = self.state.lock();
            state.cancel_debounce();
            (state.admit(), state.epoch)
        };
        self.launch(admission, epoch)
    }

    fn launch(&self, admission: Option<Admission>, epoch: u64) -> Option<JoinHandle<()>> {
        match admission {
            None => {
                self.events.status("No screenshots to analyze. Capture one first.");
                None
            }
            Some(Admission::Coalesced) => {
                info!("Analysis already running, rerun queued");
                self.events.status("Analysis in progress; it will run again with the latest screenshots.");
                None
            }
            Some(Admission::Start) => {
                let this = self.clone();
                Some(tokio::spawn(async move { this.run_worker(epoch).await }))
            }
        }
    }

    /// Runs until no rerun was requested during the last pass. `epoch` is the
    /// reset epoch the run was admitted under.
    async fn run_worker(self, mut epoch: u64) {
        self.events.emit(Event::Loading(true));
        loop {
            self.run_once(epoch).await;
            let rerun = {
                let mut state = self.state.lock();
                state.flight.finish_run().then_some(state.epoch)
            };
            match rerun {
                Some(current) => epoch = current,
                None => break,
            }
            debug!("Rerun requested while busy, analyzing again");
        }
        self.events.emit(Event::Loading(false));
    }

    async fn run_once(&self, admitted_epoch: u64) {
        let (selection, mode, paths, context) = {
            let state = self.state.lock();
            if state.epoch != admitted_epoch {
                drop(state);
                info!("Analysis admitted before a reset, skipping");
                return;
            }
            (
                state.selection.clone(),
                state.mode,
                state.ring.paths(),
                state.previous.get(state.mode).map(str::to_string),
            )
        };
        let epoch = admitted_epoch;

        let Some(target) = self.analyzer.resolve(&selection) else {
            warn!("No provider/model available, skipping analysis");
            self.events.status("No AI model configured. Add an API key or select a local model.");
            return;
        };

        self.events.status(format!(
            "Analyzing {} screenshot(s) with {target}...",
            paths.len()
        ));

        let outcome = if paths.is_empty() {
            Err(AnalysisFailure::new(
                FailureKind::NoImages,
                mode,
                "No screenshots to analyze.",
            ))
        } else {
            let batch = paths.clone();
            let images = tokio::task::spawn_blocking(move || prepare::prepare_batch(&batch))
                .await
                .unwrap_or_else(|e| {
                    warn!("Screenshot preparation task failed: {e}");
                    Vec::new()
                });
            if images.is_empty() {
                Err(AnalysisFailure::new(
                    FailureKind::Processing,
                    mode,
                    "None of the captured screenshots could be read.",
                ))
            } else {
                let request = AnalysisRequest {
                    images,
                    prompt: prompt::default_prompt(mode, &self.settings.prompts),
                    previous_context: context,
                };
                self.analyzer.analyze(&target, request, mode).await
            }
        };

        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                drop(state);
                info!("Discarding {mode} analysis that started before a reset");
                self.events.status("Discarded a result from before the reset.");
                return;
            }
            if let Ok(ref result) = outcome {
                state.previous.set(mode, result.to_context());
            }
        }

        match outcome {
            Ok(result) => {
                let markdown = result.to_markdown();
                if let Some(ref log) = self.session_log {
                    log.log_analysis(mode, &target.to_string(), paths.len(), &markdown);
                }
                self.events.emit(Event::AnalysisResult(markdown));
                if let Some(language) = result.language().filter(|l| *l != UNKNOWN_LANGUAGE) {
                    self.events.emit(Event::LanguageDetected(language.to_string()));
                }
                self.events.status("Analysis completed.");
            }
            Err(failure) => {
                warn!("Analysis failed ({:?}): {}", failure.kind, failure.message);
                self.events.emit(Event::AnalysisResult(failure.to_markdown()));
                self.events.status(format!("Analysis failed: {}", failure.message));
            }
        }
    }

    // --- Context, mode, model ---

    /// Drop screenshots and previous results. An in-flight call finishes but
    /// its result is discarded.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.cancel_debounce();
            state.ring.reset();
            state.previous.clear();
            state.flight.cancel_rerun();
            state.epoch += 1;
        }
        info!("Context reset");
        self.events.emit(Event::ContextReset);
        self.events.status("Context reset. Capture new screenshots to start over.");
    }

    /// Switch analysis mode. Never starts an analysis.
    pub fn set_mode(&self, mode: Mode) {
        {
            let mut state = self.state.lock();
            state.cancel_debounce();
            state.mode = mode;
        }
        info!("Mode set to {mode}");
        self.events.emit(Event::ModeChanged(mode));
        self.events.status(format!("Switched to {mode} mode."));
    }

    pub fn toggle_mode(&self) -> Mode {
        let mode = self.state.lock().mode.toggled();
        self.set_mode(mode);
        mode
    }

    pub fn set_model(&self, provider: Option<ProviderKind>, model: Option<String>) {
        let selection = Selection { provider, model };
        self.state.lock().selection = selection.clone();
        self.events.emit(Event::ModelChanged {
            provider: selection.provider,
            model: selection.model.clone(),
        });
        match self.analyzer.resolve(&selection) {
            Some(target) => self.events.status(format!("Using {target}.")),
            None => self.events.status("No usable provider for that selection."),
        }
    }
}
