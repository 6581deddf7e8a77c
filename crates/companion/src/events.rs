use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::config::ProviderKind;
use crate::state::Mode;

/// Everything the overlay shell is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(String),
    Loading(bool),
    ImageAdded {
        slot: usize,
        path: PathBuf,
        data_url: String,
    },
    /// Formatted markdown, success or failure.
    AnalysisResult(String),
    ContextReset,
    LanguageDetected(String),
    ModelChanged {
        provider: Option<ProviderKind>,
        model: Option<String>,
    },
    ModeChanged(Mode),
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}

impl EventSender {
    /// A shell that went away is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.0.send(event);
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(Event::Status(text.into()));
    }
}
