use serde::{Deserialize, Serialize};

use crate::config::ProviderKind;

/// Which analysis flavor is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Code,
    General,
}

impl Mode {
    pub fn toggled(self) -> Mode {
        match self {
            Self::Code => Self::General,
            Self::General => Self::Code,
        }
    }

    pub fn parse(name: &str) -> Option<Mode> {
        match name.trim().to_lowercase().as_str() {
            "code" => Some(Self::Code),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code => write!(f, "code"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Provider/model chosen by the user. `None` fields defer to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
}

/// Last successful result per mode, serialized. Code and general contexts
/// are never mixed.
#[derive(Debug, Clone, Default)]
pub struct PreviousAnalysis {
    code: Option<String>,
    general: Option<String>,
}

impl PreviousAnalysis {
    pub fn get(&self, mode: Mode) -> Option<&str> {
        match mode {
            Mode::Code => self.code.as_deref(),
            Mode::General => self.general.as_deref(),
        }
    }

    pub fn set(&mut self, mode: Mode, context: String) {
        match mode {
            Mode::Code => self.code = Some(context),
            Mode::General => self.general = Some(context),
        }
    }

    pub fn clear(&mut self) {
        self.code = None;
        self.general = None;
    }
}

/// Single-flight guard with one coalesced rerun.
#[derive(Debug, Default)]
pub struct Flight {
    running: bool,
    rerun_requested: bool,
}

/// What a trigger did to the flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No run was active; the caller must start the worker.
    Start,
    /// A run is active; it will go again once it finishes.
    Coalesced,
}

impl Flight {
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn rerun_requested(&self) -> bool {
        self.rerun_requested
    }

    pub fn admit(&mut self) -> Admission {
        if self.running {
            self.rerun_requested = true;
            Admission::Coalesced
        } else {
            self.running = true;
            Admission::Start
        }
    }

    /// Drop a queued rerun without touching the run in progress.
    pub fn cancel_rerun(&mut self) {
        self.rerun_requested = false;
    }

    /// Called by the worker after each run. Returns true if it must run again.
    pub fn finish_run(&mut self) -> bool {
        if self.rerun_requested {
            self.rerun_requested = false;
            true
        } else {
            self.running = false;
            false
        }
    }
}
