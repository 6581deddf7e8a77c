pub mod analysis;
pub mod api;
pub mod capture;
pub mod config;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod parse;
pub mod prepare;
pub mod prompt;
pub mod slots;
pub mod state;

use tracing_subscriber::EnvFilter;

pub use analysis::{AnalysisFailure, AnalysisRequest, AnalysisResult, FailureKind};
pub use api::{Analyzer, Gateway, Target};
pub use config::{Config, ProviderKind};
pub use events::{Event, EventReceiver, EventSender};
pub use orchestrator::{Orchestrator, Settings, Snapshot};
pub use state::{Mode, Selection};

/// Set up tracing-subscriber to write to companion.log in the configured
/// log directory. `RUST_LOG` overrides the default INFO level.
/// Returns false if logging is disabled or the directory is unknown.
pub fn init_tracing(config: &Config) -> bool {
    if !config.logging.enabled {
        return false;
    }
    let Some(dir) = config.log_directory() else { return false };
    if std::fs::create_dir_all(&dir).is_err() {
        return false;
    }
    let file_appender = tracing_appender::rolling::never(dir, "companion.log");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
