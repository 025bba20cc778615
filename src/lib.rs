pub mod core;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod services;
pub mod store;

pub use crate::core::config::Settings;
pub use crate::models::essay::{EssayPhase, EssayRecord, EssayStatus, PhaseStatus, ProgressStep};
pub use crate::models::grading::{GradingConfig, GradingResult, ProviderKind, WorkflowMode};
pub use crate::pipeline::orchestrator::Orchestrator;
pub use crate::services::error::ProcessingError;
pub use crate::store::{DebouncedSaver, SnapshotStore};

/// Entry point for the local transcript save server binary.
pub async fn run_save_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    core::telemetry::init_tracing(&settings)?;

    server::serve(&settings).await
}
