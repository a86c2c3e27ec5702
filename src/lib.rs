pub mod app;

pub use app::cancel::CancellationController;
pub use app::config::{load_config, EngineConfig};
pub use app::dispatcher::Engine;
pub use app::error::{AppError, ErrorKind};
pub use app::models::{Mode, Operation, OperationResult, Outcome, SequenceOutcome};
pub use app::sequence::SequencePolicy;
