pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod stats;

pub use engine::Orchestrator;
pub use gateway::PaperGateway;
pub use ledger::{MemoryLedger, PgLedger};
pub use stats::OrchestratorStats;
