pub mod killswitch;
pub mod manager;

pub use killswitch::{KillSwitch, KillSwitchError};
pub use manager::{vet_and_size, RejectReason, RiskVerdict};
