//! Auto-gas pipeline: derives each agent's progress from its status artifact
//! and hands off to the next agent at 75%, 90% and 100%, at most once each.

pub mod delivery;
pub mod error;
pub mod fsm;
pub mod monitor;
pub mod progress;
pub mod system;

pub use delivery::{GasMessage, InboxDelivery, MessageDelivery};
pub use error::{DeliveryError, PipelineError};
pub use fsm::{derive_state, due_reasons};
pub use monitor::{AgentRow, PipelineDashboard, PipelineMonitor};
pub use progress::{ProgressBasis, ProgressReading, StatusReader};
pub use system::{AgentTick, AutoGasPipelineSystem, GasOutcome, TickReport};
