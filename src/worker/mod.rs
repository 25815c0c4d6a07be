//! Generation worker: scoring, limiting, pausing and dispatching.
//!
//! Core components:
//! - `priority`: PriorityScorer (ranked per-user work queue)
//! - `limiter`: AiConcurrencyLimiter (global + per-provider slots)
//! - `pause`: PauseRegistry (global / user / instance flags)
//! - `quota`: QuotaGuard (monthly provider budgets)
//! - `dispatcher`: GenerationDispatcher (slots, retries, outcomes)
//! - `state`: Coordinator state machine (Idle → Running → Idle | Paused, Stopped)
//! - `coordinator`: WorkerCoordinator (ticker, trigger, heartbeat, shutdown)
//! - `status`: WorkerStatus, activity log and run history records

pub mod coordinator;
pub mod dispatcher;
pub mod limiter;
pub mod model;
pub mod pause;
pub mod priority;
pub mod quota;
pub mod state;
pub mod status;

pub use coordinator::{CycleResult, TriggerAck, WorkerCoordinator, WorkerHandle};
pub use dispatcher::{DispatchCounters, DispatchReport, GenerationDispatcher};
pub use limiter::{AiConcurrencyLimiter, ConcurrencySlot, LimiterSnapshot};
pub use pause::{PauseRegistry, PauseState};
pub use priority::PriorityScorer;
pub use state::CoordinatorState;
