//! Application Services
//!
//! - `ConnectionSupervisor`: owns subscription lifecycle for a symbol session
//! - `BackoffScheduler`: keyed, cancellable timers feeding the supervisor inbox

mod scheduler;
mod supervisor;

pub use scheduler::{BackoffScheduler, TimerFired};
pub use supervisor::{
    ConnectionSupervisor, SubscriptionSnapshot, SupervisorConfig, SupervisorError,
    SupervisorHandle, SupervisorSnapshot,
};
