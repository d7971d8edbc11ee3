mod changes;
mod client;
mod commands;
mod events;
pub mod reconcile;
pub mod scheduler;
mod server;

pub use changes::spawn_change_trigger;
pub use client::DaemonClient;
pub use commands::{ClientCommand, DaemonStatus, GoalStatus, ServerEvent};
pub use events::{LastOutcome, SyncEvent};
pub use reconcile::{Action, ReconcileError, Reconciler, target_day};
pub use scheduler::{
    GoalSnapshot, PendingTrigger, Scheduler, SubmitError, TimerRegistry, TriggerQueue,
    TriggerSource,
};
pub use server::{describe_goal, run_sync_daemon};
