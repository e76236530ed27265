//! # AgentDeck Scheduler
//!
//! Evaluates cron triggers on a fixed tick and turns each due trigger into a
//! pending work item for its agent.
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (tokio interval, 60s)
//!   └── TriggerScheduler::evaluate_triggers  (one in flight per instance)
//!         ├── TriggerStore::list_due_candidates
//!         └── per due trigger (isolated):
//!               render templates → insert_work_item (fire_key unique)
//!               → update_last_fired → append_firing_log
//! ```
//!
//! Stores: [`SqliteStore`] for durable state, [`MemoryStore`] for tests and
//! embedding.

pub mod clock;
pub mod cron;
pub mod engine;
pub mod persistence;
pub mod store;
pub mod template;
pub mod trigger;

pub use clock::{Clock, FixedClock, SystemClock};
pub use cron::{cron_matches_date, is_trigger_due, matches_field, validate_expression};
pub use engine::{TickOutcome, TickSummary, TriggerScheduler, spawn_scheduler};
pub use persistence::SqliteStore;
pub use store::{MemoryStore, TriggerStore};
pub use template::render_template;
pub use trigger::{
    FiringLogEntry, FiringStatus, NewWorkItem, Priority, Trigger, TriggerId, TriggerType,
    WorkItem, WorkItemId, WorkItemStatus, fire_key,
};
