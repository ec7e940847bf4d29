//! Task execution: admission, supervision and the engine seam.

pub mod capacity;
pub mod handler;
pub mod process;
pub mod supervisor;
pub mod task;

pub use capacity::{CapacityGate, CapacitySlot};
pub use handler::{EventHandler, HandlerRegistry};
pub use process::ProcessHandler;
pub use supervisor::{Completion, Supervisor};
pub use task::{Outcome, TaskAssignment};
