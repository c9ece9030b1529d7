//! Readiness barriers and the instance lifecycle built on them.

mod barrier;
mod lifecycle;

pub use barrier::{Barrier, BarrierState, LifecycleEvent, ReadyError, ReadyTask, TaskState};
pub use lifecycle::{Boot, Lifecycle};
