//! Plain data model for the wayforge workflow engine.
//!
//! This crate defines the shapes that cross the boundary between the engine
//! and its external collaborators (activities, checkpoint stores, workflow
//! authors): workflow/step/edge definitions, the persisted execution and
//! path state, and the `WorkflowError` kind/cause pair used for retry and
//! catch classification. It depends on nothing but `serde`, `serde_json` and
//! `chrono` -- no tokio, no I/O, no execution logic. `wayforge-core` builds
//! the engine on top of these types.

pub mod dotpath;
pub mod error;
pub mod state;
pub mod workflow;

pub use error::WorkflowError;
pub use state::{Checkpoint, ExecutionState, JoinState, PathState};
pub use workflow::Workflow;
