//! Checkpoint persistence. This crate ships only the trait and
//! an in-process reference implementation suitable for tests and
//! single-process embedding; a durable on-disk backend (the NDJSON-per-file
//! format under `<root>/<exec_id>/` with a `latest` pointer) is an external
//! collaborator a host application brings itself.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use wayforge_types::state::Checkpoint;

use crate::error::CheckpointError;

/// Saves, loads and deletes checkpoints for an execution id. `load` returns
/// the most recent checkpoint; `save` appends, it never overwrites history.
/// Stored as `Arc<dyn Checkpointer>` on the engine, so every method returns a
/// boxed future rather than a native `async fn`.
pub trait Checkpointer: Send + Sync {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<(), CheckpointError>>;
    fn load(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>, CheckpointError>>;
    fn delete(&self, execution_id: &str) -> BoxFuture<'_, Result<(), CheckpointError>>;
}

/// An append-only in-memory ndjson-shaped log per execution id, guarded by
/// a single mutex so a save and the log it appends to never observe each
/// other half-written.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    logs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpointer for InMemoryCheckpointer {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<(), CheckpointError>> {
        Box::pin(async move {
            let mut logs = self.logs.lock().expect("checkpoint log lock poisoned");
            logs.entry(checkpoint.execution_id.clone()).or_default().push(checkpoint);
            Ok(())
        })
    }

    fn load(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>, CheckpointError>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let logs = self.logs.lock().expect("checkpoint log lock poisoned");
            Ok(logs.get(&execution_id).and_then(|log| log.last().cloned()))
        })
    }

    fn delete(&self, execution_id: &str) -> BoxFuture<'_, Result<(), CheckpointError>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let mut logs = self.logs.lock().expect("checkpoint log lock poisoned");
            logs.remove(&execution_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use wayforge_types::state::ExecutionState;

    #[tokio::test]
    async fn load_returns_none_when_nothing_saved() {
        let checkpointer = InMemoryCheckpointer::new();
        assert!(checkpointer.load("exec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_the_latest() {
        let checkpointer = InMemoryCheckpointer::new();
        let state = ExecutionState::new("exec-1", "wf", StdHashMap::new());
        checkpointer.save(Checkpoint::from_state(&state, 1)).await.unwrap();
        checkpointer.save(Checkpoint::from_state(&state, 2)).await.unwrap();

        let loaded = checkpointer.load("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, 2);
    }

    #[tokio::test]
    async fn delete_clears_the_log() {
        let checkpointer = InMemoryCheckpointer::new();
        let state = ExecutionState::new("exec-1", "wf", StdHashMap::new());
        checkpointer.save(Checkpoint::from_state(&state, 1)).await.unwrap();
        checkpointer.delete("exec-1").await.unwrap();
        assert!(checkpointer.load("exec-1").await.unwrap().is_none());
    }
}
