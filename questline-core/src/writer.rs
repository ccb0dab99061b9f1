//! Write-behind persistence worker.
//!
//! A dedicated OS thread owns a [`PlayerStore`] and drains an unbounded
//! request channel. Each request is answered with a [`WriteCompletion`] on a
//! second channel, which the simulation thread drains once per tick and
//! feeds back into [`crate::cache::PlayerCache::complete`].
//!
//! The simulation thread never blocks on the worker: `submit` is a channel
//! send and `drain_completions` uses `try_recv`.

use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};

use crate::cache::{WriteCompletion, WriteRequest};
use crate::error::{QuestError, Result};
use crate::metrics::spans;
use crate::persistence::PlayerStore;

/// Handle to the persistence worker thread.
pub struct PersistencePipeline {
    requests: Option<mpsc::UnboundedSender<WriteRequest>>,
    completions: mpsc::UnboundedReceiver<WriteCompletion>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PersistencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistencePipeline")
            .field("running", &self.requests.is_some())
            .finish_non_exhaustive()
    }
}

impl PersistencePipeline {
    /// Spawn the worker thread around `store`.
    ///
    /// # Errors
    /// When the OS refuses to spawn the thread.
    pub fn spawn(store: Box<dyn PlayerStore>) -> Result<Self> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("questline-persist".to_string())
            .spawn(move || run_worker(store, req_rx, done_tx))?;
        info!("Persistence worker started");
        Ok(Self {
            requests: Some(req_tx),
            completions: done_rx,
            worker: Some(worker),
        })
    }

    /// Hand a snapshot to the worker.
    ///
    /// # Errors
    /// [`QuestError::WorkerUnavailable`] after shutdown or if the worker died.
    pub fn submit(&self, request: WriteRequest) -> Result<()> {
        self.try_submit(request).map_err(|_| QuestError::WorkerUnavailable)
    }

    /// Like [`Self::submit`], but hands the request back when the worker
    /// cannot take it so the caller can return it to the dirty set.
    ///
    /// # Errors
    /// The unsent request.
    pub fn try_submit(&self, request: WriteRequest) -> std::result::Result<(), WriteRequest> {
        match self.requests.as_ref() {
            Some(tx) => tx.send(request).map_err(|e| e.0),
            None => Err(request),
        }
    }

    /// Completions reported since the last call. Never blocks.
    pub fn drain_completions(&mut self) -> Vec<WriteCompletion> {
        let mut out = Vec::new();
        while let Ok(c) = self.completions.try_recv() {
            out.push(c);
        }
        out
    }

    /// Whether the worker accepts requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.requests.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Close the request channel, let the worker finish every queued write,
    /// join it and return the final completions.
    pub fn shutdown(&mut self) -> Vec<WriteCompletion> {
        self.requests = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Persistence worker panicked");
            }
        }
        let remaining = self.drain_completions();
        info!(completions = remaining.len(), "Persistence worker stopped");
        remaining
    }
}

impl Drop for PersistencePipeline {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

fn run_worker(
    store: Box<dyn PlayerStore>,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    completions: mpsc::UnboundedSender<WriteCompletion>,
) {
    while let Some(request) = requests.blocking_recv() {
        let target = request.target();
        let version = request.version();
        let _span = info_span!(spans::PERSIST_SAVE, target = ?target, version).entered();
        let result = match &request {
            WriteRequest::Player { state, version } => store.save_player(state, *version),
            WriteRequest::ServerVar { key, value, .. } => store.save_server_var(key, value.as_deref()),
        };
        let ok = match result {
            Ok(()) => {
                debug!("Write durable");
                true
            }
            Err(e) => {
                warn!(error = %e, "Write failed");
                false
            }
        };
        if completions.send(WriteCompletion { target, version, ok }).is_err() {
            debug!("Completion receiver dropped; stopping worker");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WriteTarget;
    use crate::persistence::MemoryStore;
    use crate::state::PlayerState;
    use crate::types::PlayerId;

    #[test]
    fn shutdown_drains_queued_writes() {
        let store = MemoryStore::new();
        let mut pipeline = PersistencePipeline::spawn(Box::new(store.clone())).expect("spawn");
        let players: Vec<PlayerId> = (0..10).map(|_| PlayerId::new()).collect();
        for (i, p) in players.iter().enumerate() {
            pipeline
                .submit(WriteRequest::Player {
                    state: PlayerState::new(*p),
                    version: i as u64 + 1,
                })
                .expect("submit");
        }
        let mut completions = pipeline.drain_completions();
        completions.extend(pipeline.shutdown());
        assert_eq!(completions.len(), 10);
        assert!(completions.iter().all(|c| c.ok));
        assert_eq!(store.save_count(), 10);
        assert!(pipeline.submit(WriteRequest::ServerVar {
            key: "k".into(),
            value: None,
            version: 1,
        })
        .is_err());
    }

    #[test]
    fn failed_writes_are_reported() {
        let store = MemoryStore::new();
        store.fail_next_saves(1);
        let mut pipeline = PersistencePipeline::spawn(Box::new(store)).expect("spawn");
        let p = PlayerId::new();
        pipeline
            .submit(WriteRequest::Player { state: PlayerState::new(p), version: 4 })
            .expect("submit");
        let completions = pipeline.shutdown();
        assert_eq!(
            completions,
            vec![WriteCompletion { target: WriteTarget::Player(p), version: 4, ok: false }]
        );
    }
}
