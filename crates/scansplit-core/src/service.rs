//! Many scans, one pipeline: submission, status, cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Pipeline, ProgressFn, RunContext};
use crate::{PipelineStatus, ScanId, ScanState};

/// Opaque handle to a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(u64);

impl std::fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

struct RunEntry {
    ctx: Arc<RunContext>,
    task: Option<JoinHandle<PipelineStatus>>,
}

/// Runs independent scans concurrently against one [`Pipeline`].
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
    runs: DashMap<PipelineHandle, RunEntry>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl PipelineService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            runs: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Deliver every run's progress events to `progress`.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Start a run for `scan_id` and return immediately.
    pub fn submit(&self, scan_id: ScanId) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut ctx = RunContext::new(scan_id.clone(), self.cancel.child_token());
        if let Some(progress) = &self.progress {
            ctx = ctx.with_progress(progress.clone());
        }
        let ctx = Arc::new(ctx);

        let pipeline = self.pipeline.clone();
        let run_ctx = ctx.clone();
        let task = tokio::spawn(async move { pipeline.run(run_ctx).await });

        tracing::debug!(%handle, scan = %scan_id, "run submitted");
        self.runs.insert(
            handle,
            RunEntry {
                ctx,
                task: Some(task),
            },
        );
        handle
    }

    /// Current status of a run, or `None` for an unknown handle.
    pub fn status(&self, handle: PipelineHandle) -> Option<PipelineStatus> {
        self.runs.get(&handle).map(|entry| entry.ctx.snapshot())
    }

    /// Request cancellation of one run. Returns `false` for an unknown handle.
    pub fn cancel(&self, handle: PipelineHandle) -> bool {
        match self.runs.get(&handle) {
            Some(entry) => {
                entry.ctx.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every run submitted so far.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Wait for a run to reach its terminal state.
    ///
    /// A run whose task died without finishing is reported as `Aborted`.
    pub async fn wait(&self, handle: PipelineHandle) -> Option<PipelineStatus> {
        // No map guard may be held across the await.
        let (ctx, task) = {
            let mut entry = self.runs.get_mut(&handle)?;
            (entry.ctx.clone(), entry.task.take())
        };
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(%handle, scan = %ctx.scan_id(), error = %e, "run task failed");
            if !ctx.snapshot().is_terminal() {
                ctx.push_error(format!("run stopped unexpectedly: {e}"));
                ctx.set_state(ScanState::Aborted);
            }
        }
        Some(ctx.snapshot())
    }

    /// Drop a finished run from the registry, returning its final status.
    ///
    /// Runs still in progress are kept and `None` is returned.
    pub fn forget(&self, handle: PipelineHandle) -> Option<PipelineStatus> {
        self.runs
            .remove_if(&handle, |_, entry| entry.ctx.snapshot().is_terminal())
            .map(|(_, entry)| entry.ctx.snapshot())
    }

    /// Handles of every run, in submission order.
    pub fn handles(&self) -> Vec<PipelineHandle> {
        let mut handles: Vec<PipelineHandle> = self.runs.iter().map(|e| *e.key()).collect();
        handles.sort_by_key(|h| h.0);
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::filer::MemoryFiler;
    use crate::model::mock::{FnModel, MockReply, ScriptedModel};
    use crate::model::{ModelClient, ModelError};
    use crate::store::InMemoryPageStore;
    use crate::taxonomy::{CategoryTaxonomy, GroupingPolicy};
    use crate::{Classifier, Config, Orderer, RetryPolicy};

    const ONE_LETTER: &str = r#"[{"category": "letter", "title": "Letter", "pages": [1, 2]}]"#;

    fn service(grouping: Arc<dyn ModelClient>) -> PipelineService {
        let taxonomy = CategoryTaxonomy::from_pairs([("letter", "Letters")]).unwrap();
        let mut config = Config::new(taxonomy, GroupingPolicy::Packet);
        config.grouping_retry = RetryPolicy::fixed(2, Duration::from_secs(1));
        let store = InMemoryPageStore::new();
        store.insert_texts("scan", ["Dear Sir,", "Yours faithfully"]);
        let pipeline = Pipeline::new(
            config,
            Arc::new(store),
            Classifier::new(grouping),
            Orderer::new(Arc::new(ScriptedModel::always(r#"{"page_order": [1, 2]}"#))),
            Arc::new(MemoryFiler::new()),
        )
        .unwrap();
        PipelineService::new(pipeline)
    }

    #[tokio::test(start_paused = true)]
    async fn finished_runs_can_be_forgotten() {
        let service = service(Arc::new(ScriptedModel::always(ONE_LETTER)));
        let first = service.submit(ScanId::from("scan"));
        let second = service.submit(ScanId::from("scan"));
        assert_eq!(service.handles().len(), 2);

        let done = service.wait(first).await.unwrap();
        assert!(done.is_terminal());
        let forgotten = service.forget(first).unwrap();
        assert_eq!(forgotten.documents, done.documents);

        assert_eq!(service.handles(), vec![second]);
        assert!(service.status(first).is_none());
        assert!(service.forget(first).is_none());
        assert!(!service.cancel(first));
    }

    #[tokio::test(start_paused = true)]
    async fn running_runs_are_not_forgotten() {
        let service = service(Arc::new(ScriptedModel::new(MockReply::Hang)));
        let handle = service.submit(ScanId::from("scan"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(service.forget(handle).is_none());
        assert_eq!(service.handles(), vec![handle]);

        service.cancel(handle);
        service.wait(handle).await.unwrap();
        assert!(service.forget(handle).is_some());
        assert!(service.handles().is_empty());
    }

    #[tokio::test]
    async fn crashed_run_is_reported_as_aborted() {
        let crashing = FnModel::new(|_: &str, _: &str| -> Result<String, ModelError> {
            panic!("backend crashed")
        });
        let service = service(Arc::new(crashing));
        let handle = service.submit(ScanId::from("scan"));

        let status = service.wait(handle).await.unwrap();
        assert_eq!(status.state, ScanState::Aborted);
        assert!(status.is_terminal());
        assert!(status.errors.iter().any(|e| e.contains("stopped unexpectedly")));
        assert_eq!(service.status(handle).unwrap().state, ScanState::Aborted);
    }
}
