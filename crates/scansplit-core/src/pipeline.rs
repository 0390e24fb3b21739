//! Per-scan state machine.
//!
//! ```text
//! Intake -> Grouping -> Grouped -> Ordering -> Finalized | PartiallyFinalized -> filed
//!              |                                              |
//!              +-> GroupingFailed                             +-> FilingFailed
//! ```
//!
//! Store and configuration problems stop a run as `Aborted` before any model
//! call. Cancellation before filing stops it as `Cancelled`; nothing has been
//! filed at that point, so the scan can simply be resubmitted. Once filing
//! starts it runs to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::filer::Filer;
use crate::pool::{OrderOutcome, OrderingPool};
use crate::prompt::{build_grouping_prompt, page_context};
use crate::retry::{self, InvokeError, StepError};
use crate::steps::{Classifier, Orderer};
use crate::store::{PageTextStore, check_pages};
use crate::validate::validate_grouping;
use crate::{
    Config, CoreError, FilingState, GroupProposal, GroupState, GroupStatus, LogicalDocument,
    OrderSource, Page, PipelineStatus, ProgressEvent, ScanId, ScanState, Step, document_id,
};

/// Progress callback shared across the tasks of a run.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Shared state of one run: its cancellation token, its live status and
/// where progress events go.
pub struct RunContext {
    scan_id: ScanId,
    cancel: CancellationToken,
    status: Mutex<PipelineStatus>,
    progress: Option<ProgressFn>,
}

impl RunContext {
    pub fn new(scan_id: ScanId, cancel: CancellationToken) -> Self {
        Self {
            status: Mutex::new(PipelineStatus::new(scan_id.clone())),
            scan_id,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn scan_id(&self) -> &ScanId {
        &self.scan_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. Ignored once filing has started.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A copy of the current status.
    pub fn snapshot(&self) -> PipelineStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn update<F: FnOnce(&mut PipelineStatus)>(&self, f: F) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    pub(crate) fn update_group<F: FnOnce(&mut GroupStatus)>(&self, index: usize, f: F) {
        self.update(|s| {
            if let Some(g) = s.groups.get_mut(index) {
                f(g);
            }
        });
    }

    pub(crate) fn set_state(&self, state: ScanState) {
        self.update(|s| s.state = state);
        tracing::info!(scan = %self.scan_id, state = %state, "state changed");
        self.emit(ProgressEvent::StateChanged {
            scan_id: self.scan_id.clone(),
            state,
        });
    }

    pub(crate) fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.errors.push(message));
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

/// Why a run stopped short of filing.
enum Stop {
    Cancelled,
    Failed(ScanState, String),
}

impl From<CoreError> for Stop {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Filer(e) => Stop::Failed(ScanState::FilingFailed, e.to_string()),
            other => Stop::Failed(ScanState::Aborted, other.to_string()),
        }
    }
}

/// Runs scans through intake, grouping, ordering and filing.
pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<dyn PageTextStore>,
    classifier: Classifier,
    orderer: Orderer,
    filer: Arc<dyn Filer>,
}

impl Pipeline {
    /// Build a pipeline. Fails when `config` can never produce a valid run.
    ///
    /// The configured call timeout applies to both AI-backed steps.
    pub fn new(
        config: Config,
        store: Arc<dyn PageTextStore>,
        classifier: Classifier,
        orderer: Orderer,
        filer: Arc<dyn Filer>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            classifier: classifier.with_timeout(config.call_timeout),
            orderer: orderer.with_timeout(config.call_timeout),
            config: Arc::new(config),
            store,
            filer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drive one scan to a terminal state and return the final status.
    pub async fn run(&self, ctx: Arc<RunContext>) -> PipelineStatus {
        match self.drive(&ctx).await {
            Ok(()) => {}
            Err(Stop::Cancelled) => {
                ctx.push_error("cancelled before filing");
                ctx.set_state(ScanState::Cancelled);
            }
            Err(Stop::Failed(state, message)) => {
                tracing::error!(scan = %ctx.scan_id(), state = %state, error = %message, "run stopped");
                ctx.push_error(message);
                ctx.set_state(state);
            }
        }
        ctx.snapshot()
    }

    async fn drive(&self, ctx: &Arc<RunContext>) -> Result<(), Stop> {
        ctx.set_state(ScanState::Intake);
        let pages = self.intake(ctx).await?;
        if ctx.cancel_token().is_cancelled() {
            return Err(Stop::Cancelled);
        }

        ctx.set_state(ScanState::Grouping);
        let proposals = self.group(ctx, &pages).await?;
        ctx.update(|s| {
            s.groups = proposals
                .iter()
                .enumerate()
                .map(|(index, p)| GroupStatus {
                    index,
                    category: p.category.clone(),
                    title: p.title.clone(),
                    pages: p.pages.clone(),
                    state: GroupState::Pending,
                    attempts: 0,
                    last_error: None,
                })
                .collect();
        });
        ctx.set_state(ScanState::Grouped);

        ctx.set_state(ScanState::Ordering);
        let documents = self.order(ctx, &pages, &proposals).await?;
        let state = if documents
            .iter()
            .all(|d| d.order_source == OrderSource::Model)
        {
            ScanState::Finalized
        } else {
            ScanState::PartiallyFinalized
        };
        ctx.update(|s| s.documents = documents.clone());
        ctx.set_state(state);

        self.file(ctx, &documents).await
    }

    async fn intake(&self, ctx: &RunContext) -> Result<Vec<Page>, Stop> {
        let store = self.store.clone();
        let scan_id = ctx.scan_id().clone();
        let pages = tokio::task::spawn_blocking(move || {
            let pages = store.get_pages(&scan_id)?;
            check_pages(&scan_id, pages)
        })
        .await
        .map_err(|e| Stop::Failed(ScanState::Aborted, format!("page store task failed: {e}")))?
        .map_err(CoreError::from)?;

        tracing::info!(scan = %ctx.scan_id(), pages = pages.len(), "pages loaded");
        Ok(pages)
    }

    async fn group(&self, ctx: &RunContext, pages: &[Page]) -> Result<Vec<GroupProposal>, Stop> {
        let prompt = build_grouping_prompt(&self.config.taxonomy, &self.config.grouping_policy, pages)?;
        let context = page_context(pages);
        let all_pages: Vec<u32> = pages.iter().map(|p| p.physical_number).collect();
        let policy = &self.config.grouping_retry;

        let (prompt, context, all_pages, taxonomy, classifier) = (
            &prompt,
            &context,
            &all_pages,
            &self.config.taxonomy,
            &self.classifier,
        );

        let result = retry::invoke(
            "grouping",
            policy,
            ctx.cancel_token(),
            move |_| async move {
                let raw = classifier.classify(prompt, context).await?;
                Ok::<_, StepError>(validate_grouping(&raw, all_pages, taxonomy)?)
            },
            |attempt, error| {
                ctx.emit(ProgressEvent::AttemptFailed {
                    scan_id: ctx.scan_id().clone(),
                    step: Step::Grouping,
                    attempt,
                    max_attempts: policy.max_attempts,
                    error: error.to_string(),
                });
            },
        )
        .await;

        match result {
            Ok(proposals) => {
                tracing::info!(scan = %ctx.scan_id(), groups = proposals.len(), "scan grouped");
                Ok(proposals)
            }
            Err(InvokeError::Cancelled) => Err(Stop::Cancelled),
            Err(e @ InvokeError::Exhausted { .. }) => Err(Stop::Failed(
                ScanState::GroupingFailed,
                format!("grouping {e}"),
            )),
        }
    }

    async fn order(
        &self,
        ctx: &Arc<RunContext>,
        pages: &[Page],
        proposals: &[GroupProposal],
    ) -> Result<Vec<LogicalDocument>, Stop> {
        let by_number: HashMap<u32, &Page> = pages.iter().map(|p| (p.physical_number, p)).collect();
        let workers = self.config.ordering_concurrency.min(proposals.len()).max(1);
        let pool = OrderingPool::new(
            self.orderer.clone(),
            self.config.ordering_retry,
            ctx.clone(),
            workers,
        );

        let mut receivers = Vec::with_capacity(proposals.len());
        for (index, proposal) in proposals.iter().enumerate() {
            let group_pages: Vec<Page> = proposal
                .pages
                .iter()
                .filter_map(|n| by_number.get(n).map(|p| (*p).clone()))
                .collect();
            receivers.push(pool.submit(index, group_pages).await);
        }

        let mut outcomes = Vec::with_capacity(receivers.len());
        for rx in receivers {
            outcomes.push(rx.await.unwrap_or(OrderOutcome::Cancelled));
        }
        pool.shutdown().await;

        if ctx.cancel_token().is_cancelled()
            || outcomes.iter().any(|o| *o == OrderOutcome::Cancelled)
        {
            return Err(Stop::Cancelled);
        }

        let documents = proposals
            .iter()
            .zip(outcomes)
            .enumerate()
            .map(|(index, (proposal, outcome))| {
                let (ordered_pages, order_source) = match outcome {
                    OrderOutcome::Ordered { order, .. } => (order, OrderSource::Model),
                    OrderOutcome::Fallback { order, error, .. } => {
                        ctx.push_error(format!(
                            "group {} ({}): ordering fell back to scan order: {error}",
                            index + 1,
                            proposal.title
                        ));
                        (order, OrderSource::Fallback)
                    }
                    OrderOutcome::Cancelled => (proposal.pages.clone(), OrderSource::Fallback),
                };
                LogicalDocument {
                    id: document_id(ctx.scan_id(), index),
                    scan_id: ctx.scan_id().clone(),
                    category: proposal.category.clone(),
                    label: self
                        .config
                        .taxonomy
                        .label(&proposal.category)
                        .unwrap_or(&proposal.category)
                        .to_string(),
                    title: proposal.title.clone(),
                    ordered_pages,
                    order_source,
                }
            })
            .collect();
        Ok(documents)
    }

    /// Commit every document, then archive the source. Not cancellable.
    async fn file(&self, ctx: &RunContext, documents: &[LogicalDocument]) -> Result<(), Stop> {
        ctx.update(|s| s.filing = FilingState::InProgress);

        for document in documents {
            let filer = self.filer.clone();
            let doc = document.clone();
            let scan_id = ctx.scan_id().clone();
            let receipt = tokio::task::spawn_blocking(move || filer.commit(&doc, &scan_id))
                .await
                .map_err(|e| {
                    Stop::Failed(ScanState::FilingFailed, format!("filer task failed: {e}"))
                })?
                .map_err(CoreError::from)?;

            tracing::info!(
                scan = %ctx.scan_id(),
                document = %receipt.document_id,
                location = %receipt.location,
                already_present = receipt.already_present,
                "document filed"
            );
            ctx.update(|s| s.filed += 1);
            ctx.emit(ProgressEvent::DocumentFiled {
                scan_id: ctx.scan_id().clone(),
                document_id: receipt.document_id,
                location: receipt.location,
                already_present: receipt.already_present,
            });
        }

        let filer = self.filer.clone();
        let scan_id = ctx.scan_id().clone();
        tokio::task::spawn_blocking(move || filer.archive_source(&scan_id))
            .await
            .map_err(|e| Stop::Failed(ScanState::FilingFailed, format!("archive task failed: {e}")))?
            .map_err(CoreError::from)?;

        ctx.update(|s| s.filing = FilingState::Committed);
        tracing::info!(scan = %ctx.scan_id(), documents = documents.len(), "scan filed");
        Ok(())
    }
}
