use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config_file;
pub mod filer;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod printed;
pub mod prompt;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod steps;
pub mod store;
pub mod taxonomy;
pub mod validate;

// Re-export for convenience
pub use filer::{CommitReceipt, Filer, FilerError, MemoryFiler};
pub use model::{ModelClient, ModelError};
pub use pipeline::{Pipeline, ProgressFn, RunContext};
pub use rate_limit::AdaptiveLimiter;
pub use retry::{Backoff, InvokeError, RetryPolicy, StepError};
pub use service::{PipelineHandle, PipelineService};
pub use steps::{Classifier, Orderer};
pub use store::{InMemoryPageStore, PageTextStore, PdfBackend, StoreError};
pub use taxonomy::{Category, CategoryTaxonomy, GroupingPolicy};
pub use validate::ValidationError;

/// Identifier of one scanned input (one multi-page PDF).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScanId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScanId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One OCR'd page of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based position in the original scan.
    pub physical_number: u32,
    pub text: String,
}

impl Page {
    pub fn new(physical_number: u32, text: impl Into<String>) -> Self {
        Self {
            physical_number,
            text: text.into(),
        }
    }
}

/// A logical document proposed by the grouping step, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProposal {
    pub category: String,
    pub title: String,
    /// Physical page numbers, ascending (i.e. physical scan order).
    pub pages: Vec<u32>,
}

/// Where the page order of a [`LogicalDocument`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    /// The ordering step produced a validated order.
    Model,
    /// Ordering was exhausted; pages kept in physical scan order.
    Fallback,
}

/// A finalized, category-tagged, ordered document ready for filing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalDocument {
    /// Stable per scan and group position: `<scan_id>-<NNN>`.
    pub id: String,
    pub scan_id: ScanId,
    pub category: String,
    /// Destination label of `category` in the taxonomy.
    pub label: String,
    pub title: String,
    pub ordered_pages: Vec<u32>,
    pub order_source: OrderSource,
}

/// Build the document id for the `index`-th (0-based) group of a scan.
pub fn document_id(scan_id: &ScanId, index: usize) -> String {
    format!("{}-{:03}", scan_id, index + 1)
}

/// Lifecycle state of one scan in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Intake,
    Grouping,
    /// Grouping attempts exhausted. Nothing is filed.
    GroupingFailed,
    Grouped,
    Ordering,
    /// Every group was ordered by the model.
    Finalized,
    /// At least one group fell back to physical scan order.
    PartiallyFinalized,
    /// The filer rejected a document.
    FilingFailed,
    /// Configuration or page store error before any model call.
    Aborted,
    /// Cancelled before filing; the scan can be resubmitted.
    Cancelled,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Intake => "intake",
            ScanState::Grouping => "grouping",
            ScanState::GroupingFailed => "grouping failed",
            ScanState::Grouped => "grouped",
            ScanState::Ordering => "ordering",
            ScanState::Finalized => "finalized",
            ScanState::PartiallyFinalized => "partially finalized",
            ScanState::FilingFailed => "filing failed",
            ScanState::Aborted => "aborted",
            ScanState::Cancelled => "cancelled",
        }
    }

    /// Whether the scan needs manual handling (or a resubmit).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ScanState::GroupingFailed
                | ScanState::FilingFailed
                | ScanState::Aborted
                | ScanState::Cancelled
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupState {
    Pending,
    Ordering,
    Ordered,
    /// Ordering attempts exhausted; fallback order applied.
    OrderingFailed,
}

/// Filing progress, meaningful once a scan is (partially) finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FilingState {
    #[default]
    NotStarted,
    InProgress,
    Committed,
}

/// Per-group entry of a [`PipelineStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub index: usize,
    pub category: String,
    pub title: String,
    pub pages: Vec<u32>,
    pub state: GroupState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// The user-visible summary of a scan's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Still running.
    Working,
    /// Filed, every document in model order.
    Done,
    /// Filed, at least one document in fallback order.
    Degraded,
    /// Needs manual intervention (or a resubmit after cancellation).
    Failed,
}

/// Snapshot of one pipeline run, as returned by
/// [`PipelineService::status`](service::PipelineService::status).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub scan_id: ScanId,
    pub state: ScanState,
    pub groups: Vec<GroupStatus>,
    pub errors: Vec<String>,
    pub documents: Vec<LogicalDocument>,
    pub filing: FilingState,
    /// Number of documents the filer has accepted so far.
    pub filed: usize,
}

impl PipelineStatus {
    pub fn new(scan_id: ScanId) -> Self {
        Self {
            scan_id,
            state: ScanState::Intake,
            groups: Vec::new(),
            errors: Vec::new(),
            documents: Vec::new(),
            filing: FilingState::NotStarted,
            filed: 0,
        }
    }

    pub fn health(&self) -> Health {
        match self.state {
            s if s.is_failure() => Health::Failed,
            ScanState::Finalized if self.filing == FilingState::Committed => Health::Done,
            ScanState::PartiallyFinalized if self.filing == FilingState::Committed => {
                Health::Degraded
            }
            _ => Health::Working,
        }
    }

    /// True once the run will make no further progress.
    pub fn is_terminal(&self) -> bool {
        self.health() != Health::Working
    }

    pub fn fallback_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.state == GroupState::OrderingFailed)
            .count()
    }
}

/// Which AI-backed step an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Grouping,
    Ordering { group: usize },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Grouping => f.write_str("grouping"),
            Step::Ordering { group } => write!(f, "ordering group {}", group + 1),
        }
    }
}

/// Progress events emitted during a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StateChanged {
        scan_id: ScanId,
        state: ScanState,
    },
    AttemptFailed {
        scan_id: ScanId,
        step: Step,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    GroupOrdered {
        scan_id: ScanId,
        group: usize,
        fallback: bool,
    },
    DocumentFiled {
        scan_id: ScanId,
        document_id: String,
        location: String,
        already_present: bool,
    },
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("page store error: {0}")]
    Store(#[from] StoreError),
    #[error("filer error: {0}")]
    Filer(#[from] FilerError),
}

/// Runtime configuration for one pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub taxonomy: CategoryTaxonomy,
    /// How pages are grouped. Deployments disagree, so there is no default.
    pub grouping_policy: GroupingPolicy,
    pub grouping_retry: RetryPolicy,
    pub ordering_retry: RetryPolicy,
    /// Per model call; an expired call counts as a transient failure.
    pub call_timeout: Duration,
    /// Ordering calls in flight per scan.
    pub ordering_concurrency: usize,
}

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_ORDERING_CONCURRENCY: usize = 4;

impl Config {
    pub fn new(taxonomy: CategoryTaxonomy, grouping_policy: GroupingPolicy) -> Self {
        Self {
            taxonomy,
            grouping_policy,
            grouping_retry: RetryPolicy::default(),
            ordering_retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ordering_concurrency: DEFAULT_ORDERING_CONCURRENCY,
        }
    }

    /// Reject configurations that can never produce a valid run.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.taxonomy.is_empty() {
            return Err(CoreError::Config("category taxonomy is empty".into()));
        }
        if self.grouping_retry.max_attempts == 0 || self.ordering_retry.max_attempts == 0 {
            return Err(CoreError::Config("attempt budget must be at least 1".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(CoreError::Config("call timeout must be positive".into()));
        }
        if self.ordering_concurrency == 0 {
            return Err(CoreError::Config(
                "ordering concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
