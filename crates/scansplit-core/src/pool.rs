//! Worker pool for the per-group ordering step.
//!
//! Groups of one scan are independent, so their ordering calls run
//! concurrently on a fixed number of workers fed through an async channel.
//! Each job answers on its own oneshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::pipeline::RunContext;
use crate::prompt::{build_ordering_prompt, page_context};
use crate::retry::{self, InvokeError, RetryPolicy, StepError};
use crate::steps::Orderer;
use crate::validate::validate_ordering;
use crate::{GroupState, Page, ProgressEvent, Step};

/// Ordering work for one group.
pub struct OrderJob {
    pub group_index: usize,
    /// The group's pages, ascending by physical number.
    pub pages: Vec<Page>,
    pub result_tx: oneshot::Sender<OrderOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    /// A validated reading order.
    Ordered { order: Vec<u32>, attempts: u32 },
    /// Attempts exhausted; `order` is the physical scan order.
    Fallback {
        order: Vec<u32>,
        attempts: u32,
        error: StepError,
    },
    Cancelled,
}

/// A pool of ordering workers bound to one scan run.
pub struct OrderingPool {
    job_tx: async_channel::Sender<OrderJob>,
    pool_handle: JoinHandle<()>,
}

impl OrderingPool {
    /// Spawn `num_workers` workers (at least one).
    pub fn new(
        orderer: Orderer,
        policy: RetryPolicy,
        ctx: Arc<RunContext>,
        num_workers: usize,
    ) -> Self {
        let (job_tx, job_rx) = async_channel::unbounded::<OrderJob>();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers.max(1));
            for _ in 0..num_workers.max(1) {
                handles.push(tokio::spawn(worker_loop(
                    job_rx.clone(),
                    orderer.clone(),
                    policy,
                    ctx.clone(),
                )));
            }
            drop(job_rx);

            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
        }
    }

    /// Submit a job; returns the receiver for its outcome.
    pub async fn submit(&self, group_index: usize, pages: Vec<Page>) -> oneshot::Receiver<OrderOutcome> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .job_tx
            .send(OrderJob {
                group_index,
                pages,
                result_tx,
            })
            .await;
        result_rx
    }

    /// Close the queue and wait for the workers to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn worker_loop(
    rx: async_channel::Receiver<OrderJob>,
    orderer: Orderer,
    policy: RetryPolicy,
    ctx: Arc<RunContext>,
) {
    while let Ok(job) = rx.recv().await {
        let outcome = if ctx.cancel_token().is_cancelled() {
            tracing::debug!(scan = %ctx.scan_id(), group = job.group_index, "skipping: cancelled");
            OrderOutcome::Cancelled
        } else {
            order_group(&orderer, &policy, &ctx, job.group_index, &job.pages).await
        };
        let _ = job.result_tx.send(outcome);
    }
}

/// Order one group, retrying up to the policy's budget.
async fn order_group(
    orderer: &Orderer,
    policy: &RetryPolicy,
    ctx: &RunContext,
    group_index: usize,
    pages: &[Page],
) -> OrderOutcome {
    let group_pages: Vec<u32> = pages.iter().map(|p| p.physical_number).collect();
    let prompt = build_ordering_prompt(pages);
    let context = page_context(pages);
    ctx.update_group(group_index, |g| g.state = GroupState::Ordering);

    let attempts = AtomicU32::new(0);
    let (prompt, context, pages_ref, attempts_ref) = (&prompt, &context, &group_pages, &attempts);

    let result = retry::invoke(
        "ordering",
        policy,
        ctx.cancel_token(),
        move |attempt| {
            attempts_ref.store(attempt, Ordering::SeqCst);
            async move {
                let raw = orderer.order(prompt, context).await?;
                Ok::<_, StepError>(validate_ordering(&raw, pages_ref)?)
            }
        },
        |attempt, error| {
            ctx.update_group(group_index, |g| {
                g.attempts = attempt;
                g.last_error = Some(error.to_string());
            });
            ctx.emit(ProgressEvent::AttemptFailed {
                scan_id: ctx.scan_id().clone(),
                step: Step::Ordering { group: group_index },
                attempt,
                max_attempts: policy.max_attempts,
                error: error.to_string(),
            });
        },
    )
    .await;
    let attempts = attempts.load(Ordering::SeqCst);

    let outcome = match result {
        Ok(order) => OrderOutcome::Ordered { order, attempts },
        Err(InvokeError::Exhausted { attempts, last_error }) => {
            tracing::warn!(
                scan = %ctx.scan_id(),
                group = group_index,
                attempts,
                error = %last_error,
                "ordering exhausted, keeping physical order"
            );
            OrderOutcome::Fallback {
                order: group_pages.clone(),
                attempts,
                error: last_error,
            }
        }
        Err(InvokeError::Cancelled) => return OrderOutcome::Cancelled,
    };

    let fallback = matches!(outcome, OrderOutcome::Fallback { .. });
    ctx.update_group(group_index, |g| {
        g.attempts = attempts;
        g.state = if fallback {
            GroupState::OrderingFailed
        } else {
            GroupState::Ordered
        };
    });
    ctx.emit(ProgressEvent::GroupOrdered {
        scan_id: ctx.scan_id().clone(),
        group: group_index,
        fallback,
    });
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;
    use crate::model::mock::{MockReply, ScriptedModel};
    use crate::validate::ValidationError;
    use crate::{GroupStatus, ScanId};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx_with_groups(n: usize) -> Arc<RunContext> {
        let ctx = RunContext::new(ScanId::from("scan"), CancellationToken::new());
        ctx.update(|s| {
            s.groups = (0..n)
                .map(|index| GroupStatus {
                    index,
                    category: "letter".into(),
                    title: format!("Group {index}"),
                    pages: Vec::new(),
                    state: GroupState::Pending,
                    attempts: 0,
                    last_error: None,
                })
                .collect();
        });
        Arc::new(ctx)
    }

    fn pages(numbers: &[u32]) -> Vec<Page> {
        numbers.iter().map(|&n| Page::new(n, format!("text {n}"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn orders_group_with_validated_reply() {
        let ctx = ctx_with_groups(1);
        let model = Arc::new(ScriptedModel::always(r#"{"page_order": [3, 1, 2]}"#));
        let pool = OrderingPool::new(
            Orderer::new(model),
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            ctx.clone(),
            2,
        );

        let rx = pool.submit(0, pages(&[1, 2, 3])).await;
        let outcome = rx.await.unwrap();
        pool.shutdown().await;

        assert_eq!(
            outcome,
            OrderOutcome::Ordered {
                order: vec![3, 1, 2],
                attempts: 1
            }
        );
        assert_eq!(ctx.snapshot().groups[0].state, GroupState::Ordered);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_falls_back_to_physical_order() {
        let ctx = ctx_with_groups(1);
        let model = Arc::new(ScriptedModel::always(r#"{"page_order": [3, 1]}"#));
        let pool = OrderingPool::new(
            Orderer::new(model.clone()),
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            ctx.clone(),
            1,
        );

        let outcome = pool.submit(0, pages(&[1, 2, 3])).await.await.unwrap();
        pool.shutdown().await;

        assert_eq!(
            outcome,
            OrderOutcome::Fallback {
                order: vec![1, 2, 3],
                attempts: 3,
                error: StepError::Validation(ValidationError::IncompleteOrder(vec![2])),
            }
        );
        assert_eq!(model.call_count(), 3);
        let group = &ctx.snapshot().groups[0];
        assert_eq!(group.state, GroupState::OrderingFailed);
        assert_eq!(group.attempts, 3);
        assert!(group.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let ctx = ctx_with_groups(1);
        let model = Arc::new(ScriptedModel::with_sequence(vec![
            MockReply::Error(ModelError::Transport("reset".into())),
            MockReply::text(r#"{"page_order": [2, 1]}"#),
        ]));
        let pool = OrderingPool::new(
            Orderer::new(model),
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            ctx.clone(),
            1,
        );

        let outcome = pool.submit(0, pages(&[1, 2])).await.await.unwrap();
        pool.shutdown().await;
        assert_eq!(
            outcome,
            OrderOutcome::Ordered {
                order: vec![2, 1],
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn cancelled_run_skips_jobs() {
        let ctx = ctx_with_groups(1);
        ctx.cancel();
        let model = Arc::new(ScriptedModel::always(r#"{"page_order": [1]}"#));
        let pool = OrderingPool::new(
            Orderer::new(model.clone()),
            RetryPolicy::default(),
            ctx.clone(),
            1,
        );

        let outcome = pool.submit(0, pages(&[1])).await.await.unwrap();
        pool.shutdown().await;
        assert_eq!(outcome, OrderOutcome::Cancelled);
        assert_eq!(model.call_count(), 0);
    }
}
