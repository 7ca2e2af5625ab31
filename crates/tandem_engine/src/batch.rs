//! Bounded-concurrency batch processor.
//!
//! Applies one record operation to every record matching a predicate, fans
//! out under a concurrency cap, aggregates per-record results, and commits
//! the batch's staged side effects as a single transaction. Every selected
//! record is seeded with an unknown-failure placeholder before any work
//! starts, so a crash mid-batch can never silently drop a record from the
//! result set.

use crate::config::SyncConfig;
use crate::progress::Progress;
use crate::store::{RecordStore, SaveContext, StoreError, StoreResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tandem_model::{RecordEntry, RecordError, RecordPredicate, RecordResults};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// The future a record-operation factory produces for one record.
pub type OperationFuture = Pin<Box<dyn Future<Output = Result<(), RecordError>> + Send>>;

/// Hook run over the selected records before any operation starts.
///
/// Returns the records to process; records it rejects are recorded as
/// failures in the result map.
pub type PreProcessHook =
    Box<dyn Fn(Vec<RecordEntry>, &mut RecordResults) -> Vec<RecordEntry> + Send + Sync>;

/// Hook run over the aggregate result map before the commit, for
/// cross-cutting effects staged against the save context.
pub type PostProcessHook = Box<dyn Fn(&RecordResults, &SaveContext) + Send + Sync>;

/// Why a batch's results were overwritten wholesale.
#[derive(Debug)]
pub enum BatchFailure {
    /// The batch was cancelled before its commit.
    Cancelled,
    /// The transactional commit failed; no staged change is durable.
    Commit(StoreError),
}

/// The outcome of one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Per-record results. Complete: every selected record appears.
    pub results: RecordResults,
    /// Set when cancellation or a commit failure overwrote the results.
    pub failure: Option<BatchFailure>,
}

/// Applies a per-record operation to every record matching a predicate.
pub struct BatchProcessor {
    store: Arc<dyn RecordStore>,
    config: SyncConfig,
    predicate: RecordPredicate,
    save: Arc<SaveContext>,
    progress: Progress,
    pre_process: Option<PreProcessHook>,
    post_process: Option<PostProcessHook>,
}

impl BatchProcessor {
    /// Creates a processor with a fresh save context and no hooks.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: SyncConfig,
        predicate: RecordPredicate,
        progress: Progress,
    ) -> Self {
        Self {
            store,
            config,
            predicate,
            save: Arc::new(SaveContext::new()),
            progress,
            pre_process: None,
            post_process: None,
        }
    }

    /// Sets the pre-processing hook.
    pub fn with_pre_process(mut self, hook: PreProcessHook) -> Self {
        self.pre_process = Some(hook);
        self
    }

    /// Sets the post-processing hook.
    pub fn with_post_process(mut self, hook: PostProcessHook) -> Self {
        self.post_process = Some(hook);
        self
    }

    /// The save context operations stage their side effects into.
    pub fn save_context(&self) -> Arc<SaveContext> {
        self.save.clone()
    }

    /// Runs the batch to completion.
    ///
    /// Per-record failures never abort the batch; they land in the result
    /// map and every other record proceeds independently. Cancellation and
    /// commit failure overwrite the whole map instead, since in both cases
    /// no staged change became durable.
    pub async fn run<F>(&self, make_operation: F) -> StoreResult<BatchOutcome>
    where
        F: Fn(RecordEntry, Progress) -> OperationFuture,
    {
        let records = self.store.fetch_records(&self.predicate)?;
        debug!(
            count = records.len(),
            predicate = ?self.predicate,
            "processing batch"
        );

        let mut results: RecordResults = records
            .iter()
            .map(|entry| {
                (
                    entry.record_id.clone(),
                    Err(RecordError::unknown(entry.record_id.clone())),
                )
            })
            .collect();

        let records = match &self.pre_process {
            Some(hook) => hook(records, &mut results),
            None => records,
        };

        self.progress.set_total(records.len() as u64);

        // One permit per concurrently-running operation. Operations are
        // created lazily, so a queued operation does no work until a permit
        // frees up.
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency));
        let mut tasks = JoinSet::new();
        for entry in records {
            let record_id = entry.record_id.clone();
            let operation_progress = self.progress.child(1);
            let future = make_operation(entry, operation_progress.clone());
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = future.await;
                operation_progress.complete();
                (record_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((record_id, result)) => {
                    results.insert(record_id, result);
                }
                Err(error) => {
                    // The record keeps its unknown-failure placeholder.
                    warn!(%error, "batch operation task failed to complete");
                }
            }
        }

        if let Some(hook) = &self.post_process {
            hook(&results, &self.save);
        }

        let changes = self.save.take_changes();
        let failure = if self.progress.is_cancelled() {
            for (record_id, result) in results.iter_mut() {
                *result = Err(RecordError::Cancelled(record_id.clone()));
            }
            Some(BatchFailure::Cancelled)
        } else if let Err(error) = self.store.apply(changes) {
            warn!(%error, "batch commit failed, failing every record");
            for (record_id, result) in results.iter_mut() {
                *result = Err(RecordError::other(record_id.clone(), &error));
            }
            Some(BatchFailure::Commit(error))
        } else {
            None
        };

        self.store.process_pending_updates();
        self.progress.complete();

        Ok(BatchOutcome { results, failure })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use crate::store::RecordChange;
    use crate::testutil::note;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tandem_model::{RecordID, RecordStatus};

    fn seeded_store(count: usize) -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        for n in 0..count {
            store.seed_entity(note(&n.to_string(), "content"), RecordStatus::Updated);
        }
        store
    }

    fn processor(store: &Arc<MemoryRecordStore>) -> BatchProcessor {
        BatchProcessor::new(
            store.clone(),
            SyncConfig::new(),
            RecordPredicate::Upload,
            Progress::new(1),
        )
    }

    #[tokio::test]
    async fn one_failure_leaves_the_other_records_alone() {
        let store = seeded_store(10);
        let processor = processor(&store);
        let failing = RecordID::new("Note", "7");

        let outcome = processor
            .run(|entry, _progress| {
                let failing = failing.clone();
                Box::pin(async move {
                    if entry.record_id == failing {
                        Err(RecordError::DoesNotExist(entry.record_id))
                    } else {
                        Ok(())
                    }
                })
            })
            .await
            .unwrap();

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.results.len(), 10);
        let failures: Vec<_> = outcome
            .results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(failures, vec![failing]);
        assert_eq!(store.pending_update_runs(), 1);
    }

    #[tokio::test]
    async fn commit_failure_overwrites_every_result() {
        let store = seeded_store(10);
        store.fail_next_apply(StoreError::save_failed("disk full"));
        let processor = processor(&store);

        let outcome = processor
            .run(|entry, _progress| {
                Box::pin(async move {
                    let _ = entry;
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(matches!(outcome.failure, Some(BatchFailure::Commit(_))));
        assert_eq!(outcome.results.len(), 10);
        for result in outcome.results.values() {
            let error = result.as_ref().unwrap_err();
            assert!(error.to_string().contains("disk full"));
        }
    }

    #[tokio::test]
    async fn a_crashed_operation_keeps_its_placeholder() {
        let store = seeded_store(3);
        let processor = processor(&store);
        let crashing = RecordID::new("Note", "1");

        let outcome = processor
            .run(|entry, _progress| {
                let crashing = crashing.clone();
                Box::pin(async move {
                    assert!(entry.record_id != crashing, "operation 1 crashed");
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 3);
        let placeholder = outcome.results[&crashing].as_ref().unwrap_err();
        assert!(placeholder.to_string().contains("unknown"));
        assert!(outcome.results[&RecordID::new("Note", "0")].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_stays_under_the_cap() {
        let store = seeded_store(12);
        let processor = BatchProcessor::new(
            store.clone(),
            SyncConfig::new().with_batch_concurrency(2),
            RecordPredicate::Upload,
            Progress::new(1),
        );

        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let outcome = processor
            .run(|_entry, _progress| {
                let current = current.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(outcome.failure.is_none());
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.results.len(), 12);
    }

    #[tokio::test]
    async fn cancellation_discards_staged_changes_and_fails_every_record() {
        let store = seeded_store(4);
        let progress = Progress::new(1);
        let processor = BatchProcessor::new(
            store.clone(),
            SyncConfig::new(),
            RecordPredicate::Upload,
            progress.clone(),
        );
        let save = processor.save_context();
        progress.cancel();

        let outcome = processor
            .run(|entry, _progress| {
                let save = save.clone();
                Box::pin(async move {
                    save.stage(RecordChange::SetLocalStatus {
                        record_id: entry.record_id,
                        status: RecordStatus::Normal,
                    });
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(matches!(outcome.failure, Some(BatchFailure::Cancelled)));
        for result in outcome.results.values() {
            assert!(matches!(
                result.as_ref().unwrap_err(),
                RecordError::Cancelled(_)
            ));
        }

        // Nothing staged became durable.
        for entry in store.fetch_records(&RecordPredicate::All).unwrap() {
            assert_eq!(entry.local_status(), Some(RecordStatus::Updated));
        }
    }

    #[tokio::test]
    async fn pre_process_can_reject_records() {
        let store = seeded_store(3);
        let rejected = RecordID::new("Note", "2");
        let rejected_for_hook = rejected.clone();
        let processor = processor(&store).with_pre_process(Box::new(move |records, results| {
            records
                .into_iter()
                .filter(|entry| {
                    if entry.record_id == rejected_for_hook {
                        results.insert(
                            entry.record_id.clone(),
                            Err(RecordError::SyncingDisabled(entry.record_id.clone())),
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect()
        }));

        let ran = Arc::new(AtomicUsize::new(0));
        let outcome = processor
            .run(|_entry, _progress| {
                let ran = ran.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(matches!(
            outcome.results[&rejected].as_ref().unwrap_err(),
            RecordError::SyncingDisabled(_)
        ));
    }

    #[tokio::test]
    async fn post_process_stages_cross_cutting_changes() {
        let store = seeded_store(2);
        let processor = processor(&store).with_post_process(Box::new(|results, save| {
            for (record_id, result) in results {
                if result.is_ok() {
                    save.stage(RecordChange::SetLocalStatus {
                        record_id: record_id.clone(),
                        status: RecordStatus::Normal,
                    });
                }
            }
        }));

        let outcome = processor
            .run(|_entry, _progress| Box::pin(async { Ok(()) }))
            .await
            .unwrap();

        assert!(outcome.failure.is_none());
        for entry in store.fetch_records(&RecordPredicate::All).unwrap() {
            assert_eq!(entry.local_status(), Some(RecordStatus::Normal));
        }
    }
}
