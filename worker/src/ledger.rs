//! Durable queue of candidate keys awaiting pool submission. The disk
//! copy is authoritative across restarts; every mutation persists
//! before it is reported.

use std::{fs, path::PathBuf, time::Duration};

use shared::types::{KeyRange, PrivateKey};
use tracing::*;

use crate::{
    keyspace::generate_filler_keys,
    restful::{PoolClient, SubmitOutcome},
};

const MIN_BATCH: usize = 10;
const MAX_BATCH: usize = 30;
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Failed attempts per batch tolerated in blocking mode before the
/// flush hands control back to the loop. The caller counts the
/// returned events toward its reset thresholds, so a flush must not
/// retry indefinitely on its own.
const BLOCKING_ATTEMPT_LIMIT: u32 = 3;

/// Inputs the flush policy needs from the current loop iteration.
pub struct FlushContext<'a> {
    /// Address count of the active assignment; drives the batch size.
    pub addr_count: usize,
    /// Whether the most recent search run succeeded. Filler padding is
    /// only allowed after a clean run.
    pub last_run_ok: bool,
    /// Last known assignment range, the filler-key domain.
    pub last_range: Option<&'a KeyRange>,
    /// Blocking mode retries a failed batch every 30s, up to
    /// `BLOCKING_ATTEMPT_LIMIT` attempts; non-blocking stops at the
    /// first failure.
    pub blocking: bool,
    /// A re-fetch is already pending; blocking mode must not spin.
    pub need_new_block_pending: bool,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub posted: bool,
    pub need_new_block: bool,
    /// Submit outcomes in order, for status/error bookkeeping upstream.
    pub events: Vec<SubmitOutcome>,
}

pub struct PendingKeyLedger {
    keys: Vec<PrivateKey>,
    path: PathBuf,
}

impl PendingKeyLedger {
    /// Restore from disk; a missing or unreadable file starts empty.
    pub fn load(path: PathBuf) -> PendingKeyLedger {
        let keys = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
            .map(|raw| raw.iter().filter_map(|k| PrivateKey::parse(k)).collect())
            .unwrap_or_default();
        PendingKeyLedger {
            keys,
            path,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[PrivateKey] {
        &self.keys
    }

    /// Batch size required for submission: one key per assignment
    /// address, clamped to [10, 30].
    pub fn required_batch(addr_count: usize) -> usize {
        addr_count.clamp(MIN_BATCH, MAX_BATCH)
    }

    pub fn enqueue(&mut self, keys: Vec<PrivateKey>) {
        if keys.is_empty() {
            return;
        }
        self.keys.extend(keys);
        self.persist();
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.persist();
    }

    /// Clear and drop the backing file entirely (reset safety valve).
    pub fn clear_and_remove_file(&mut self) {
        self.keys.clear();
        let _ = fs::remove_file(&self.path);
    }

    fn persist(&self) {
        let raw: Vec<&str> = self.keys.iter().map(PrivateKey::as_str).collect();
        match serde_json::to_string(&raw) {
            Ok(body) => {
                if let Err(err) = fs::write(&self.path, body) {
                    error!("failed to persist pending keys: {err:#}");
                }
            }
            Err(err) => error!("failed to serialize pending keys: {err:#}"),
        }
    }

    /// Submit full batches from the front of the queue, then optionally
    /// one filler-padded partial batch. See `FlushContext` for policy
    /// knobs.
    pub async fn flush(&mut self, pool: &dyn PoolClient, ctx: FlushContext<'_>) -> FlushReport {
        let required = Self::required_batch(ctx.addr_count);
        let mut report = FlushReport::default();
        let mut failed_attempts = 0u32;

        while self.keys.len() >= required {
            let batch: Vec<PrivateKey> = self.keys[..required].to_vec();
            let outcome = pool.submit_keys(&batch).await;
            report.events.push(outcome.clone());
            match outcome {
                SubmitOutcome::Accepted => {
                    self.keys.drain(..required);
                    self.persist();
                    report.posted = true;
                    failed_attempts = 0;
                }
                SubmitOutcome::Incompatible => {
                    // the whole ledger belongs to the stale block, not
                    // just this batch
                    self.clear();
                    report.need_new_block = true;
                    return report;
                }
                _ => {
                    self.persist();
                    failed_attempts += 1;
                    if !ctx.blocking
                        || ctx.need_new_block_pending
                        || failed_attempts >= BLOCKING_ATTEMPT_LIMIT
                    {
                        return report;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        // partial remainder: pad with random keys from the last block's
        // range, but only after a clean run
        if report.posted || !ctx.last_run_ok || self.keys.is_empty() {
            return report;
        }
        let Some(range) = ctx.last_range else {
            return report;
        };
        let fillers = generate_filler_keys(required - self.keys.len(), range, &self.keys);
        if self.keys.len() + fillers.len() != required {
            return report;
        }
        let mut batch = self.keys.clone();
        batch.extend(fillers);
        info!("padding partial batch to {} with filler keys", required);
        let outcome = pool.submit_keys(&batch).await;
        report.events.push(outcome.clone());
        match outcome {
            SubmitOutcome::Accepted => {
                self.clear();
                report.posted = true;
            }
            SubmitOutcome::Incompatible => {
                self.clear();
                report.need_new_block = true;
            }
            _ => {
                // fillers are never persisted; real keys stay queued
                if ctx.blocking && !ctx.need_new_block_pending {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use num_bigint::BigUint;
    use tempfile::tempdir;

    use super::*;
    use crate::restful::FetchOutcome;

    /// Pool stub replaying a fixed outcome script and recording every
    /// submitted batch.
    struct ScriptedPool {
        script: Mutex<Vec<SubmitOutcome>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedPool {
        fn new(script: Vec<SubmitOutcome>) -> ScriptedPool {
            ScriptedPool {
                script: Mutex::new(script),
                batches: Mutex::new(vec![]),
            }
        }

        fn submitted(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PoolClient for ScriptedPool {
        async fn fetch_block(&self) -> FetchOutcome {
            FetchOutcome::Error("not under test".to_string())
        }

        async fn submit_keys(&self, keys: &[PrivateKey]) -> SubmitOutcome {
            self.batches
                .lock()
                .unwrap()
                .push(keys.iter().map(|k| k.as_str().to_string()).collect());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                SubmitOutcome::Accepted
            } else {
                script.remove(0)
            }
        }
    }

    fn key(n: u32) -> PrivateKey {
        PrivateKey::from_canonical(format!("{n:0>64X}"))
    }

    fn keys(range: std::ops::Range<u32>) -> Vec<PrivateKey> {
        range.map(key).collect()
    }

    fn ctx(addr_count: usize) -> FlushContext<'static> {
        FlushContext {
            addr_count,
            last_run_ok: false,
            last_range: None,
            blocking: false,
            need_new_block_pending: false,
        }
    }

    #[test]
    fn batch_size_clamped() {
        assert_eq!(PendingKeyLedger::required_batch(0), 10);
        assert_eq!(PendingKeyLedger::required_batch(10), 10);
        assert_eq!(PendingKeyLedger::required_batch(17), 17);
        assert_eq!(PendingKeyLedger::required_batch(300), 30);
    }

    #[tokio::test]
    async fn below_threshold_submits_nothing() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..9));
        let pool = ScriptedPool::new(vec![]);
        let report = ledger.flush(&pool, ctx(10)).await;
        assert!(!report.posted);
        assert!(pool.submitted().is_empty());
        assert_eq!(ledger.len(), 9);
    }

    #[tokio::test]
    async fn exact_batch_in_insertion_order() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..10));
        let pool = ScriptedPool::new(vec![]);
        let report = ledger.flush(&pool, ctx(10)).await;
        assert!(report.posted);
        let submitted = pool.submitted();
        assert_eq!(submitted.len(), 1);
        let expected: Vec<String> = keys(0..10).iter().map(|k| k.as_str().to_string()).collect();
        assert_eq!(submitted[0], expected);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn drains_multiple_batches() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..25));
        let pool = ScriptedPool::new(vec![]);
        let report = ledger.flush(&pool, ctx(10)).await;
        assert!(report.posted);
        assert_eq!(pool.submitted().len(), 2);
        assert_eq!(ledger.len(), 5);
    }

    #[tokio::test]
    async fn incompatible_clears_entire_ledger() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..25));
        let pool = ScriptedPool::new(vec![SubmitOutcome::Incompatible]);
        let report = ledger.flush(&pool, ctx(10)).await;
        assert!(report.need_new_block);
        assert!(ledger.is_empty());
        // the on-disk copy is cleared too
        let reloaded = PendingKeyLedger::load(dir.path().join("pending.json"));
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn generic_failure_keeps_keys_in_non_blocking_mode() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..12));
        let pool = ScriptedPool::new(vec![SubmitOutcome::Error("rejected".to_string())]);
        let report = ledger.flush(&pool, ctx(10)).await;
        assert!(!report.posted);
        assert!(!report.need_new_block);
        assert_eq!(pool.submitted().len(), 1);
        assert_eq!(ledger.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_flush_bounds_retries_of_a_failing_batch() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..12));
        // the pool keeps rejecting with "no target block"; the flush
        // must hand control back so the caller can count and reset
        let pool = ScriptedPool::new(vec![
            SubmitOutcome::NoTargetBlock("no target block".to_string());
            6
        ]);
        let report = ledger
            .flush(&pool, FlushContext {
                addr_count: 10,
                last_run_ok: false,
                last_range: None,
                blocking: true,
                need_new_block_pending: false,
            })
            .await;
        assert!(!report.posted);
        assert!(!report.need_new_block);
        assert_eq!(pool.submitted().len(), 3);
        assert_eq!(report.events.len(), 3);
        assert!(report
            .events
            .iter()
            .all(|e| matches!(e, SubmitOutcome::NoTargetBlock(_))));
        // the keys stay queued for the next round
        assert_eq!(ledger.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_flush_retries_then_succeeds() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..10));
        let pool = ScriptedPool::new(vec![SubmitOutcome::Error("rejected".to_string())]);
        let report = ledger
            .flush(&pool, FlushContext {
                addr_count: 10,
                last_run_ok: false,
                last_range: None,
                blocking: true,
                need_new_block_pending: false,
            })
            .await;
        assert!(report.posted);
        assert_eq!(pool.submitted().len(), 2);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn persistence_round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let mut ledger = PendingKeyLedger::load(path.clone());
        ledger.enqueue(keys(0..7));
        ledger.enqueue(keys(100..103));
        let reloaded = PendingKeyLedger::load(path);
        assert_eq!(reloaded.keys(), ledger.keys());
    }

    #[tokio::test]
    async fn filler_padding_submits_exactly_required() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..3));
        let range = KeyRange {
            start: BigUint::from(0u32),
            end: BigUint::from(1u32) << 200usize,
        };
        let pool = ScriptedPool::new(vec![]);
        let report = ledger
            .flush(&pool, FlushContext {
                addr_count: 10,
                last_run_ok: true,
                last_range: Some(&range),
                blocking: false,
                need_new_block_pending: false,
            })
            .await;
        assert!(report.posted);
        let submitted = pool.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].len(), 10);
        // the real keys lead the batch
        assert_eq!(submitted[0][0], key(0).as_str());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn failed_filler_batch_never_persists_fillers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let mut ledger = PendingKeyLedger::load(path.clone());
        ledger.enqueue(keys(0..3));
        let range = KeyRange {
            start: BigUint::from(0u32),
            end: BigUint::from(1u32) << 200usize,
        };
        let pool = ScriptedPool::new(vec![SubmitOutcome::Error("nope".to_string())]);
        let report = ledger
            .flush(&pool, FlushContext {
                addr_count: 10,
                last_run_ok: true,
                last_range: Some(&range),
                blocking: false,
                need_new_block_pending: false,
            })
            .await;
        assert!(!report.posted);
        assert_eq!(ledger.len(), 3);
        let reloaded = PendingKeyLedger::load(path);
        assert_eq!(reloaded.len(), 3);
    }

    #[tokio::test]
    async fn filler_padding_skipped_after_failed_run() {
        let dir = tempdir().unwrap();
        let mut ledger = PendingKeyLedger::load(dir.path().join("pending.json"));
        ledger.enqueue(keys(0..3));
        let range = KeyRange {
            start: BigUint::from(0u32),
            end: BigUint::from(1u32) << 200usize,
        };
        let pool = ScriptedPool::new(vec![]);
        let report = ledger
            .flush(&pool, FlushContext {
                addr_count: 10,
                last_run_ok: false,
                last_range: Some(&range),
                blocking: false,
                need_new_block_pending: false,
            })
            .await;
        assert!(!report.posted);
        assert!(pool.submitted().is_empty());
    }
}
