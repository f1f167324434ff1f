//! Top-level orchestration: fetch a block, run the search program,
//! parse results, flush the ledger, and keep going no matter what.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use shared::types::{Address, BlockAssignment, KeyRange};
use tokio::fs;
use tracing::*;

use crate::{
    config::{Config, WorkDir},
    ledger::{FlushContext, PendingKeyLedger},
    parse::parse_output,
    restful::{FetchOutcome, PoolApi, PoolClient, SubmitOutcome},
    runner::{
        self,
        clean_io_files,
        detect_devices,
        write_input_file,
        DeviceRunner,
        RunError,
    },
    status::{ErrorCategory, ErrorCounter, RateLimiter, WorkerStatus, ERROR_RESET_THRESHOLD},
    telegram::TelegramNotifier,
};

const FETCH_RETRY_DELAY: Duration = Duration::from_secs(30);
const BAD_BLOCK_DELAY: Duration = Duration::from_secs(30);
const RESET_DELAY: Duration = Duration::from_secs(5);
const RL_LONG: Duration = Duration::from_secs(300);
const RL_SHORT: Duration = Duration::from_secs(120);

/// Consecutive "no target block" rejections tolerated before the local
/// state is reset and a fresh block is forced.
const NO_BLOCK_RESET_AFTER: u32 = 3;

pub type PoolFactory = Box<dyn Fn(&Config) -> Arc<dyn PoolClient> + Send + Sync>;

enum Step {
    /// Go straight into the next iteration.
    Continue,
    /// Sleep the post-block delay first.
    Wait,
    /// Terminal transition; the loop ends.
    Terminate,
}

/// The only owner of mutable worker state. Components get borrowed
/// slices of it; nothing here is global.
pub struct WorkerManager {
    config_path: PathBuf,
    config: Config,
    files: WorkDir,
    pool: Arc<dyn PoolClient>,
    pool_factory: PoolFactory,
    ledger: PendingKeyLedger,
    notifier: TelegramNotifier,
    pub(crate) status: WorkerStatus,
    pub(crate) errors: ErrorCounter,
    limiter: RateLimiter,
    previous_keyspace: Option<String>,
    /// Address count and range of the block currently being worked.
    current_addr_count: usize,
    current_range: Option<KeyRange>,
    pub(crate) need_new_block: bool,
    processed_one_block: bool,
    last_run_ok: bool,
    no_block_consecutive: u32,
}

impl WorkerManager {
    pub fn new(config_path: PathBuf, work_dir: PathBuf) -> anyhow::Result<WorkerManager> {
        let factory: PoolFactory = Box::new(|config| Arc::new(PoolApi::new(config)));
        WorkerManager::with_pool_factory(config_path, work_dir, factory)
    }

    pub fn with_pool_factory(
        config_path: PathBuf,
        work_dir: PathBuf,
        pool_factory: PoolFactory,
    ) -> anyhow::Result<WorkerManager> {
        let config = Config::load(&config_path)?;
        let files = WorkDir::new(work_dir);
        let pool = pool_factory(&config);
        let ledger = PendingKeyLedger::load(files.pending_keys_file());
        let notifier = TelegramNotifier::new(&config, files.telegram_state_file());
        Ok(WorkerManager {
            config_path,
            files,
            pool,
            pool_factory,
            ledger,
            notifier,
            config,
            status: WorkerStatus::new(),
            errors: ErrorCounter::default(),
            limiter: RateLimiter::default(),
            previous_keyspace: None,
            current_addr_count: 0,
            current_range: None,
            need_new_block: false,
            processed_one_block: false,
            last_run_ok: false,
            no_block_consecutive: 0,
        })
    }

    pub fn pending_keys(&self) -> usize {
        self.ledger.len()
    }

    /// Main loop. Exits only on a terminal transition: all blocks
    /// solved, a target key found, or one-shot completion. Anything
    /// unexpected resets local state and keeps going.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        clean_io_files(&self.files).await;
        info!(
            "worker session {} starting, {} pending keys restored",
            self.status.session.id,
            self.ledger.len()
        );

        loop {
            match self.run_iteration().await {
                Ok(Step::Terminate) => break,
                Ok(Step::Continue) => {}
                Ok(Step::Wait) => {
                    let delay = self.config.post_block_delay;
                    self.status.next_fetch_in = delay.as_secs();
                    self.status.pending_keys = self.ledger.len();
                    self.push_status().await;
                    info!("no critical solution this round, next fetch in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!("unhandled error in main loop: {err:#}");
                    self.status.last_error = format!("Main loop error `{err}`");
                    self.push_status_rl(ErrorCategory::MainLoopException, RL_SHORT).await;
                    self.reset_local_state().await;
                    tokio::time::sleep(RESET_DELAY).await;
                }
            }
        }
        Ok(())
    }

    /// One pass of the state machine: FETCH -> RUN -> PARSE -> FLUSH.
    async fn run_iteration(&mut self) -> anyhow::Result<Step> {
        self.reload_config().await;
        self.flush_ledger(true).await;

        if self.need_new_block {
            self.need_new_block = false;
            self.status.pending_keys = self.ledger.len();
            self.status.next_fetch_in = 0;
            self.push_status().await;
            info!("ledger cleared, fetching a new block immediately");
            return Ok(Step::Continue);
        }
        if self.config.one_shot && self.processed_one_block {
            info!("one-shot mode enabled, exiting after first block");
            return Ok(Step::Terminate);
        }

        let block = match self.fetch_block().await? {
            Some(block) => block,
            None => {
                if self.status.all_blocks_solved {
                    return Ok(Step::Terminate);
                }
                error!("could not fetch block data, retrying in 30 seconds");
                tokio::time::sleep(FETCH_RETRY_DELAY).await;
                return Ok(Step::Continue);
            }
        };

        if block.addresses.is_empty() {
            self.notify_error(ErrorCategory::NoAddresses, "No addresses in block", RL_SHORT)
                .await;
            tokio::time::sleep(BAD_BLOCK_DELAY).await;
            return Ok(Step::Continue);
        }
        if block.range.end <= block.range.start {
            self.notify_error(ErrorCategory::MissingKeyRange, "Key range missing", RL_SHORT)
                .await;
            tokio::time::sleep(BAD_BLOCK_DELAY).await;
            return Ok(Step::Continue);
        }

        let keyspace = block.keyspace();
        let devices = detect_devices(&self.config.program_path).await;
        if self.previous_keyspace.as_deref() != Some(keyspace.as_str()) {
            self.previous_keyspace = Some(keyspace.clone());
            self.status.range = keyspace.clone();
            self.status.addresses = block.addresses.len();
            self.status.gpu =
                devices.iter().map(|d| d.label.clone()).collect::<Vec<_>>().join("\n");
            self.status.algorithm = self.program_label();
            self.status.arguments = if self.config.program_args.is_empty() {
                "-".to_string()
            } else {
                self.config.program_args.join(" ")
            };
            self.push_status().await;
            info!("new block: {}", keyspace);
        }
        self.current_addr_count = block.addresses.len();
        self.current_range = Some(block.range.clone());

        write_input_file(&self.files, &block.addresses, &self.config.target_addresses).await?;

        let ran_ok = self.run_block(&block, &devices).await;
        let solution_found = self.process_output().await;

        if ran_ok {
            self.status.session.blocks += 1;
            self.status.session.consecutive += 1;
            self.status.session.keyspace_total += block.range.span();
        } else {
            self.status.session.consecutive = 0;
        }
        self.processed_one_block = true;

        if solution_found {
            info!("target address key found, exiting");
            return Ok(Step::Terminate);
        }

        self.flush_ledger(true).await;
        if self.need_new_block {
            self.need_new_block = false;
            self.status.pending_keys = self.ledger.len();
            self.status.next_fetch_in = 0;
            self.push_status().await;
            info!("incompatible keys cleared, fetching a new block immediately");
            return Ok(Step::Continue);
        }
        if self.config.one_shot {
            info!("one-shot mode enabled, exiting after first block");
            return Ok(Step::Terminate);
        }
        Ok(Step::Wait)
    }

    async fn reload_config(&mut self) {
        match Config::load(&self.config_path) {
            Ok(config) => {
                self.pool = (self.pool_factory)(&config);
                self.notifier.reconfigure(&config);
                self.config = config;
            }
            Err(err) => warn!("settings reload failed, keeping previous config: {err:#}"),
        }
    }

    // ---------------------------------------------------------- fetch

    /// `Ok(None)` means retry later; the all-solved terminal state is
    /// reported through `status.all_blocks_solved`.
    async fn fetch_block(&mut self) -> anyhow::Result<Option<BlockAssignment>> {
        match self.pool.fetch_block().await {
            FetchOutcome::Block(block) => Ok(Some(block)),
            FetchOutcome::AllSolved => {
                self.status.all_blocks_solved = true;
                self.status.next_fetch_in = 0;
                self.push_status().await;
                info!("all blocks solved, shutting down");
                Ok(None)
            }
            FetchOutcome::NoRange(msg) => {
                warn!("no range available: {msg}");
                self.status.last_error = format!("No range available: `{msg}`");
                self.push_status_rl(ErrorCategory::NoRange, RL_LONG).await;
                Ok(None)
            }
            FetchOutcome::Offline(msg) => {
                self.status.last_error = format!("API offline `{msg}`");
                self.api_offline_error(&format!("API offline `{msg}`")).await;
                Ok(None)
            }
            FetchOutcome::Error(msg) => {
                self.notify_error(
                    ErrorCategory::ApiFetchError,
                    &format!("API error `{msg}`"),
                    RL_LONG,
                )
                .await;
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------ run

    async fn run_block(&mut self, block: &BlockAssignment, devices: &[runner::GpuDevice]) -> bool {
        let runner = DeviceRunner::new(
            self.config.program_path.clone(),
            self.config.program_args.clone(),
            self.config.kind,
            self.files.clone(),
        );
        match runner.run(&block.range, devices).await {
            Ok(result) if result.succeeded => {
                self.last_run_ok = true;
                true
            }
            Ok(result) => {
                self.last_run_ok = false;
                self.notify_error(
                    ErrorCategory::ProgramFailed,
                    &format!("Program failed code `{}`", result.exit_code),
                    RL_SHORT,
                )
                .await;
                false
            }
            Err(RunError::NotFound) => {
                self.last_run_ok = false;
                error!("external program not found, check path and permissions");
                self.notify_error(ErrorCategory::ProgramNotFound, "Program not found", RL_SHORT)
                    .await;
                false
            }
            Err(RunError::Spawn(msg)) => {
                self.last_run_ok = false;
                self.notify_error(
                    ErrorCategory::ProgramException,
                    &format!("Program start exception `{msg}`"),
                    RL_SHORT,
                )
                .await;
                false
            }
        }
    }

    // ---------------------------------------------------------- parse

    /// Returns true when a target-address key was found (terminal).
    async fn process_output(&mut self) -> bool {
        let out_path = self.files.out_file();
        let content = match fs::read_to_string(&out_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("output file {:?} missing", out_path);
                self.notify_error(ErrorCategory::OutputMissing, "Output file missing", RL_SHORT)
                    .await;
                return false;
            }
            Err(err) => {
                self.notify_error(
                    ErrorCategory::OutputParseError,
                    &format!("Output unreadable `{err}`"),
                    RL_SHORT,
                )
                .await;
                return false;
            }
        };

        let targets: HashSet<Address> = self.config.target_addresses.iter().cloned().collect();
        let parsed = parse_output(&content, self.config.kind, &targets);

        if !parsed.found.is_empty() {
            info!("{} key(s) for target addresses found, stopping", parsed.found.len());
            let body = parsed
                .found
                .iter()
                .map(|p| format!("{}:{}", p.address, p.key))
                .collect::<Vec<_>>()
                .join("\n")
                + "\n";
            match fs::write(self.files.keyfound_file(), body).await {
                Ok(_) => info!("private key saved in {:?}", self.files.keyfound_file()),
                Err(err) => error!("failed to save found key: {err:#}"),
            }
            if self.config.send_found_keys_to_api {
                let keys: Vec<_> = parsed.found.iter().map(|p| p.key.clone()).collect();
                let _ = self.pool.submit_keys(&keys).await;
            }
            self.ledger.enqueue(parsed.candidates);
            self.status.keyfound = format!("{} saved to KEYFOUND.txt", parsed.found.len());
            self.status.pending_keys = self.ledger.len();
            self.push_status().await;
            return true;
        }

        if !parsed.candidates.is_empty() {
            self.ledger.enqueue(parsed.candidates);
            info!("accumulated {} keys for posting", self.ledger.len());
            self.status.pending_keys = self.ledger.len();
            self.push_status().await;
        }

        if let Err(err) = fs::write(&out_path, "").await {
            self.notify_error(
                ErrorCategory::ClearOutError,
                &format!("Failed to clear output `{err}`"),
                RL_SHORT,
            )
            .await;
        }
        runner::clean_device_out_files(&self.files).await;
        false
    }

    // ---------------------------------------------------------- flush

    async fn flush_ledger(&mut self, blocking: bool) {
        if self.ledger.is_empty() {
            return;
        }
        let ctx = FlushContext {
            addr_count: self.current_addr_count,
            last_run_ok: self.last_run_ok,
            last_range: self.current_range.as_ref(),
            blocking,
            need_new_block_pending: self.need_new_block,
        };
        let report = self.ledger.flush(self.pool.as_ref(), ctx).await;
        if report.need_new_block {
            self.need_new_block = true;
        }
        let batch_size = PendingKeyLedger::required_batch(self.current_addr_count);
        for event in report.events {
            self.apply_submit_event(event, batch_size).await;
        }
        self.status.pending_keys = self.ledger.len();
    }

    async fn apply_submit_event(&mut self, event: SubmitOutcome, batch_size: usize) {
        match event {
            SubmitOutcome::Accepted => {
                self.no_block_consecutive = 0;
                info!("private keys posted successfully");
                self.status.last_batch = format!("Sent {batch_size} keys");
                self.push_status().await;
            }
            SubmitOutcome::Offline(msg) => {
                self.status.last_batch = format!("Server error `{msg}`");
                self.status.last_error = format!("Post server error `{msg}`");
                error!("[{}] post server error `{msg}`", ErrorCategory::PostServerError);
                self.push_status_rl(ErrorCategory::PostServerError, RL_LONG).await;
            }
            SubmitOutcome::NetworkError(msg) => {
                self.status.last_batch = format!("Connection error `{msg}`");
                self.status.last_error = format!("Post connection error `{msg}`");
                error!("[{}] post connection error `{msg}`", ErrorCategory::PostNetworkError);
                self.push_status_rl(ErrorCategory::PostNetworkError, RL_LONG).await;
            }
            SubmitOutcome::Incompatible => {
                self.status.last_batch = "Incompatible privatekeys".to_string();
                self.push_status_rl(ErrorCategory::PostIncompatible, RL_LONG).await;
                error!("pool reports incompatible private keys, ledger discarded");
            }
            SubmitOutcome::NoTargetBlock(msg) => {
                warn!("[{}] no target block: {msg}", ErrorCategory::PostError);
                self.status.last_batch = format!("No target block `{msg}`");
                self.status.last_error = format!("Post error `{msg}`");
                self.push_status_rl(ErrorCategory::PostError, RL_LONG).await;
                self.no_block_consecutive += 1;
                if self.no_block_consecutive >= NO_BLOCK_RESET_AFTER {
                    self.no_block_consecutive = 0;
                    warn!("no active block for this worker, resetting state");
                    self.notifier
                        .send_notification("Post errors: no active block. Resetting state.")
                        .await;
                    self.reset_local_state().await;
                }
            }
            SubmitOutcome::Error(msg) => {
                self.status.last_batch = format!("Failed `{msg}`");
                self.notify_error(ErrorCategory::PostError, &format!("Post error `{msg}`"), RL_LONG)
                    .await;
            }
        }
    }

    // --------------------------------------------------------- errors

    /// Categorized error path: rate-limited status push, threshold
    /// accounting, and the reset safety valve at three occurrences.
    async fn notify_error(&mut self, category: ErrorCategory, message: &str, interval: Duration) {
        error!("[{category}] {message}");
        self.status.last_error = message.to_string();
        self.push_status_rl(category, interval).await;

        let count = self.errors.record(category);
        if count >= ERROR_RESET_THRESHOLD {
            self.errors.reset(category);
            self.notifier
                .send_notification(&format!(
                    "❌ Error threshold reached in '{category}'. Resetting state."
                ))
                .await;
            self.reset_local_state().await;
        }
    }

    /// Offline APIs are transient by definition and never feed the
    /// threshold counter.
    async fn api_offline_error(&mut self, message: &str) {
        error!("[{}] {message}", ErrorCategory::ApiOffline);
        self.push_status_rl(ErrorCategory::ApiOffline, RL_LONG).await;
    }

    /// The consistency safety valve: drop everything local and force a
    /// fresh block.
    async fn reset_local_state(&mut self) {
        self.ledger.clear_and_remove_file();
        clean_io_files(&self.files).await;
        self.need_new_block = true;
        self.status.pending_keys = 0;
    }

    // --------------------------------------------------------- status

    async fn push_status(&mut self) {
        self.status.pending_keys = self.ledger.len();
        self.notifier.update_status(&self.status).await;
    }

    async fn push_status_rl(&mut self, category: ErrorCategory, interval: Duration) {
        if self.limiter.allow(category, interval) {
            self.push_status().await;
        }
    }

    fn program_label(&self) -> String {
        self.config
            .program_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "-".to_string())
    }
}
