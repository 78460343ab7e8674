//! The synchronization controller.
//!
//! One tokio task exclusively owns the selected run id, the polling timer,
//! and the published view-model; everything observable leaves through
//! `watch` channels. Fetch cycles run as spawned tasks and funnel their
//! results back over an internal channel, so the owning task never blocks
//! on I/O and every state transition happens in one task turn. There is
//! no window in which an old and a new polling timer can both fire.
//!
//! A single `start_cycle` entry point serves the timer tick, run-id
//! changes, manual refresh, and the registered refresh signal, so
//! single-flight and the liveness guard exist exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::assemble::ModelDataAssembler;
use crate::config::SyncConfig;
use crate::error::{FetchError, SyncError, ValidationError};
use crate::fetch::{
    ArtifactFetcher, DATA_METADATA_FILE, DOSE_EFFECTS_FILE, MODEL_RESULTS_FILE,
    SAMPLE_DESCRIPTIVES_FILE,
};
use crate::model::ModelData;
use crate::runs::{Run, RunRegistry};

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Controller constructed, task not yet running.
    Uninitialized,
    /// Fetching the run catalog.
    CatalogLoading,
    /// The catalog came back empty; nothing to sync.
    NoRunsAvailable,
    /// A run is selected and its data is current.
    Idle,
    /// A fetch cycle is in flight.
    Syncing,
    /// The last cycle failed; previously published data is retained.
    Error,
}

enum Command {
    SetRun(String),
    Refresh,
}

struct CycleOutcome {
    epoch: u64,
    cycle_id: u64,
    run_id: String,
    result: Result<Arc<ModelData>, FetchError>,
}

/// Configures and spawns a [`SyncHandle`].
pub struct SyncControllerBuilder {
    config: SyncConfig,
    client: Option<reqwest::Client>,
    poll_interval: Option<Duration>,
    initial_data: Option<Arc<ModelData>>,
    refresh_signal: Option<broadcast::Receiver<()>>,
}

impl SyncControllerBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            client: None,
            poll_interval: None,
            initial_data: None,
            refresh_signal: None,
        }
    }

    /// Use a caller-supplied HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the poll interval from the config.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Publish this value until the first fetch cycle lands, instead of
    /// the built-in placeholder.
    pub fn with_initial_data(mut self, data: Arc<ModelData>) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Register an external refresh signal. A received `()` takes exactly
    /// the manual-refresh path.
    pub fn with_refresh_signal(mut self, signal: broadcast::Receiver<()>) -> Self {
        self.refresh_signal = Some(signal);
        self
    }

    /// Spawn the controller task. Must be called from a tokio runtime.
    pub fn spawn(self) -> Result<SyncHandle, ValidationError> {
        let fetcher = match self.client {
            Some(client) => ArtifactFetcher::with_client(client, &self.config),
            None => ArtifactFetcher::new(&self.config),
        };
        let registry = RunRegistry::new(fetcher.clone())?;
        let assembler = Arc::new(ModelDataAssembler::new()?);
        // tokio::time::interval panics on a zero period.
        let poll_interval = self
            .poll_interval
            .unwrap_or_else(|| self.config.poll_interval())
            .max(Duration::from_millis(10));
        let initial_data = self
            .initial_data
            .unwrap_or_else(|| Arc::new(ModelData::placeholder()));

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (cycles_tx, cycles_rx) = mpsc::channel(8);
        let (data_tx, data_rx) = watch::channel(initial_data);
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Uninitialized);
        let (refreshing_tx, refreshing_rx) = watch::channel(false);
        let (runs_tx, runs_rx) = watch::channel(Arc::new(Vec::new()));
        let (selected_tx, selected_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = ControllerTask {
            registry,
            fetcher,
            assembler,
            poll_interval,
            cancel: cancel.clone(),
            commands: commands_rx,
            refresh_signal: self.refresh_signal,
            cycles_tx,
            cycles_rx,
            data_tx,
            phase_tx,
            refreshing_tx,
            runs_tx,
            selected_tx,
            current_run: None,
            epoch: 0,
            in_flight: None,
            next_cycle_id: 0,
            timer: None,
        };
        tokio::spawn(task.run());

        Ok(SyncHandle {
            commands: commands_tx,
            cancel,
            data_rx,
            phase_rx,
            refreshing_rx,
            runs_rx,
            selected_rx,
        })
    }
}

/// Owner-side handle to a running controller.
///
/// Dropping the handle tears the session down; in-flight requests are not
/// aborted, their results simply have nowhere to land.
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    data_rx: watch::Receiver<Arc<ModelData>>,
    phase_rx: watch::Receiver<SyncPhase>,
    refreshing_rx: watch::Receiver<bool>,
    runs_rx: watch::Receiver<Arc<Vec<Run>>>,
    selected_rx: watch::Receiver<Option<String>>,
}

impl SyncHandle {
    /// The currently published view-model.
    pub fn data(&self) -> Arc<ModelData> {
        self.data_rx.borrow().clone()
    }

    /// Subscribe to view-model replacements.
    pub fn subscribe_data(&self) -> watch::Receiver<Arc<ModelData>> {
        self.data_rx.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        *self.refreshing_rx.borrow()
    }

    pub fn subscribe_refreshing(&self) -> watch::Receiver<bool> {
        self.refreshing_rx.clone()
    }

    /// The run catalog, newest first.
    pub fn available_runs(&self) -> Arc<Vec<Run>> {
        self.runs_rx.borrow().clone()
    }

    pub fn subscribe_runs(&self) -> watch::Receiver<Arc<Vec<Run>>> {
        self.runs_rx.clone()
    }

    pub fn current_run(&self) -> Option<String> {
        self.selected_rx.borrow().clone()
    }

    pub fn subscribe_current_run(&self) -> watch::Receiver<Option<String>> {
        self.selected_rx.clone()
    }

    /// Select a run. A no-op when `run_id` is already selected; otherwise
    /// the polling timer is rebound and an immediate cycle starts.
    pub async fn set_current_run(&self, run_id: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::SetRun(run_id.into())).await
    }

    /// Request a refresh. Single-flight: a refresh while one is in flight
    /// is a no-op, not a second network cycle.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.send(Command::Refresh).await
    }

    /// Tear the session down. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: Command) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ControllerGone);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ControllerGone)
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ControllerTask {
    registry: RunRegistry,
    fetcher: ArtifactFetcher,
    assembler: Arc<ModelDataAssembler>,
    poll_interval: Duration,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    refresh_signal: Option<broadcast::Receiver<()>>,
    cycles_tx: mpsc::Sender<CycleOutcome>,
    cycles_rx: mpsc::Receiver<CycleOutcome>,
    data_tx: watch::Sender<Arc<ModelData>>,
    phase_tx: watch::Sender<SyncPhase>,
    refreshing_tx: watch::Sender<bool>,
    runs_tx: watch::Sender<Arc<Vec<Run>>>,
    selected_tx: watch::Sender<Option<String>>,
    current_run: Option<String>,
    /// Bumped on run change; cycle results carrying an older epoch are
    /// discarded unseen.
    epoch: u64,
    /// Cycle id outstanding for the current epoch, if any.
    in_flight: Option<u64>,
    next_cycle_id: u64,
    timer: Option<Interval>,
}

impl ControllerTask {
    async fn run(mut self) {
        self.set_phase(SyncPhase::CatalogLoading);
        let runs = Arc::new(self.registry.list_runs().await);
        let _ = self.runs_tx.send(Arc::clone(&runs));
        match runs.first() {
            Some(first) => self.select_run(first.run_id.clone()),
            None => self.set_phase(SyncPhase::NoRunsAvailable),
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone: session over.
                    None => break,
                },
                Some(outcome) = self.cycles_rx.recv() => self.handle_outcome(outcome),
                _ = next_tick(self.timer.as_mut()) => self.start_cycle("poll tick"),
                _ = signalled(self.refresh_signal.as_mut()) => self.start_cycle("refresh signal"),
            }
        }
        tracing::debug!("sync controller task exiting");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetRun(run_id) => {
                if self.current_run.as_deref() == Some(run_id.as_str()) {
                    return;
                }
                self.select_run(run_id);
            }
            Command::Refresh => self.start_cycle("manual refresh"),
        }
    }

    /// Bind the timer and an immediate cycle to `run_id`.
    ///
    /// Runs inside one task turn, so the old timer is gone before the new
    /// one exists and no interleaved tick can write for the old run.
    fn select_run(&mut self, run_id: String) {
        tracing::info!(run_id = %run_id, "selecting run");
        self.epoch += 1;
        self.in_flight = None;
        self.current_run = Some(run_id.clone());
        let _ = self.selected_tx.send(Some(run_id));

        let mut timer = tokio::time::interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The immediate cycle is started explicitly below; push the first
        // tick a full period out.
        timer.reset();
        self.timer = Some(timer);

        self.start_cycle("run selected");
    }

    /// The single entry point for every cycle trigger.
    fn start_cycle(&mut self, reason: &'static str) {
        let Some(run_id) = self.current_run.clone() else {
            tracing::debug!(reason, "no run selected; skipping sync cycle");
            return;
        };
        if self.in_flight.is_some() {
            tracing::debug!(reason, "sync cycle already in flight; coalescing");
            return;
        }

        let cycle_id = self.next_cycle_id;
        self.next_cycle_id += 1;
        self.in_flight = Some(cycle_id);
        let _ = self.refreshing_tx.send(true);
        self.set_phase(SyncPhase::Syncing);
        tracing::debug!(reason, run_id = %run_id, cycle_id, "starting sync cycle");

        let epoch = self.epoch;
        let fetcher = self.fetcher.clone();
        let assembler = Arc::clone(&self.assembler);
        let outcomes = self.cycles_tx.clone();
        tokio::spawn(async move {
            let result = fetch_and_assemble(&fetcher, &assembler, &run_id).await;
            // The owning task may already be gone; that is fine.
            let _ = outcomes
                .send(CycleOutcome {
                    epoch,
                    cycle_id,
                    run_id,
                    result,
                })
                .await;
        });
    }

    fn handle_outcome(&mut self, outcome: CycleOutcome) {
        // Liveness guard: the run changed while this cycle was in flight.
        if outcome.epoch != self.epoch {
            tracing::debug!(
                run_id = %outcome.run_id,
                cycle_id = outcome.cycle_id,
                "discarding sync result for a superseded run"
            );
            return;
        }

        if self.in_flight == Some(outcome.cycle_id) {
            self.in_flight = None;
            let _ = self.refreshing_tx.send(false);
        }

        match outcome.result {
            Ok(data) => {
                if !data.validation.is_valid {
                    tracing::warn!(
                        run_id = %outcome.run_id,
                        errors = ?data.validation.errors,
                        "model data assembled with validation errors"
                    );
                }
                let _ = self.data_tx.send(data);
                self.set_phase(SyncPhase::Idle);
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %outcome.run_id,
                    error = %err,
                    "sync cycle failed; retaining previous model data"
                );
                self.set_phase(SyncPhase::Error);
            }
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        let _ = self.phase_tx.send(phase);
    }
}

/// One fetch cycle: retrieve the run's artifacts concurrently, degrade
/// the optional ones, assemble.
async fn fetch_and_assemble(
    fetcher: &ArtifactFetcher,
    assembler: &ModelDataAssembler,
    run_id: &str,
) -> Result<Arc<ModelData>, FetchError> {
    let base = fetcher.resolve_base(Some(run_id));
    let (model, dose, sample, metadata) = tokio::join!(
        fetcher.fetch_json(&base, MODEL_RESULTS_FILE),
        fetcher.fetch_json(&base, DOSE_EFFECTS_FILE),
        fetcher.fetch_json(&base, SAMPLE_DESCRIPTIVES_FILE),
        fetcher.fetch_json(&base, DATA_METADATA_FILE),
    );

    // Model results are required; everything else degrades to absent.
    let model = model?;
    let dose = degrade(DOSE_EFFECTS_FILE, dose);
    let sample = degrade(SAMPLE_DESCRIPTIVES_FILE, sample);
    let metadata = degrade(DATA_METADATA_FILE, metadata);

    Ok(Arc::new(assembler.assemble(
        &model,
        dose.as_ref(),
        sample.as_ref(),
        metadata.as_ref(),
    )))
}

fn degrade(artifact: &str, result: Result<Value, FetchError>) -> Option<Value> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_not_found() => {
            tracing::debug!(artifact, "optional artifact absent");
            None
        }
        Err(err) => {
            tracing::warn!(artifact, error = %err, "optional artifact unavailable; treating as absent");
            None
        }
    }
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn signalled(signal: Option<&mut broadcast::Receiver<()>>) {
    let Some(rx) = signal else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "refresh signal lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}
