//! Per-source periodic scheduling.
//!
//! Every source gets its own trigger task. Triggers run concurrently and
//! share one [`BrokerPublisher`]; within a source, executions are strictly
//! serialized.

use crate::classifier::ErrorClassifier;
use crate::config::{SchedulerSettings, SourceConfig};
use crate::pipeline::{ExecutionOutcome, PipelineRunner, PipelineStatus};
use crate::publisher::BrokerPublisher;
use crate::registry::PipelineRegistry;
use crate::transport::RetryingTransport;
use crate::{ConnectorError, ConnectorResult};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Process-wide scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Trigger state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Unscheduled,
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    #[serde(flatten)]
    pub pipeline: PipelineStatus,
    pub schedule: ScheduleState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub running: bool,
    pub broker_connected: bool,
    pub sources: Vec<SourceStatus>,
}

struct Trigger {
    cancel: CancellationToken,
}

struct SourceSlot {
    runner: Arc<PipelineRunner>,
    schedule: ScheduleState,
    trigger: Option<Trigger>,
}

/// Owns the pipelines and their periodic triggers.
///
/// All operations take `&self`, so a scheduler can be shared behind an
/// `Arc` between the main task and a signal handler.
///
/// Every trigger task and manual execution of a run is spawned on one
/// [`TaskTracker`]; `stop` drains the tracker before disconnecting.
pub struct Scheduler {
    sources: Vec<SourceConfig>,
    settings: SchedulerSettings,
    registry: PipelineRegistry,
    publisher: Arc<BrokerPublisher>,
    transport: RetryingTransport,
    classifier: ErrorClassifier,
    state: Mutex<SchedulerState>,
    slots: Mutex<Vec<SourceSlot>>,
    tasks: TaskTracker,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Scheduler {
    pub fn new(
        sources: Vec<SourceConfig>,
        settings: SchedulerSettings,
        registry: PipelineRegistry,
        publisher: Arc<BrokerPublisher>,
        transport: RetryingTransport,
    ) -> Self {
        Self {
            sources,
            settings,
            registry,
            publisher,
            transport,
            classifier: ErrorClassifier::new(),
            state: Mutex::new(SchedulerState::Stopped),
            slots: Mutex::new(Vec::new()),
            tasks: TaskTracker::new(),
            aborts: Mutex::new(Vec::new()),
        }
    }

    /// Use `classifier` (for example one with a reporter) for pipeline failures
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Connect the publisher, build one pipeline per source and schedule them.
    ///
    /// Sources whose pipeline cannot be built are dropped. Startup fails when
    /// the broker is unreachable or no pipeline could be built.
    pub async fn start(&self) -> ConnectorResult<()> {
        {
            let mut state = self.lock_state();
            match *state {
                SchedulerState::Stopped => *state = SchedulerState::Starting,
                other => {
                    warn!("Scheduler is {:?}, ignoring start", other);
                    return Ok(());
                }
            }
        }

        info!("Starting scheduler with {} configured sources", self.sources.len());

        if let Err(e) = self.publisher.connect().await {
            self.set_state(SchedulerState::Stopped);
            return Err(e);
        }

        self.tasks.reopen();
        let created = self.registry.create_many(&self.sources);
        if created.is_empty() {
            if let Err(e) = self.publisher.disconnect().await {
                warn!("Broker disconnect after failed startup: {}", e);
            }
            self.set_state(SchedulerState::Stopped);
            return Err(ConnectorError::config(
                "no pipelines could be created from the configured sources",
            ));
        }

        let mut slots = Vec::with_capacity(created.len());
        for (config, pipeline) in created {
            let runner = Arc::new(PipelineRunner::new(
                config,
                pipeline,
                self.transport.clone(),
                self.classifier.clone(),
                self.settings.default_interval_ms,
            ));
            let delay = runner.config().startup_delay();
            let trigger = self.spawn_trigger(Arc::clone(&runner), delay);
            slots.push(SourceSlot {
                runner,
                schedule: ScheduleState::Active,
                trigger: Some(trigger),
            });
        }

        let scheduled = slots.len();
        *self.lock_slots() = slots;
        self.set_state(SchedulerState::Running);

        info!(
            "Scheduler running: {} of {} sources scheduled",
            scheduled,
            self.sources.len()
        );
        Ok(())
    }

    /// Cancel every trigger, wait for in-flight executions up to the
    /// shutdown grace period, then disconnect the publisher.
    pub async fn stop(&self) -> ConnectorResult<()> {
        {
            let mut state = self.lock_state();
            if *state != SchedulerState::Running {
                debug!("Scheduler is {:?}, ignoring stop", *state);
                return Ok(());
            }
            *state = SchedulerState::Stopping;
        }

        info!("Stopping scheduler");

        {
            let mut slots = self.lock_slots();
            for slot in slots.iter_mut() {
                slot.schedule = ScheduleState::Unscheduled;
                if let Some(trigger) = slot.trigger.take() {
                    trigger.cancel.cancel();
                }
            }
        }

        self.tasks.close();
        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                "{} scheduler tasks did not finish within {:?}, aborting them",
                self.tasks.len(),
                grace
            );
            for abort in self.lock_aborts().drain(..) {
                abort.abort();
            }
        }
        self.lock_aborts().clear();

        let result = self.publisher.disconnect().await;
        self.set_state(SchedulerState::Stopped);

        match &result {
            Ok(()) => info!("Scheduler stopped"),
            Err(e) => error!("Scheduler stopped with broker error: {}", e),
        }
        result
    }

    /// Run one execution of `source_name` outside the schedule.
    ///
    /// Still subject to the pipeline's single-flight guard, and drained by
    /// `stop` like scheduled executions.
    pub async fn execute_manually(&self, source_name: &str) -> ConnectorResult<ExecutionOutcome> {
        let runner = self.runner(source_name)?;
        info!(source = %source_name, "Manual execution requested");

        let publisher = Arc::clone(&self.publisher);
        let handle = self
            .tasks
            .spawn(async move { runner.execute(&publisher).await });
        self.track_abort(handle.abort_handle());

        handle
            .await
            .map_err(|e| ConnectorError::fatal_with_source("Manual execution was aborted", e))
    }

    /// Cancel the trigger of one source. Other sources are untouched.
    pub fn pause_strategy(&self, source_name: &str) -> ConnectorResult<()> {
        let mut slots = self.lock_slots();
        let slot = find_slot(&mut slots, source_name)?;

        if slot.schedule != ScheduleState::Active {
            warn!(source = %source_name, "Source is not active, ignoring pause");
            return Ok(());
        }

        if let Some(trigger) = &slot.trigger {
            trigger.cancel.cancel();
        }
        slot.schedule = ScheduleState::Paused;
        info!(source = %source_name, "Source paused");
        Ok(())
    }

    /// Re-establish the trigger of one source. Resuming an active source is
    /// a no-op.
    ///
    /// The paused trigger may still be finishing an execution; it stays on
    /// the task tracker until it does.
    pub fn resume_strategy(&self, source_name: &str) -> ConnectorResult<()> {
        let running = self.is_running();
        let mut slots = self.lock_slots();
        let slot = find_slot(&mut slots, source_name)?;

        if slot.schedule == ScheduleState::Active {
            warn!(source = %source_name, "Source is already active, ignoring resume");
            return Ok(());
        }
        if !running {
            warn!(source = %source_name, "Scheduler is not running, ignoring resume");
            return Ok(());
        }

        slot.trigger = Some(self.spawn_trigger(Arc::clone(&slot.runner), None));
        slot.schedule = ScheduleState::Active;
        info!(source = %source_name, "Source resumed");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state();
        let sources = self
            .lock_slots()
            .iter()
            .map(|slot| SourceStatus {
                pipeline: slot.runner.status(),
                schedule: slot.schedule,
            })
            .collect();

        SchedulerStatus {
            state,
            running: state == SchedulerState::Running,
            broker_connected: self.publisher.is_healthy(),
            sources,
        }
    }

    fn runner(&self, source_name: &str) -> ConnectorResult<Arc<PipelineRunner>> {
        self.lock_slots()
            .iter()
            .find(|slot| slot.runner.name() == source_name)
            .map(|slot| Arc::clone(&slot.runner))
            .ok_or_else(|| ConnectorError::SourceNotFound(source_name.to_string()))
    }

    fn spawn_trigger(&self, runner: Arc<PipelineRunner>, delay: Option<Duration>) -> Trigger {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let publisher = Arc::clone(&self.publisher);
        let period = runner.interval().max(Duration::from_millis(1));

        debug!(
            source = %runner.name(),
            interval_ms = period.as_millis() as u64,
            "Scheduling source"
        );

        let handle = self.tasks.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let ExecutionOutcome::Skipped = runner.execute(&publisher).await {
                            debug!(source = %runner.name(), "Tick skipped");
                        }
                    }
                }
            }

            debug!(source = %runner.name(), "Trigger cancelled");
        });

        self.track_abort(handle.abort_handle());
        Trigger { cancel }
    }

    fn set_state(&self, next: SchedulerState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<SourceSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_abort(&self, abort: AbortHandle) {
        let mut aborts = self.lock_aborts();
        aborts.retain(|a| !a.is_finished());
        aborts.push(abort);
    }

    fn lock_aborts(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.aborts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_slot<'a>(slots: &'a mut [SourceSlot], name: &str) -> ConnectorResult<&'a mut SourceSlot> {
    slots
        .iter_mut()
        .find(|slot| slot.runner.name() == name)
        .ok_or_else(|| ConnectorError::SourceNotFound(name.to_string()))
}
