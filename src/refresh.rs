use crate::collector::CollectError;
use crate::probe::now_unix;
use crate::snapshot::FleetSnapshot;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Lower bound between attempts after a failed pass.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("фоновое обновление уже запущено")]
    AlreadyRunning,
    #[error("фоновое обновление не запущено")]
    NotRunning,
    #[error("интервал обновления должен быть больше нуля")]
    InvalidInterval,
}

/// What the loop drives on every tick.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    async fn collect(&self) -> Result<FleetSnapshot, CollectError>;
    async fn publish(&self, snapshot: FleetSnapshot);
    fn record_failure(&self, err: &CollectError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Loop exited within the grace period.
    Joined,
    /// Loop was still busy; it keeps running detached but will never publish again.
    Abandoned,
    /// Loop had already died on a panic.
    Crashed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub interval_secs: Option<f64>,
    pub started_at_unix: Option<i64>,
    pub completed_passes: u64,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    halted: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    handle: JoinHandle<()>,
    interval: Duration,
    started_at_unix: i64,
}

/// Owner of the single background refresh task.
pub struct BackgroundRefresh {
    running: Mutex<Option<RunningLoop>>,
    grace: Duration,
}

impl BackgroundRefresh {
    pub fn new(grace: Duration) -> Self {
        Self {
            running: Mutex::new(None),
            grace,
        }
    }

    pub async fn start(
        &self,
        interval: Duration,
        target: Arc<dyn RefreshTarget>,
    ) -> Result<(), RefreshError> {
        if interval.is_zero() {
            return Err(RefreshError::InvalidInterval);
        }
        let mut guard = self.running.lock().await;
        if let Some(current) = guard.as_ref() {
            if !current.handle.is_finished() {
                return Err(RefreshError::AlreadyRunning);
            }
            warn!("предыдущий цикл обновления завершился аварийно, запускаем заново");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let halted = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run_loop(
            interval,
            target,
            shutdown_rx,
            halted.clone(),
            passes.clone(),
        ));

        info!(interval = %humantime::format_duration(interval), "фоновое обновление запущено");
        *guard = Some(RunningLoop {
            shutdown: shutdown_tx,
            halted,
            passes,
            handle,
            interval,
            started_at_unix: now_unix(),
        });
        Ok(())
    }

    /// Requests cancellation and waits up to the grace period for the loop to exit.
    pub async fn stop(&self) -> Result<StopOutcome, RefreshError> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(RefreshError::NotRunning)?;

        running.halted.store(true, Ordering::SeqCst);
        let _ = running.shutdown.send(true);

        let mut handle = running.handle;
        let outcome = match time::timeout(self.grace, &mut handle).await {
            Ok(Ok(())) => StopOutcome::Joined,
            Ok(Err(err)) => {
                error!(error = %err, "цикл обновления завершился аварийно");
                StopOutcome::Crashed
            }
            Err(_elapsed) => {
                warn!(
                    grace = %humantime::format_duration(self.grace),
                    "цикл обновления не остановился вовремя, оставляем его без публикации"
                );
                StopOutcome::Abandoned
            }
        };
        info!(outcome = ?outcome, "фоновое обновление остановлено");
        Ok(outcome)
    }

    pub async fn status(&self) -> LoopStatus {
        let guard = self.running.lock().await;
        match guard.as_ref() {
            Some(running) if !running.handle.is_finished() => LoopStatus {
                state: LoopState::Running,
                interval_secs: Some(running.interval.as_secs_f64()),
                started_at_unix: Some(running.started_at_unix),
                completed_passes: running.passes.load(Ordering::Relaxed),
            },
            Some(crashed) => LoopStatus {
                state: LoopState::Stopped,
                interval_secs: None,
                started_at_unix: None,
                completed_passes: crashed.passes.load(Ordering::Relaxed),
            },
            None => LoopStatus {
                state: LoopState::Stopped,
                interval_secs: None,
                started_at_unix: None,
                completed_passes: 0,
            },
        }
    }
}

async fn run_loop(
    interval: Duration,
    target: Arc<dyn RefreshTarget>,
    mut shutdown: watch::Receiver<bool>,
    halted: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
) {
    let mut delay = interval;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("refresh loop received shutdown");
                break;
            }
            _ = time::sleep(delay) => {}
        }
        if halted.load(Ordering::SeqCst) {
            break;
        }

        match target.collect().await {
            Ok(snapshot) => {
                // a stop issued mid-pass wins over the finished result
                if halted.load(Ordering::SeqCst) {
                    debug!("refresh loop halted during collection, dropping result");
                    break;
                }
                target.publish(snapshot).await;
                passes.fetch_add(1, Ordering::Relaxed);
                delay = interval;
            }
            Err(err) => {
                warn!(error = %err, stage = err.stage(), "проход обновления завершился ошибкой, сохраняем прошлый снимок");
                target.record_failure(&err);
                delay = interval.max(MIN_RETRY_DELAY);
            }
        }
    }
}
