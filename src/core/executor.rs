//! Sequence executor
//!
//! Drives a command sequence through the connection manager on its own task.
//! Each step is encoded, sent if it produces a frame, and followed by its
//! delay. Cancellation is cooperative and only observed at step boundaries.
//! Every run, completed or cancelled, ends by sending a stop frame.

use super::command::{Command, Encoder, SpeedScale};
use super::connection::{ConnectionManager, Delivery};
use crate::config::ExecutionSettings;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executor phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPhase {
    /// Nothing has run yet
    Idle,
    /// A run is in progress
    Running,
    /// Last run reached the end of its sequence
    Completed,
    /// Last run was cancelled
    Cancelled,
    /// Last run was rejected or aborted
    Error,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Progress event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Run the event belongs to; `None` for rejected runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Phase
    pub phase: ExecutionPhase,
    /// Step being executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionEvent {
    fn new(
        run_id: Option<Uuid>,
        phase: ExecutionPhase,
        step_index: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            phase,
            step_index,
            message: Some(message.into()),
        }
    }
}

/// Reasons `run` refuses to start
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// Sequence has no steps
    #[error("Nothing to run: the sequence is empty")]
    Empty,

    /// No active connection
    #[error("Nothing to run: not connected")]
    NotConnected,

    /// Another run is in progress
    #[error("A sequence is already running")]
    AlreadyRunning,
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run identifier
    pub run_id: Uuid,
    /// `Completed`, `Cancelled`, or `Error` if the task died
    pub phase: ExecutionPhase,
    /// Steps started before the run ended
    pub steps_executed: usize,
    /// Frames the transport accepted, including the final stop
    pub frames_sent: usize,
    /// Frames skipped or lost
    pub frames_dropped: usize,
}

/// Handle to a run in progress
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    task: JoinHandle<RunOutcome>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Run identifier, also carried by every event of this run
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation at the next step boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end
    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run = %self.id, error = %e, "Run task failed");
                RunOutcome {
                    run_id: self.id,
                    phase: ExecutionPhase::Error,
                    steps_executed: 0,
                    frames_sent: 0,
                    frames_dropped: 0,
                }
            }
        }
    }
}

/// State of one playthrough, owned by the run task
struct ExecutionRun {
    id: Uuid,
    sequence: Arc<[Command]>,
    current_index: usize,
    speed: SpeedScale,
    cancel: CancellationToken,
}

/// Runs command sequences against the connection manager
pub struct SequenceExecutor {
    connection: Arc<ConnectionManager>,
    encoder: Encoder,
    default_speed: SpeedScale,
    phase: Arc<RwLock<ExecutionPhase>>,
    current: Arc<Mutex<Option<CancellationToken>>>,
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl SequenceExecutor {
    /// Executor with the default timing
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self::with_settings(connection, &ExecutionSettings::default())
    }

    /// Executor with configured timing, terminator and start speed
    pub fn with_settings(connection: Arc<ConnectionManager>, settings: &ExecutionSettings) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            connection,
            encoder: Encoder::from_settings(settings),
            default_speed: SpeedScale::new(i64::from(settings.default_speed)),
            phase: Arc::new(RwLock::new(ExecutionPhase::Idle)),
            current: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    /// Current phase
    pub fn phase(&self) -> ExecutionPhase {
        *self.phase.read()
    }

    /// Encoder used for every run
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Start running `sequence`. Rejections are reported synchronously and
    /// nothing is sent.
    pub fn run(&self, sequence: impl Into<Arc<[Command]>>) -> Result<RunHandle, SequenceError> {
        let sequence = sequence.into();
        let mut phase = self.phase.write();

        if *phase == ExecutionPhase::Running {
            warn!("Run rejected: already running");
            return Err(SequenceError::AlreadyRunning);
        }
        let rejection = if sequence.is_empty() {
            Some(SequenceError::Empty)
        } else if !self.connection.is_connected() {
            Some(SequenceError::NotConnected)
        } else {
            None
        };
        if let Some(err) = rejection {
            warn!(error = %err, "Run rejected");
            *phase = ExecutionPhase::Error;
            let _ = self
                .event_tx
                .send(ExecutionEvent::new(None, ExecutionPhase::Error, None, err.to_string()));
            return Err(err);
        }

        *phase = ExecutionPhase::Running;
        drop(phase);

        let cancel = CancellationToken::new();
        *self.current.lock() = Some(cancel.clone());

        let id = Uuid::new_v4();
        let run = ExecutionRun {
            id,
            sequence,
            current_index: 0,
            speed: self.default_speed,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(
            Arc::clone(&self.connection),
            self.encoder.clone(),
            Arc::clone(&self.phase),
            Arc::clone(&self.current),
            self.event_tx.clone(),
        ));

        Ok(RunHandle { id, task, cancel })
    }

    /// Cancel the current run, if any
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            info!("Cancellation requested");
            token.cancel();
        }
    }
}

impl ExecutionRun {
    async fn execute(
        mut self,
        connection: Arc<ConnectionManager>,
        encoder: Encoder,
        phase: Arc<RwLock<ExecutionPhase>>,
        current: Arc<Mutex<Option<CancellationToken>>>,
        event_tx: broadcast::Sender<ExecutionEvent>,
    ) -> RunOutcome {
        let total = self.sequence.len();
        let run_id = Some(self.id);
        let mut outcome = RunOutcome {
            run_id: self.id,
            phase: ExecutionPhase::Running,
            steps_executed: 0,
            frames_sent: 0,
            frames_dropped: 0,
        };
        info!(run = %self.id, steps = total, "Run started");
        let _ = event_tx.send(ExecutionEvent::new(
            run_id,
            ExecutionPhase::Running,
            None,
            format!("Running {total} steps"),
        ));

        let mut cancelled = false;
        while self.current_index < total {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let index = self.current_index;
            let command = self.sequence[index];
            let step = encoder.encode(&command, self.speed);
            self.speed = step.speed;

            debug!(step = index, %command, speed = %self.speed, "Executing step");
            let _ = event_tx.send(ExecutionEvent::new(
                run_id,
                ExecutionPhase::Running,
                Some(index),
                command.to_string(),
            ));

            if let Some(frame) = &step.frame {
                match connection.send(frame).await {
                    Delivery::Sent(_) => outcome.frames_sent += 1,
                    Delivery::Skipped | Delivery::Dropped(_) => outcome.frames_dropped += 1,
                }
            }
            outcome.steps_executed += 1;

            tokio::time::sleep(step.delay).await;
            self.current_index += 1;
        }
        // A cancel during the last step's delay still ends the run as cancelled.
        if self.cancel.is_cancelled() {
            cancelled = true;
        }

        // Leave the robot stationary however the run ended.
        match connection.send(&encoder.stop_frame()).await {
            Delivery::Sent(_) => outcome.frames_sent += 1,
            Delivery::Skipped | Delivery::Dropped(_) => {
                warn!("Final stop frame not delivered");
                outcome.frames_dropped += 1;
            }
        }

        let (final_phase, message) = if cancelled {
            (
                ExecutionPhase::Cancelled,
                format!("Cancelled after {} of {total} steps", outcome.steps_executed),
            )
        } else {
            (ExecutionPhase::Completed, format!("Completed {total} steps"))
        };
        outcome.phase = final_phase;
        info!(
            run = %self.id,
            phase = %final_phase,
            steps = outcome.steps_executed,
            sent = outcome.frames_sent,
            dropped = outcome.frames_dropped,
            "Run finished"
        );

        *current.lock() = None;
        *phase.write() = final_phase;
        let _ = event_tx.send(ExecutionEvent::new(run_id, final_phase, None, message));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{Endpoint, VirtualFactory, VirtualLog};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn connected(factory: VirtualFactory) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(Arc::new(factory)));
        manager.select_endpoint(Endpoint::serial("/dev/rfcomm0", "HC-05"));
        manager.connect().await.unwrap();
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_applies_to_following_steps_only() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log.clone())).await);

        let handle = assert_ok!(executor.run(vec![
            Command::forward(2),
            Command::set_speed(9),
            Command::forward(2),
        ]));
        let outcome = handle.wait().await;

        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(outcome.steps_executed, 3);
        assert_eq!(outcome.frames_sent, 3);
        assert_eq!(
            log.frames(),
            vec![b"F142\n".to_vec(), b"F255\n".to_vec(), b"S\n".to_vec()]
        );
        assert_eq!(executor.phase(), ExecutionPhase::Completed);
    }

    #[tokio::test]
    async fn test_empty_sequence_rejected() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log.clone())).await);
        let mut events = executor.subscribe();

        let err = assert_err!(executor.run(Vec::<Command>::new()));
        assert_eq!(err, SequenceError::Empty);
        assert!(log.frames().is_empty());

        let event = events.try_recv().unwrap();
        assert_eq!(event.phase, ExecutionPhase::Error);
        assert_eq!(event.message.as_deref(), Some("Nothing to run: the sequence is empty"));
    }

    #[tokio::test]
    async fn test_not_connected_rejected() {
        let log = VirtualLog::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(VirtualFactory::new(log.clone()))));
        let executor = SequenceExecutor::new(manager);

        let err = assert_err!(executor.run(vec![Command::forward(1)]));
        assert_eq!(err, SequenceError::NotConnected);
        assert!(log.events().is_empty());
        assert_eq!(executor.phase(), ExecutionPhase::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run_ends_with_stop() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log.clone())).await);

        let handle = assert_ok!(executor.run(vec![
            Command::forward(2),
            Command::turn_left(90),
            Command::backward(2),
        ]));
        tokio::time::sleep(Duration::from_millis(500)).await;
        executor.cancel();

        let outcome = handle.wait().await;
        assert_eq!(outcome.phase, ExecutionPhase::Cancelled);
        assert_eq!(outcome.steps_executed, 1);
        assert_eq!(log.frame_symbols(), vec!["F142", "S"]);
        assert_eq!(executor.phase(), ExecutionPhase::Cancelled);

        // Nothing left to cancel.
        executor.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_last_step_reports_cancelled() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log.clone())).await);
        let mut events = executor.subscribe();

        let handle = assert_ok!(executor.run(vec![Command::forward(5)]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        executor.cancel();

        let outcome = handle.wait().await;
        assert_eq!(outcome.phase, ExecutionPhase::Cancelled);
        assert_eq!(outcome.steps_executed, 1);
        assert_eq!(log.frame_symbols(), vec!["F142", "S"]);
        assert_eq!(executor.phase(), ExecutionPhase::Cancelled);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.phase, ExecutionPhase::Cancelled);
        assert_eq!(last.message.as_deref(), Some("Cancelled after 1 of 1 steps"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_rejected_while_running() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log.clone())).await);

        let handle = assert_ok!(executor.run(vec![Command::wait(3)]));
        assert_eq!(executor.phase(), ExecutionPhase::Running);
        assert_eq!(
            executor.run(vec![Command::stop()]).err(),
            Some(SequenceError::AlreadyRunning)
        );

        handle.cancel();
        assert_eq!(handle.wait().await.phase, ExecutionPhase::Cancelled);
        assert_ok!(executor.run(vec![Command::stop()])).wait().await;
        assert_eq!(log.frame_symbols(), vec!["S", "S", "S"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_frame_does_not_abort() {
        let log = VirtualLog::new();
        let executor =
            SequenceExecutor::new(connected(VirtualFactory::new(log.clone()).drop_sends([0])).await);

        let outcome = assert_ok!(executor.run(vec![Command::forward(1), Command::backward(1)]))
            .wait()
            .await;
        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(outcome.frames_dropped, 1);
        assert_eq!(log.frame_symbols(), vec!["B142", "S"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_run_skips_remaining_frames() {
        let log = VirtualLog::new();
        let manager = connected(VirtualFactory::new(log.clone())).await;
        let executor = SequenceExecutor::new(Arc::clone(&manager));

        let handle = assert_ok!(executor.run(vec![Command::forward(2), Command::forward(2)]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.disconnect().await;

        let outcome = handle.wait().await;
        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(outcome.frames_sent, 1);
        assert_eq!(outcome.frames_dropped, 2);
        assert_eq!(log.frame_symbols(), vec!["F142"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events() {
        let log = VirtualLog::new();
        let executor = SequenceExecutor::new(connected(VirtualFactory::new(log)).await);
        let mut events = executor.subscribe();

        let handle = assert_ok!(executor.run(vec![Command::wait(1), Command::stop()]));
        let run_id = handle.id();
        assert_eq!(handle.wait().await.run_id, run_id);

        let mut steps = Vec::new();
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id, Some(run_id));
            if let Some(index) = event.step_index {
                steps.push(index);
            }
            last = Some(event.phase);
        }
        assert_eq!(steps, vec![0, 1]);
        assert_eq!(last, Some(ExecutionPhase::Completed));
    }
}
