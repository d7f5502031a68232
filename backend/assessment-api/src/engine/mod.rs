use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

use crate::metrics::{track_submission_delivery, ATTEMPTS_ACTIVE, ATTEMPTS_TOTAL};
use crate::models::{
    AssessmentDefinition, AssessmentInfo, AttemptPhase, AttemptResult, AttemptSnapshot,
    SubmissionPayload, SubmitReason,
};

pub mod attempt;
pub mod scorer;

pub use attempt::{AttemptState, EngineError, SubmissionTicket, TickOutcome};

/// Destination for completed attempts. The engine makes at most one
/// successful delivery per attempt; implementations may retry
/// internally but the call is atomic from the engine's point of view.
#[async_trait::async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submit(&self, payload: &SubmissionPayload) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("submission could not be delivered: {0}")]
    Delivery(#[source] anyhow::Error),
}

struct TimerHandle {
    stop: watch::Sender<bool>,
}

/// One live attempt: the state machine, the countdown task driving it,
/// and the submission pipeline around both.
///
/// All transitions go through the state mutex, which is only ever held
/// for synchronous work. Recorder calls happen outside the lock, with
/// the phase already moved to `Submitting` so no competing caller can
/// trigger a second delivery.
pub struct AttemptEngine {
    attempt_id: String,
    student_id: String,
    state: Mutex<AttemptState>,
    sink: Arc<dyn SubmissionSink>,
    tick_interval: Duration,
    timer: Mutex<Option<TimerHandle>>,
    // Handed to countdown tasks so they never keep the engine alive.
    weak_self: Weak<AttemptEngine>,
}

impl AttemptEngine {
    pub fn new(
        attempt_id: String,
        student_id: String,
        definition: AssessmentDefinition,
        sink: Arc<dyn SubmissionSink>,
        tick_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| AttemptEngine {
            attempt_id,
            student_id,
            state: Mutex::new(AttemptState::new(Arc::new(definition))),
            sink,
            tick_interval,
            timer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    // Transitions are plain assignments, so a poisoned lock cannot hold
    // torn state and is safe to keep using.
    fn state(&self) -> MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<(), EngineError> {
        let timed = {
            let mut state = self.state();
            state.start()?;
            state.remaining_seconds().is_some()
        };
        if timed {
            self.spawn_timer();
        }
        tracing::info!(
            "Attempt started: {} for student: {}",
            self.attempt_id,
            self.student_id
        );
        Ok(())
    }

    pub fn record_answer(&self, question_id: &str, value: String) -> Result<(), EngineError> {
        self.state().record_answer(question_id, value)
    }

    pub fn set_position(&self, index: usize) -> Result<(), EngineError> {
        self.state().set_position(index)
    }

    /// Student-initiated submission. Winning or losing the gate is
    /// decided atomically inside the state lock; everything slow runs
    /// afterwards against the ticket.
    pub async fn submit(&self) -> Result<AttemptResult, SubmitError> {
        let ticket = self.state().begin_submission(SubmitReason::Manual)?;
        self.stop_timer();
        self.finish_submission(ticket).await
    }

    /// Read-only view of the attempt, taken under the state lock so it
    /// is always a consistent cut.
    pub fn snapshot(&self) -> AttemptSnapshot {
        let state = self.state();
        AttemptSnapshot {
            attempt_id: self.attempt_id.clone(),
            student_id: self.student_id.clone(),
            assessment: AssessmentInfo::from(state.definition().as_ref()),
            phase: state.phase(),
            current_question_index: state.current_question_index(),
            answers: state.answers().clone(),
            remaining_seconds: state.remaining_seconds(),
            submission_in_flight: state.phase() == AttemptPhase::Submitting,
            started_at: state.started_at(),
            result: state.result().cloned(),
        }
    }

    /// Stops the countdown without touching attempt state. Called when
    /// the attempt is abandoned and unregistered.
    pub fn shutdown(&self) {
        self.stop_timer();
    }

    /// Drives a won ticket to the end: deliver to the recorder, then
    /// settle the state machine with the outcome.
    async fn finish_submission(
        &self,
        ticket: SubmissionTicket,
    ) -> Result<AttemptResult, SubmitError> {
        let assessment_id = self.state().definition().id.clone();
        let payload = SubmissionPayload {
            attempt_id: self.attempt_id.clone(),
            assessment_id,
            student_id: self.student_id.clone(),
            reason: ticket.reason,
            answers: ticket.answers.clone(),
            score: ticket.score.clone(),
            submitted_at: Utc::now(),
        };

        let delivery =
            track_submission_delivery(ticket.reason.as_str(), self.sink.submit(&payload)).await;

        match delivery {
            Ok(()) => {
                let result = self.state().complete_submission(&ticket)?;
                ATTEMPTS_TOTAL.with_label_values(&["completed"]).inc();
                ATTEMPTS_ACTIVE.dec();
                tracing::info!(
                    "Attempt completed: {} reason: {} score: {}%",
                    self.attempt_id,
                    ticket.reason.as_str(),
                    ticket.score.percent
                );
                Ok(result)
            }
            Err(err) => {
                let resume_countdown = {
                    let mut state = self.state();
                    state.fail_submission()?;
                    state.remaining_seconds().is_some_and(|left| left > 0)
                };
                tracing::error!(
                    "Submission delivery failed for attempt {}: {:#}",
                    self.attempt_id,
                    err
                );
                if resume_countdown {
                    self.spawn_timer();
                }
                Err(SubmitError::Delivery(err))
            }
        }
    }

    /// One timer wakeup. Returns false when the countdown task should
    /// exit its loop.
    async fn on_tick(&self) -> bool {
        // Bound so the state guard drops here; the expired arm below
        // re-enters the lock while settling the submission.
        let outcome = self.state().clock_tick();
        match outcome {
            TickOutcome::Running(remaining) => {
                tracing::trace!("Attempt {} countdown: {}s left", self.attempt_id, remaining);
                true
            }
            TickOutcome::Expired(ticket) => {
                tracing::info!(
                    "Attempt {} reached its time limit, submitting",
                    self.attempt_id
                );
                // Failures are logged inside and leave the attempt open
                // for a manual retry.
                let _ = self.finish_submission(ticket).await;
                false
            }
            TickOutcome::Idle => false,
        }
    }

    fn spawn_timer(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let weak = self.weak_self.clone();
        let interval = self.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    // Fires on an explicit stop and when the engine is dropped.
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = weak.upgrade() else { break };
                        if !engine.on_tick().await {
                            break;
                        }
                    }
                }
            }
        });

        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(TimerHandle { stop: stop_tx }) {
            let _ = previous.stop.send(true);
        }
    }

    fn stop_timer(&self) {
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;
    use crate::models::{Question, QuestionKind};

    struct RecordingSink {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Duration,
        payloads: Mutex<Vec<SubmissionPayload>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Self::with_failures(0)
        }

        fn with_failures(failures: usize) -> Arc<Self> {
            Arc::new(RecordingSink {
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
                delay: Duration::ZERO,
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(RecordingSink {
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                delay,
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn payloads(&self) -> Vec<SubmissionPayload> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SubmissionSink for RecordingSink {
        async fn submit(&self, payload: &SubmissionPayload) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                sleep(self.delay).await;
            }
            let failures = self.failures_left.load(Ordering::SeqCst);
            if failures > 0 {
                self.failures_left.store(failures - 1, Ordering::SeqCst);
                anyhow::bail!("recorder offline");
            }
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn definition(time_limit_seconds: u32) -> AssessmentDefinition {
        AssessmentDefinition {
            id: "assessment-1".to_string(),
            title: "Engine fixture".to_string(),
            time_limit_seconds,
            passing_score_percent: 50,
            questions: vec![
                Question {
                    id: "q1".to_string(),
                    prompt: "2 + 2?".to_string(),
                    kind: QuestionKind::FreeText,
                    correct_answer: "4".to_string(),
                },
                Question {
                    id: "q2".to_string(),
                    prompt: "3 * 3?".to_string(),
                    kind: QuestionKind::FreeText,
                    correct_answer: "9".to_string(),
                },
            ],
        }
    }

    fn engine(
        time_limit_seconds: u32,
        sink: Arc<RecordingSink>,
        tick_interval: Duration,
    ) -> Arc<AttemptEngine> {
        AttemptEngine::new(
            "attempt-1".to_string(),
            "student-1".to_string(),
            definition(time_limit_seconds),
            sink,
            tick_interval,
        )
    }

    #[tokio::test]
    async fn test_concurrent_submits_deliver_once() {
        let sink = RecordingSink::with_delay(Duration::from_millis(20));
        let engine = engine(0, sink.clone(), Duration::from_millis(1000));
        engine.start().unwrap();
        engine.record_answer("q1", "4".to_string()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.submit().await }));
        }

        let mut delivered = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => {
                    delivered += 1;
                    assert_eq!(result.reason, SubmitReason::Manual);
                }
                Err(SubmitError::Engine(EngineError::IllegalTransition { .. })) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(delivered, 1);
        assert_eq!(rejected, 7);
        assert_eq!(sink.calls(), 1);
        assert_eq!(engine.snapshot().phase, AttemptPhase::Completed);
    }

    #[tokio::test]
    async fn test_timeout_submits_exactly_once() {
        let sink = RecordingSink::new();
        let engine = engine(2, sink.clone(), Duration::from_millis(10));
        engine.start().unwrap();
        engine.record_answer("q1", "4".to_string()).unwrap();

        sleep(Duration::from_millis(120)).await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.phase, AttemptPhase::Completed);
        assert_eq!(snapshot.remaining_seconds, Some(0));
        let result = snapshot.result.expect("attempt should carry a result");
        assert_eq!(result.reason, SubmitReason::Timeout);
        assert_eq!(result.score.correct_count, 1);

        assert_eq!(sink.calls(), 1);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].reason, SubmitReason::Timeout);
        assert_eq!(payloads[0].answers.get("q1").unwrap(), "4");
    }

    #[tokio::test]
    async fn test_expiry_racing_manual_submit_delivers_once() {
        let sink = RecordingSink::with_delay(Duration::from_millis(30));
        let engine = engine(1, sink.clone(), Duration::from_millis(5));
        engine.start().unwrap();

        sleep(Duration::from_millis(7)).await;
        // Either side may win the gate; the loser must be turned away.
        let manual = engine.submit().await;
        if let Err(err) = &manual {
            assert!(matches!(err, SubmitError::Engine(EngineError::IllegalTransition { .. })));
        }

        sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.calls(), 1);
        assert_eq!(engine.snapshot().phase, AttemptPhase::Completed);
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_attempt_retryable() {
        let sink = RecordingSink::with_failures(1);
        let engine = engine(0, sink.clone(), Duration::from_millis(1000));
        engine.start().unwrap();
        engine.record_answer("q1", "4".to_string()).unwrap();
        engine.record_answer("q2", "9".to_string()).unwrap();

        let first = engine.submit().await;
        assert!(matches!(first, Err(SubmitError::Delivery(_))));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.phase, AttemptPhase::InProgress);
        assert!(!snapshot.submission_in_flight);
        assert_eq!(snapshot.answers.len(), 2);

        let second = engine.submit().await.unwrap();
        assert!(second.passed);
        assert_eq!(sink.calls(), 2);
        assert_eq!(engine.snapshot().phase, AttemptPhase::Completed);
    }

    #[tokio::test]
    async fn test_countdown_resumes_after_failed_manual_submit() {
        let sink = RecordingSink::with_failures(1);
        let engine = engine(60, sink.clone(), Duration::from_millis(10));
        engine.start().unwrap();

        sleep(Duration::from_millis(45)).await;
        let before = engine.snapshot().remaining_seconds.unwrap();
        assert!(before < 60);

        assert!(engine.submit().await.is_err());
        let frozen = engine.snapshot().remaining_seconds.unwrap();

        sleep(Duration::from_millis(60)).await;
        let after = engine.snapshot().remaining_seconds.unwrap();
        assert!(
            after < frozen,
            "countdown should resume after a failed submission ({after} !< {frozen})"
        );
        assert_eq!(engine.snapshot().phase, AttemptPhase::InProgress);
    }

    #[tokio::test]
    async fn test_failed_timeout_submission_waits_for_manual_retry() {
        let sink = RecordingSink::with_failures(1);
        let engine = engine(1, sink.clone(), Duration::from_millis(10));
        engine.start().unwrap();
        engine.record_answer("q1", "4".to_string()).unwrap();

        sleep(Duration::from_millis(80)).await;
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.phase, AttemptPhase::InProgress);
        assert_eq!(snapshot.remaining_seconds, Some(0));
        assert_eq!(sink.calls(), 1);

        // The countdown stays parked at zero instead of re-firing.
        sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.calls(), 1);

        let result = engine.submit().await.unwrap();
        assert_eq!(result.reason, SubmitReason::Manual);
        assert_eq!(engine.snapshot().phase, AttemptPhase::Completed);
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_freezes_countdown() {
        let sink = RecordingSink::new();
        let engine = engine(60, sink.clone(), Duration::from_millis(10));
        engine.start().unwrap();

        sleep(Duration::from_millis(45)).await;
        engine.shutdown();
        let frozen = engine.snapshot().remaining_seconds.unwrap();

        sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.snapshot().remaining_seconds, Some(frozen));
        assert_eq!(engine.snapshot().phase, AttemptPhase::InProgress);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_in_flight_submission() {
        let sink = RecordingSink::with_delay(Duration::from_millis(50));
        let engine = engine(0, sink.clone(), Duration::from_millis(1000));
        engine.start().unwrap();

        let submitting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit().await })
        };
        sleep(Duration::from_millis(10)).await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.phase, AttemptPhase::Submitting);
        assert!(snapshot.submission_in_flight);

        submitting.await.unwrap().unwrap();
        assert_eq!(engine.snapshot().phase, AttemptPhase::Completed);
    }
}
