use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AssessmentDefinition, AttemptPhase, AttemptResult, ScoreReport, SubmitReason};

use super::scorer;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{op} is not allowed while the attempt is {phase}")]
    IllegalTransition {
        op: &'static str,
        phase: AttemptPhase,
    },
    #[error("question '{0}' is not part of this assessment")]
    UnknownQuestion(String),
    #[error("question index {index} is out of range for {len} questions")]
    PositionOutOfRange { index: usize, len: usize },
}

/// Outcome of one countdown decrement.
#[derive(Debug)]
pub enum TickOutcome {
    /// Countdown advanced; seconds left after the decrement.
    Running(u32),
    /// The decrement crossed zero and claimed the timeout submission.
    Expired(SubmissionTicket),
    /// Nothing to do: untimed, already at zero, or not in progress.
    Idle,
}

/// Proof that the submission transition was won. At most one ticket is
/// live per attempt; whoever holds it drives the recorder call and then
/// settles the attempt with [`AttemptState::complete_submission`] or
/// [`AttemptState::fail_submission`].
#[derive(Debug)]
pub struct SubmissionTicket {
    pub reason: SubmitReason,
    pub answers: HashMap<String, String>,
    pub score: ScoreReport,
}

/// The attempt state machine. Every transition is synchronous and
/// checked against the current phase; the owning engine serializes
/// callers behind a mutex so each transition is observed atomically.
#[derive(Debug)]
pub struct AttemptState {
    definition: Arc<AssessmentDefinition>,
    phase: AttemptPhase,
    current_question_index: usize,
    answers: HashMap<String, String>,
    remaining_seconds: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    result: Option<AttemptResult>,
}

impl AttemptState {
    pub fn new(definition: Arc<AssessmentDefinition>) -> Self {
        AttemptState {
            definition,
            phase: AttemptPhase::NotStarted,
            current_question_index: 0,
            answers: HashMap::new(),
            remaining_seconds: None,
            started_at: None,
            result: None,
        }
    }

    pub fn definition(&self) -> &Arc<AssessmentDefinition> {
        &self.definition
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub fn current_question_index(&self) -> usize {
        self.current_question_index
    }

    pub fn answers(&self) -> &HashMap<String, String> {
        &self.answers
    }

    /// None for untimed attempts and before the attempt starts.
    pub fn remaining_seconds(&self) -> Option<u32> {
        self.remaining_seconds
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn result(&self) -> Option<&AttemptResult> {
        self.result.as_ref()
    }

    fn require(&self, expected: AttemptPhase, op: &'static str) -> Result<(), EngineError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                op,
                phase: self.phase,
            })
        }
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        self.require(AttemptPhase::NotStarted, "start")?;
        self.phase = AttemptPhase::InProgress;
        self.current_question_index = 0;
        self.answers.clear();
        self.remaining_seconds =
            (self.definition.time_limit_seconds > 0).then_some(self.definition.time_limit_seconds);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Stores the latest answer for a question, replacing any earlier one.
    pub fn record_answer(&mut self, question_id: &str, value: String) -> Result<(), EngineError> {
        self.require(AttemptPhase::InProgress, "record_answer")?;
        if !self.definition.questions.iter().any(|q| q.id == question_id) {
            return Err(EngineError::UnknownQuestion(question_id.to_string()));
        }
        self.answers.insert(question_id.to_string(), value);
        Ok(())
    }

    pub fn set_position(&mut self, index: usize) -> Result<(), EngineError> {
        self.require(AttemptPhase::InProgress, "set_position")?;
        let len = self.definition.questions.len();
        if index >= len {
            return Err(EngineError::PositionOutOfRange { index, len });
        }
        self.current_question_index = index;
        Ok(())
    }

    /// One countdown decrement. Outside `InProgress`, at zero, or for
    /// untimed attempts this is a no-op, so a late timer wakeup can
    /// never disturb a submission that is already underway.
    pub fn clock_tick(&mut self) -> TickOutcome {
        if self.phase != AttemptPhase::InProgress {
            return TickOutcome::Idle;
        }
        match self.remaining_seconds {
            None | Some(0) => TickOutcome::Idle,
            Some(1) => {
                self.remaining_seconds = Some(0);
                match self.begin_submission(SubmitReason::Timeout) {
                    Ok(ticket) => TickOutcome::Expired(ticket),
                    // Unreachable: the phase was checked above.
                    Err(_) => TickOutcome::Idle,
                }
            }
            Some(remaining) => {
                let next = remaining - 1;
                self.remaining_seconds = Some(next);
                TickOutcome::Running(next)
            }
        }
    }

    /// Atomically wins (or loses) the right to submit. The score is
    /// computed here, in the same critical section that freezes the
    /// answers, so the recorder sees exactly what was scored.
    pub fn begin_submission(
        &mut self,
        reason: SubmitReason,
    ) -> Result<SubmissionTicket, EngineError> {
        self.require(AttemptPhase::InProgress, "submit")?;
        self.phase = AttemptPhase::Submitting;
        Ok(SubmissionTicket {
            reason,
            answers: self.answers.clone(),
            score: scorer::score(&self.definition, &self.answers),
        })
    }

    /// Settles a delivered submission. Terminal: the attempt can never
    /// leave `Completed` again.
    pub fn complete_submission(
        &mut self,
        ticket: &SubmissionTicket,
    ) -> Result<AttemptResult, EngineError> {
        self.require(AttemptPhase::Submitting, "complete_submission")?;
        let result = AttemptResult {
            passed: ticket.score.percent >= self.definition.passing_score_percent,
            score: ticket.score.clone(),
            reason: ticket.reason,
            completed_at: Utc::now(),
        };
        self.phase = AttemptPhase::Completed;
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Settles a failed delivery: back to `InProgress` with answers and
    /// the frozen countdown untouched, so the student can retry.
    pub fn fail_submission(&mut self) -> Result<(), EngineError> {
        self.require(AttemptPhase::Submitting, "fail_submission")?;
        self.phase = AttemptPhase::InProgress;
        Ok(())
    }
}
