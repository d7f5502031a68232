use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::engine::{AttemptEngine, EngineError, SubmitError};
use crate::metrics::{ANSWERS_RECORDED_TOTAL, ATTEMPTS_ACTIVE, ATTEMPTS_TOTAL};
use crate::models::{
    AssessmentDefinition, AttemptPhase, AttemptSnapshot, CreateAttemptRequest,
    CreateAttemptResponse, QuestionKind, RecordAnswerRequest, SubmitAttemptResponse,
};

use super::AppState;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("attempt '{0}' not found")]
    AttemptNotFound(String),
    #[error("invalid assessment definition: {0}")]
    InvalidDefinition(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("submission could not be delivered: {0}")]
    Delivery(#[source] anyhow::Error),
}

impl From<SubmitError> for ServiceError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Engine(e) => ServiceError::Engine(e),
            SubmitError::Delivery(e) => ServiceError::Delivery(e),
        }
    }
}

pub struct AttemptService {
    state: Arc<AppState>,
}

impl AttemptService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn create_attempt(
        &self,
        req: CreateAttemptRequest,
    ) -> Result<CreateAttemptResponse, ServiceError> {
        req.validate()
            .map_err(|e| ServiceError::InvalidDefinition(e.to_string()))?;
        Self::check_definition(&req.definition)?;

        // Degenerate but legal definitions are accepted and flagged.
        for warning in Self::definition_warnings(&req.definition) {
            tracing::warn!("Assessment {}: {}", req.definition.id, warning);
        }

        let attempt_id = Uuid::new_v4().to_string();
        let engine = AttemptEngine::new(
            attempt_id.clone(),
            req.student_id.clone(),
            req.definition,
            self.state.recorder.clone(),
            self.state.config.tick_interval(),
        );
        let snapshot = engine.snapshot();
        self.state.attempts.insert(attempt_id.clone(), engine);

        ATTEMPTS_TOTAL.with_label_values(&["created"]).inc();
        ATTEMPTS_ACTIVE.inc();

        tracing::info!(
            "Attempt created: {} for student: {}",
            attempt_id,
            req.student_id
        );

        Ok(CreateAttemptResponse {
            attempt_id,
            phase: snapshot.phase,
            assessment: snapshot.assessment,
        })
    }

    pub fn get_snapshot(&self, attempt_id: &str) -> Result<AttemptSnapshot, ServiceError> {
        Ok(self.engine(attempt_id)?.snapshot())
    }

    pub fn start_attempt(&self, attempt_id: &str) -> Result<AttemptSnapshot, ServiceError> {
        let engine = self.engine(attempt_id)?;
        engine.start()?;
        Ok(engine.snapshot())
    }

    pub fn record_answer(
        &self,
        attempt_id: &str,
        req: &RecordAnswerRequest,
    ) -> Result<AttemptSnapshot, ServiceError> {
        let engine = self.engine(attempt_id)?;
        engine.record_answer(&req.question_id, req.value.clone())?;
        ANSWERS_RECORDED_TOTAL.inc();
        Ok(engine.snapshot())
    }

    pub fn set_position(
        &self,
        attempt_id: &str,
        index: usize,
    ) -> Result<AttemptSnapshot, ServiceError> {
        let engine = self.engine(attempt_id)?;
        engine.set_position(index)?;
        Ok(engine.snapshot())
    }

    pub async fn submit_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<SubmitAttemptResponse, ServiceError> {
        let engine = self.engine(attempt_id)?;
        let result = engine.submit().await?;
        Ok(SubmitAttemptResponse {
            attempt_id: attempt_id.to_string(),
            phase: AttemptPhase::Completed,
            result,
        })
    }

    /// Walking away is not submitting: nothing is scored or delivered,
    /// the attempt is simply unregistered and its countdown stopped.
    pub fn abandon_attempt(&self, attempt_id: &str) -> Result<(), ServiceError> {
        let (_, engine) = self
            .state
            .attempts
            .remove(attempt_id)
            .ok_or_else(|| ServiceError::AttemptNotFound(attempt_id.to_string()))?;

        let snapshot = engine.snapshot();
        engine.shutdown();
        if snapshot.phase != AttemptPhase::Completed {
            ATTEMPTS_TOTAL.with_label_values(&["abandoned"]).inc();
            ATTEMPTS_ACTIVE.dec();
        }

        tracing::info!("Attempt abandoned: {}", attempt_id);
        Ok(())
    }

    pub fn engine(&self, attempt_id: &str) -> Result<Arc<AttemptEngine>, ServiceError> {
        self.state
            .attempts
            .get(attempt_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::AttemptNotFound(attempt_id.to_string()))
    }

    fn check_definition(definition: &AssessmentDefinition) -> Result<(), ServiceError> {
        let mut seen = HashSet::new();
        for question in &definition.questions {
            if question.id.trim().is_empty() {
                return Err(ServiceError::InvalidDefinition(
                    "question ids must not be empty".to_string(),
                ));
            }
            if !seen.insert(question.id.as_str()) {
                return Err(ServiceError::InvalidDefinition(format!(
                    "duplicate question id '{}'",
                    question.id
                )));
            }
            if let QuestionKind::SingleChoice { choices } = &question.kind {
                if choices.is_empty() {
                    return Err(ServiceError::InvalidDefinition(format!(
                        "question '{}' has no choices",
                        question.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn definition_warnings(definition: &AssessmentDefinition) -> Vec<String> {
        let mut warnings = Vec::new();
        for question in &definition.questions {
            if let QuestionKind::SingleChoice { choices } = &question.kind {
                if !choices.contains(&question.correct_answer) {
                    warnings.push(format!(
                        "question '{}' lists a correct answer that is not among its choices and can never be answered correctly",
                        question.id
                    ));
                }
            }
            if question.correct_answer.is_empty() {
                warnings.push(format!(
                    "question '{}' has an empty correct answer",
                    question.id
                ));
            }
        }
        warnings
    }
}
