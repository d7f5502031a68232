use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub mod timer;

/// Immutable description of one assessment, provided in full when an
/// attempt is created. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssessmentDefinition {
    pub id: String,
    #[validate(length(
        min = 1,
        max = 200,
        message = "Title must be between 1 and 200 characters"
    ))]
    pub title: String,
    /// 0 means the assessment is untimed.
    #[serde(default)]
    pub time_limit_seconds: u32,
    #[serde(default)]
    #[validate(range(max = 100, message = "Passing score must be between 0 and 100"))]
    pub passing_score_percent: u8,
    #[validate(length(min = 1, message = "Assessment must contain at least one question"))]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
    /// Kept server-side only; question views sent to clients omit it.
    pub correct_answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    SingleChoice { choices: Vec<String> },
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    NotStarted,
    InProgress,
    Submitting,
    Completed,
}

impl AttemptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptPhase::NotStarted => "not_started",
            AttemptPhase::InProgress => "in_progress",
            AttemptPhase::Submitting => "submitting",
            AttemptPhase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitReason {
    Manual,
    Timeout,
}

impl SubmitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitReason::Manual => "manual",
            SubmitReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub correct_count: u32,
    pub total_count: u32,
    /// Integer percentage, rounded half up.
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub score: ScoreReport,
    pub passed: bool,
    pub reason: SubmitReason,
    pub completed_at: DateTime<Utc>,
}

/// What gets delivered to the submission recorder once per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub attempt_id: String,
    pub assessment_id: String,
    pub student_id: String,
    pub reason: SubmitReason,
    pub answers: HashMap<String, String>,
    pub score: ScoreReport,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAttemptRequest {
    #[validate(length(min = 1, message = "student_id must not be empty"))]
    pub student_id: String,
    #[validate(nested)]
    pub definition: AssessmentDefinition,
}

#[derive(Debug, Serialize)]
pub struct CreateAttemptResponse {
    pub attempt_id: String,
    pub phase: AttemptPhase,
    pub assessment: AssessmentInfo,
}

/// Client-facing view of a definition. Correct answers stay behind.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentInfo {
    pub id: String,
    pub title: String,
    pub time_limit_seconds: u32,
    pub passing_score_percent: u8,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub id: String,
    pub prompt: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl From<&Question> for QuestionView {
    fn from(q: &Question) -> Self {
        QuestionView {
            id: q.id.clone(),
            prompt: q.prompt.clone(),
            kind: q.kind.clone(),
        }
    }
}

impl From<&AssessmentDefinition> for AssessmentInfo {
    fn from(def: &AssessmentDefinition) -> Self {
        AssessmentInfo {
            id: def.id.clone(),
            title: def.title.clone(),
            time_limit_seconds: def.time_limit_seconds,
            passing_score_percent: def.passing_score_percent,
            questions: def.questions.iter().map(QuestionView::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordAnswerRequest {
    #[validate(length(min = 1, message = "question_id must not be empty"))]
    pub question_id: String,
    /// Empty strings are accepted; an empty answer still counts as answered.
    pub value: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetPositionRequest {
    pub index: usize,
}

#[derive(Debug, Serialize)]
pub struct SubmitAttemptResponse {
    pub attempt_id: String,
    pub phase: AttemptPhase,
    pub result: AttemptResult,
}

/// Full read-model of one attempt, safe to hand to the owning student.
#[derive(Debug, Serialize)]
pub struct AttemptSnapshot {
    pub attempt_id: String,
    pub student_id: String,
    pub assessment: AssessmentInfo,
    pub phase: AttemptPhase,
    pub current_question_index: usize,
    pub answers: HashMap<String, String>,
    /// None for untimed assessments.
    pub remaining_seconds: Option<u32>,
    pub submission_in_flight: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub result: Option<AttemptResult>,
}
