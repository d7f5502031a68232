use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;

use crate::engine::SubmissionSink;
use crate::models::SubmissionPayload;
use crate::utils::retry::{retry_with_policy, RetryPolicy};

/// Delivers submissions to an external recorder endpoint. Transient
/// failures are retried with backoff before the delivery is reported
/// as failed to the engine.
pub struct HttpRecorder {
    client: Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpRecorder {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build recorder HTTP client")?;
        Ok(Self {
            client,
            url,
            retry: RetryPolicy::recorder(),
        })
    }
}

#[async_trait::async_trait]
impl SubmissionSink for HttpRecorder {
    async fn submit(&self, payload: &SubmissionPayload) -> Result<()> {
        retry_with_policy(&self.retry, || async {
            let response = self
                .client
                .post(&self.url)
                .json(payload)
                .send()
                .await
                .context("Failed to reach submission recorder")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(anyhow!("Recorder returned {}: {}", status, body));
            }

            Ok(())
        })
        .await?;

        tracing::debug!(
            "Submission for attempt {} delivered to recorder",
            payload.attempt_id
        );
        Ok(())
    }
}

/// Keeps delivered submissions in memory. Used when no recorder
/// endpoint is configured, and by the test suite.
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<SubmissionPayload>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SubmissionPayload> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl SubmissionSink for MemoryRecorder {
    async fn submit(&self, payload: &SubmissionPayload) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
        tracing::debug!(
            "Submission for attempt {} stored in memory",
            payload.attempt_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScoreReport, SubmitReason};
    use chrono::Utc;
    use std::collections::HashMap;

    fn payload(attempt_id: &str) -> SubmissionPayload {
        SubmissionPayload {
            attempt_id: attempt_id.to_string(),
            assessment_id: "assessment-1".to_string(),
            student_id: "student-1".to_string(),
            reason: SubmitReason::Manual,
            answers: HashMap::new(),
            score: ScoreReport {
                correct_count: 0,
                total_count: 1,
                percent: 0,
            },
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_recorder_keeps_order() {
        let recorder = MemoryRecorder::new();
        recorder.submit(&payload("a-1")).await.unwrap();
        recorder.submit(&payload("a-2")).await.unwrap();

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt_id, "a-1");
        assert_eq!(records[1].attempt_id, "a-2");
    }

    #[tokio::test]
    async fn test_http_recorder_rejects_unreachable_endpoint() {
        // Nothing listens on this port; all retries burn out.
        let recorder = HttpRecorder::new(
            "http://127.0.0.1:9/submissions".to_string(),
            Duration::from_millis(200),
        )
        .unwrap();
        let result = recorder.submit(&payload("a-1")).await;
        assert!(result.is_err());
    }
}
