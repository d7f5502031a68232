use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::engine::{AttemptEngine, SubmissionSink};

use self::recorder::{HttpRecorder, MemoryRecorder};

pub struct AppState {
    pub config: Config,
    /// Registry of live attempts, keyed by attempt id.
    pub attempts: DashMap<String, Arc<AttemptEngine>>,
    pub recorder: Arc<dyn SubmissionSink>,
    pub recorder_mode: &'static str,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let (recorder, recorder_mode): (Arc<dyn SubmissionSink>, &'static str) =
            match config.recorder_url.clone() {
                Some(url) => {
                    tracing::info!("Submission recorder: HTTP endpoint {}", url);
                    let recorder = HttpRecorder::new(url, config.recorder_timeout())?;
                    (Arc::new(recorder), "http")
                }
                None => {
                    tracing::info!("Submission recorder: in-memory (no RECORDER_URL configured)");
                    (Arc::new(MemoryRecorder::new()), "memory")
                }
            };

        Ok(Self {
            config,
            attempts: DashMap::new(),
            recorder,
            recorder_mode,
        })
    }
}

pub mod attempt_service;
pub mod recorder;
