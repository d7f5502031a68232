use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use chrono::Utc;
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;

use crate::{
    engine::AttemptEngine,
    handlers::attempts::AttemptApiError,
    metrics::SSE_CONNECTIONS_ACTIVE,
    models::{
        timer::{TimeExpired, TimerEvent, TimerTick},
        AttemptPhase,
    },
    services::{attempt_service::AttemptService, AppState},
};

/// SSE endpoint for countdown events
/// GET /api/v1/attempts/{id}/stream
pub async fn attempt_stream(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, AttemptApiError> {
    tracing::info!("Client connected to SSE stream: attempt={}", attempt_id);

    let max_events = state.config.sse_max_stream_seconds;
    let tick_interval = state.config.tick_interval();

    let service = AttemptService::new(state);
    let engine = service.engine(&attempt_id)?;

    let snapshot = engine.snapshot();
    let total_seconds = snapshot.assessment.time_limit_seconds;
    if total_seconds == 0 {
        return Err(AttemptApiError::BadRequest(
            "Attempt has no time limit to stream".to_string(),
        ));
    }
    // Before start there is no running clock to report; connecting is a
    // phase conflict, just like submitting would be.
    if snapshot.phase == AttemptPhase::NotStarted {
        return Err(AttemptApiError::Conflict(
            "Attempt has not been started; there is no countdown to stream".to_string(),
        ));
    }

    tracing::info!(
        "Starting SSE stream: attempt={}, total={}s, tick_interval={:?}",
        attempt_id,
        total_seconds,
        tick_interval
    );
    let stream =
        countdown_stream(Arc::downgrade(&engine), total_seconds, tick_interval, max_events);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Decrements the connection gauge when the stream ends, however it ends.
struct StreamGuard;

impl StreamGuard {
    fn register() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        StreamGuard
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

/// Create a stream of countdown events mirroring the attempt's own clock.
///
/// Each iteration re-reads the attempt, so the stream reports whatever the
/// countdown decided rather than counting down on its own. Holding only a
/// `Weak` reference means an abandoned attempt ends the stream instead of
/// the stream keeping the attempt alive.
fn countdown_stream(
    engine: Weak<AttemptEngine>,
    total_seconds: u32,
    tick_interval: Duration,
    max_events: u32,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let guard = StreamGuard::register();

    stream::unfold(
        (engine, 0u32, false, guard),
        move |(engine, emitted, final_sent, guard)| async move {
            if final_sent || emitted >= max_events {
                return None;
            }

            // First event goes out immediately so clients can render the
            // clock on connect; the rest follow the tick cadence.
            if emitted > 0 {
                sleep(tick_interval).await;
            }

            let snapshot = engine.upgrade()?.snapshot();

            if snapshot.remaining_seconds == Some(0) {
                // Send final time-expired event once
                let expired_event = TimerEvent::TimeExpired(TimeExpired {
                    attempt_id: snapshot.attempt_id.clone(),
                    timestamp: Utc::now(),
                    message: "Time limit exceeded".to_string(),
                });

                let event = Event::default()
                    .event(expired_event.event_name())
                    .data(expired_event.to_sse_data());

                tracing::info!("Countdown reached zero: attempt={}", snapshot.attempt_id);
                return Some((Ok(event), (engine, emitted + 1, true, guard)));
            }

            // A manual submission freezes the clock above zero; nothing more
            // will ever happen on this stream, so close it.
            if matches!(
                snapshot.phase,
                AttemptPhase::Submitting | AttemptPhase::Completed
            ) {
                return None;
            }

            // Started and timed at this point, so the clock is always set.
            let remaining = snapshot.remaining_seconds.unwrap_or(total_seconds);
            let tick_event = TimerEvent::TimerTick(TimerTick {
                attempt_id: snapshot.attempt_id.clone(),
                phase: snapshot.phase,
                remaining_seconds: remaining,
                elapsed_seconds: total_seconds.saturating_sub(remaining),
                total_seconds,
                timestamp: Utc::now(),
            });

            let event = Event::default()
                .event(tick_event.event_name())
                .data(tick_event.to_sse_data());

            Some((Ok(event), (engine, emitted + 1, false, guard)))
        },
    )
}
