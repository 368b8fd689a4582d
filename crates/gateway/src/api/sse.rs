//! SSE plumbing: one `data:` frame per event, plus a periodic heartbeat
//! event so clients can detect dead connections. Streams end cleanly on
//! process shutdown or when the subscription closes.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures_util::stream::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::runtime::Subscription;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

fn heartbeat_event() -> Event {
    Event::default().data(
        serde_json::json!({
            "type": "heartbeat",
            "timestamp": Utc::now(),
        })
        .to_string(),
    )
}

/// Stream one subscription's events.
pub fn event_stream<T: Serialize + Send + 'static>(
    mut subscription: Subscription<T>,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    yield Ok(heartbeat_event());
                }
                event = subscription.recv() => match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(json));
                        }
                    }
                    None => break,
                }
            }
        }
    };
    Sse::new(stream)
}

/// Stream two subscriptions merged into one (the unified activity feed).
pub fn merged_event_stream<A, B>(
    mut left: Subscription<A>,
    mut right: Subscription<B>,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    A: Serialize + Send + 'static,
    B: Serialize + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut left_open = true;
        let mut right_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    yield Ok(heartbeat_event());
                }
                event = left.recv(), if left_open => match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(json));
                        }
                    }
                    None => left_open = false,
                },
                event = right.recv(), if right_open => match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(json));
                        }
                    }
                    None => right_open = false,
                },
            }
            if !left_open && !right_open {
                break;
            }
        }
    };
    Sse::new(stream)
}
