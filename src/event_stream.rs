//! `EventStream` (spec.md §4.G) — renders a `SamplingLoop`'s `StreamEvent`s
//! as a `text/event-stream` SSE body.
//!
//! Grounded on `hi-youichi-loom/serve/src/run/stream.rs`'s decoupled
//! producer/consumer shape: the producer (`SamplingLoop::run`, driven by
//! `TaskCoordinator`/`BatchExecutor`) writes into an `mpsc::Sender`, and
//! this module owns the paired `Receiver`, turning it into the `Stream`
//! an axum SSE handler returns as its response body. Each event is one
//! JSON object per spec.md §4.G ("preceded by `data: ` and followed by a
//! blank line") — exactly axum's `Event::default().json_data(..)` framing.

use crate::sampling_loop::StreamEvent;
use axum::response::sse::Event;
use futures_util::stream::Stream;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

/// Turn the receiving half of a `SamplingLoop`'s event channel into the
/// `Stream` body of an axum SSE response. One `StreamEvent` in, one SSE
/// `data:` frame out — no buffering, no reordering.
pub fn sse_stream(rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx).map(|event| {
        let event = Event::default().json_data(&event).unwrap_or_else(|e| {
            warn!(error = %e, "failed to serialize stream event, sending empty keep-alive");
            Event::default().comment("serialization error")
        });
        Ok(event)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling_loop::StreamEvent;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn stream_emits_one_frame_per_event() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamEvent::Done { final_response: Some("ok".into()), timestamp: Utc::now() }).await.unwrap();
        drop(tx);

        let mut stream = Box::pin(sse_stream(rx));
        let first = stream.next().await;
        assert!(first.is_some());
        let second = stream.next().await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn metadata_event_round_trips_through_sse_framing() {
        let (tx, rx) = mpsc::channel(4);
        let event = StreamEvent::Metadata {
            session_id: Uuid::new_v4(),
            browser_session_id: "rs-1".into(),
            stream_url: "https://fake".into(),
            task_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        tx.send(event).await.unwrap();
        drop(tx);

        let mut stream = Box::pin(sse_stream(rx));
        let frame = stream.next().await.unwrap().unwrap();
        let rendered = frame.to_string();
        assert!(rendered.contains("data:"));
        assert!(rendered.contains("browser_session_id"));
    }
}
