//! SSE streaming endpoint.
//!
//! GET /v1/sessions/:id/events?cursor=N
//!
//! Replays durable events with seq > cursor, then stays attached to the
//! live fan-out. Delivery is at-least-once with strict per-session
//! ordering: the stream deduplicates by seq, and a gap in the live feed
//! (broker hiccup, lagged broadcast) is refilled from the durable log
//! before anything newer is forwarded.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Path, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::sessions::load_live_session;
use crate::common::SessionId;
use crate::domains::sessions::session_topic;
use crate::domains::sessions::store::SessionStore;
use crate::server::app::AppState;

const REPLAY_BATCH: i64 = 256;

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Highest sequence number the client has already seen.
    cursor: Option<i64>,
}

struct StreamState {
    store: Arc<dyn SessionStore>,
    session_id: SessionId,
    live: BoxStream<'static, Value>,
    backlog: VecDeque<Value>,
    last_seq: i64,
}

fn seq_of(value: &Value) -> i64 {
    value.get("seq").and_then(Value::as_i64).unwrap_or(0)
}

/// GET /v1/sessions/:id/events
pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<
    Sse<impl futures::Stream<Item = Result<Event, Infallible>>>,
    (axum::http::StatusCode, axum::Json<Value>),
> {
    let session = load_live_session(&state, &id).await?;
    let cursor = query.cursor.unwrap_or(0).max(0);

    // Attach to the live feed BEFORE draining the log, so nothing falls
    // between replay and subscription.
    let live = state
        .deps
        .fanout
        .subscribe(&session_topic(session.id))
        .await
        .unwrap_or_else(|_| stream::empty().boxed());

    let mut stream_state = StreamState {
        store: state.deps.store.clone(),
        session_id: session.id,
        live,
        backlog: VecDeque::new(),
        last_seq: cursor,
    };
    fill_backlog(&mut stream_state).await;

    let events = stream::unfold(stream_state, |mut st| async move {
        loop {
            if let Some(value) = st.backlog.pop_front() {
                let seq = seq_of(&value);
                if seq <= st.last_seq {
                    continue;
                }
                st.last_seq = seq;
                return Some((value, st));
            }

            match st.live.next().await {
                Some(value) => {
                    let seq = seq_of(&value);
                    if seq <= st.last_seq {
                        // Already delivered via replay; drop the duplicate.
                        continue;
                    }
                    if seq > st.last_seq + 1 {
                        // Gap: refill from the durable log, then reconsider
                        // this event from the backlog.
                        fill_backlog(&mut st).await;
                        st.backlog.push_back(value);
                        continue;
                    }
                    st.last_seq = seq;
                    return Some((value, st));
                }
                None => return None,
            }
        }
    })
    .map(|value| {
        let name = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        Ok::<_, Infallible>(Event::default().event(name).data(value.to_string()))
    });

    let heartbeat = Duration::from_millis(state.deps.config.stream.heartbeat_ms);
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(heartbeat)))
}

/// Drain every durable event past `last_seq` into the backlog.
async fn fill_backlog(st: &mut StreamState) {
    let mut after = st
        .backlog
        .back()
        .map(seq_of)
        .unwrap_or(st.last_seq)
        .max(st.last_seq);

    loop {
        match st.store.read_events(st.session_id, after, REPLAY_BATCH).await {
            Ok(events) => {
                let count = events.len();
                for event in events {
                    after = after.max(event.seq);
                    st.backlog.push_back(event.to_wire());
                }
                if (count as i64) < REPLAY_BATCH {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %st.session_id, error = %e, "event replay read failed");
                break;
            }
        }
    }
}
