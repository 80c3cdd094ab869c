use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::ready;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

use super::job_failure;
use crate::schedule::JobEvent;
use crate::AppContext;

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;

fn to_sse(event: &JobEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event)
}

/// Server-sent events for one job.
///
/// The first event is a `job_status` snapshot of the stored job; live
/// events follow until the job reaches a terminal state.
pub async fn job_events(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Response {
    // subscribe first so nothing published between the two calls is missed
    let subscription = ctx.job_manager.subscribe(&job_id);
    let job = match ctx.job_manager.get_status(&job_id).await {
        Ok(job) => job,
        Err(e) => return job_failure::<()>(e).into_response(),
    };

    let snapshot = Event::default().event("job_status").json_data(&job);
    let updates: EventStream = if job.is_terminal() {
        stream::empty().boxed()
    } else {
        BroadcastStream::new(subscription.into_inner())
            // lagged receivers just skip ahead
            .filter_map(move |item| {
                ready(match item {
                    Ok(event) if event.job_id() == job_id => Some(event),
                    _ => None,
                })
            })
            .scan(false, |finished, event| {
                if *finished {
                    return ready(None);
                }
                *finished = event.is_terminal();
                ready(Some(to_sse(&event)))
            })
            .boxed()
    };

    let events: EventStream = stream::once(ready(snapshot)).chain(updates).boxed();
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}
