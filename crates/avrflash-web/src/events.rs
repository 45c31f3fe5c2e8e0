// SPDX-License-Identifier: CC-BY-NC-ND-4.0

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

/// SSE stream of status events, one `status` event per report
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    trace!("SSE listener connected");

    let receiver = state.updater.emitter().bus().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(status) => match Event::default().event("status").json_data(&status) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!("Failed to encode status event: {e}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!("SSE listener lagged, {skipped} status events dropped");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
