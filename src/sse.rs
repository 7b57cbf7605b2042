use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::Utc;
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use tower_sessions::Session;
use tracing::debug;
use uuid::Uuid;

use crate::counter::ensure_vote_table;
use crate::db::Permission;
use crate::error::FanoutError;
use crate::fanout::FanoutManager;
use crate::notify::ChangeNotification;
use crate::startup::AppState;

/// Unsubscribes the client when its stream is dropped, which is how a viewer
/// disconnect surfaces here. Unsubscribe is async and `drop` is not, so it
/// runs on a spawned task; the operation is idempotent either way.
struct Disconnect {
    fanout: FanoutManager,
    poll_id: Uuid,
    client_id: u64,
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        let fanout = self.fanout.clone();
        let poll_id = self.poll_id;
        let client_id = self.client_id;
        tokio::spawn(async move {
            fanout.unsubscribe(poll_id, client_id).await;
        });
    }
}

/// Long-lived stream of a poll's vote counts.
///
/// Emits one `init` event with the current counter table, then a
/// `vote_update` event per change notification, each carrying the full
/// snapshot. Admission denial produces a single terminal `error` event.
/// Keepalives go out on the configured interval whenever no update arrived.
pub async fn poll_updates_sse(
    Extension(app_state): Extension<AppState>,
    session: Session,
    Path(poll_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user_id = session.get::<Uuid>("user_id").await.ok().flatten();
    let keepalive = app_state.config.sse_keepalive;

    let stream = async_stream::stream! {
        match app_state
            .store
            .authorize(user_id, poll_id, Permission::View, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": "Poll not found"}).to_string()));
                return;
            }
            Err(_) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": "Database error"}).to_string()));
                return;
            }
        }

        let mut mailbox = match app_state.fanout.subscribe(poll_id, user_id).await {
            Ok(mailbox) => mailbox,
            Err(e @ (FanoutError::GlobalCapacity(_) | FanoutError::UserCapacity(_))) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": e.to_string()}).to_string()));
                return;
            }
            Err(_) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": "Subscription failed"}).to_string()));
                return;
            }
        };
        let _guard = Disconnect {
            fanout: app_state.fanout.clone(),
            poll_id,
            client_id: mailbox.client_id(),
        };

        // Fresh full snapshot on connect; notifications missed before this
        // point don't matter.
        let init = async {
            ensure_vote_table(poll_id, app_state.store.as_ref(), app_state.cache.as_ref())
                .await?;
            app_state.cache.read_counts(poll_id).await
        }
        .await;
        match init {
            Ok(counts) => {
                let snapshot = ChangeNotification::new(poll_id, counts);
                yield Ok(Event::default()
                    .event("init")
                    .data(json!(snapshot).to_string()));
            }
            Err(_) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": "Failed to load vote counts"}).to_string()));
                return;
            }
        }

        loop {
            match tokio::time::timeout(keepalive, mailbox.next_update()).await {
                Ok(Some(update)) => {
                    yield Ok(Event::default()
                        .event("vote_update")
                        .data(json!(update).to_string()));
                }
                // Subscription removed: dead-client cleanup or shutdown.
                Ok(None) => break,
                // Idle interval elapsed; the keep-alive layer sends the
                // signal, we just wake up so disconnects get noticed.
                Err(_) => continue,
            }
        }
        debug!(%poll_id, "poll update stream ended");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(keepalive)
            .text("keep-alive"),
    )
}
