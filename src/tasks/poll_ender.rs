//! Lifecycle sweep: periodically closes active polls whose end date has
//! elapsed. Explicit close requests go straight to `Engine::close_poll` and
//! do not pass through here.

use crate::engine::Engine;
use chrono::{DateTime, Utc};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;

pub async fn check_expired_polls_task(engine: Arc<Engine>, interval_seconds: u64) {
    info!("Starting background task to check for expired polls...");
    let mut interval = interval(StdDuration::from_secs(interval_seconds));

    loop {
        interval.tick().await; // Wait for the next interval tick
        sweep_once(&engine, Utc::now()).await;
    }
}

/// One sweep pass. Closing is terminal, so a poll picked up by two
/// overlapping sweeps still transitions exactly once.
pub async fn sweep_once(engine: &Engine, now: DateTime<Utc>) {
    match engine.expired_poll_ids(now).await {
        Ok(expired) => {
            if !expired.is_empty() {
                info!("Found {} expired poll(s).", expired.len());
                for poll_id in expired {
                    match engine.close_poll(&poll_id).await {
                        Ok(revision) => {
                            info!("Closed expired poll {} at revision {}", poll_id, revision)
                        }
                        Err(e) => error!("Error closing expired poll {}: {}", poll_id, e),
                    }
                }
            }
        }
        Err(e) => {
            error!("Failed to query for expired polls: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use crate::models::{Poll, PollStatus};

    #[tokio::test]
    async fn sweep_closes_expired_polls_exactly_once() {
        let engine = Engine::new(Arc::new(MemoryRepository::new()));
        let mut poll = Poll::new("c".into(), "q".into(), vec!["a".into()], Some(1));
        poll.ends_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let poll = engine.create_poll(poll).await.unwrap();

        sweep_once(&engine, Utc::now()).await;
        let snapshot = engine.snapshot(&poll.id).await.unwrap();
        assert_eq!(snapshot.status, PollStatus::Closed);
        assert_eq!(snapshot.revision, 1);

        // A second sweep finds nothing to do and bumps no revision.
        sweep_once(&engine, Utc::now()).await;
        assert_eq!(engine.snapshot(&poll.id).await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn sweep_leaves_open_polls_alone() {
        let engine = Engine::new(Arc::new(MemoryRepository::new()));
        let open = engine
            .create_poll(Poll::new("c".into(), "q".into(), vec!["a".into()], Some(60)))
            .await
            .unwrap();
        let endless = engine
            .create_poll(Poll::new("c".into(), "q".into(), vec!["a".into()], None))
            .await
            .unwrap();

        sweep_once(&engine, Utc::now()).await;
        assert_eq!(
            engine.snapshot(&open.id).await.unwrap().status,
            PollStatus::Active
        );
        assert_eq!(
            engine.snapshot(&endless.id).await.unwrap().status,
            PollStatus::Active
        );
    }
}
