//! End-to-end engine scenarios: vote acceptance, duplicate rejection,
//! mid-stream subscription and concurrent voting.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};

use pollstream::db::MemoryRepository;
use pollstream::engine::Engine;
use pollstream::error::VoteError;
use pollstream::events::EngineEvent;
use pollstream::models::Poll;
use pollstream::rooms::RoomEvent;

async fn engine_with_poll(options: Vec<&str>) -> (Arc<Engine>, Poll) {
    let engine = Arc::new(Engine::new(Arc::new(MemoryRepository::new())));
    let poll = engine
        .create_poll(Poll::new(
            "creator".into(),
            "Which option?".into(),
            options.into_iter().map(String::from).collect(),
            None,
        ))
        .await
        .unwrap();
    (engine, poll)
}

#[tokio::test]
async fn vote_duplicate_vote_then_fresh_subscriber() {
    let (engine, poll) = engine_with_poll(vec!["A", "B"]).await;
    let option_a = poll.options[0].id.clone();
    let option_b = poll.options[1].id.clone();

    // u1 votes A: accepted at revision 1.
    let receipt = engine.submit_vote(&poll.id, "u1", &option_a).await.unwrap();
    assert_eq!(receipt.revision, 1);
    assert_eq!(receipt.new_count, 1);

    // u1 tries B: rejected, tallies unchanged.
    let err = engine.submit_vote(&poll.id, "u1", &option_b).await.unwrap_err();
    assert!(matches!(err, VoteError::AlreadyVoted(_)));
    let snapshot = engine.snapshot(&poll.id).await.unwrap();
    assert_eq!(snapshot.options[0].vote_count, 1);
    assert_eq!(snapshot.options[1].vote_count, 0);
    assert_eq!(snapshot.revision, 1);

    // u2 votes B: accepted at revision 2.
    let receipt = engine.submit_vote(&poll.id, "u2", &option_b).await.unwrap();
    assert_eq!(receipt.revision, 2);

    // A subscriber arriving now starts from {A:1, B:1, revision 2}.
    let (tx, _rx) = mpsc::channel(8);
    let snapshot = engine
        .subscribe(1, &poll.id, tx, Arc::new(Notify::new()))
        .await
        .unwrap();
    assert_eq!(snapshot.options[0].vote_count, 1);
    assert_eq!(snapshot.options[1].vote_count, 1);
    assert_eq!(snapshot.revision, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_concurrent_voters_produce_exact_tallies() {
    let (engine, poll) = engine_with_poll(vec!["A", "B"]).await;
    let option_a = poll.options[0].id.clone();
    let option_b = poll.options[1].id.clone();

    let mut handles = Vec::new();
    for i in 0..100 {
        let engine = Arc::clone(&engine);
        let poll_id = poll.id.clone();
        let option = if i < 60 {
            option_a.clone()
        } else {
            option_b.clone()
        };
        handles.push(tokio::spawn(async move {
            engine
                .submit_vote(&poll_id, &format!("voter-{i}"), &option)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let snapshot = engine.snapshot(&poll.id).await.unwrap();
    assert_eq!(snapshot.options[0].vote_count, 60);
    assert_eq!(snapshot.options[1].vote_count, 40);
    assert_eq!(snapshot.revision, 100);
    assert_eq!(snapshot.total_votes(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_observes_strictly_increasing_revisions() {
    let (engine, poll) = engine_with_poll(vec!["A", "B"]).await;
    let option_a = poll.options[0].id.clone();
    let option_b = poll.options[1].id.clone();

    let (tx, mut rx) = mpsc::channel(256);
    let baseline = engine
        .subscribe(1, &poll.id, tx, Arc::new(Notify::new()))
        .await
        .unwrap();
    assert_eq!(baseline.revision, 0);

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = Arc::clone(&engine);
        let poll_id = poll.id.clone();
        let option = if i % 2 == 0 {
            option_a.clone()
        } else {
            option_b.clone()
        };
        handles.push(tokio::spawn(async move {
            engine
                .submit_vote(&poll_id, &format!("voter-{i}"), &option)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut last_revision = 0;
    for _ in 0..50 {
        match rx.recv().await.unwrap() {
            RoomEvent::Delta { revision, .. } => {
                assert_eq!(revision, last_revision + 1);
                last_revision = revision;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(last_revision, 50);
}

#[tokio::test]
async fn closing_broadcasts_to_subscribers_and_rejects_late_votes() {
    let (engine, poll) = engine_with_poll(vec!["A"]).await;
    let option_a = poll.options[0].id.clone();

    let (tx, mut rx) = mpsc::channel(8);
    engine
        .subscribe(1, &poll.id, tx, Arc::new(Notify::new()))
        .await
        .unwrap();

    engine.submit_vote(&poll.id, "u1", &option_a).await.unwrap();
    let revision = engine.close_poll(&poll.id).await.unwrap();
    assert_eq!(revision, 2);

    assert!(matches!(
        rx.recv().await.unwrap(),
        RoomEvent::Delta { revision: 1, .. }
    ));
    assert_eq!(
        rx.recv().await.unwrap(),
        RoomEvent::Closed {
            poll_id: poll.id.clone(),
            revision: 2,
        }
    );

    // A vote that was in flight when the poll closed still gets PollClosed.
    let err = engine.submit_vote(&poll.id, "u2", &option_a).await.unwrap_err();
    assert!(matches!(err, VoteError::PollClosed(_)));
}

#[tokio::test]
async fn engine_events_feed_the_statistics_consumer() {
    let (engine, poll) = engine_with_poll(vec!["A"]).await;
    let option_a = poll.options[0].id.clone();
    let mut events = engine.subscribe_events();

    engine.submit_vote(&poll.id, "u1", &option_a).await.unwrap();
    engine.close_poll(&poll.id).await.unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        EngineEvent::VoteAccepted { revision: 1, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        EngineEvent::PollClosed { revision: 2, .. }
    ));

    let stats = engine.stats();
    assert_eq!(stats.polls_created, 1);
    assert_eq!(stats.votes_received, 1);
    assert_eq!(stats.polls_closed, 1);
}

#[tokio::test]
async fn disconnect_cancels_subscriptions_but_not_poll_state() {
    let (engine, poll) = engine_with_poll(vec!["A"]).await;
    let option_a = poll.options[0].id.clone();

    let (tx, _rx) = mpsc::channel(8);
    engine
        .subscribe(9, &poll.id, tx, Arc::new(Notify::new()))
        .await
        .unwrap();
    assert_eq!(engine.rooms().members_of(&poll.id), vec![9]);

    engine.drop_connection(9);
    assert!(engine.rooms().members_of(&poll.id).is_empty());

    // Poll state is untouched by the disconnect.
    engine.submit_vote(&poll.id, "u1", &option_a).await.unwrap();
    assert_eq!(engine.snapshot(&poll.id).await.unwrap().revision, 1);
}
