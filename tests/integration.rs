use std::{
    collections::HashSet,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use mnemq::{
    config::Config,
    db::claim::ClaimMode,
    error::Error,
    message::{EnqueueOptions, FailureOutcome, MessageStatus, NewMessage, QueueMessage},
    processor::Router,
    queue::QueueConfig,
    service::Service,
    utils::now_ms,
};
use serde_json::json;
use tempfile::TempDir;

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup_with(config: Config) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    TmpService {
        svc: Service::connect_with(Config {
            db_path: Some(path.path().join("mnemq.db").to_string_lossy().to_string()),
            poll_interval_ms: 20,
            ..config
        })
        .await
        .unwrap(),
        tmpdir: path,
    }
}

async fn setup() -> TmpService {
    setup_with(Config::default()).await
}

async fn wait_for_status(service: &Service, id: i64, status: MessageStatus) -> QueueMessage {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let message = service.get_message(id).await.unwrap().unwrap();
        if message.status == status {
            return message;
        }
        assert!(
            Instant::now() < deadline,
            "message {id} still {} after 5s",
            message.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Makes a retrying message eligible right away.
async fn expire_retry(service: &Service, id: i64) {
    sqlx::query("UPDATE queue_messages SET next_retry_at = 0 WHERE id = $1")
        .bind(id)
        .execute(service.db())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_enqueue_and_peek() {
    let service = setup().await;

    assert_eq!(service.list_queues().await.unwrap(), Vec::<String>::new());

    let id = service
        .enqueue(
            "emails",
            "welcome",
            json!({ "to": "someone@example.com" }),
            EnqueueOptions::builder()
                .correlation_id("signup-42")
                .metadata(json!({ "source": "signup" }))
                .build(),
        )
        .await
        .unwrap();

    let peeked = service.peek("emails", 10).await.unwrap();
    assert_eq!(peeked.len(), 1);

    let message = &peeked[0];
    assert_eq!(message.id, id);
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.payload, json!({ "to": "someone@example.com" }));
    assert_eq!(message.metadata, Some(json!({ "source": "signup" })));
    assert_eq!(message.max_retries, 3);
    assert_eq!(message.retry_count, 0);

    // Peeking does not claim.
    assert_eq!(
        service.get_message(id).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );

    let correlated = service.find_by_correlation("signup-42").await.unwrap();
    assert_eq!(correlated.len(), 1);
    assert_eq!(correlated[0].id, id);

    assert_eq!(service.list_queues().await.unwrap(), vec!["emails".to_owned()]);
}

#[tokio::test]
async fn test_enqueue_validation() {
    let service = setup_with(Config {
        max_payload_bytes: 64,
        ..Config::default()
    })
    .await;

    let err = service
        .enqueue("", "t", json!({}), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingParameter { .. }));

    let err = service
        .enqueue("q", " ", json!({}), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingParameter { .. }));

    let err = service
        .enqueue("q", "t", json!("x".repeat(100)), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { max: 64, .. }));
    assert!(err.is_validation());

    assert!(service.peek("q", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_priority_and_retries_are_clamped() {
    let service = setup().await;

    let id = service
        .enqueue(
            "q",
            "t",
            json!(null),
            EnqueueOptions::builder().priority(1_000).max_retries(50).build(),
        )
        .await
        .unwrap();

    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.priority, 100);
    assert_eq!(message.max_retries, 10);

    let id = service
        .enqueue(
            "q",
            "t",
            json!(null),
            EnqueueOptions::builder().priority(-5).max_retries(-1).build(),
        )
        .await
        .unwrap();

    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.priority, 0);
    assert_eq!(message.max_retries, 0);
}

#[tokio::test]
async fn test_priority_ordering() {
    let service = setup().await;

    for priority in [1, 5, 3] {
        service
            .enqueue(
                "q",
                "t",
                json!({ "priority": priority }),
                EnqueueOptions::builder().priority(priority).build(),
            )
            .await
            .unwrap();
    }

    let claimed = service.claim("q", 3).await.unwrap();
    let priorities: Vec<_> = claimed.iter().map(|m| m.priority).collect();
    assert_eq!(priorities, vec![5, 3, 1]);
    assert!(claimed
        .iter()
        .all(|m| m.status == MessageStatus::Processing && m.processed_at.is_some()));

    assert!(service.claim("q", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduled_messages_wait() {
    let service = setup().await;

    let later = service
        .enqueue(
            "q",
            "t",
            json!(null),
            EnqueueOptions::builder().delay_ms(60_000).build(),
        )
        .await
        .unwrap();
    let now = service
        .enqueue("q", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    let claimed = service.claim("q", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, now);

    let message = service.get_message(later).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    assert!(message.scheduled_at >= message.created_at + 60_000);
}

async fn assert_at_most_one_claim(mode: ClaimMode) {
    let service = setup_with(Config {
        claim_strategy: mode,
        ..Config::default()
    })
    .await;

    assert_eq!(service.claim_strategy(), mode.to_string());

    let messages: Vec<_> = (0..30)
        .map(|i| {
            NewMessage::builder()
                .queue_name("contended")
                .message_type("t")
                .payload(json!(i))
                .build()
        })
        .collect();
    service.enqueue_batch(messages).await.unwrap();

    let claims: Vec<_> = (0..8)
        .map(|_| {
            let engine = service.engine().clone();
            tokio::spawn(async move { engine.claim("contended", 5).await })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for claim in claims {
        let claimed = claim.await.unwrap().unwrap();
        total += claimed.len();
        for message in claimed {
            assert!(seen.insert(message.id), "message {} claimed twice", message.id);
        }
    }

    // min(M, N * batch) = min(30, 40)
    assert_eq!(total, 30);
    assert_eq!(seen.len(), 30);
}

#[tokio::test]
async fn test_at_most_one_claim_returning() {
    assert_at_most_one_claim(ClaimMode::Returning).await;
}

#[tokio::test]
async fn test_at_most_one_claim_transactional() {
    assert_at_most_one_claim(ClaimMode::Transactional).await;
}

#[tokio::test]
async fn test_transactional_claim_ordering() {
    let service = setup_with(Config {
        claim_strategy: ClaimMode::Transactional,
        ..Config::default()
    })
    .await;

    for priority in [1, 5, 3] {
        service
            .enqueue(
                "q",
                "t",
                json!(null),
                EnqueueOptions::builder().priority(priority).build(),
            )
            .await
            .unwrap();
    }

    let priorities: Vec<_> = service
        .claim("q", 3)
        .await
        .unwrap()
        .iter()
        .map(|m| m.priority)
        .collect();
    assert_eq!(priorities, vec![5, 3, 1]);
    assert!(service.statements().contains("claim_update:3"));
}

#[tokio::test]
async fn test_failed_claim_evicts_only_its_statements() {
    let service = setup_with(Config {
        claim_strategy: ClaimMode::Transactional,
        ..Config::default()
    })
    .await;

    for _ in 0..3 {
        service
            .enqueue("q", "t", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
    }
    service.claim("q", 1).await.unwrap();
    assert!(service.statements().contains("claim_update:1"));
    assert!(service.statements().contains("claim_select:1"));

    sqlx::query(
        "
        CREATE TRIGGER reject_claims BEFORE UPDATE OF status ON queue_messages
        BEGIN SELECT RAISE(ABORT, 'claims rejected'); END
        ",
    )
    .execute(service.db())
    .await
    .unwrap();

    let err = service.claim("q", 2).await.unwrap_err();
    assert!(err.is_store(), "{err:?}");

    assert!(!service.statements().contains("claim_update:2"));
    assert!(!service.statements().contains("claim_select:2"));
    assert!(service.statements().contains("claim_update:1"));
    assert!(service.statements().contains("claim_select:1"));

    // Nothing was claimed by the rolled-back attempt.
    assert_eq!(service.peek("q", 10).await.unwrap().len(), 2);

    sqlx::query("DROP TRIGGER reject_claims")
        .execute(service.db())
        .await
        .unwrap();
    assert_eq!(service.claim("q", 2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retry_then_dead_letter() {
    let service = setup().await;

    service
        .configure_queue(
            "jobs",
            QueueConfig::builder()
                .base_delay_ms(1_000)
                .use_jitter(false)
                .build(),
        )
        .await
        .unwrap();

    let id = service
        .enqueue(
            "jobs",
            "flaky",
            json!({ "n": 1 }),
            EnqueueOptions::builder()
                .priority(0)
                .max_retries(2)
                .correlation_id("c-1")
                .build(),
        )
        .await
        .unwrap();

    for (attempt, delay) in [(1, 1_000), (2, 2_000)] {
        let claimed = service.claim("jobs", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        let before = now_ms();
        let outcome = service.mark_failed(id, "boom").await.unwrap();
        let after = now_ms();

        let FailureOutcome::Retrying {
            retry_count,
            next_retry_at,
        } = outcome
        else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert_eq!(retry_count, attempt);
        assert!(next_retry_at >= before + delay && next_retry_at <= after + delay);

        let message = service.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Retrying);
        assert_eq!(message.retry_count, attempt);
        assert_eq!(message.next_retry_at, Some(next_retry_at));
        assert_eq!(message.error_message.as_deref(), Some("boom"));

        // Not eligible until the backoff elapses.
        assert!(service.claim("jobs", 1).await.unwrap().is_empty());
        expire_retry(&service, id).await;
    }

    service.claim("jobs", 1).await.unwrap();
    let outcome = service.mark_failed(id, "still broken").await.unwrap();
    assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));

    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 3);
    assert!(message.processed_at.is_some());

    let dead = service.get_dead_letters_for("jobs", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id, id);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].error_message.as_deref(), Some("still broken"));
    assert_eq!(dead[0].correlation_id.as_deref(), Some("c-1"));
    assert_eq!(dead[0].payload, json!({ "n": 1 }));

    let for_message = service.dead_letters_for_message(id).await.unwrap();
    assert_eq!(for_message, dead);

    assert!(service
        .peek("jobs", 10)
        .await
        .unwrap()
        .iter()
        .all(|m| m.id != id));
}

#[tokio::test]
async fn test_resolution_requires_processing() {
    let service = setup().await;

    let id = service
        .enqueue("q", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    assert!(!service.mark_completed(id).await.unwrap());
    assert_eq!(
        service.mark_failed(id, "nope").await.unwrap(),
        FailureOutcome::Ignored
    );
    assert_eq!(
        service.mark_failed(9_999, "nope").await.unwrap(),
        FailureOutcome::Ignored
    );

    service.claim("q", 1).await.unwrap();
    assert!(service.mark_completed(id).await.unwrap());
    assert!(!service.mark_completed(id).await.unwrap());
    assert_eq!(
        service.mark_failed(id, "late").await.unwrap(),
        FailureOutcome::Ignored
    );

    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Completed);
    assert_eq!(message.error_message, None);
}

#[tokio::test]
async fn test_batch_atomicity() {
    let service = setup_with(Config {
        max_payload_bytes: 32,
        ..Config::default()
    })
    .await;

    let batch = vec![
        NewMessage::builder()
            .queue_name("q")
            .message_type("t")
            .payload(json!(1))
            .build(),
        NewMessage::builder()
            .queue_name("q")
            .message_type("t")
            .payload(json!("y".repeat(64)))
            .build(),
        NewMessage::builder()
            .queue_name("q")
            .message_type("t")
            .payload(json!(3))
            .build(),
    ];

    let err = service.enqueue_batch(batch).await.unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }));
    assert!(service.peek("q", 10).await.unwrap().is_empty());

    let ids = service
        .enqueue_batch(vec![
            NewMessage::builder()
                .queue_name("q")
                .message_type("t")
                .payload(json!(1))
                .build(),
            NewMessage::builder()
                .queue_name("other")
                .message_type("t")
                .payload(json!(2))
                .options(EnqueueOptions::builder().priority(9).build())
                .build(),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
    assert_eq!(service.peek("other", 10).await.unwrap()[0].priority, 9);

    assert!(service.enqueue_batch(Vec::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_capacity() {
    let service = setup_with(Config {
        max_queue_size: 2,
        ..Config::default()
    })
    .await;

    for _ in 0..2 {
        service
            .enqueue("small", "t", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let err = service
        .enqueue("small", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull { size: 2, max: 2, .. }));
    assert!(err.is_validation());

    // Capacity is per queue.
    service
        .enqueue("roomy", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    // Completed messages do not count against capacity.
    let claimed = service.claim("small", 1).await.unwrap();
    service.mark_completed(claimed[0].id).await.unwrap();
    service
        .enqueue("small", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_requeue_from_dead_letter() {
    let service = setup().await;

    let id = service
        .enqueue(
            "q",
            "resize",
            json!({ "image": 7 }),
            EnqueueOptions::builder()
                .max_retries(0)
                .correlation_id("img-7")
                .build(),
        )
        .await
        .unwrap();

    service.claim("q", 1).await.unwrap();
    let FailureOutcome::DeadLettered { dead_letter_id } =
        service.mark_failed(id, "corrupt").await.unwrap()
    else {
        panic!("expected dead letter");
    };

    assert_eq!(service.get_dead_letter_messages(10).await.unwrap().len(), 1);

    let requeued = service
        .requeue_from_dead_letter(&[dead_letter_id, 9_999])
        .await
        .unwrap();
    assert_eq!(requeued.len(), 1);
    assert_ne!(requeued[0], id);

    let message = service.get_message(requeued[0]).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.queue_name, "q");
    assert_eq!(message.message_type, "resize");
    assert_eq!(message.payload, json!({ "image": 7 }));
    assert_eq!(message.correlation_id.as_deref(), Some("img-7"));
    assert_eq!(message.retry_count, 0);

    assert!(service.get_dead_letter_messages(10).await.unwrap().is_empty());
    assert!(service
        .requeue_from_dead_letter(&[dead_letter_id])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_queue_stats() {
    let service = setup().await;

    service
        .configure_queue("idle", QueueConfig::default())
        .await
        .unwrap();

    for _ in 0..3 {
        service
            .enqueue("busy", "t", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
    }
    let claimed = service.claim("busy", 2).await.unwrap();
    service.mark_completed(claimed[0].id).await.unwrap();

    let stats = service.get_queue_stats(Some("busy")).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pending, 1);
    assert_eq!(stats[0].processing, 1);
    assert_eq!(stats[0].completed, 1);
    assert_eq!(stats[0].total, 3);
    assert_eq!(stats[0].live(), 2);
    assert!(stats[0].avg_processing_ms.is_some());
    assert!(stats[0].oldest_pending_at.is_some());

    let all = service.get_queue_stats(None).await.unwrap();
    let names: Vec<_> = all.iter().map(|s| s.queue_name.as_str()).collect();
    assert_eq!(names, vec!["busy", "idle"]);
    assert_eq!(all[1].total, 0);
    assert_eq!(all[1].avg_processing_ms, None);
}

#[tokio::test]
async fn test_configure_queue() {
    let service = setup().await;

    assert_eq!(service.queue_config("q").await.unwrap(), QueueConfig::default());

    let config = QueueConfig::builder().max_retries(7).batch_size(2).build();
    service.configure_queue("q", config.clone()).await.unwrap();
    assert_eq!(service.queue_config("q").await.unwrap(), config);

    // New messages pick up the queue's retry limit.
    let id = service
        .enqueue("q", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(service.get_message(id).await.unwrap().unwrap().max_retries, 7);

    let err = service
        .configure_queue("q", QueueConfig::builder().batch_size(0).build())
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(service.queue_config("q").await.unwrap(), config);

    service.pause_queue("q").await.unwrap();
    assert!(!service.queue_config("q").await.unwrap().enabled);
    assert_eq!(service.queue_config("q").await.unwrap().max_retries, 7);

    service.resume_queue("q").await.unwrap();
    assert!(service.queue_config("q").await.unwrap().enabled);
}

#[tokio::test]
async fn test_purge_and_cleanup() {
    let service = setup().await;

    service
        .configure_queue(
            "short",
            QueueConfig::builder().retention_period(0).build(),
        )
        .await
        .unwrap();

    for queue in ["short", "long"] {
        service
            .enqueue(queue, "t", json!(null), EnqueueOptions::default())
            .await
            .unwrap();
        let claimed = service.claim(queue, 1).await.unwrap();
        service.mark_completed(claimed[0].id).await.unwrap();
    }
    let pending = service
        .enqueue("short", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = service.cleanup_queue("short").await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.dead_letters, 0);
    assert!(service.get_message(pending).await.unwrap().is_some());

    // Default retention keeps a just-completed message.
    assert_eq!(service.cleanup_queue("long").await.unwrap().messages, 0);

    assert!(service.purge_completed(-1).await.unwrap_err().is_validation());
    assert_eq!(service.purge_completed(1).await.unwrap(), 0);
    assert_eq!(service.purge_completed(0).await.unwrap(), 1);
    assert_eq!(service.get_queue_stats(Some("long")).await.unwrap()[0].total, 0);
}

/// Dead-letters a fresh message of `queue` and backdates its failure.
async fn dead_letter_aged(service: &Service, queue: &str, age_ms: i64) -> i64 {
    let id = service
        .enqueue(
            queue,
            "t",
            json!(null),
            EnqueueOptions::builder().max_retries(0).build(),
        )
        .await
        .unwrap();
    service.claim(queue, 1).await.unwrap();
    service.mark_failed(id, "boom").await.unwrap();

    sqlx::query("UPDATE dead_letter_queue SET failed_at = $2 WHERE original_message_id = $1")
        .bind(id)
        .bind(now_ms() - age_ms)
        .execute(service.db())
        .await
        .unwrap();

    id
}

#[tokio::test]
async fn test_dead_letter_retention() {
    let service = setup().await;
    let day = mnemq::utils::MS_PER_DAY;

    dead_letter_aged(&service, "q", 40 * day).await;
    let recent = dead_letter_aged(&service, "q", 10 * day).await;

    let report = service.cleanup_queue("q").await.unwrap();
    assert_eq!(report.dead_letters, 1);

    let dead = service.get_dead_letters_for("q", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message_id, recent);

    // Retention holds for queues cleanup_queue no longer visits.
    dead_letter_aged(&service, "gone", 40 * day).await;
    dead_letter_aged(&service, "gone", 29 * day).await;
    sqlx::query("DELETE FROM queue_messages WHERE queue_name = 'gone'")
        .execute(service.db())
        .await
        .unwrap();
    assert!(!service.list_queues().await.unwrap().contains(&"gone".to_owned()));

    assert_eq!(service.prune_dead_letters().await.unwrap(), 1);
    assert_eq!(service.get_dead_letters_for("gone", 10).await.unwrap().len(), 1);
    assert_eq!(service.get_dead_letter_messages(10).await.unwrap().len(), 2);
    assert_eq!(service.prune_dead_letters().await.unwrap(), 0);
}

#[tokio::test]
async fn test_release_stalled() {
    let service = setup().await;

    let id = service
        .enqueue("q", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();
    service.claim("q", 1).await.unwrap();

    assert_eq!(service.release_stalled(Duration::from_secs(60)).await.unwrap(), 0);

    sqlx::query("UPDATE queue_messages SET processed_at = $2 WHERE id = $1")
        .bind(id)
        .bind(now_ms() - 120_000)
        .execute(service.db())
        .await
        .unwrap();

    assert_eq!(service.release_stalled(Duration::from_secs(60)).await.unwrap(), 1);

    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Retrying);
    assert_eq!(message.retry_count, 1);
    assert_eq!(message.error_message.as_deref(), Some("processing stalled"));
}

#[tokio::test]
async fn test_release_stalled_respects_queue_timeout() {
    let service = setup().await;

    service
        .configure_queue(
            "slow",
            QueueConfig::builder()
                .processing_timeout(15 * 60 * 1_000)
                .build(),
        )
        .await
        .unwrap();

    let id = service
        .enqueue("slow", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();
    service.claim("slow", 1).await.unwrap();

    let backdate = |age_ms: i64| {
        sqlx::query("UPDATE queue_messages SET processed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now_ms() - age_ms)
            .execute(service.db())
    };

    // Past the janitor threshold but inside the queue's own timeout.
    backdate(11 * 60 * 1_000).await.unwrap();
    assert_eq!(service.release_stalled(Duration::from_secs(10 * 60)).await.unwrap(), 0);
    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Processing);
    assert_eq!(message.retry_count, 0);

    backdate(17 * 60 * 1_000).await.unwrap();
    assert_eq!(service.release_stalled(Duration::from_secs(10 * 60)).await.unwrap(), 1);
    assert_eq!(
        service.get_message(id).await.unwrap().unwrap().status,
        MessageStatus::Retrying
    );

    assert_eq!(service.release_stalled(Duration::MAX).await.unwrap(), 0);
}

#[tokio::test]
async fn test_system_health() {
    let service = setup().await;

    service
        .enqueue("q", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();
    service
        .register_processor("idle", |_m: QueueMessage| async { eyre::Ok(()) })
        .await
        .unwrap();

    let health = service.get_system_health().await;
    assert!(health.is_healthy);
    assert_eq!(health.pending, 1);
    assert_eq!(health.stuck_processing, 0);
    assert_eq!(health.store_error, None);
    assert_eq!(health.processors, vec!["idle".to_owned()]);

    service.shutdown().await;

    let health = service.health().await;
    assert!(!health.is_healthy);
    assert!(health.store_error.is_some());
}

#[tokio::test]
async fn test_processor_completes_messages() {
    let service = setup().await;
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    service
        .register_processor("work", move |message: QueueMessage| {
            let counter = counter.clone();
            async move {
                assert_eq!(message.status, MessageStatus::Processing);
                counter.fetch_add(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            service
                .enqueue("work", "t", json!(i), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    for id in ids {
        wait_for_status(&service, id, MessageStatus::Completed).await;
    }
    assert_eq!(handled.load(Ordering::SeqCst), 5);

    let err = service
        .register_processor("work", |_m: QueueMessage| async { eyre::Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));

    assert!(service.unregister_processor("work").await);
    assert!(!service.unregister_processor("work").await);
    assert!(service.processors().await.is_empty());
}

#[tokio::test]
async fn test_processor_failures_are_contained() {
    let service = setup().await;

    service
        .configure_queue(
            "fragile",
            QueueConfig::builder()
                .max_retries(0)
                .processing_timeout(100)
                .build(),
        )
        .await
        .unwrap();

    let router = Router::new()
        .route("ok", |_m: QueueMessage| async { eyre::Ok(()) })
        .route("error", |_m: QueueMessage| async {
            Err::<(), _>(eyre::eyre!("bad input"))
        })
        .route("panic", |_m: QueueMessage| async {
            if true {
                panic!("handler blew up");
            }
            eyre::Ok(())
        })
        .route("slow", |_m: QueueMessage| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            eyre::Ok(())
        });
    service.register_processor("fragile", router).await.unwrap();

    let mut ids = Vec::new();
    for message_type in ["error", "panic", "slow", "unknown", "ok"] {
        ids.push(
            service
                .enqueue("fragile", message_type, json!(null), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let errors: Vec<_> = {
        let mut errors = Vec::new();
        for &id in &ids[..4] {
            let message = wait_for_status(&service, id, MessageStatus::Failed).await;
            errors.push(message.error_message.unwrap_or_default());
        }
        errors
    };

    assert_eq!(errors[0], "bad input");
    assert_eq!(errors[1], "handler panicked");
    assert!(errors[2].contains("timed out"), "{}", errors[2]);
    assert!(errors[3].contains("unknown"), "{}", errors[3]);

    // The loop survived all of the above.
    wait_for_status(&service, ids[4], MessageStatus::Completed).await;

    assert_eq!(service.get_dead_letters_for("fragile", 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_timed_out_handler_finishing_late_is_ignored() {
    let service = setup().await;

    service
        .configure_queue(
            "late",
            QueueConfig::builder()
                .max_retries(0)
                .processing_timeout(100)
                .build(),
        )
        .await
        .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    service
        .register_processor("late", move |_m: QueueMessage| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                eyre::Ok(())
            }
        })
        .await
        .unwrap();

    let id = service
        .enqueue("late", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    wait_for_status(&service, id, MessageStatus::Failed).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !finished.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "handler never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The late Ok does not resurrect the failed message.
    let message = service.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert!(
        message.error_message.as_deref().unwrap_or_default().contains("timed out"),
        "{:?}",
        message.error_message
    );
    assert_eq!(service.dead_letters_for_message(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_paused_queue_is_not_processed() {
    let service = setup().await;

    service.pause_queue("held").await.unwrap();
    service
        .register_processor("held", |_m: QueueMessage| async { eyre::Ok(()) })
        .await
        .unwrap();

    let id = service
        .enqueue("held", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        service.get_message(id).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );

    service.resume_queue("held").await.unwrap();
    wait_for_status(&service, id, MessageStatus::Completed).await;
}

#[tokio::test]
async fn test_concurrency_ceiling() {
    let service = setup_with(Config {
        max_concurrency: 2,
        ..Config::default()
    })
    .await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    service
        .register_processor("bounded", move |_m: QueueMessage| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(
            service
                .enqueue("bounded", "t", json!(null), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    for id in ids {
        wait_for_status(&service, id, MessageStatus::Completed).await;
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight() {
    let service = setup().await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (started.clone(), finished.clone());
    service
        .register_processor("drain", move |_m: QueueMessage| {
            let (started, finished) = (s.clone(), f.clone());
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                eyre::Ok(())
            }
        })
        .await
        .unwrap();

    let id = service
        .enqueue("drain", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap();

    wait_for_status(&service, id, MessageStatus::Processing).await;
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    service.shutdown().await;
    assert!(finished.load(Ordering::SeqCst));

    let err = service
        .enqueue("drain", "t", json!(null), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));

    // A second shutdown is harmless.
    service.shutdown().await;
}
