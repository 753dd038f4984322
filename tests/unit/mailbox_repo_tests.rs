//! Unit tests for the per-device command mailbox.

use std::sync::Arc;

use camfleet::models::command::{CommandAction, QueuedCommand};
use camfleet::models::device::Device;
use camfleet::persistence::db;
use camfleet::persistence::device_repo::DeviceRepo;
use camfleet::persistence::mailbox_repo::MailboxRepo;
use camfleet::AppError;

async fn setup(devices: &[&str]) -> MailboxRepo {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let registry = DeviceRepo::new(Arc::clone(&pool));
    for id in devices {
        registry
            .upsert(&Device::new(
                (*id).to_owned(),
                None,
                "1.0".into(),
                vec!["cam1".to_owned()],
                Vec::new(),
            ))
            .await
            .expect("register");
    }
    MailboxRepo::new(pool)
}

fn start(device_id: &str, session_id: &str) -> QueuedCommand {
    QueuedCommand::new(
        device_id.to_owned(),
        CommandAction::StartRecording,
        "cam1".into(),
        Some(session_id.to_owned()),
        Some(10),
    )
}

#[tokio::test]
async fn enqueue_assigns_device_scoped_command_id() {
    let mailbox = setup(&["AGENT-1"]).await;
    let queued = mailbox.enqueue(&start("AGENT-1", "S1")).await.expect("enqueue");

    assert!(queued.command_id.starts_with("AGENT-1_"));
    assert!(queued.enqueued_at.is_some());
}

#[tokio::test]
async fn enqueue_for_unregistered_device_is_rejected() {
    let mailbox = setup(&[]).await;
    let result = mailbox.enqueue(&start("AGENT-404", "S1")).await;

    assert!(matches!(result, Err(AppError::DeviceNotFound(id)) if id == "AGENT-404"));
    assert!(mailbox.peek("AGENT-404").await.expect("peek").is_empty());
}

#[tokio::test]
async fn unknown_action_is_never_queued() {
    let mailbox = setup(&["AGENT-1"]).await;
    let mut command = start("AGENT-1", "S1");
    command.action = CommandAction::Unknown;

    assert!(matches!(
        mailbox.enqueue(&command).await,
        Err(AppError::InvalidCommand(_))
    ));
}

#[tokio::test]
async fn drain_returns_in_enqueue_order_and_empties_the_mailbox() {
    let mailbox = setup(&["AGENT-1"]).await;
    for session in ["S1", "S2", "S3"] {
        mailbox.enqueue(&start("AGENT-1", session)).await.expect("enqueue");
    }

    let drained = mailbox.drain("AGENT-1").await.expect("drain");
    let sessions: Vec<_> = drained
        .iter()
        .map(|c| c.session_id.clone().unwrap_or_default())
        .collect();
    assert_eq!(sessions, vec!["S1", "S2", "S3"]);

    let ids: Vec<_> = drained.iter().map(|c| c.command_id.clone()).collect();
    let mut unique = ids.clone();
    unique.dedup();
    assert_eq!(ids, unique, "command ids are distinct");

    assert!(mailbox.drain("AGENT-1").await.expect("second drain").is_empty());
}

#[tokio::test]
async fn drain_only_touches_the_requested_device() {
    let mailbox = setup(&["AGENT-1", "AGENT-2"]).await;
    mailbox.enqueue(&start("AGENT-1", "S1")).await.expect("enqueue");
    mailbox.enqueue(&start("AGENT-2", "S2")).await.expect("enqueue");

    let drained = mailbox.drain("AGENT-1").await.expect("drain");
    assert_eq!(drained.len(), 1);
    assert_eq!(mailbox.peek("AGENT-2").await.expect("peek").len(), 1);
}

#[tokio::test]
async fn concurrent_drains_never_deliver_twice() {
    let mailbox = setup(&["AGENT-1"]).await;
    for n in 0..20 {
        mailbox
            .enqueue(&start("AGENT-1", &format!("S{n}")))
            .await
            .expect("enqueue");
    }

    let a = mailbox.clone();
    let b = mailbox.clone();
    let (first, second) = tokio::join!(a.drain("AGENT-1"), b.drain("AGENT-1"));
    let total = first.expect("first").len() + second.expect("second").len();

    assert_eq!(total, 20);
    assert!(mailbox.peek("AGENT-1").await.expect("peek").is_empty());
}
