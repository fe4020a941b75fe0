mod common;

use common::{log, push_config, settle, FakePushServer};
use contractflow::jobs::{JobId, JobStatus};
use contractflow::push::{ClientFrame, ConnectionState, JobEvent, PushClient};
use serde_json::json;
use std::time::Duration;

fn client() -> (std::sync::Arc<FakePushServer>, PushClient) {
    let server = FakePushServer::new();
    let push = PushClient::new(server.clone(), push_config());
    (server, push)
}

fn join(id: &str) -> ClientFrame {
    ClientFrame::Subscribe(JobId::from(id))
}

fn leave(id: &str) -> ClientFrame {
    ClientFrame::Unsubscribe(JobId::from(id))
}

#[tokio::test(start_paused = true)]
async fn subscribing_while_disconnected_joins_once_connected() {
    let (server, push) = client();
    assert_eq!(push.state(), ConnectionState::Disconnected);

    let _sub = push.subscribe_to_job(&JobId::from("J1"));
    settle().await;

    assert!(push.is_connected());
    assert_eq!(server.opens(), 1);
    assert_eq!(server.client_frames(), vec![join("J1")]);
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let (server, push) = client();
    push.connect();
    push.connect();
    settle().await;
    push.connect();
    settle().await;

    assert!(push.is_connected());
    assert_eq!(server.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_active_rooms() {
    let (server, push) = client();
    let mut sub = push.subscribe_to_job(&JobId::from("J1"));
    settle().await;

    server.drop_connection();
    settle().await;
    assert_eq!(push.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle().await;

    assert!(push.is_connected());
    assert_eq!(server.opens(), 2);
    assert_eq!(server.client_frames(), vec![join("J1"), join("J1")]);

    assert!(server.emit_log("J1", log("after reconnect", "t5")));
    assert_eq!(
        sub.next().await,
        Some(JobEvent::Log(log("after reconnect", "t5")))
    );
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_bounded_reconnect_attempts() {
    let (server, push) = client();
    server.refuse(10);

    push.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(server.opens(), 5);
    assert_eq!(push.state(), ConnectionState::Disconnected);

    // an explicit connect starts a fresh round
    push.connect();
    settle().await;
    assert_eq!(server.opens(), 6);
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_unknown_job_is_a_no_op() {
    let (server, push) = client();
    push.unsubscribe_from_job(&JobId::from("never-seen"));

    push.connect();
    settle().await;
    push.unsubscribe_from_job(&JobId::from("never-seen"));

    assert!(server.client_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_leaves_room_and_ends_stream() {
    let (server, push) = client();
    let id = JobId::from("J1");
    let mut sub = push.subscribe_to_job(&id);
    settle().await;

    push.unsubscribe_from_job(&id);

    assert!(sub.is_closed());
    assert_eq!(sub.next().await, None);
    assert!(!push.is_subscribed(&id));
    assert_eq!(server.client_frames(), vec![join("J1"), leave("J1")]);

    // the released handle must not send a second leave
    drop(sub);
    assert_eq!(server.client_frames(), vec![join("J1"), leave("J1")]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_leaves_the_room() {
    let (server, push) = client();
    let id = JobId::from("J1");
    let sub = push.subscribe_to_job(&id);
    settle().await;

    sub.close();

    assert!(!push.is_subscribed(&id));
    assert_eq!(server.client_frames(), vec![join("J1"), leave("J1")]);
}

#[tokio::test(start_paused = true)]
async fn events_are_scoped_to_the_subscribed_job() {
    let (server, push) = client();
    let mut sub = push.subscribe_to_job(&JobId::from("A"));
    settle().await;

    server.emit_log("B", log("for b", "t1"));
    server.emit_status("B", JobStatus::Completed, json!({}));
    server.emit_log("A", log("for a", "t2"));
    server.emit_status("A", JobStatus::Failed, json!({ "error": "boom" }));

    assert_eq!(sub.next().await, Some(JobEvent::Log(log("for a", "t2"))));
    assert_eq!(
        sub.next().await,
        Some(JobEvent::Status {
            status: JobStatus::Failed,
            result: json!({ "error": "boom" }),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn resubscribing_replaces_the_previous_handle() {
    let (server, push) = client();
    let id = JobId::from("J1");
    let mut first = push.subscribe_to_job(&id);
    settle().await;

    let mut second = push.subscribe_to_job(&id);
    settle().await;

    assert!(first.is_closed());
    assert_eq!(first.next().await, None);
    drop(first);
    assert!(push.is_subscribed(&id));

    // already joined, so no second join signal
    assert_eq!(server.client_frames(), vec![join("J1")]);

    server.emit_log("J1", log("still here", "t1"));
    assert_eq!(second.next().await, Some(JobEvent::Log(log("still here", "t1"))));
}

#[tokio::test(start_paused = true)]
async fn subscribe_does_not_wait_for_a_stuck_connection() {
    let (server, push) = client();
    server.hang();

    let started = tokio::time::Instant::now();
    let sub = push.subscribe_to_job(&JobId::from("J1"));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(push.state(), ConnectionState::Connecting);

    // past the join wait: still registered, nothing sent
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!sub.is_closed());
    assert!(push.is_subscribed(&JobId::from("J1")));
    assert!(server.client_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_every_subscription() {
    let (_server, push) = client();
    let mut a = push.subscribe_to_job(&JobId::from("A"));
    let mut b = push.subscribe_to_job(&JobId::from("B"));
    settle().await;

    push.disconnect();

    assert_eq!(push.state(), ConnectionState::Disconnected);
    assert_eq!(a.next().await, None);
    assert_eq!(b.next().await, None);
}

#[tokio::test(start_paused = true)]
async fn join_wait_expiry_still_joins_on_later_connect() {
    let (server, push) = client();
    // refused at 0s, 1s and 3s; the fourth attempt at 7s succeeds
    server.refuse(3);

    let mut sub = push.subscribe_to_job(&JobId::from("J1"));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!push.is_connected());
    assert!(server.client_frames().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    assert!(push.is_connected());
    assert_eq!(server.opens(), 4);
    assert_eq!(server.client_frames(), vec![join("J1")]);

    assert!(server.emit_log("J1", log("late but joined", "t1")));
    assert_eq!(
        sub.next().await,
        Some(JobEvent::Log(log("late but joined", "t1")))
    );
}
