//! Integration tests against a live Asterisk instance.
//!
//! These tests require AMI on 127.0.0.1:5038 with user `admin`, secret
//! `amp111` and `read = all`, `write = all` in manager.conf.
//! Run with: cargo test --test live_asterisk -- --ignored

use asterisk_manager_tokio::{ManagerAction, ManagerConfig, ManagerConnection, ManagerEventStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const AMI_HOST: &str = "127.0.0.1";
const AMI_USER: &str = "admin";
const AMI_SECRET: &str = "amp111";

async fn connect() -> (ManagerConnection, ManagerEventStream) {
    let config = ManagerConfig::new(AMI_HOST, AMI_USER, AMI_SECRET);
    let (manager, events) = ManagerConnection::new(config);
    manager
        .login()
        .await
        .expect("failed to log in to Asterisk");
    (manager, events)
}

#[tokio::test]
#[ignore]
async fn live_login_and_version() {
    let (manager, _events) = connect().await;
    assert!(manager.is_connected());
    let version = manager
        .version()
        .expect("version should be detected");
    assert!(version.major >= 1);
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_ping() {
    let (manager, _events) = connect().await;
    let reply = manager
        .send_action(ManagerAction::ping().action_id("live-ping"))
        .await
        .unwrap();
    assert!(reply.is_pong() || reply.is_success());
    assert_eq!(reply.action_id(), Some("live-ping"));

    manager
        .ping(Duration::from_secs(5))
        .await
        .unwrap();
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_command_output() {
    let (manager, _events) = connect().await;
    let reply = manager
        .send_action(ManagerAction::command("core show uptime").unwrap())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let output = reply
        .output()
        .expect("command should have output");
    assert!(output
        .iter()
        .any(|l| l.contains("uptime")));
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_core_show_channels() {
    let (manager, _events) = connect().await;
    let listing = manager
        .send_event_generating_action(ManagerAction::core_show_channels(), Duration::from_secs(10))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(listing.is_complete());
    assert!(listing
        .events()
        .last()
        .unwrap()
        .is_list_terminal());
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_user_event_round_trip() {
    let (manager, _events) = connect().await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    manager.add_event_listener(Some("UserLiveTest"), move |event| {
        if event.extra("probe") == Some("live") || event.text("probe") == Some("live") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let action = ManagerAction::user_event("LiveTest")
        .unwrap()
        .field("Probe", "live")
        .unwrap();
    manager
        .send_action(action)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("user event not delivered");
    manager
        .close()
        .await;
}
