//! Flap suppression over a live tree watcher
//!
//! A short drop-out followed by re-registration yields BackOnline; a
//! drop-out that outlasts the flap window yields exactly one Lost.

use std::time::Duration;

use healthmesh::coordination::CoordinationStore;

use crate::common::{master_config, register, start_master, wait_until, TestMaster};

const WAIT: Duration = Duration::from_secs(10);

fn flap_master() -> TestMaster {
    let mut config = master_config();
    config.classifier.gray_period_secs = 0;
    config.classifier.flap_window_secs = 2;
    config.classifier.sweep_interval_secs = 1;
    start_master(config)
}

async fn wait_for_alarm(master: &TestMaster, name: &str, count: usize) -> bool {
    wait_until(WAIT, move || async move { master.sink.named(name).len() >= count }).await
}

#[tokio::test]
async fn test_short_dropout_is_back_online() {
    let master = flap_master();
    let classifier = master.server.state().classifier;

    register(&master.coordination, "/lb/svc-a", "10.0.0.1", 9100, "zoneX").await;
    assert!(wait_for_alarm(&master, "module_added", 1).await);

    master.coordination.delete("/lb/svc-a/10.0.0.1:9100").await.unwrap();
    let pending = classifier.clone();
    assert!(
        wait_until(WAIT, || {
            let pending = pending.clone();
            async move { pending.pending() == 1 }
        })
        .await,
        "lost observation should be held back"
    );
    assert!(master.sink.named("module_lost").is_empty());

    register(&master.coordination, "/lb/svc-a", "10.0.0.1", 9100, "zoneX").await;
    assert!(wait_for_alarm(&master, "module_back_online", 1).await);
    assert_eq!(classifier.pending(), 0);

    // Nothing left for the sweeper
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(master.sink.named("module_lost").is_empty());
    assert_eq!(master.sink.named("module_added").len(), 1);

    master.server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_long_dropout_is_lost_once() {
    let master = flap_master();

    let entry = register(&master.coordination, "/lb/svc-b", "10.0.0.2", 9100, "zoneX").await;
    assert!(wait_for_alarm(&master, "module_added", 1).await);

    master
        .coordination
        .delete(&format!("/lb/svc-b/{}", entry.leaf_name()))
        .await
        .unwrap();
    assert!(wait_for_alarm(&master, "module_lost", 1).await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let lost = master.sink.named("module_lost");
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].module, "svc-b");

    master.server.shutdown_token().cancel();
}
