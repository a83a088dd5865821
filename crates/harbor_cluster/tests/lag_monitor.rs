//! Replication lag monitor cycles against simulated backends.

mod common;

use common::*;

#[tokio::test]
async fn test_scenario_unreachable_standby_does_not_break_cycle() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/16000000");
    h.pg_host("db1", false, "0/15000000");
    // db2 is never registered: unreachable.
    h.replication_rows(&[("db1", Some("streaming"), Some("async"))]);

    let mut monitor = h.monitor();
    let report = monitor.run_cycle().await.expect("cycle should complete");

    assert!(report.lag_checked);
    assert_eq!(report.node(NodeId(0)).unwrap().lag, Probe::Ok(0));
    assert_eq!(report.node(NodeId(1)).unwrap().lag, Probe::Ok(0x100_0000));
    let b = report.node(NodeId(2)).unwrap();
    assert_eq!(b.lag, Probe::Unknown);
    assert!(b.position.is_failed());

    assert_eq!(h.directory.node(NodeId(0)).unwrap().standby_delay, 0);
    assert_eq!(h.directory.node(NodeId(1)).unwrap().standby_delay, 0x100_0000);
    assert_eq!(h.directory.node(NodeId(2)).unwrap().standby_delay, 0);
    assert_eq!(report.probe_failures(), 1);

    // Every diagnostic connection is closed at the end of the cycle.
    assert_eq!(h.sim.open_connections(), 0);
}

#[tokio::test]
async fn test_query_failure_on_one_standby_keeps_others() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/3000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/2000");
    h.sim.reply(
        "db1",
        "SELECT pg_last_wal_replay_lsn()",
        SimReply::Error("canceling statement due to conflict with recovery".into()),
    );
    h.replication_rows(&[]);

    let report = h.monitor().run_cycle().await.unwrap();
    assert!(report.node(NodeId(1)).unwrap().position.is_failed());
    assert_eq!(report.node(NodeId(1)).unwrap().lag, Probe::Unknown);
    assert_eq!(report.node(NodeId(2)).unwrap().lag, Probe::Ok(0x1000));
    assert_eq!(h.directory.node(NodeId(2)).unwrap().standby_delay, 0x1000);
}

#[tokio::test]
async fn test_standby_ahead_of_primary_has_zero_lag() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/2000");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[]);

    let report = h.monitor().run_cycle().await.unwrap();
    assert_eq!(report.node(NodeId(1)).unwrap().lag, Probe::Ok(0));
    assert_eq!(report.node(NodeId(2)).unwrap().lag, Probe::Ok(0));
}

#[tokio::test]
async fn test_unknown_primary_position_makes_all_lag_unknown() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.sim.reply("db0", "SELECT pg_current_wal_lsn()", SimReply::null());
    h.pg_host("db1", false, "0/800");
    h.pg_host("db2", false, "0/900");
    h.replication_rows(&[]);

    let report = h.monitor().run_cycle().await.unwrap();
    assert_eq!(report.node(NodeId(0)).unwrap().position, Probe::Unknown);
    assert_eq!(report.node(NodeId(0)).unwrap().lag, Probe::Ok(0));
    assert_eq!(report.node(NodeId(1)).unwrap().lag, Probe::Unknown);
    assert_eq!(report.node(NodeId(2)).unwrap().lag, Probe::Unknown);
}

#[tokio::test]
async fn test_replication_state_is_correlated_by_application_name() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[
        ("db2", Some("streaming"), Some("sync")),
        ("db1", None, None),
        ("someone-else", Some("catchup"), Some("async")),
    ]);

    let report = h.monitor().run_cycle().await.unwrap();
    assert_eq!(report.replication_status, Some(Probe::Ok(3)));
    let db2 = h.directory.node(NodeId(2)).unwrap();
    assert_eq!(db2.replication_state, "streaming");
    assert_eq!(db2.replication_sync_state, "sync");
    // NULL columns (insufficient privilege) are stored as empty strings.
    let db1 = h.directory.node(NodeId(1)).unwrap();
    assert_eq!(db1.replication_state, "");
    assert_eq!(db1.replication_sync_state, "");
    assert_eq!(h.directory.node(NodeId(0)).unwrap().replication_state, "");
}

#[tokio::test]
async fn test_replication_state_cleared_when_status_query_fails() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[("db1", Some("streaming"), Some("async"))]);

    let mut monitor = h.monitor();
    monitor.run_cycle().await.unwrap();
    assert_eq!(h.directory.node(NodeId(1)).unwrap().replication_state, "streaming");

    h.sim.reply(
        "db0",
        "SELECT application_name, state, sync_state FROM pg_stat_replication",
        SimReply::Error("permission denied".into()),
    );
    let report = monitor.run_cycle().await.unwrap();
    assert!(matches!(report.replication_status, Some(Probe::Failed(_))));
    assert_eq!(h.directory.node(NodeId(1)).unwrap().replication_state, "");
    assert_eq!(h.directory.node(NodeId(1)).unwrap().replication_sync_state, "");
}

#[tokio::test]
async fn test_old_server_uses_xlog_statements_and_no_status_query() {
    let h = Harness::new([BackendStatus::Up, BackendStatus::Up, BackendStatus::Down]);
    for (host, primary, sql, pos) in [
        ("db0", true, "SELECT pg_current_xlog_location()", "0/5000"),
        ("db1", false, "SELECT pg_last_xlog_replay_location()", "0/4000"),
    ] {
        h.sim.add_host(host);
        h.sim.reply(host, "SELECT current_setting('server_version_num')", SimReply::scalar("90000"));
        h.sim.reply(host, "SELECT pg_is_in_recovery()", SimReply::scalar(if primary { "f" } else { "t" }));
        h.sim.reply(host, sql, SimReply::scalar(pos));
    }

    let mut monitor = h.monitor();
    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.node(NodeId(1)).unwrap().lag, Probe::Ok(0x1000));
    assert_eq!(report.replication_status, None);
    assert!(report.node(NodeId(2)).is_none());
    assert!(!h
        .sim
        .queries("db0")
        .iter()
        .any(|q| q.contains("pg_stat_replication")));
    assert_eq!(monitor.versions().cached(NodeId(0)), Some(90_000));
}

#[tokio::test]
async fn test_server_version_is_queried_once() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[]);

    let mut monitor = h.monitor();
    monitor.run_cycle().await.unwrap();
    monitor.run_cycle().await.unwrap();
    let version_queries = h
        .sim
        .queries("db1")
        .iter()
        .filter(|q| q.contains("server_version_num"))
        .count();
    assert_eq!(version_queries, 1);
}

#[tokio::test]
async fn test_malformed_position_fails_cycle_and_tears_down() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "garbage");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[]);

    let err = h.monitor().run_cycle().await.unwrap_err();
    assert!(matches!(err, harbor_common::HarborError::Lsn(_)));
    assert_eq!(h.sim.open_connections(), 0);
}

#[tokio::test]
async fn test_no_primary_skips_lag_check() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.directory.set_primary(None);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/1000");

    let report = h.monitor().run_cycle().await.unwrap();
    assert!(!report.lag_checked);
    assert!(report.nodes.is_empty());
    assert!(!h.sim.queries("db0").iter().any(|q| q.contains("lsn")));
}

#[tokio::test]
async fn test_false_primary_is_degenerated_when_policy_allows() {
    let mut config = Harness::new([BackendStatus::Up; 3]).config;
    config.cluster.detach_false_primary = true;
    let h = Harness::with_config(config);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    // db2 was promoted behind the proxy's back.
    h.pg_host("db2", true, "0/1000");
    h.sim.reply("db2", "SELECT pg_last_wal_replay_lsn()", SimReply::null());
    h.replication_rows(&[]);

    let mut monitor = h.monitor();
    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.verdicts[2], NodeVerdict::Invalid);
    assert_eq!(report.degenerated, vec![NodeId(2)]);
    assert_eq!(h.directory.status(NodeId(2)), Some(BackendStatus::Down));
    assert_eq!(h.events.by_category(EventCategory::Degeneration).len(), 1);
    assert_eq!(monitor.metrics().snapshot().degeneration_requests, 1);
}

#[tokio::test]
async fn test_false_primary_left_alone_without_policy() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", true, "0/1000");
    h.sim.reply("db1", "SELECT pg_last_wal_replay_lsn()", SimReply::null());
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[]);

    let report = h.monitor().run_cycle().await.unwrap();
    assert_eq!(report.verdicts[1], NodeVerdict::Invalid);
    assert!(report.degenerated.is_empty());
    assert!(h.directory.is_up(NodeId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_worker_honours_shutdown_at_loop_top() {
    let h = Harness::new([BackendStatus::Up; 3]);
    h.pg_host("db0", true, "0/1000");
    h.pg_host("db1", false, "0/1000");
    h.pg_host("db2", false, "0/1000");
    h.replication_rows(&[]);

    let signal = harbor_common::signal::WorkerSignal::new();
    let handle = h.monitor().spawn(signal.clone());
    tokio::time::sleep(Duration::from_secs(25)).await;
    handle.stop();
    let metrics = handle.metrics.clone();
    assert_eq!(handle.join().await.unwrap(), MonitorExit::Shutdown);

    // Cycles at t=0, 10 and 20.
    assert_eq!(metrics.snapshot().cycles_ok, 3);
    assert_eq!(h.sim.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_check_idles_without_contacting_backends() {
    let mut config = Harness::new([BackendStatus::Up; 3]).config;
    config.sr_check.period_secs = 0;
    let h = Harness::with_config(config);

    let signal = harbor_common::signal::WorkerSignal::new();
    let handle = h.monitor().spawn(signal.clone());
    tokio::time::sleep(Duration::from_secs(95)).await;
    signal.request(harbor_common::signal::WorkerRequest::Restart);
    assert_eq!(handle.join().await.unwrap(), MonitorExit::Restart);
    assert!(h.sim.calls().is_empty());
}

#[test]
fn test_non_streaming_mode_sleeps_for_period() {
    let mut config = Harness::new([BackendStatus::Up; 3]).config;
    config.cluster.mode = harbor_common::config::ClusterMode::Raw;
    config.sr_check.period_secs = 10;
    let h = Harness::with_config(config.clone());
    let monitor = h.monitor();
    assert!(!monitor.checking_enabled());
    assert_eq!(monitor.sleep_interval(), Duration::from_secs(10));

    config.sr_check.period_secs = 0;
    let monitor = Harness::with_config(config).monitor();
    assert_eq!(monitor.sleep_interval(), Duration::from_secs(30));
}
