use agentboard::core::claims::ClaimChain;
use agentboard::core::config::BoardConfig;
use agentboard::core::error::BoardError;
use agentboard::core::events::EventLog;
use agentboard::core::fold::{AGENT_REGISTERED, FINDING_ADDED, FindingType};
use agentboard::core::store::Store;
use serde_json::json;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn test_config() -> BoardConfig {
    BoardConfig {
        fsync: false,
        claim_poll_ms: 5,
        ..BoardConfig::default()
    }
}

fn event_log(root: &Path) -> EventLog {
    EventLog::new(Store::new(root), test_config())
}

fn claim_chain(root: &Path, lease_ms: u64) -> ClaimChain {
    ClaimChain::new(
        Store::new(root),
        BoardConfig {
            lease_ms,
            ..test_config()
        },
    )
}

fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log");
    file.write_all(bytes).expect("raw write");
}

#[test]
fn missing_and_empty_storage_replay_to_empty_state() {
    let tmp = tempdir().expect("tempdir");

    let never_created = event_log(&tmp.path().join("does/not/exist"));
    let state = never_created.get_current_state().expect("missing dir");
    assert!(state.agents.is_empty());
    assert!(state.findings.is_empty());

    let log = event_log(tmp.path());
    fs::write(log.path(), b"").expect("touch");
    assert!(log.get_current_state().expect("empty file").is_empty());
    assert!(log.read_events().expect("events").is_empty());
}

#[test]
fn fresh_reader_sees_appended_events() {
    let tmp = tempdir().expect("tempdir");
    {
        let writer = event_log(tmp.path());
        writer
            .append_event(AGENT_REGISTERED, json!({"agent_id": "agent-1", "task": "test"}))
            .expect("register");
        writer
            .append_event(
                FINDING_ADDED,
                json!({"agent_id": "agent-1", "finding_type": "fact", "content": "Test"}),
            )
            .expect("finding");
    }

    let reader = event_log(tmp.path());
    let state = reader.get_current_state().expect("replay");
    assert_eq!(state.agents.len(), 1);
    assert!(state.agents.contains_key("agent-1"));
    assert_eq!(state.findings.len(), 1);
    assert_eq!(state.findings[0].finding_type, FindingType::Fact);
}

#[test]
fn replay_is_deterministic() {
    let tmp = tempdir().expect("tempdir");
    let log = event_log(tmp.path());
    for i in 0..20 {
        let agent = format!("a{}", i % 4);
        log.append_event(
            AGENT_REGISTERED,
            json!({"agent_id": agent, "task": format!("t{}", i)}),
        )
        .expect("append");
        log.append_event(
            FINDING_ADDED,
            json!({"agent_id": agent, "finding_type": "hypothesis", "content": format!("f{}", i)}),
        )
        .expect("append");
    }

    let first = log.get_current_state().expect("first");
    let second = event_log(tmp.path()).get_current_state().expect("second");
    assert_eq!(first, second);
    assert_eq!(first.agents.len(), 4);
    assert_eq!(first.agents["a3"].task, "t19");
    assert_eq!(first.findings.len(), 20);
}

#[test]
fn torn_tail_is_invisible_and_healed_by_next_append() {
    let tmp = tempdir().expect("tempdir");
    let log = event_log(tmp.path());
    log.append_event(AGENT_REGISTERED, json!({"agent_id": "a", "task": "t"}))
        .expect("append");

    // A writer died half-way through its record.
    append_raw(&log.path(), br#"{"seq":2,"event_id":"x","event_type":"finding.ad"#);

    let report = log.replay().expect("replay");
    assert!(report.is_clean(), "in-flight tail must not be reported: {:?}", report.skipped);
    assert_eq!(report.last_seq, 1);
    assert_eq!(report.state.agents.len(), 1);

    let ev = log
        .append_event(
            FINDING_ADDED,
            json!({"agent_id": "a", "finding_type": "fact", "content": "c"}),
        )
        .expect("append after crash");
    assert_eq!(ev.seq, 2);

    let raw = fs::read_to_string(log.path()).expect("read log");
    assert_eq!(raw.lines().count(), 2);
    assert!(raw.ends_with('\n'));
    let report = log.replay().expect("replay");
    assert!(report.is_clean());
    assert_eq!(report.state.findings.len(), 1);
}

#[test]
fn malformed_and_unknown_records_do_not_poison_replay() {
    let tmp = tempdir().expect("tempdir");
    let log = event_log(tmp.path());
    log.append_event(AGENT_REGISTERED, json!({"agent_id": "a", "task": "t"}))
        .expect("append");
    append_raw(&log.path(), b"this is not json\n");
    log.append_event("agent.heartbeat", json!({"agent_id": "a"}))
        .expect("append unknown");
    log.append_event(FINDING_ADDED, json!({"agent_id": "a"}))
        .expect("append rejected payload");
    log.append_event(
        FINDING_ADDED,
        json!({"agent_id": "b", "finding_type": "warning", "content": "w"}),
    )
    .expect("append");

    let report = log.replay().expect("replay");
    assert_eq!(report.state.agents.len(), 1);
    assert_eq!(report.state.findings.len(), 1);
    assert_eq!(report.state.findings[0].agent_id, "b");
    assert_eq!(report.unknown_types.get("agent.heartbeat"), Some(&1));

    let skipped_lines: Vec<u64> = report.skipped.iter().map(|s| s.line).collect();
    assert_eq!(skipped_lines, vec![2, 4]);
    // The garbage line does not break seq assignment either.
    assert_eq!(report.last_seq, 4);
}

#[test]
fn append_rejects_non_object_payloads() {
    let tmp = tempdir().expect("tempdir");
    let log = event_log(tmp.path());
    let err = log
        .append_event(AGENT_REGISTERED, json!(["not", "an", "object"]))
        .expect_err("array payload");
    assert!(matches!(err, BoardError::ValidationError(_)));
    assert!(!log.path().exists());
}

#[test]
fn concurrent_appends_get_gapless_unique_sequence_numbers() {
    let tmp = tempdir().expect("tempdir");
    let threads = 8;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let root = tmp.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let log = event_log(&root);
                barrier.wait();
                for i in 0..per_thread {
                    log.append_event(
                        FINDING_ADDED,
                        json!({
                            "agent_id": format!("w{}", t),
                            "finding_type": "fact",
                            "content": format!("{}-{}", t, i),
                        }),
                    )
                    .expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let events = event_log(tmp.path()).read_events().expect("read");
    assert_eq!(events.len(), threads * per_thread);
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
    assert_eq!(seqs, expected);

    // Per-writer order is preserved.
    for t in 0..threads {
        let mine: Vec<String> = events
            .iter()
            .filter(|e| e.payload["agent_id"] == format!("w{}", t))
            .map(|e| e.payload["content"].as_str().unwrap_or_default().to_string())
            .collect();
        let expected: Vec<String> = (0..per_thread).map(|i| format!("{}-{}", t, i)).collect();
        assert_eq!(mine, expected);
    }
}

#[test]
fn incremental_replay_matches_cold_replay() {
    let tmp = tempdir().expect("tempdir");
    let log = event_log(tmp.path());
    let mut cache = log.incremental();
    assert!(cache.state().expect("empty").is_empty());

    for i in 0..5 {
        log.append_event(AGENT_REGISTERED, json!({"agent_id": format!("a{}", i), "task": "t"}))
            .expect("append");
        append_raw(&log.path(), b"{\"partial\":");
        assert_eq!(cache.state().expect("cached"), log.get_current_state().expect("cold"));
    }
    assert_eq!(cache.state().expect("cached").agents.len(), 5);

    // Truncation invalidates the cache.
    fs::write(log.path(), b"").expect("truncate");
    assert!(cache.state().expect("after truncate").is_empty());
    log.append_event(AGENT_REGISTERED, json!({"agent_id": "z", "task": "t"}))
        .expect("append");
    assert_eq!(cache.state().expect("cached"), log.get_current_state().expect("cold"));
}

#[test]
fn concurrent_claims_never_both_succeed() {
    let tmp = tempdir().expect("tempdir");
    for round in 0..10 {
        let key = format!("resource-{}", round);
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["alpha", "beta"]
            .into_iter()
            .map(|agent| {
                let root = tmp.path().to_path_buf();
                let barrier = barrier.clone();
                let key = key.clone();
                thread::spawn(move || {
                    let chain = claim_chain(&root, 30_000);
                    barrier.wait();
                    chain.try_claim(&key, agent)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("claim thread"))
            .collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {}: {:?}", round, results);
        for r in &results {
            if let Err(e) = r {
                assert!(e.is_blocked(), "loser must see contention, got {:?}", e);
            }
        }
    }
}

#[test]
fn waiting_claim_succeeds_once_holder_releases() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 30_000);
    chain.try_claim("db", "holder").expect("first claim");

    let root = tmp.path().to_path_buf();
    let waiter = thread::spawn(move || {
        claim_chain(&root, 30_000).claim("db", "waiter", Duration::from_secs(5))
    });

    thread::sleep(Duration::from_millis(100));
    assert!(chain.release("db", "holder").expect("release"));

    let claim = waiter.join().expect("waiter thread").expect("claim after release");
    assert_eq!(claim.holder, "waiter");
}

#[test]
fn blocked_claim_times_out_with_holder_details() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 30_000);
    let held = chain.try_claim("db", "holder").expect("claim");

    let started = Instant::now();
    let err = chain
        .claim("db", "other", Duration::from_millis(80))
        .expect_err("should block");
    assert!(started.elapsed() >= Duration::from_millis(80));
    match err {
        BoardError::Blocked(blocked) => {
            assert_eq!(blocked.resource, "db");
            assert_eq!(blocked.holder, "holder");
            assert_eq!(blocked.expires_at_ms, held.expires_at_ms);
        }
        other => panic!("expected Blocked, got {:?}", other),
    }
}

#[test]
fn expired_lease_is_reclaimable_without_release() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 50);
    chain.try_claim("db", "crashed").expect("claim");
    assert!(chain.try_claim("db", "next").expect_err("still live").is_blocked());

    thread::sleep(Duration::from_millis(80));
    let claim = chain.try_claim("db", "next").expect("reclaim after expiry");
    assert_eq!(claim.holder, "next");
    assert_eq!(chain.inspect("db").expect("inspect"), Some(claim));
}

#[test]
fn renewal_keeps_token_and_non_holder_release_is_noop() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 30_000);
    let first = chain.try_claim("db", "a").expect("claim");
    thread::sleep(Duration::from_millis(5));

    let again = chain.try_claim("db", "a").expect("re-claim");
    assert_eq!(again.token, first.token);
    assert!(again.expires_at_ms >= first.expires_at_ms);

    let renewed = chain.renew(&again).expect("renew");
    assert_eq!(renewed.token, first.token);

    assert!(!chain.release("db", "b").expect("foreign release"));
    assert_eq!(chain.inspect("db").expect("inspect").map(|c| c.holder), Some("a".to_string()));

    assert!(chain.release("db", "a").expect("release"));
    assert!(matches!(
        chain.renew(&renewed),
        Err(BoardError::NotHolder { .. })
    ));
}

#[test]
fn claim_guard_releases_on_drop_and_reap_clears_expired() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 40);
    {
        let guard = chain
            .acquire("scoped", "a", Duration::ZERO)
            .expect("acquire");
        assert_eq!(guard.claim().holder, "a");
        assert_eq!(chain.list().expect("list").len(), 1);
    }
    assert!(chain.inspect("scoped").expect("inspect").is_none());

    chain.try_claim("x", "a").expect("claim x");
    chain.try_claim("y", "b").expect("claim y");
    thread::sleep(Duration::from_millis(60));
    assert!(chain.list().expect("list").is_empty());
    assert_eq!(chain.reap_expired().expect("reap"), 2);
    assert_eq!(chain.reap_expired().expect("reap again"), 0);
}

#[test]
fn resource_keys_map_to_distinct_files() {
    let tmp = tempdir().expect("tempdir");
    let chain = claim_chain(tmp.path(), 30_000);
    let keys = ["file:src/a.rs", "file:src/a_rs", "FILE:src/a.rs", "../../etc/passwd"];
    for key in keys {
        chain.try_claim(key, "a").expect("claim");
    }
    let listed: HashSet<String> = chain
        .list()
        .expect("list")
        .into_iter()
        .map(|c| c.resource_key)
        .collect();
    assert_eq!(listed.len(), keys.len());
    for entry in fs::read_dir(tmp.path().join("claims")).expect("claims dir") {
        let path = entry.expect("entry").path();
        assert_eq!(path.parent(), Some(tmp.path().join("claims").as_path()));
    }
}

#[test]
fn config_file_and_env_overrides_layer() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    fs::write(store.config_path(), "lease_ms = 1234\nfsync = false\n").expect("config");

    let mut config = BoardConfig::from_file(&store).expect("from file");
    assert_eq!(config.lease_ms, 1234);
    assert!(!config.fsync);
    assert_eq!(config.claim_poll_ms, BoardConfig::default().claim_poll_ms);

    config
        .apply_overrides(|key| (key == "AGENTBOARD_LEASE_MS").then(|| "99".to_string()))
        .expect("overrides");
    assert_eq!(config.lease_ms, 99);

    fs::write(store.config_path(), "lease_ms = \"soon\"\n").expect("bad config");
    assert!(matches!(
        BoardConfig::from_file(&store),
        Err(BoardError::ConfigError(_))
    ));
}
