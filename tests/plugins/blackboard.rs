use agentboard::core::config::BoardConfig;
use agentboard::core::error::BoardError;
use agentboard::core::fold::{BoardState, FindingType};
use agentboard::core::store::Store;
use agentboard::plugins::blackboard::Blackboard;
use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn board(root: &Path) -> Blackboard {
    let config = BoardConfig {
        fsync: false,
        claim_poll_ms: 5,
        ..BoardConfig::default()
    };
    Blackboard::new(Store::new(root), config)
}

fn run_agentboard(root: &Path, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agentboard"));
    cmd.arg("--root").arg(root).args(args);
    cmd.env_remove("AGENTBOARD_LOG");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd.output().expect("run agentboard")
}

fn json_stdout(out: &Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&out.stdout)
        )
    })
}

#[test]
fn never_written_workspace_has_empty_state() {
    let tmp = TempDir::new().expect("tmpdir");
    let state = board(&tmp.path().join("fresh")).get_full_state().expect("state");
    assert_eq!(state.agents.len(), 0);
    assert_eq!(state.findings.len(), 0);
    assert!(!tmp.path().join("fresh").exists(), "reads must not create storage");
}

#[test]
fn new_instance_recovers_previous_instance_state() {
    let tmp = TempDir::new().expect("tmpdir");
    {
        let first = board(tmp.path());
        first.register_agent("agent-1", "test task").expect("register");
        first
            .add_finding("agent-1", "fact", "Test finding")
            .expect("finding");
        // Dropped without any shutdown step, like a crashed process.
    }

    let second = board(tmp.path());
    let state = second.get_full_state().expect("state");
    let agent = state.agents.get("agent-1").expect("agent-1 present");
    assert_eq!(agent.task, "test task");
    assert_eq!(state.findings.len(), 1);
    assert_eq!(state.findings[0].content, "Test finding");
    assert_eq!(state.findings[0].finding_type, FindingType::Fact);
}

#[test]
fn re_registration_updates_task_without_duplicating() {
    let tmp = TempDir::new().expect("tmpdir");
    let board = board(tmp.path());
    board.register_agent("agent-1", "first").expect("register");
    let first = board.agent("agent-1").expect("agent").expect("present");
    thread::sleep(Duration::from_millis(1100));
    board.register_agent("agent-1", "second").expect("re-register");

    let state = board.get_full_state().expect("state");
    assert_eq!(state.agents.len(), 1);
    let agent = &state.agents["agent-1"];
    assert_eq!(agent.task, "second");
    assert_eq!(agent.registered_at, first.registered_at);
    assert_ne!(agent.updated_at, first.updated_at);
}

#[test]
fn findings_do_not_require_registration() {
    let tmp = TempDir::new().expect("tmpdir");
    let board = board(tmp.path());
    board
        .add_finding("ghost", "question", "who registered me?")
        .expect("finding");
    board
        .add_finding("ghost", "custom-tag", "kept verbatim")
        .expect("finding");

    let state = board.get_full_state().expect("state");
    assert!(state.agents.is_empty());
    let findings = board.findings_for("ghost").expect("findings");
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].finding_type, FindingType::Question);
    assert_eq!(
        findings[1].finding_type,
        FindingType::Other("custom-tag".to_string())
    );
}

#[test]
fn concurrent_threads_lose_and_duplicate_nothing() {
    let tmp = TempDir::new().expect("tmpdir");
    let threads = 6;
    let per_thread = 15;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let root = tmp.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let board = board(&root);
                barrier.wait();
                let mut acked = Vec::new();
                for i in 0..per_thread {
                    let agent = format!("agent-{}", t);
                    if i % 3 == 0 {
                        board
                            .register_agent(&agent, &format!("task-{}", i))
                            .expect("register");
                    } else {
                        let content = format!("finding-{}-{}", t, i);
                        board.add_finding(&agent, "fact", &content).expect("finding");
                        acked.push(content);
                    }
                    // Readers running alongside writers never see a torn record.
                    let report = board.replay_report().expect("replay");
                    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
                }
                acked
            })
        })
        .collect();

    let mut acked = HashSet::new();
    for handle in handles {
        acked.extend(handle.join().expect("worker"));
    }

    let state = board(tmp.path()).get_full_state().expect("state");
    assert_eq!(state.agents.len(), threads);
    let stored: Vec<&str> = state.findings.iter().map(|f| f.content.as_str()).collect();
    let unique: HashSet<&str> = stored.iter().copied().collect();
    assert_eq!(stored.len(), unique.len(), "duplicated findings");
    assert_eq!(unique.len(), acked.len());
    assert!(acked.iter().all(|c| unique.contains(c.as_str())));
    for t in 0..threads {
        assert_eq!(state.agents[&format!("agent-{}", t)].task, "task-12");
    }
}

#[test]
fn concurrent_same_id_registrations_keep_one_agent() {
    let tmp = TempDir::new().expect("tmpdir");
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let root = tmp.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let board = board(&root);
                barrier.wait();
                board.register_agent("shared", &format!("task-{}", t))
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker").expect("register");
    }

    let board = board(tmp.path());
    let state = board.get_full_state().expect("state");
    assert_eq!(state.agents.len(), 1);
    let last = board
        .event_log()
        .read_events()
        .expect("events")
        .pop()
        .expect("last event");
    assert_eq!(state.agents["shared"].task, last.payload["task"]);
    assert!(board.claims().list().expect("claims").is_empty());
}

#[test]
fn resource_claims_go_through_the_claim_chain() {
    let tmp = TempDir::new().expect("tmpdir");
    let a = board(tmp.path());
    let b = board(tmp.path());
    a.claim_resource("repo:main", "agent-a", Duration::ZERO)
        .expect("claim");
    let err = b
        .claim_resource("repo:main", "agent-b", Duration::from_millis(30))
        .expect_err("contended");
    assert!(err.is_blocked());
    assert!(!b.release_resource("repo:main", "agent-b").expect("noop"));
    assert!(a.release_resource("repo:main", "agent-a").expect("release"));
    b.claim_resource("repo:main", "agent-b", Duration::ZERO)
        .expect("claim after release");
}

#[test]
fn cli_round_trip_and_envelope() {
    let tmp = TempDir::new().expect("tmpdir");
    let root = tmp.path().join("board");

    let out = run_agentboard(&root, &["register", "--agent", "cli-1", "--task", "parse"], &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let out = run_agentboard(
        &root,
        &["finding", "--agent", "cli-1", "--type", "warning", "--content", "flaky test"],
        &[],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = run_agentboard(&root, &["--format", "json", "state"], &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let envelope = json_stdout(&out);
    assert_eq!(envelope["cmd"], "state");
    assert_eq!(envelope["status"], "ok");
    assert_eq!(envelope["envelope_version"], "1.0.0");
    let state: BoardState =
        serde_json::from_value(envelope["state"].clone()).expect("state payload");
    assert_eq!(state.agents["cli-1"].task, "parse");
    assert_eq!(state.findings[0].finding_type, FindingType::Warning);

    // The library sees what the CLI wrote.
    assert_eq!(board(&root).get_full_state().expect("state"), state);

    let out = run_agentboard(&root, &["--format", "json", "events", "--since", "1"], &[]);
    let envelope = json_stdout(&out);
    assert_eq!(envelope["count"], 1);
    assert_eq!(envelope["events"][0]["event_type"], "finding.added");
}

#[test]
fn cli_rejects_empty_agent() {
    let tmp = TempDir::new().expect("tmpdir");
    let out = run_agentboard(tmp.path(), &["register", "--agent", " ", "--task", "t"], &[]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("agent id must not be empty"));
}

#[test]
fn processes_contending_for_a_claim_never_both_win() {
    let tmp = TempDir::new().expect("tmpdir");
    let root = tmp.path().to_path_buf();
    let contenders = 6;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let root = root.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let agent = format!("proc-{}", i);
                barrier.wait();
                run_agentboard(
                    &root,
                    &["claim", "--resource", "deploy", "--agent", &agent],
                    &[],
                )
            })
        })
        .collect();

    let outputs: Vec<Output> = handles
        .into_iter()
        .map(|h| h.join().expect("contender"))
        .collect();
    let winners = outputs.iter().filter(|o| o.status.success()).count();
    assert_eq!(winners, 1);
    for out in outputs.iter().filter(|o| !o.status.success()) {
        assert_eq!(
            out.status.code(),
            Some(3),
            "loser must exit with the contention status: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
}

#[test]
fn expired_cli_claim_is_taken_over_by_another_process() {
    let tmp = TempDir::new().expect("tmpdir");
    let root = tmp.path();
    let short_lease = [("AGENTBOARD_LEASE_MS", "1000")];

    let claim_as = |agent: &str| {
        run_agentboard(root, &["claim", "--resource", "db", "--agent", agent], &short_lease)
    };

    let out = claim_as("first");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    // The first process has exited without releasing.
    let out = claim_as("second");
    assert_eq!(out.status.code(), Some(3));

    thread::sleep(Duration::from_millis(1300));
    let out = run_agentboard(
        root,
        &["--format", "json", "claim", "--resource", "db", "--agent", "second"],
        &short_lease,
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(json_stdout(&out)["claim"]["holder"], "second");

    let out = run_agentboard(
        root,
        &["--format", "json", "release", "--resource", "db", "--agent", "first"],
        &[],
    );
    assert!(out.status.success());
    assert_eq!(json_stdout(&out)["status"], "noop");
}

#[test]
fn concurrent_cli_appends_keep_every_record() {
    let tmp = TempDir::new().expect("tmpdir");
    let root = tmp.path().to_path_buf();
    let processes = 4;
    let per_process = 5;

    let handles: Vec<_> = (0..processes)
        .map(|p| {
            let root = root.clone();
            thread::spawn(move || {
                for i in 0..per_process {
                    let content = format!("p{}-{}", p, i);
                    let out = run_agentboard(
                        &root,
                        &["finding", "--agent", &format!("proc-{}", p), "--content", &content],
                        &[("AGENTBOARD_FSYNC", "0")],
                    );
                    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer");
    }

    let board = board(&root);
    let report = board.replay_report().expect("replay");
    assert!(report.is_clean());
    assert_eq!(report.state.findings.len(), processes * per_process);
    assert_eq!(report.last_seq, (processes * per_process) as u64);
}

#[test]
fn validation_errors_are_not_contention() {
    let tmp = TempDir::new().expect("tmpdir");
    let board = board(tmp.path());
    let err = board
        .claim_resource("", "agent", Duration::ZERO)
        .expect_err("empty key");
    assert!(matches!(err, BoardError::ValidationError(_)));
    assert!(!err.is_blocked());
}
