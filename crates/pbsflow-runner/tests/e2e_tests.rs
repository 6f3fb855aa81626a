mod harness;
use harness::TestHarness;
use pbsflow_test_utils::harness::FakeQueue;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use std::fs;

#[test]
fn test_run_submits_held_roots_and_releases_once() {
    let harness = TestHarness::new();
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "1\n2\n");

    harness
        .cmd()
        .arg("run")
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success()
        .stdout(contains("Submitted 3 job(s)"));

    let qsub = harness.calls("qsub");
    assert_eq!(qsub.len(), 3);
    assert!(qsub[0].starts_with("-h "), "root job is held: {}", qsub[0]);
    assert!(qsub[1].starts_with("-W depend=afterok:1.fake-server "));
    assert!(qsub[2].contains("afterok:1.fake-server:2.fake-server"));
    assert_eq!(harness.calls("qrls"), vec!["1.fake-server".to_string()]);

    let log_dir = harness.log_dir("demo");
    let submissions = fs::read_to_string(log_dir.join("pipeline_batch_id_list.txt")).unwrap();
    assert_eq!(submissions.lines().count(), 3);
    assert!(log_dir.join("submit").join("first_copy.sh").exists());
    assert!(log_dir.join("submit").join("demo_cleanup.sh").exists());
}

#[test]
fn test_no_submit_contacts_no_resource_manager() {
    let harness = TestHarness::new();
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "x\n");

    harness
        .cmd()
        .args(["run", "--no-submit"])
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success()
        .stdout(contains("Prepared 3 job(s)"));

    assert!(harness.calls("qsub").is_empty());
    assert!(harness.calls("qrls").is_empty());
    assert!(harness.log_dir("demo").join("NO_SUBMIT").exists());

    harness
        .cmd()
        .arg("status")
        .arg(harness.log_dir("demo"))
        .assert()
        .success()
        .stdout(contains("NotSubmitted: 3"));
}

#[test]
fn test_missing_input_fails_before_submission() {
    let harness = TestHarness::new();
    let pipeline = harness.write_two_step_pipeline("demo");

    harness
        .cmd()
        .arg("run")
        .arg(&pipeline)
        .arg(harness.path("absent.txt"))
        .assert()
        .failure()
        .stderr(contains("[ERROR]").and(contains("absent.txt")));

    assert!(harness.calls("qsub").is_empty());
    assert!(!harness.log_dir("demo").exists());
}

#[test]
fn test_cancel_then_status_reports_canceled() {
    let harness = TestHarness::new();
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "x\n");
    harness
        .cmd()
        .arg("run")
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success();

    harness
        .cmd()
        .arg("cancel")
        .arg(harness.log_dir("demo"))
        .assert()
        .success()
        .stdout(contains("cancelled 3"));
    assert_eq!(harness.calls("qdel").len(), 3);

    harness
        .cmd()
        .arg("status")
        .arg(harness.log_dir("demo"))
        .assert()
        .success()
        .stdout(contains("Canceled: 3"));
}

#[test]
fn test_status_reads_status_files() {
    let harness = TestHarness::new();
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "x\n");
    harness
        .cmd()
        .arg("run")
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success();

    let log_dir = harness.log_dir("demo");
    fs::write(log_dir.join("first_copy-status.txt"), "exit_status=0\n").unwrap();
    fs::write(log_dir.join("second_count-status.txt"), "exit_status=-11\n").unwrap();

    harness
        .cmd()
        .arg("status")
        .arg(&log_dir)
        .assert()
        .success()
        .stdout(
            contains("Complete: 1")
                .and(contains("WalltimeExceeded: 1"))
                .and(contains("Deleted: 1")),
        );
}

#[test]
fn test_managed_runs_store_to_completion() {
    let harness = TestHarness::with_queue(FakeQueue::Finished(0));
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "x\n");
    let store = harness.path("jobs.db");

    harness
        .cmd()
        .args(["managed", "submit"])
        .arg(&store)
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success()
        .stdout(contains("with 3 job(s)"));
    assert!(harness.calls("qsub").is_empty());

    harness
        .cmd()
        .args(["managed", "start"])
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("demo").and(contains("Complete")));

    let qsub = harness.calls("qsub");
    assert_eq!(qsub.len(), 3);
    assert!(qsub.iter().all(|args| !args.contains("depend=")));

    harness
        .cmd()
        .args(["managed", "status"])
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("demo"));

    harness
        .cmd()
        .args(["managed", "submit"])
        .arg(&store)
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .failure()
        .stderr(contains("already started"));
}

#[test]
fn test_managed_failure_exits_nonzero() {
    let harness = TestHarness::with_queue(FakeQueue::Finished(1));
    let pipeline = harness.write_two_step_pipeline("demo");
    let input = harness.write_input("a.txt", "x\n");
    let store = harness.path("jobs.db");

    harness
        .cmd()
        .args(["managed", "submit"])
        .arg(&store)
        .arg(&pipeline)
        .arg(&input)
        .assert()
        .success();

    harness
        .cmd()
        .args(["managed", "start"])
        .arg(&store)
        .assert()
        .failure()
        .stderr(contains("1 of 1 pipeline(s) failed"));
    assert_eq!(harness.calls("qsub").len(), 1);
}

#[test]
fn test_managed_commands_need_existing_store() {
    let harness = TestHarness::new();
    harness
        .cmd()
        .args(["managed", "status"])
        .arg(harness.path("nope.db"))
        .assert()
        .failure()
        .stderr(contains("does not exist"));
}
