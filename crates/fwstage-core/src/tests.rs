use super::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> HostLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "fwstage-core-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    HostLayout::new(path)
}

#[derive(Default)]
struct ScriptedRunner {
    responses: HashMap<String, CommandResult>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    fn with(mut self, command: &str, result: CommandResult) -> Self {
        self.responses.insert(command.to_string(), result);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &str) -> anyhow::Result<CommandResult> {
        self.calls.borrow_mut().push(command.to_string());
        Ok(self
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| CommandResult::failure(127, "not scripted")))
    }
}

#[test]
fn revision_suffix_is_stripped_before_comparison() {
    let with_suffix = VersionInfo::parse("26.1.2_5").expect("must parse");
    let plain = VersionInfo::parse("26.1.2").expect("must parse");
    assert_eq!(with_suffix, plain);
    assert_eq!(with_suffix, VersionInfo::new(26, 1, 2, 0));
}

#[test]
fn missing_components_default_to_zero() {
    assert_eq!(
        VersionInfo::parse("26.7").expect("must parse"),
        VersionInfo::new(26, 7, 0, 0)
    );
    assert_eq!(
        VersionInfo::parse(" 24.7.12.1\n").expect("must parse"),
        VersionInfo::new(24, 7, 12, 1)
    );
}

#[test]
fn malformed_versions_are_rejected() {
    for raw in ["", "26", "26.x.1", "26.13.1", "26.0", "1.2.3.4.5", "26..1"] {
        assert!(VersionInfo::parse(raw).is_err(), "'{raw}' must not parse");
    }
}

#[test]
fn classifies_minor_and_major_moves() {
    let v = |raw: &str| VersionInfo::parse(raw).expect("must parse");
    assert_eq!(v("26.1.2").upgrade_kind_to(&v("26.1.3")), UpgradeKind::Minor);
    assert_eq!(v("26.1.9").upgrade_kind_to(&v("26.7.0")), UpgradeKind::Major);
    assert_eq!(v("26.1.2").upgrade_kind_to(&v("26.1.2_3")), UpgradeKind::None);
    assert_eq!(v("26.7").upgrade_kind_to(&v("26.1.9")), UpgradeKind::None);
    assert!(v("26.1.2.1").is_minor_candidate_for(&v("26.1.2")));
    assert!(!v("26.7").is_minor_candidate_for(&v("26.1.2")));
    assert!(v("27.1").is_major_candidate_for(&v("26.7.4")));
}

#[test]
fn display_omits_zero_revision() {
    assert_eq!(VersionInfo::new(26, 1, 2, 0).to_string(), "26.1.2");
    assert_eq!(VersionInfo::new(24, 7, 12, 1).to_string(), "24.7.12.1");
    assert_eq!(Branch::new(26, 7).to_string(), "26.7");
}

#[test]
fn branch_successors_follow_release_cadence() {
    assert_eq!(
        Branch::new(26, 1).successors(),
        [Branch::new(26, 7), Branch::new(27, 1)]
    );
    assert_eq!(
        Branch::new(25, 7).successors(),
        [Branch::new(26, 1), Branch::new(26, 7)]
    );
}

#[test]
fn branch_target_is_reached_by_any_version_on_branch() {
    let target = VersionTarget::parse("26.7").expect("must parse");
    assert!(target.branch_only);
    assert_eq!(target.to_string(), "26.7");
    assert!(target.is_reached_by(&VersionInfo::new(26, 7, 0, 0)));
    assert!(target.is_reached_by(&VersionInfo::new(26, 7, 3, 0)));
    assert!(!target.is_reached_by(&VersionInfo::new(26, 1, 9, 0)));
}

#[test]
fn exact_target_requires_the_version_itself() {
    let target = VersionTarget::parse("26.1.3_1").expect("must parse");
    assert!(!target.branch_only);
    assert_eq!(target.to_string(), "26.1.3");
    assert!(target.is_reached_by(&VersionInfo::new(26, 1, 3, 0)));
    assert!(!target.is_reached_by(&VersionInfo::new(26, 1, 2, 0)));
}

#[test]
fn stage_codes_are_stable() {
    let codes = StageId::sequence(false)
        .into_iter()
        .map(StageId::code)
        .collect::<Vec<_>>();
    assert_eq!(codes, vec![1, 2, 3, 4, 6, 7, 8, 10]);
    assert_eq!(StageId::from_code(6).expect("known code"), StageId::FixPkg);
    assert!(StageId::from_code(5).is_err());
    assert_eq!(StageId::BaseKernel.to_string(), "BASE_KERNEL");
}

#[test]
fn minor_sequence_skips_fix_pkg() {
    assert!(!StageId::sequence(true).contains(&StageId::FixPkg));
    assert!(StageId::sequence(false).contains(&StageId::FixPkg));
    assert_eq!(StageId::BaseKernel.next_for(true), Some(StageId::Packages));
    assert_eq!(StageId::BaseKernel.next_for(false), Some(StageId::FixPkg));
    assert_eq!(StageId::Done.next_for(false), None);
}

#[test]
fn parses_checkpoint_written_by_earlier_tool() {
    let raw = r#"{"stage": 4, "version": "26.7", "timestamp": 1771700000, "minor_only": false, "force_mode": true, "log_file": "/var/log/opnsense-upgrades/opnsense-upgrade-20260221-141423.log"}"#;
    let state = parse_upgrade_state(raw).expect("must parse");
    assert_eq!(state.stage, StageId::BaseKernel);
    assert_eq!(state.target, VersionTarget::parse("26.7").expect("target"));
    assert!(state.force_mode);
    assert!(!state.minor_only);
    assert_eq!(state.created_at, 1_771_700_000);
}

#[test]
fn serialized_checkpoint_uses_integer_stage_codes() {
    let state = UpgradeState::new(
        StageId::Packages,
        VersionTarget::parse("26.1.3").expect("target"),
        true,
        false,
        PathBuf::from("/var/log/run.log"),
    );
    let raw = serialize_upgrade_state(&state).expect("must serialize");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(value["stage"], 7);
    assert_eq!(value["version"], "26.1.3");
    assert_eq!(value["log_file"], "/var/log/run.log");
    assert_eq!(parse_upgrade_state(&raw).expect("must parse"), state);
}

#[test]
fn rejects_unknown_stage_code_and_garbage() {
    assert!(parse_upgrade_state(r#"{"stage": 5, "version": "26.7", "timestamp": 0}"#).is_err());
    assert!(parse_upgrade_state("{not json").is_err());
    assert!(parse_upgrade_state(r#"{"stage": 1, "version": "latest", "timestamp": 0}"#).is_err());
}

#[test]
fn config_defaults_apply_to_missing_fields() {
    let config = parse_config("version = 1\nmin_free_mb = 500\n").expect("must parse");
    assert_eq!(config.min_free_mb, 500);
    assert_eq!(config.resume_settle_secs, DEFAULT_RESUME_SETTLE_SECS);
    assert_eq!(config.critical_services, vec!["configd", "syslog-ng"]);
    assert_eq!(config.host_root, PathBuf::from("/"));
}

#[test]
fn config_rejects_unknown_version() {
    let err = parse_config("version = 7\n").expect_err("unsupported version must fail");
    assert!(err.to_string().contains("unsupported config version 7"));
}

#[test]
fn missing_optional_config_falls_back_to_defaults() {
    let layout = test_layout();
    let path = layout.root().join("absent.toml");
    let config = UpgradeConfig::load(&path, false).expect("defaults");
    assert_eq!(config, UpgradeConfig::default());
    assert!(UpgradeConfig::load(&path, true).is_err());
}

#[test]
fn layout_paths_are_rooted() {
    let layout = HostLayout::new("/tmp/host");
    assert_eq!(
        layout.state_path(),
        PathBuf::from("/tmp/host/var/db/opnsense-upgrade.state")
    );
    assert_eq!(
        layout.resume_hook_path(),
        PathBuf::from("/tmp/host/etc/rc.local.d/99-opnsense-upgrade-resume")
    );
    assert_eq!(
        layout.run_log_path("dryrun", "20260101-000000"),
        PathBuf::from("/tmp/host/var/log/opnsense-upgrades/opnsense-dryrun-20260101-000000.log")
    );
}

#[test]
fn dry_run_intercepts_mutating_commands_only() {
    let runner = ScriptedRunner::default().with("opnsense-version -v", CommandResult::success("26.1.1\n"));
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);

    let result = executor.run("pkg autoremove -y", true).expect("synthetic success");
    assert!(result.succeeded());
    assert_eq!(
        executor.inspect("opnsense-version -v").as_deref(),
        Some("26.1.1\n")
    );
    assert_eq!(runner.calls(), vec!["opnsense-version -v"]);
    assert_eq!(executor.planned_commands(), vec!["pkg autoremove -y"]);
    assert!(log.contains("would run: pkg autoremove -y"));
}

#[test]
fn strict_policy_surfaces_raw_output() {
    let runner = ScriptedRunner::default().with(
        "opnsense-update -ubkf",
        CommandResult {
            exit_code: 1,
            stdout: "fetching base".to_string(),
            stderr: "checksum mismatch".to_string(),
            duration: std::time::Duration::ZERO,
        },
    );
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, false);

    let err = executor
        .run_with("opnsense-update -ubkf", FailurePolicy::Strict)
        .expect_err("strict failure");
    let err = UpgradeError::from(err);
    assert_eq!(err.exit_code(), 5);
    let rendered = err.to_string();
    assert!(rendered.contains("checksum mismatch"));
    assert!(rendered.contains("fetching base"));
}

#[test]
fn best_effort_policy_only_warns() {
    let runner = ScriptedRunner::default().with("pkg clean -ay", CommandResult::failure(3, "busy"));
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, false);

    executor
        .run_with("pkg clean -ay", FailurePolicy::BestEffort)
        .expect("best effort never fails");
    assert!(log.contains("reported errors"));
}

#[test]
fn recheck_policy_trusts_post_hoc_state() {
    let runner = ScriptedRunner::default().with("opnsense-update -p", CommandResult::failure(1, ""));
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, false);

    let reached = || true;
    executor
        .run_with("opnsense-update -p", FailurePolicy::Recheck(&reached))
        .expect("post-check confirms the upgrade");

    let missing = || false;
    let err = executor
        .run_with("opnsense-update -p", FailurePolicy::Recheck(&missing))
        .expect_err("post-check shows nothing changed");
    assert!(matches!(
        UpgradeError::from(err),
        UpgradeError::CommandFailure { .. }
    ));
}

#[test]
fn taxonomy_errors_survive_anyhow_round_trip() {
    let err: anyhow::Error = UpgradeError::SafetyGateBlocked("minor update pending".into()).into();
    let err = UpgradeError::from(err.context("while planning"));
    assert!(matches!(err, UpgradeError::SafetyGateBlocked(_)));

    let other = UpgradeError::from(anyhow::anyhow!("disk on fire"));
    assert_eq!(other.exit_code(), 1);
}

#[test]
fn run_log_writes_plain_text_file() {
    let layout = test_layout();
    let log = RunLog::create(&layout, RunKind::Query);
    log.section("Version survey");
    log.info("current 26.1.1");
    log.append_raw("raw output line\n");

    let raw = fs::read_to_string(log.path()).expect("log file must exist");
    assert!(raw.contains("=== Version survey ==="));
    assert!(raw.contains("[INFO] current 26.1.1"));
    assert!(raw.contains("raw output line"));
    assert!(log
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("opnsense-query-")));

    let _ = fs::remove_dir_all(layout.root());
}
