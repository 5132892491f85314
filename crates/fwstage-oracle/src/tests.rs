use super::*;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use fwstage_core::{
    Branch, CommandResult, CommandRunner, Executor, HostLayout, RunLog, UpgradeError, VersionInfo,
};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> HostLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "fwstage-oracle-tests-{}-{}-{}",
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
    fn ok(mut self, command: &str, stdout: &str) -> Self {
        self.responses
            .insert(command.to_string(), CommandResult::success(stdout));
        self
    }

    fn program(self, name: &str) -> Self {
        self.ok(&format!("command -v {name} >/dev/null 2>&1"), "")
    }

    fn count(&self, command: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.as_str() == command)
            .count()
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

#[derive(Default)]
struct FakeMirror {
    existing: HashSet<String>,
    bodies: HashMap<String, String>,
}

impl FakeMirror {
    fn with_branch(mut self, mirror: &str, branch: Branch, meta_conf: &str) -> Self {
        let url = meta_conf_url(mirror, branch);
        self.existing.insert(url.clone());
        self.bodies.insert(url, meta_conf.to_string());
        self
    }
}

impl MirrorClient for FakeMirror {
    fn exists(&self, url: &str) -> bool {
        self.existing.contains(url)
    }

    fn fetch(&self, url: &str) -> Option<String> {
        self.bodies.get(url).cloned()
    }
}

const MIRROR: &str = "https://mirror.test/FreeBSD:14:amd64";

fn v(raw: &str) -> VersionInfo {
    VersionInfo::parse(raw).expect("version must parse")
}

fn at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, min, sec))
        .expect("valid timestamp")
}

#[test]
fn installed_version_output_shapes() {
    assert_eq!(
        parse_installed_version("OPNsense 26.1.1_5 (amd64)\n"),
        Some(v("26.1.1"))
    );
    assert_eq!(parse_installed_version("26.1.2\n"), Some(v("26.1.2")));
    assert_eq!(parse_installed_version(""), None);
}

#[test]
fn firmware_json_with_nested_product() {
    let raw = r#"{
        "status": "update",
        "needs_reboot": "0",
        "upgrade_packages": [{"name": "opnsense"}],
        "product": {
            "product_version": "26.1.1_2",
            "product_latest": "26.1.2",
            "CORE_NEXT": "26.7"
        }
    }"#;
    let report = parse_firmware_status(raw);
    assert_eq!(report.product_version, Some(v("26.1.1")));
    assert_eq!(report.minor_candidate(&v("26.1.1")), Some(v("26.1.2")));
    assert_eq!(report.major_candidate(&v("26.1.1")), Some(v("26.7")));
    assert!(report.pending_packages);
    assert!(!report.needs_reboot);
    assert_eq!(report.status.as_deref(), Some("update"));
}

#[test]
fn firmware_text_package_plan() {
    let raw = "Updating OPNsense repository catalogue...\nThe following 3 package(s) will be affected:\n\topnsense: 26.1.1 -> 26.1.2_5 [OPNsense]\n\tphp83: 8.3.1 -> 8.3.2 [OPNsense]\n";
    let report = parse_firmware_status(raw);
    assert_eq!(report.package_upgrade, Some(v("26.1.2")));
    assert_eq!(report.minor_candidate(&v("26.1.1")), Some(v("26.1.2")));
    assert_eq!(report.major_candidate(&v("26.1.1")), None);
}

#[test]
fn firmware_answer_equal_to_current_is_no_candidate() {
    let report = parse_firmware_status(r#"{"product_version": "26.1.2", "product_latest": "26.1.2_1"}"#);
    assert_eq!(report.minor_candidate(&v("26.1.2")), None);
}

#[test]
fn reboot_flag_absent() {
    let report = FirmwareReport::default();
    let assessment = assess_reboot(&report, Some(60), at(2026, 2, 21, 15, 0, 0));
    assert!(!assessment.needs_reboot);
    assert!(!assessment.is_stale);
}

// Heuristic under revision: leftover flags with nothing pending are stale regardless of uptime.
#[test]
fn reboot_flag_without_pending_packages_is_stale() {
    let report = FirmwareReport {
        needs_reboot: true,
        status: Some("none".to_string()),
        ..FirmwareReport::default()
    };
    let assessment = assess_reboot(&report, None, at(2026, 2, 21, 15, 0, 0));
    assert!(assessment.needs_reboot);
    assert!(assessment.is_stale);
}

#[test]
fn reboot_flag_older_than_boot_is_stale() {
    let report = FirmwareReport {
        needs_reboot: true,
        pending_packages: true,
        status: Some("update".to_string()),
        last_check: Some("Sat Feb 21 14:00:00 EST 2026".to_string()),
        ..FirmwareReport::default()
    };
    // Checked an hour ago, booted ten minutes ago.
    let assessment = assess_reboot(&report, Some(600), at(2026, 2, 21, 15, 0, 0));
    assert!(assessment.is_stale);

    // Booted two hours ago, checked one hour ago.
    let assessment = assess_reboot(&report, Some(7_200), at(2026, 2, 21, 15, 0, 0));
    assert!(!assessment.is_stale);
    assert!(assessment.explanation.contains("genuine"));
}

#[test]
fn reboot_flag_staleness_unknown_without_uptime() {
    let report = FirmwareReport {
        needs_reboot: true,
        pending_packages: true,
        last_check: Some("Sat Feb 21 14:00:00 EST 2026".to_string()),
        ..FirmwareReport::default()
    };
    let assessment = assess_reboot(&report, None, at(2026, 2, 21, 15, 0, 0));
    assert!(assessment.needs_reboot);
    assert!(!assessment.is_stale);
}

#[test]
fn last_check_stamp_ignores_zone_name() {
    assert_eq!(
        last_check_age_secs("Sat Feb 21 14:14:23 EST 2026", at(2026, 2, 21, 14, 24, 23)),
        Some(600)
    );
    assert_eq!(last_check_age_secs("yesterday", at(2026, 2, 21, 0, 0, 0)), None);
}

#[test]
fn uptime_header_formats() {
    assert_eq!(
        parse_uptime_header("last pid: 4121;  load averages:  0.10,  0.20,  0.30  up 2+03:04:05    14:14:23"),
        Some(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5)
    );
    assert_eq!(parse_uptime_header("up 01:08:14"), Some(4_094));
    assert_eq!(parse_uptime_header("load averages only"), None);
}

#[test]
fn boottime_sysctl_output() {
    assert_eq!(
        parse_boottime("{ sec = 1771700000, usec = 123 } Sat Feb 21 14:13:20 2026"),
        Some(1_771_700_000)
    );
}

#[test]
fn mirror_base_strips_version_path() {
    let conf = "OPNsense: {\n  url: \"pkg+https://pkg.opnsense.org/FreeBSD:14:amd64/26.1/latest\",\n  enabled: yes\n}\n";
    assert_eq!(
        mirror_from_repo_conf(conf).as_deref(),
        Some("https://pkg.opnsense.org/FreeBSD:14:amd64")
    );
    assert_eq!(mirror_from_repo_conf("OPNsense: { enabled: no }"), None);
}

#[test]
fn mirror_url_expands_abi_placeholder() {
    let layout = test_layout();
    let conf = layout.pkg_repo_conf_path();
    fs::create_dir_all(conf.parent().expect("parent")).expect("must create repo dir");
    fs::write(
        &conf,
        "OPNsense: {\n  url: \"pkg+https://pkg.opnsense.org/${ABI}/26.1/latest\",\n}\n",
    )
    .expect("must write repo conf");

    let runner = ScriptedRunner::default()
        .ok("uname -r", "14.3-RELEASE-p5\n")
        .ok("uname -m", "amd64\n");
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);

    assert_eq!(
        resolve_mirror_url(&executor, &layout, None),
        "https://pkg.opnsense.org/FreeBSD:14:amd64"
    );
    assert_eq!(
        resolve_mirror_url(&executor, &layout, Some("https://mirror.test/")),
        "https://mirror.test"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn packagesite_version_extraction() {
    let yaml = "{\"name\":\"opnsense-update\",\"version\":\"26.7\"}\n{\"name\":\"opnsense\",\"version\":\"26.7.1_2\",\"origin\":\"opnsense/opnsense\"}\n";
    assert_eq!(parse_packagesite_version(yaml), Some(v("26.7.1")));
    assert_eq!(parse_meta_conf_version("version = 2;\nabi = \"FreeBSD:14:amd64\";\n"), None);
}

#[test]
fn current_version_prefers_installed_version_tool() {
    let runner = ScriptedRunner::default()
        .ok("opnsense-version", "OPNsense 26.1.1_3 (amd64)\n")
        .ok("pkg query '%v' opnsense", "26.1.0\n");
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let current = oracle.resolve_current().expect("must resolve");
    assert_eq!(current.version, v("26.1.1"));
    assert_eq!(current.probe, "installed-version");
}

#[test]
fn current_version_falls_back_to_pkg_query() {
    let runner = ScriptedRunner::default().ok("pkg query '%v' opnsense", "26.1.1_1\n");
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let current = oracle.resolve_current().expect("must resolve");
    assert_eq!(current.probe, "pkg-query");
}

#[test]
fn unresolvable_current_version_is_fatal() {
    let runner = ScriptedRunner::default();
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let err = oracle.resolve_current().expect_err("nothing answers");
    assert!(matches!(err, UpgradeError::VersionUnresolvable(_)));
}

#[test]
fn stale_firmware_answer_falls_through_to_next_probe() {
    let runner = ScriptedRunner::default()
        .program("configctl")
        .ok(
            "configctl firmware status 2>&1",
            r#"{"product_version": "26.1.1", "product_latest": "26.1.1"}"#,
        )
        .program("opnsense-update")
        .ok(
            "opnsense-update -c 2>&1",
            "Your packages can be upgraded to 26.1.2_1\n",
        );
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let minor = oracle
        .resolve_minor_candidate(&v("26.1.1"))
        .expect("update-check answers");
    assert_eq!(minor.version, v("26.1.2"));
    assert_eq!(minor.probe, "update-check");
}

#[test]
fn firmware_status_is_queried_once_per_oracle() {
    let runner = ScriptedRunner::default().program("configctl").ok(
        "configctl firmware status 2>&1",
        r#"{"product_version": "26.1.1", "product_latest": "26.1.2", "upgrade_major_version": "26.7"}"#,
    );
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let survey = oracle.survey().expect("survey");
    assert_eq!(survey.current.probe, "firmware-status");
    assert_eq!(survey.minor.map(|found| found.version), Some(v("26.1.2")));
    assert_eq!(survey.major.map(|found| found.version), Some(v("26.7")));
    assert_eq!(runner.count("configctl firmware status 2>&1"), 1);
}

#[test]
fn major_candidate_from_mirror_branch_probe() {
    let packagesite = packagesite_commands(MIRROR, Branch::new(26, 7));
    let runner = ScriptedRunner::default().ok(
        &packagesite[0],
        "{\"name\":\"opnsense\",\"version\":\"26.7.1\"}\n",
    );
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default().with_branch(MIRROR, Branch::new(26, 7), "");
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let major = oracle
        .resolve_major_candidate(&v("26.1.9"))
        .expect("mirror has 26.7");
    assert_eq!(major.version, v("26.7.1"));
    assert_eq!(major.probe, "mirror-branch");
    assert!(oracle.branch_on_mirror(Branch::new(26, 7)));
    assert!(!oracle.branch_on_mirror(Branch::new(27, 1)));
}

#[test]
fn mirror_branch_without_catalog_reports_the_branch() {
    let runner = ScriptedRunner::default();
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let layout = test_layout();
    let mirror = FakeMirror::default().with_branch(MIRROR, Branch::new(27, 1), "version = 2;\n");
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let major = oracle
        .resolve_major_candidate(&v("26.7.4"))
        .expect("mirror has 27.1");
    assert_eq!(major.version, v("27.1"));
}

#[test]
fn changelog_directory_hints() {
    let layout = test_layout();
    let dir = layout.changelog_dir();
    fs::create_dir_all(&dir).expect("must create changelog dir");
    for name in ["26.1", "26.1.1", "26.1.2", "26.7", "index.json"] {
        fs::write(dir.join(name), "").expect("must write changelog entry");
    }

    let runner = ScriptedRunner::default();
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    let mirror = FakeMirror::default();
    let oracle = VersionOracle::new(ProbeContext::new(&executor, &layout, &mirror, MIRROR.into()));

    let minor = oracle
        .resolve_minor_candidate(&v("26.1.1"))
        .expect("changelog lists 26.1.2");
    assert_eq!((minor.version, minor.probe), (v("26.1.2"), "changelog"));
    let major = oracle
        .resolve_major_candidate(&v("26.1.1"))
        .expect("changelog lists 26.7");
    assert_eq!(major.version, v("26.7"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn abi_mismatch_detection() {
    let runner = ScriptedRunner::default()
        .ok("uname -r", "15.0-RELEASE\n")
        .ok("pkg -vv 2>/dev/null", "ABI = \"FreeBSD:14:amd64\";\n");
    let log = RunLog::in_memory();
    let executor = Executor::new(&runner, &log, true);
    assert_eq!(
        abi_mismatch(&executor),
        Some(AbiMismatch {
            base_major: "15".to_string(),
            pkg_major: "14".to_string(),
        })
    );

    let runner = ScriptedRunner::default()
        .ok("uname -r", "14.3-RELEASE-p5\n")
        .ok("pkg -vv 2>/dev/null", "ABI = \"FreeBSD:14:amd64\";\n");
    let executor = Executor::new(&runner, &log, true);
    assert_eq!(abi_mismatch(&executor), None);
}

#[test]
fn pending_update_phrase_is_case_insensitive() {
    assert!(reports_pending_update("Your system Can Be Upgraded"));
    assert!(!reports_pending_update("Your system is up to date."));
}
