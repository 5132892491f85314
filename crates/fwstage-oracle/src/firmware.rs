//! Parsing of `configctl firmware status`, which answers either as a JSON document or as
//! freeform package-manager text depending on the firmware backend state.

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::Value;

use fwstage_core::VersionInfo;

const PENDING_PACKAGE_FIELDS: [&str; 5] = [
    "upgrade_packages",
    "new_packages",
    "reinstall_packages",
    "downgrade_packages",
    "remove_packages",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareReport {
    pub product_version: Option<VersionInfo>,
    pub product_latest: Option<VersionInfo>,
    pub upgrade_major: Option<VersionInfo>,
    /// Target of an `opnsense: A -> B` line in the package plan.
    pub package_upgrade: Option<VersionInfo>,
    pub needs_reboot: bool,
    pub pending_packages: bool,
    pub status: Option<String>,
    pub last_check: Option<String>,
}

impl FirmwareReport {
    pub fn minor_candidate(&self, current: &VersionInfo) -> Option<VersionInfo> {
        [self.package_upgrade, self.product_latest]
            .into_iter()
            .flatten()
            .find(|version| version.is_minor_candidate_for(current))
    }

    pub fn major_candidate(&self, current: &VersionInfo) -> Option<VersionInfo> {
        [self.upgrade_major, self.package_upgrade, self.product_latest]
            .into_iter()
            .flatten()
            .find(|version| version.is_major_candidate_for(current))
    }
}

pub fn parse_firmware_status(raw: &str) -> FirmwareReport {
    let mut report = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(document) if document.is_object() => report_from_json(&document),
        _ => report_from_text(raw),
    };
    report.package_upgrade = package_plan_target(raw);
    report
}

fn report_from_json(document: &Value) -> FirmwareReport {
    let version = |names: &[&str]| -> Option<VersionInfo> {
        names
            .iter()
            .filter_map(|name| json_field(document, name).and_then(Value::as_str))
            .find_map(|raw| VersionInfo::parse(raw).ok())
    };
    let text = |name: &str| -> Option<String> {
        json_field(document, name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(str::to_string)
    };

    FirmwareReport {
        product_version: version(&["product_version"]),
        product_latest: version(&["product_latest"]),
        upgrade_major: version(&["upgrade_major_version", "CORE_NEXT"]),
        package_upgrade: None,
        needs_reboot: json_field(document, "needs_reboot").is_some_and(is_truthy_flag),
        pending_packages: PENDING_PACKAGE_FIELDS
            .iter()
            .any(|name| json_field(document, name).is_some_and(is_non_empty)),
        status: text("status"),
        last_check: text("last_check"),
    }
}

// Newer backends nest product details under `product`.
fn json_field<'a>(document: &'a Value, name: &str) -> Option<&'a Value> {
    document
        .get(name)
        .or_else(|| document.get("product").and_then(|product| product.get(name)))
}

fn report_from_text(raw: &str) -> FirmwareReport {
    let version = |name: &str| text_field(raw, name).and_then(|value| VersionInfo::parse(&value).ok());
    FirmwareReport {
        product_version: version("product_version"),
        product_latest: version("product_latest"),
        upgrade_major: version("upgrade_major_version"),
        ..FirmwareReport::default()
    }
}

fn text_field(text: &str, field: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#""{}"\s*:\s*"([^"]+)""#, regex::escape(field))).ok()?;
    pattern
        .captures(text)
        .map(|captures| captures[1].to_string())
}

fn package_plan_target(raw: &str) -> Option<VersionInfo> {
    let pattern =
        Regex::new(r"(?m)^\s*opnsense:\s+[\d.]+(?:_\d+)?\s+->\s+([\d.]+)(?:_\d+)?").ok()?;
    let captures = pattern.captures(raw)?;
    VersionInfo::parse(&captures[1]).ok()
}

fn is_truthy_flag(value: &Value) -> bool {
    match value {
        Value::String(raw) => raw.trim() == "1",
        Value::Number(number) => number.as_u64() == Some(1),
        Value::Bool(flag) => *flag,
        _ => false,
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(items) => !items.is_empty(),
        Value::String(raw) => !raw.trim().is_empty(),
        Value::Number(number) => number.as_u64().is_some_and(|count| count > 0),
        Value::Bool(flag) => *flag,
        Value::Null => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootAssessment {
    pub needs_reboot: bool,
    pub is_stale: bool,
    pub explanation: String,
}

/// Decides whether a firmware "reboot required" flag is genuine.
///
/// This is a heuristic and is expected to be revised as firmware backends change. A flag with
/// no pending packages and status `none` is a leftover from an update that was already
/// rebooted. Otherwise the flag is stale when the system has been up for less time than has
/// passed since the last firmware check, because that check then predates the current boot.
pub fn assess_reboot(
    report: &FirmwareReport,
    uptime_secs: Option<u64>,
    now: NaiveDateTime,
) -> RebootAssessment {
    if !report.needs_reboot {
        return RebootAssessment {
            needs_reboot: false,
            is_stale: false,
            explanation: "No reboot required.".to_string(),
        };
    }

    if !report.pending_packages && report.status.as_deref() == Some("none") {
        return RebootAssessment {
            needs_reboot: true,
            is_stale: true,
            explanation: "Reboot flag is set but no packages are pending and the system is up to \
                          date; it is left over from an update that was already applied."
                .to_string(),
        };
    }

    let last_check_age = report
        .last_check
        .as_deref()
        .and_then(|raw| last_check_age_secs(raw, now));
    match (uptime_secs, last_check_age) {
        (Some(uptime), Some(age)) if (uptime as i64) < age => RebootAssessment {
            needs_reboot: true,
            is_stale: true,
            explanation: format!(
                "Reboot flag appears stale: up {}m but the last firmware check was {}m ago, \
                 before this boot.",
                uptime / 60,
                age / 60
            ),
        },
        (Some(uptime), Some(age)) => RebootAssessment {
            needs_reboot: true,
            is_stale: false,
            explanation: format!(
                "Reboot flag appears genuine: up {}m and the last firmware check {}m ago \
                 still reports a reboot is needed.",
                uptime / 60,
                age / 60
            ),
        },
        _ => RebootAssessment {
            needs_reboot: true,
            is_stale: false,
            explanation: "Reboot flag is set; staleness unknown (uptime or last check unavailable)."
                .to_string(),
        },
    }
}

/// Seconds since a `last_check` stamp such as `Sat Feb 21 14:14:23 EST 2026`. The zone name
/// is dropped and the stamp read as local time.
pub fn last_check_age_secs(raw: &str, now: NaiveDateTime) -> Option<i64> {
    let zone = Regex::new(r"^[A-Z]{2,5}$").ok()?;
    let cleaned = raw
        .split_whitespace()
        .filter(|token| !zone.is_match(token))
        .collect::<Vec<_>>()
        .join(" ");
    let checked_at = NaiveDateTime::parse_from_str(&cleaned, "%a %b %d %H:%M:%S %Y").ok()?;
    Some((now - checked_at).num_seconds())
}

/// Uptime from a `top` header carrying `up D+HH:MM:SS` or `up HH:MM:SS`.
pub fn parse_uptime_header(header: &str) -> Option<u64> {
    let with_days = Regex::new(r"up\s+(\d+)\+(\d+):(\d+):(\d+)").ok()?;
    if let Some(captures) = with_days.captures(header) {
        let part = |index: usize| captures[index].parse::<u64>().ok();
        return Some(part(1)? * 86_400 + part(2)? * 3_600 + part(3)? * 60 + part(4)?);
    }
    let clock = Regex::new(r"up\s+(\d+):(\d+):(\d+)").ok()?;
    let captures = clock.captures(header)?;
    let part = |index: usize| captures[index].parse::<u64>().ok();
    Some(part(1)? * 3_600 + part(2)? * 60 + part(3)?)
}
