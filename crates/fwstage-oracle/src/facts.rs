use regex::Regex;

use fwstage_core::Executor;

use crate::firmware::parse_uptime_header;

pub const UPDATE_CHECK_COMMAND: &str = "opnsense-update -c 2>&1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiMismatch {
    pub base_major: String,
    pub pkg_major: String,
}

pub fn freebsd_release(executor: &Executor<'_>) -> Option<String> {
    executor
        .inspect("uname -r")
        .map(|raw| raw.trim().to_string())
}

pub fn freebsd_major(executor: &Executor<'_>) -> Option<String> {
    freebsd_release(executor).and_then(|release| {
        release
            .split('.')
            .next()
            .filter(|major| !major.is_empty())
            .map(str::to_string)
    })
}

pub fn machine_arch(executor: &Executor<'_>) -> Option<String> {
    executor
        .inspect("uname -m")
        .map(|raw| raw.trim().to_string())
}

/// FreeBSD major the installed pkg binary was built for.
pub fn pkg_abi_major(executor: &Executor<'_>) -> Option<String> {
    let pattern = Regex::new(r"FreeBSD:(\d+)").ok()?;
    let output = executor.capture("pkg -vv 2>/dev/null");
    pattern
        .captures(&output)
        .map(|captures| captures[1].to_string())
}

/// Base replaced but pkg still built for the old base.
pub fn abi_mismatch(executor: &Executor<'_>) -> Option<AbiMismatch> {
    let base_major = freebsd_major(executor)?;
    let pkg_major = pkg_abi_major(executor)?;
    (base_major != pkg_major).then_some(AbiMismatch {
        base_major,
        pkg_major,
    })
}

/// Output of the native update check, whatever its exit status.
pub fn update_check_output(executor: &Executor<'_>) -> String {
    executor.capture(UPDATE_CHECK_COMMAND)
}

pub fn reports_pending_update(update_check_output: &str) -> bool {
    update_check_output
        .to_ascii_lowercase()
        .contains("can be upgraded")
}

pub fn update_pending(executor: &Executor<'_>) -> bool {
    reports_pending_update(&update_check_output(executor))
}

pub fn free_disk_mb(executor: &Executor<'_>) -> Option<u64> {
    executor
        .inspect("df -m / | awk 'NR==2 {print $4}'")
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

pub fn pkg_process_running(executor: &Executor<'_>) -> bool {
    executor.check("pgrep -q pkg")
}

pub fn service_running(executor: &Executor<'_>, service: &str) -> bool {
    executor.check(&format!("service {service} status"))
}

/// Seconds since boot from `kern.boottime`, falling back to the `top` header.
pub fn uptime_secs(executor: &Executor<'_>, now_epoch: i64) -> Option<u64> {
    if let Some(boot_epoch) = executor
        .inspect("sysctl -n kern.boottime")
        .as_deref()
        .and_then(parse_boottime)
    {
        if now_epoch >= boot_epoch {
            return Some((now_epoch - boot_epoch) as u64);
        }
    }
    executor
        .inspect("top -b -d 1 | head -1")
        .as_deref()
        .and_then(parse_uptime_header)
}

/// Boot epoch from `{ sec = 1771700000, usec = 0 } Sat Feb 21 ...`.
pub fn parse_boottime(raw: &str) -> Option<i64> {
    let pattern = Regex::new(r"sec\s*=\s*(\d+)").ok()?;
    pattern.captures(raw)?[1].parse::<i64>().ok()
}
