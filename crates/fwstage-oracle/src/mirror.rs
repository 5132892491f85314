use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use fwstage_core::{Branch, Executor, HostLayout, VersionInfo};

use crate::facts::{freebsd_major, machine_arch};

const DEFAULT_MIRROR_HOST: &str = "https://pkg.opnsense.org";

/// Read-only view of the package mirror.
pub trait MirrorClient {
    /// True when `url` answers 200.
    fn exists(&self, url: &str) -> bool;
    /// Body of `url`, or `None` on any transport or status error.
    fn fetch(&self, url: &str) -> Option<String>;
}

pub struct HttpMirror {
    client: reqwest::blocking::Client,
}

impl HttpMirror {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create mirror HTTP client")?;
        Ok(Self { client })
    }
}

impl MirrorClient for HttpMirror {
    fn exists(&self, url: &str) -> bool {
        match self.client.get(url).send() {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                tracing::debug!(url, error = %err, "mirror probe failed");
                false
            }
        }
    }

    fn fetch(&self, url: &str) -> Option<String> {
        let response = self.client.get(url).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().ok()
    }
}

/// Mirror base URL from the pkg repository config, with its version path removed.
pub fn mirror_from_repo_conf(content: &str) -> Option<String> {
    let url_pattern = Regex::new(r#"pkg\+https://[^"\s]+"#).ok()?;
    let version_path = Regex::new(r"/[0-9]{2}\.[0-9][^/]*/.*").ok()?;
    let found = url_pattern.find(content)?.as_str().trim_start_matches("pkg+");
    Some(version_path.replace(found, "").into_owned())
}

/// Mirror base: configured override, then the pkg repository config, then the public default
/// for this FreeBSD major and architecture.
pub fn resolve_mirror_url(
    executor: &Executor<'_>,
    layout: &HostLayout,
    configured: Option<&str>,
) -> String {
    if let Some(url) = configured.map(str::trim).filter(|url| !url.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    let abi = || {
        let arch = machine_arch(executor).unwrap_or_else(|| "amd64".to_string());
        let major = freebsd_major(executor).unwrap_or_default();
        format!("FreeBSD:{major}:{arch}")
    };
    if let Some(url) = fs::read_to_string(layout.pkg_repo_conf_path())
        .ok()
        .as_deref()
        .and_then(mirror_from_repo_conf)
    {
        // Stock repo configs leave the ABI to pkg.
        return if url.contains("${ABI}") {
            url.replace("${ABI}", &abi())
        } else {
            url
        };
    }
    format!("{DEFAULT_MIRROR_HOST}/{}", abi())
}

pub fn branch_base_url(mirror: &str, branch: Branch) -> String {
    format!("{}/{branch}/latest", mirror.trim_end_matches('/'))
}

pub fn meta_conf_url(mirror: &str, branch: Branch) -> String {
    format!("{}/meta.conf", branch_base_url(mirror, branch))
}

/// Commands that extract `packagesite.yaml` from the branch catalog, zstd first.
pub fn packagesite_commands(mirror: &str, branch: Branch) -> [String; 2] {
    let base = branch_base_url(mirror, branch);
    [
        format!("fetch -qo - -T 15 '{base}/packagesite.pkg' 2>/dev/null | zstd -d 2>/dev/null | tar -xf - --to-stdout packagesite.yaml 2>/dev/null"),
        format!("fetch -qo - -T 15 '{base}/packagesite.txz' 2>/dev/null | tar -xJf - --to-stdout packagesite.yaml 2>/dev/null"),
    ]
}

pub fn parse_packagesite_version(packagesite: &str) -> Option<VersionInfo> {
    let pattern = Regex::new(r#""name":"opnsense","version":"([^"]+)""#).ok()?;
    let captures = pattern.captures(packagesite)?;
    VersionInfo::parse(&captures[1]).ok()
}

pub fn parse_meta_conf_version(meta_conf: &str) -> Option<VersionInfo> {
    let pattern = Regex::new(r"(\d{2}\.\d+\.\d+)").ok()?;
    let captures = pattern.captures(meta_conf)?;
    VersionInfo::parse(&captures[1]).ok()
}

/// Exact `opnsense` package version published on `branch`.
pub fn exact_branch_version(
    executor: &Executor<'_>,
    mirror_client: &dyn MirrorClient,
    mirror: &str,
    branch: Branch,
) -> Option<VersionInfo> {
    for command in packagesite_commands(mirror, branch) {
        if let Some(version) = executor
            .inspect(&command)
            .as_deref()
            .and_then(parse_packagesite_version)
        {
            return Some(version);
        }
    }
    mirror_client
        .fetch(&meta_conf_url(mirror, branch))
        .as_deref()
        .and_then(parse_meta_conf_version)
}
