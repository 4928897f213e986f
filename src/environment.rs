//! Host and network environment snapshot.
//!
//! Every lookup is best-effort: a failure is logged at debug level and the
//! corresponding field is left out of the snapshot.

use crate::config::EnvironmentConfig;
use crate::invoker::{CommandSpec, Invoke, Outcome};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe address for `ip route get`; no packet is sent.
const ROUTE_PROBE: &str = "1.1.1.1";

static ROUTE_INTERFACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"interface:\s+(\S+)").unwrap());
static IP_ROUTE_DEV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bdev\s+(\S+)").unwrap());
static IP_ROUTE_SRC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bsrc\s+(\S+)").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvironmentSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_lookup_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A failed enrichment lookup. Never fatal.
#[derive(Debug)]
pub enum LookupFailure {
    Command(String),
    Http(reqwest::Error),
    Dns(std::io::Error),
    Missing(&'static str),
}

impl std::fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupFailure::Command(msg) => write!(f, "command lookup failed: {msg}"),
            LookupFailure::Http(e) => write!(f, "public IP lookup failed: {e}"),
            LookupFailure::Dns(e) => write!(f, "DNS lookup failed: {e}"),
            LookupFailure::Missing(what) => write!(f, "{what} not present in output"),
        }
    }
}

impl std::error::Error for LookupFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LookupFailure::Http(e) => Some(e),
            LookupFailure::Dns(e) => Some(e),
            _ => None,
        }
    }
}

fn ok_or_debug<T>(what: &str, result: Result<T, LookupFailure>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(lookup = what, error = %e, "environment lookup failed");
            None
        }
    }
}

async fn command_output<I: Invoke>(
    invoker: &I,
    program: &str,
    args: &[&str],
) -> Result<String, LookupFailure> {
    let cmd = CommandSpec::new(
        program,
        args.iter().map(|a| a.to_string()).collect(),
        COMMAND_TIMEOUT,
    );
    let inv = invoker
        .invoke(&cmd)
        .await
        .map_err(|e| LookupFailure::Command(e.to_string()))?;
    if inv.outcome != Outcome::Success {
        return Err(LookupFailure::Command(format!(
            "{} ended with {:?}",
            cmd.display(),
            inv.outcome
        )));
    }
    Ok(inv.stdout)
}

fn capture(re: &Regex, text: &str, what: &'static str) -> Result<String, LookupFailure> {
    re.captures(text)
        .map(|c| c[1].to_string())
        .ok_or(LookupFailure::Missing(what))
}

/// (interface, local IPv4) of the default route on macOS.
async fn default_route_macos<I: Invoke>(invoker: &I) -> (Option<String>, Option<String>) {
    let iface = ok_or_debug(
        "default interface",
        command_output(invoker, "route", &["-n", "get", "default"])
            .await
            .and_then(|out| capture(&ROUTE_INTERFACE, &out, "interface")),
    );
    let Some(iface) = iface else {
        return (None, None);
    };
    let ip = ok_or_debug(
        "local ip",
        command_output(invoker, "ipconfig", &["getifaddr", &iface]).await,
    )
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty());
    (Some(iface), ip)
}

/// (interface, local IPv4) of the default route via iproute2.
async fn default_route_iproute<I: Invoke>(invoker: &I) -> (Option<String>, Option<String>) {
    let out = ok_or_debug(
        "default route",
        command_output(invoker, "ip", &["-4", "route", "get", ROUTE_PROBE]).await,
    );
    let Some(out) = out else {
        return (None, None);
    };
    let iface = ok_or_debug("interface", capture(&IP_ROUTE_DEV, &out, "dev"));
    let ip = ok_or_debug("local ip", capture(&IP_ROUTE_SRC, &out, "src"));
    (iface, ip)
}

/// Time a resolver lookup of `host`, in milliseconds.
async fn dns_lookup_ms(host: &str) -> Result<f64, LookupFailure> {
    let start = Instant::now();
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(LookupFailure::Dns)?;
    if addrs.next().is_none() {
        return Err(LookupFailure::Missing("address"));
    }
    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

/// Public IP, ISP/org and location from an ipinfo-style JSON response.
#[derive(Debug, Default, PartialEq)]
pub struct PublicInfo {
    pub ip: Option<String>,
    pub org: Option<String>,
    pub location: Option<String>,
}

pub fn parse_ipinfo(doc: &Value) -> PublicInfo {
    let field = |k: &str| {
        doc.get(k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let parts: Vec<String> = ["city", "region", "country"]
        .into_iter()
        .filter_map(field)
        .collect();
    PublicInfo {
        ip: field("ip"),
        org: field("org"),
        location: (!parts.is_empty()).then(|| parts.join(", ")),
    }
}

async fn fetch_public_info(url: &str, timeout: Duration) -> Result<PublicInfo, LookupFailure> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(LookupFailure::Http)?;
    let doc: Value = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(LookupFailure::Http)?
        .json()
        .await
        .map_err(LookupFailure::Http)?;
    Ok(parse_ipinfo(&doc))
}

fn os_description() -> Option<String> {
    match nix::sys::utsname::uname() {
        Ok(u) => Some(format!(
            "{} {}",
            u.sysname().to_string_lossy(),
            u.release().to_string_lossy()
        )),
        Err(e) => {
            tracing::debug!(error = %e, "uname failed");
            None
        }
    }
}

fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
}

/// Collect the environment snapshot. Never fails.
pub async fn collect<I: Invoke>(invoker: &I, config: &EnvironmentConfig) -> EnvironmentSnapshot {
    let (interface, local_ip) = if cfg!(target_os = "macos") {
        default_route_macos(invoker).await
    } else {
        default_route_iproute(invoker).await
    };

    let dns_lookup_ms = match config.dns_probe_host.as_deref().filter(|h| !h.is_empty()) {
        Some(host) => ok_or_debug("dns", dns_lookup_ms(host).await),
        None => None,
    };

    let public = if config.public_ip_lookup {
        ok_or_debug(
            "public ip",
            fetch_public_info(
                &config.ipinfo_url,
                Duration::from_secs(config.http_timeout_secs.max(1)),
            )
            .await,
        )
        .unwrap_or_default()
    } else {
        PublicInfo::default()
    };

    EnvironmentSnapshot {
        hostname: hostname(),
        os: os_description(),
        arch: std::env::consts::ARCH.to_string(),
        interface,
        local_ip,
        dns_lookup_ms: dns_lookup_ms.map(|ms| crate::aggregate::round_to(ms, 2)),
        public_ip: public.ip,
        isp: public.org,
        location: public.location,
    }
}
