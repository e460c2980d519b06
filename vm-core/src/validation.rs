//! Centralized validation logic for values that reach remote systems.
//!
//! Repository URLs and integration names are interpolated into the boot
//! script of a freshly launched instance, so they are checked against strict
//! allow-lists rather than escaped. CIDR blocks end up in provider firewall
//! rules and are parsed before any provider call is made.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, VmError};

/// Longest repository URL accepted for a boot script
const MAX_REPO_URL_LENGTH: usize = 512;

static REPO_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[A-Za-z0-9.-]+(:[0-9]{1,5})?(/[A-Za-z0-9._~-]+)+/?$")
        .expect("repository URL pattern is a valid regex")
});

static INTEGRATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$")
        .expect("integration pattern is a valid regex")
});

/// Validate a git repository URL before it is written into a shell script.
///
/// Only `https://host[:port]/path` URLs built from unreserved characters are
/// accepted. Quotes, whitespace, `$`, backticks, `;` and every other shell
/// metacharacter are rejected outright.
pub fn validate_repo_url(url: &str) -> Result<()> {
    if url.is_empty() || url.len() > MAX_REPO_URL_LENGTH {
        return Err(VmError::Validation(format!(
            "Repository URL must be between 1 and {} characters",
            MAX_REPO_URL_LENGTH
        )));
    }

    if !REPO_URL_PATTERN.is_match(url) {
        return Err(VmError::Validation(format!(
            "Repository URL '{}' is not an allowed https URL",
            url
        )));
    }

    Ok(())
}

/// Validate an integration name (letters, digits, `-` and `_`, max 64 chars)
pub fn validate_integration_name(name: &str) -> Result<()> {
    if !INTEGRATION_PATTERN.is_match(name) {
        return Err(VmError::Validation(format!(
            "Integration name '{}' contains invalid characters (only alphanumeric, '-' and '_' allowed)",
            name
        )));
    }

    Ok(())
}

/// Validate an IPv4 CIDR block such as `203.0.113.0/24`.
///
/// The address must be the network address for the prefix length, which is
/// what the provider accepts for ingress rules.
pub fn validate_ipv4_cidr(cidr: &str) -> Result<()> {
    let (addr, prefix) = cidr.split_once('/').ok_or_else(|| {
        VmError::Validation(format!("CIDR '{}' is missing a prefix length", cidr))
    })?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| VmError::Validation(format!("CIDR '{}' has an invalid address", cidr)))?;

    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| {
            VmError::Validation(format!("CIDR '{}' has an invalid prefix length", cidr))
        })?;

    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    if u32::from(addr) & !mask != 0 {
        return Err(VmError::Validation(format!(
            "CIDR '{}' has host bits set; use the network address",
            cidr
        )));
    }

    Ok(())
}

/// Validate a server address (hostname or IP address)
///
/// Used on the public address reported by the provider before it is handed
/// to the SSH client.
pub fn validate_server_address(server_addr: &str) -> Result<()> {
    if server_addr.is_empty() || server_addr.len() > 253 {
        return Err(VmError::Validation(
            "Server address must be between 1 and 253 characters".to_string(),
        ));
    }

    if server_addr.contains('\0') || server_addr.chars().any(|c| c.is_control()) {
        return Err(VmError::Validation(
            "Server address contains invalid control characters".to_string(),
        ));
    }

    if server_addr.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let ipv6_candidate = server_addr
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(server_addr);
    if ipv6_candidate.parse::<Ipv6Addr>().is_ok() {
        return Ok(());
    }

    // Looks like an IPv4 address but failed parsing (e.g. "256.256.256.256")
    let labels: Vec<&str> = server_addr.split('.').collect();
    if labels.len() >= 2
        && labels
            .iter()
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(VmError::Validation(format!(
            "Invalid IP address format: {}",
            server_addr
        )));
    }

    validate_hostname(server_addr)
}

/// Validate a hostname according to RFC 1123 rules
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(VmError::Validation(
            "Hostname must be between 1 and 253 characters".to_string(),
        ));
    }

    if hostname.starts_with('.') || hostname.ends_with('.') {
        return Err(VmError::Validation(
            "Hostname cannot start or end with a dot".to_string(),
        ));
    }

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(VmError::Validation(
                "Hostname labels must be between 1 and 63 characters".to_string(),
            ));
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err(VmError::Validation(
                "Hostname labels cannot start or end with a hyphen".to_string(),
            ));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(VmError::Validation(format!(
                "Hostname label '{}' contains invalid characters (only alphanumeric and '-' allowed)",
                label
            )));
        }
    }

    Ok(())
}
