// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Input validation shared by all provisioners.
//!
//! Every function returns [`CoreError::Validation`] naming the offending
//! field. Builders call these before emitting any step.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// PHP versions the installer knows how to provision.
pub const SUPPORTED_PHP_VERSIONS: &[&str] = &["7.4", "8.0", "8.1", "8.2", "8.3", "8.4"];

/// Database engines the installer knows how to provision.
pub const SUPPORTED_DATABASE_ENGINES: &[&str] = &["mysql", "mariadb", "postgresql"];

/// Host used when a repository is given as `owner/name`.
pub const DEFAULT_GIT_HOST: &str = "github.com";

static OWNER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?$").expect("valid regex")
});
static SSH_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^git@([A-Za-z0-9][A-Za-z0-9.-]*):([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?$")
        .expect("valid regex")
});
static BRANCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("valid regex"));
static PHP_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+$").expect("valid regex"));
static ENGINE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?$").expect("valid regex"));
static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));
static UNIX_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));
static CRON_FIELD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9*/,-]+$").expect("valid regex"));
static DOMAIN_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("valid regex")
});

const CRON_MACROS: &[&str] = &[
    "@hourly", "@daily", "@weekly", "@monthly", "@yearly", "@reboot",
];

/// A required, non-empty string field of a config object.
pub fn required_str<'a>(config: &'a Value, field: &str) -> Result<&'a str> {
    match config.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(CoreError::validation(field, "is required"))
        }
        Some(_) => Err(CoreError::validation(field, "must be a string")),
    }
}

/// An optional string field; empty strings count as absent.
pub fn optional_str<'a>(config: &'a Value, field: &str) -> Result<Option<&'a str>> {
    match config.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(_) => Err(CoreError::validation(field, "must be a string")),
    }
}

/// Normalize a repository to its SSH clone URL.
///
/// `owner/name` becomes `git@github.com:owner/name.git`; an SSH URL keeps
/// its host and gains a `.git` suffix if missing.
pub fn normalize_repository(input: &str) -> Result<String> {
    let input = input.trim();
    if let Some(caps) = SSH_URL.captures(input) {
        return Ok(format!("git@{}:{}/{}.git", &caps[1], &caps[2], &caps[3]));
    }
    if let Some(caps) = OWNER_NAME.captures(input) {
        return Ok(format!("git@{}:{}/{}.git", DEFAULT_GIT_HOST, &caps[1], &caps[2]));
    }
    Err(CoreError::validation(
        "repository",
        format!("'{input}' is not owner/name or git@host:owner/name"),
    ))
}

/// Host part of a normalized SSH clone URL.
pub fn repository_host(normalized: &str) -> Option<&str> {
    normalized
        .strip_prefix("git@")
        .and_then(|rest| rest.split_once(':'))
        .map(|(host, _)| host)
}

/// Validate a branch name.
pub fn validate_branch(branch: &str) -> Result<()> {
    if !BRANCH.is_match(branch) {
        return Err(CoreError::validation(
            "branch",
            format!("'{branch}' may only contain letters, digits, '.', '_', '/' and '-'"),
        ));
    }
    if branch.contains("..") || branch.starts_with('-') || branch.starts_with('/') {
        return Err(CoreError::validation(
            "branch",
            format!("'{branch}' is not a valid ref name"),
        ));
    }
    Ok(())
}

/// Validate a PHP `major.minor` version.
pub fn validate_php_version(version: &str) -> Result<()> {
    if !PHP_VERSION.is_match(version) {
        return Err(CoreError::validation(
            "version",
            format!("'{version}' is not a major.minor version"),
        ));
    }
    if !SUPPORTED_PHP_VERSIONS.contains(&version) {
        return Err(CoreError::validation(
            "version",
            format!(
                "PHP {version} is not supported (supported: {})",
                SUPPORTED_PHP_VERSIONS.join(", ")
            ),
        ));
    }
    Ok(())
}

/// Validate a database engine name and version.
pub fn validate_database_engine(engine: &str, version: &str) -> Result<()> {
    if !SUPPORTED_DATABASE_ENGINES.contains(&engine) {
        return Err(CoreError::validation(
            "engine",
            format!(
                "'{engine}' is not one of {}",
                SUPPORTED_DATABASE_ENGINES.join(", ")
            ),
        ));
    }
    if !ENGINE_VERSION.is_match(version) {
        return Err(CoreError::validation(
            "version",
            format!("'{version}' is not a valid engine version"),
        ));
    }
    Ok(())
}

/// Validate a port number from config (accepts numbers and numeric strings).
pub fn validate_port(value: Option<&Value>) -> Result<u16> {
    let raw = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match raw {
        Some(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(CoreError::validation("port", "must be between 1 and 65535")),
    }
}

/// Validate a firewall protocol.
pub fn validate_protocol(protocol: &str) -> Result<()> {
    match protocol {
        "tcp" | "udp" => Ok(()),
        other => Err(CoreError::validation(
            "protocol",
            format!("'{other}' is not tcp or udp"),
        )),
    }
}

/// Validate a firewall source: `any`, an address, or a CIDR block.
pub fn validate_source(source: &str) -> Result<()> {
    if source == "any" {
        return Ok(());
    }
    let invalid = || CoreError::validation("source", format!("'{source}' is not an address or CIDR"));
    let (addr, prefix) = match source.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (source, None),
    };
    let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validate a supervisor program or scheduled task name.
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if NAME.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            format!("'{name}' must be 1-64 letters, digits, '_' or '-'"),
        ))
    }
}

/// Validate a unix account name.
pub fn validate_unix_user(user: &str) -> Result<()> {
    if UNIX_USER.is_match(user) {
        Ok(())
    } else {
        Err(CoreError::validation(
            "user",
            format!("'{user}' is not a valid unix user name"),
        ))
    }
}

/// Validate a cron schedule: five fields or a macro.
pub fn validate_cron_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    if CRON_MACROS.contains(&schedule) {
        return Ok(());
    }
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() == 5 && fields.iter().all(|f| CRON_FIELD.is_match(f)) {
        Ok(())
    } else {
        Err(CoreError::validation(
            "schedule",
            format!("'{schedule}' is not a five-field cron expression"),
        ))
    }
}

/// Validate an absolute path without parent references.
pub fn validate_absolute_path(field: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(CoreError::validation(field, format!("'{path}' must be absolute")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(CoreError::validation(
            field,
            format!("'{path}' must not contain '..'"),
        ));
    }
    if path.chars().any(|c| c.is_control() || c == '\'' || c == '"') {
        return Err(CoreError::validation(
            field,
            format!("'{path}' contains forbidden characters"),
        ));
    }
    Ok(())
}

/// Validate a domain name (RFC 1123 labels).
pub fn validate_domain(domain: &str) -> Result<()> {
    let invalid = || CoreError::validation("domain", format!("'{domain}' is not a valid domain"));
    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }
    if domain.split('.').all(|label| DOMAIN_LABEL.is_match(label)) {
        Ok(())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_repository() {
        let cases = [
            ("owner/repo", "git@github.com:owner/repo.git"),
            ("owner/repo.git", "git@github.com:owner/repo.git"),
            ("git@github.com:owner/repo.git", "git@github.com:owner/repo.git"),
            ("git@gitlab.example.com:team/app", "git@gitlab.example.com:team/app.git"),
            ("  acme/site  ", "git@github.com:acme/site.git"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_repository(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_invalid_repositories() {
        for input in [
            "invalid-format",
            "",
            "https://github.com/owner/repo",
            "owner/repo/extra",
            "owner/repo; rm -rf /",
            "git@-oProxyCommand=touch:owner/repo",
            "git@.example.com:owner/repo",
        ] {
            let err = normalize_repository(input).unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_ERROR", "{input}");
        }
    }

    #[test]
    fn test_repository_host() {
        assert_eq!(
            repository_host("git@gitlab.example.com:team/app.git"),
            Some("gitlab.example.com")
        );
        assert_eq!(repository_host("owner/repo"), None);
    }

    #[test]
    fn test_branches() {
        for ok in ["main", "release/1.2", "feature_x-y", "v1.0.0"] {
            assert!(validate_branch(ok).is_ok(), "{ok}");
        }
        for bad in ["bad branch!", "a..b", "-x", "/main", "", "main;ls"] {
            assert!(validate_branch(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_php_versions() {
        assert!(validate_php_version("8.3").is_ok());
        assert!(validate_php_version("7.4").is_ok());
        assert!(validate_php_version("5.6").is_err());
        assert!(validate_php_version("8").is_err());
        assert!(validate_php_version("8.3.1").is_err());
    }

    #[test]
    fn test_database_engines() {
        assert!(validate_database_engine("mysql", "8.0").is_ok());
        assert!(validate_database_engine("postgresql", "16").is_ok());
        assert!(validate_database_engine("oracle", "19").is_err());
        assert!(validate_database_engine("mariadb", "latest").is_err());
    }

    #[test]
    fn test_firewall_inputs() {
        assert_eq!(validate_port(Some(&json!(443))).unwrap(), 443);
        assert_eq!(validate_port(Some(&json!("22"))).unwrap(), 22);
        assert!(validate_port(Some(&json!(0))).is_err());
        assert!(validate_port(Some(&json!(70000))).is_err());
        assert!(validate_port(None).is_err());

        assert!(validate_protocol("tcp").is_ok());
        assert!(validate_protocol("icmp").is_err());

        for ok in ["any", "10.0.0.1", "10.0.0.0/8", "2001:db8::/32"] {
            assert!(validate_source(ok).is_ok(), "{ok}");
        }
        for bad in ["10.0.0.0/33", "nope", "10.0.0.1/x", "2001:db8::/129"] {
            assert!(validate_source(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_names_and_users() {
        assert!(validate_name("name", "queue-worker_1").is_ok());
        assert!(validate_name("name", "has space").is_err());
        assert!(validate_name("name", &"x".repeat(65)).is_err());
        assert!(validate_unix_user("hostwright").is_ok());
        assert!(validate_unix_user("Root").is_err());
        assert!(validate_unix_user("9lives").is_err());
    }

    #[test]
    fn test_cron_schedules() {
        for ok in ["* * * * *", "*/5 0 1-15 * 1,3,5", "@daily", "@reboot"] {
            assert!(validate_cron_schedule(ok).is_ok(), "{ok}");
        }
        for bad in ["* * * *", "@sometimes", "* * * * * *", "a b c d e"] {
            assert!(validate_cron_schedule(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_paths_and_domains() {
        assert!(validate_absolute_path("directory", "/home/hostwright/site").is_ok());
        assert!(validate_absolute_path("directory", "relative/path").is_err());
        assert!(validate_absolute_path("directory", "/home/../etc").is_err());

        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("a-b.example.co.uk").is_ok());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("bad_label.com").is_err());
        assert!(validate_domain("").is_err());
    }

    #[test]
    fn test_config_fields() {
        let config = json!({"name": " worker ", "empty": "", "n": 3});
        assert_eq!(required_str(&config, "name").unwrap(), "worker");
        assert!(required_str(&config, "empty").is_err());
        assert!(required_str(&config, "missing").is_err());
        assert!(required_str(&config, "n").is_err());
        assert_eq!(optional_str(&config, "empty").unwrap(), None);
        assert_eq!(optional_str(&config, "name").unwrap(), Some("worker"));
    }
}
