//! Config validation (friendly errors)
//!
//! Catches share.json values that parse fine but will behave badly, and says where they live
//! (a JSON-pointer style path) and what to change. Parse errors come from the engine.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use framecast_engine::config::{Backpressure, ShareConfig, SurfaceBackend};
use framecast_engine::registry::MIN_ROTATION_DEPTH;
use framecast_engine::{loge, logi, logw};

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub path: String,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Warn,
    Error,
}

impl ValidationIssue {
    pub fn warn(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Warn, path: path.into(), message: message.into(), hint }
    }
    pub fn error(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Error, path: path.into(), message: message.into(), hint }
    }
}

pub fn emit_issues(tag: &str, issues: &[ValidationIssue]) {
    for issue in issues {
        let hint = issue.hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default();
        match issue.level {
            IssueLevel::Warn => logw!(tag, "{}: {}{hint}", issue.path, issue.message),
            IssueLevel::Error => loge!(tag, "{}: {}{hint}", issue.path, issue.message),
        }
    }
}

/// Always logs one line, so a clean run still shows that validation happened.
pub fn emit_summary(tag: &str, label: &str, issues: &[ValidationIssue]) {
    let (errors, warnings) = issues.iter().fold((0, 0), |(e, w), i| match i.level {
        IssueLevel::Error => (e + 1, w),
        IssueLevel::Warn => (e, w + 1),
    });
    if errors + warnings == 0 {
        logi!(tag, "{label}: no issues");
    } else {
        logw!(tag, "{label}: {errors} error(s), {warnings} warning(s)");
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.level == IssueLevel::Error)
}

const KNOWN_KEYS: &[&str] = &[
    "version",
    "server_name",
    "rotation_depth",
    "pixel_format",
    "backpressure",
    "surface_backend",
    "gpu_timeout_ms",
    "drain_timeout_ms",
    "session_timeout_ms",
    "leak_timeout_ms",
    "bind_addr",
    "discovery_dir",
    "surface_dir",
];

/// Raw-document checks: keys the engine would silently ignore in lenient mode.
pub fn validate_share_json(raw: &serde_json::Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let Some(obj) = raw.as_object() else {
        issues.push(ValidationIssue::error(
            "share.json:/",
            "top level must be an object",
            Some("expected: { \"server_name\": \"framecast\", ... }".into()),
        ));
        return issues;
    };

    let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();
    for key in obj.keys() {
        if !known.contains(key.as_str()) {
            issues.push(ValidationIssue::warn(
                format!("share.json:/{}", escape_ptr(key)),
                format!("unknown key '{key}' is ignored"),
                Some(match closest(key, KNOWN_KEYS) {
                    Some(k) => format!("did you mean '{k}'?"),
                    None => "remove it, or run with --strict to make this an error".into(),
                }),
            ));
        }
    }
    issues
}

/// Semantic checks on a parsed config.
pub fn validate_share_config(cfg: &ShareConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if cfg.server_name.trim().is_empty() {
        issues.push(ValidationIssue::error(
            "share.json:/server_name",
            "server name is empty",
            Some("consumers find servers by name; pick something like \"main-out\"".into()),
        ));
    } else if cfg.server_name.chars().any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_')) {
        issues.push(ValidationIssue::warn(
            "share.json:/server_name",
            format!("'{}' contains characters that are replaced in file names", cfg.server_name),
            Some("use letters, digits, '-' and '_' so the discovery file name matches".into()),
        ));
    }

    match cfg.rotation_depth {
        d if d < MIN_ROTATION_DEPTH => issues.push(ValidationIssue::error(
            "share.json:/rotation_depth",
            format!("rotation depth {d} leaves no surface to write while a frame is published"),
            Some("use 2 (double-buffered) or 3 (triple-buffered)".into()),
        )),
        d if d > 8 => issues.push(ValidationIssue::warn(
            "share.json:/rotation_depth",
            format!("rotation depth {d} holds {d} full frames in shared memory"),
            Some("consumers only ever see the newest frame; 3 is usually enough".into()),
        )),
        _ => {}
    }

    if let Backpressure::BoundedWait { max_wait_ms } = cfg.backpressure {
        if max_wait_ms == 0 {
            issues.push(ValidationIssue::warn(
                "share.json:/backpressure/max_wait_ms",
                "bounded wait of 0 ms behaves like the drop policy",
                Some("use { \"policy\": \"drop\" } to say so".into()),
            ));
        } else if max_wait_ms > 16 {
            issues.push(ValidationIssue::warn(
                "share.json:/backpressure/max_wait_ms",
                format!("waiting up to {max_wait_ms} ms stalls the render loop longer than a 60 fps frame"),
                Some("keep it at a few milliseconds, or use the drop policy".into()),
            ));
        }
    }

    for (key, v) in [
        ("gpu_timeout_ms", cfg.gpu_timeout_ms),
        ("drain_timeout_ms", cfg.drain_timeout_ms),
        ("session_timeout_ms", cfg.session_timeout_ms),
    ] {
        if v == 0 {
            issues.push(ValidationIssue::error(
                format!("share.json:/{key}"),
                "timeout is 0",
                Some("a zero timeout fails every frame or session immediately".into()),
            ));
        }
    }
    if cfg.session_timeout_ms > 0 && cfg.session_timeout_ms < 250 {
        issues.push(ValidationIssue::warn(
            "share.json:/session_timeout_ms",
            format!("{} ms is shorter than a typical consumer poll interval", cfg.session_timeout_ms),
            Some("consumers must ping at least this often; 5000 is the default".into()),
        ));
    }

    match &cfg.bind_addr {
        Some(addr) => {
            if addr.parse::<SocketAddr>().is_err() {
                issues.push(ValidationIssue::error(
                    "share.json:/bind_addr",
                    format!("'{addr}' is not an IP:port address"),
                    Some("e.g. \"127.0.0.1:0\" (any free port) or \"0.0.0.0:9123\"".into()),
                ));
            }
            if cfg.surface_backend == SurfaceBackend::Heap {
                issues.push(ValidationIssue::warn(
                    "share.json:/surface_backend",
                    "heap surfaces cannot be mapped by other processes",
                    Some("use \"file\" when consumers connect over bind_addr".into()),
                ));
            }
        }
        None => issues.push(ValidationIssue::warn(
            "share.json:/bind_addr",
            "no UDP endpoint; only in-process consumers can connect",
            None,
        )),
    }

    issues
}

/// Nearest known key by edit distance (only suggested when it is a plausible typo).
fn closest<'a>(key: &str, known: &[&'a str]) -> Option<&'a str> {
    known
        .iter()
        .map(|k| (edit_distance(key, k), *k))
        .filter(|(d, _)| *d <= 3)
        .min_by_key(|(d, _)| *d)
        .map(|(_, k)| k)
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != *cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}

// RFC 6901 escaping
fn escape_ptr(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(issues: &[ValidationIssue]) -> Vec<&str> {
        issues.iter().map(|i| i.path.as_str()).collect()
    }

    #[test]
    fn defaults_are_clean() {
        assert!(validate_share_config(&ShareConfig::default()).is_empty());
    }

    #[test]
    fn typo_gets_a_suggestion() {
        let raw = serde_json::json!({ "rotation_dept": 3, "syphon": true });
        let issues = validate_share_json(&raw);
        assert_eq!(issues.len(), 2);
        let typo = issues.iter().find(|i| i.path.ends_with("rotation_dept")).unwrap();
        assert_eq!(typo.hint.as_deref(), Some("did you mean 'rotation_depth'?"));
        assert!(!has_errors(&issues));
    }

    #[test]
    fn bad_values_are_flagged() {
        let cfg = ShareConfig {
            server_name: " ".into(),
            rotation_depth: 1,
            gpu_timeout_ms: 0,
            bind_addr: Some("localhost".into()),
            surface_backend: SurfaceBackend::Heap,
            backpressure: Backpressure::BoundedWait { max_wait_ms: 40 },
            ..ShareConfig::default()
        };
        let issues = validate_share_config(&cfg);
        assert!(has_errors(&issues));
        let depth = issues.iter().find(|i| i.path == "share.json:/rotation_depth").unwrap();
        assert_eq!(depth.level, IssueLevel::Error);
        let p = paths(&issues);
        for want in [
            "share.json:/server_name",
            "share.json:/rotation_depth",
            "share.json:/gpu_timeout_ms",
            "share.json:/bind_addr",
            "share.json:/surface_backend",
            "share.json:/backpressure/max_wait_ms",
        ] {
            assert!(p.contains(&want), "missing {want} in {p:?}");
        }
    }

    #[test]
    fn non_object_document_is_an_error() {
        assert!(has_errors(&validate_share_json(&serde_json::json!([1, 2]))));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }
}
