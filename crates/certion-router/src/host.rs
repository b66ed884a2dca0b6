//! Host header parsing and subdomain helpers
//!
//! Public hosts have the form `{subdomain}.{domain}` where the subdomain is
//! `{project}-{owner}`.

use crate::routing::RoutingError;

/// Longest DNS label
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// What a Host header points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    /// `{sub}.{domain}`
    Subdomain(String),
    /// The bare public domain
    Apex,
    /// Not under the public domain
    Foreign,
}

/// Lower-case and drop the port (IPv6 literals keep their brackets)
pub fn strip_port(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Classify a Host header against the public domain
pub fn parse_host(host: &str, domain: &str) -> HostTarget {
    let host = strip_port(host);
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() || domain.is_empty() {
        return HostTarget::Foreign;
    }
    if host == domain {
        return HostTarget::Apex;
    }
    match host.strip_suffix(&domain).and_then(|s| s.strip_suffix('.')) {
        Some(sub) if !sub.is_empty() && !sub.contains('.') => {
            HostTarget::Subdomain(sub.to_string())
        }
        _ => HostTarget::Foreign,
    }
}

/// `[a-z0-9-]`, no leading/trailing hyphen, no consecutive hyphens
pub fn validate_subdomain(name: &str) -> Result<(), RoutingError> {
    let invalid = |why: &str| RoutingError::InvalidSubdomain(format!("{:?}: {}", name, why));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_SUBDOMAIN_LEN {
        return Err(invalid("longer than 63 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only a-z, 0-9 and '-' are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("cannot start or end with '-'"));
    }
    if name.contains("--") {
        return Err(invalid("cannot contain consecutive hyphens"));
    }
    Ok(())
}

/// Best-effort conversion of arbitrary text into a subdomain label
pub fn normalize_subdomain(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            ' ' | '_' | '-' => {
                if !out.is_empty() && !out.ends_with('-') {
                    out.push('-');
                }
            }
            _ => {}
        }
    }
    let mut out = out.trim_end_matches('-').to_string();
    if out.len() > MAX_SUBDOMAIN_LEN {
        out.truncate(MAX_SUBDOMAIN_LEN);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

/// `{project}-{owner}`, made unique against `is_taken` with a numeric
/// suffix (random after 1000 attempts)
pub fn generate_subdomain(project: &str, owner: &str, is_taken: impl Fn(&str) -> bool) -> String {
    let mut base = normalize_subdomain(&format!("{}-{}", project, owner));
    if validate_subdomain(&base).is_err() {
        base = normalize_subdomain(&format!("project-{}", owner));
    }
    if validate_subdomain(&base).is_err() {
        base = "project".to_string();
    }

    if !is_taken(&base) {
        return base;
    }
    for counter in 1..=1000 {
        let candidate = with_suffix(&base, &counter.to_string());
        if !is_taken(&candidate) {
            return candidate;
        }
    }
    let random = uuid::Uuid::new_v4().simple().to_string();
    with_suffix(&base, &random[..8])
}

fn with_suffix(base: &str, suffix: &str) -> String {
    let keep = MAX_SUBDOMAIN_LEN.saturating_sub(suffix.len() + 1);
    let head = if base.len() > keep { &base[..keep] } else { base };
    format!("{}-{}", head.trim_end_matches('-'), suffix)
}
