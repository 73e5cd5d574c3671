use std::time::Duration;

use crate::error::DomainError;

// Annotations recognized on desired manifests.
pub const READINESS_PREFIX: &str = "eno.azure.io/readiness";
pub const READINESS_GROUP: &str = "eno.azure.io/readiness-group";
pub const DELETION_GROUP: &str = "eno.azure.io/deletion-group";
pub const RECONCILE_INTERVAL: &str = "eno.azure.io/reconcile-interval";
pub const OVERRIDES: &str = "eno.azure.io/overrides";
pub const REPLACE: &str = "eno.azure.io/replace";
pub const FAIL_OPEN: &str = "eno.azure.io/fail-open";
pub const DISABLE_RECONCILIATION: &str = "eno.azure.io/disable-reconciliation";

// Composition-level.
pub const DELETION_STRATEGY: &str = "eno.azure.io/deletion-strategy";

const ANNOTATION_DOMAIN: &str = "eno.azure.io/";

/// Whether `key` belongs to this engine's annotation namespace (and is
/// therefore stripped from manifests before they are applied downstream).
pub fn is_eno_annotation(key: &str) -> bool {
    key.starts_with(ANNOTATION_DOMAIN)
}

/// The readiness check name encoded in an annotation key: the bare
/// `…/readiness` annotation is the unnamed (default) check,
/// `…/readiness-<name>` is a named one. Group/interval annotations share
/// the prefix and are excluded explicitly.
pub fn readiness_check_name(key: &str) -> Option<&str> {
    if key == READINESS_GROUP {
        return None;
    }
    let rest = key.strip_prefix(READINESS_PREFIX)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('-')
    }
}

/// Parse a Go-style duration string: one or more `<int><unit>` components
/// with units `ns`, `us`, `ms`, `s`, `m`, `h` (e.g. `100ms`, `1h30m`).
pub fn parse_duration(input: &str) -> Result<Duration, DomainError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DomainError::InvalidDuration(input.to_string()));
    }
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total = Duration::ZERO;
    while i < bytes.len() {
        let num_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == num_start {
            return Err(DomainError::InvalidDuration(input.to_string()));
        }
        let value: u64 = s[num_start..i]
            .parse()
            .map_err(|_| DomainError::InvalidDuration(input.to_string()))?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let component = match &s[unit_start..i] {
            "ns" => Duration::from_nanos(value),
            "us" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return Err(DomainError::InvalidDuration(input.to_string())),
        };
        total += component;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_names() {
        assert_eq!(readiness_check_name("eno.azure.io/readiness"), Some(""));
        assert_eq!(readiness_check_name("eno.azure.io/readiness-db"), Some("db"));
        assert_eq!(readiness_check_name("eno.azure.io/readiness-group"), None);
        assert_eq!(readiness_check_name("eno.azure.io/reconcile-interval"), None);
        assert_eq!(readiness_check_name("other.io/readiness"), None);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn eno_annotation_namespace() {
        assert!(is_eno_annotation("eno.azure.io/replace"));
        assert!(!is_eno_annotation("example.com/replace"));
    }
}
