//! Utility functions for warden

use chrono::{DateTime, Utc};

/// Get the current wall-clock time.
///
/// Kept as a function so call sites read the same as in tests, where fixed
/// timestamps are injected instead.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidArgument("empty duration".into()));
    }

    let (num_str, unit) = if s.ends_with("ms") {
        (&s[..s.len() - 2], "ms")
    } else if s.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        // Bare numbers are seconds.
        (s, "s")
    } else {
        (&s[..s.len() - 1], &s[s.len() - 1..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidArgument(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        "d" => std::time::Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidArgument(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Human-readable name for a member architecture code.
pub fn arch_name(code: i32) -> crate::Result<&'static str> {
    let name = match code {
        1 => "i686",
        2 => "x86_64",
        3 => "armv7l",
        4 => "aarch64",
        5 => "ppc",
        6 => "ppc64",
        7 => "ppc64le",
        8 => "s390x",
        9 => "riscv64",
        _ => {
            return Err(crate::Error::InvalidArgument(format!(
                "unknown architecture code: {}",
                code
            )))
        }
    };
    Ok(name)
}

/// Compare two (schema, api_extensions) version records.
///
/// Schema takes precedence; the API extension count breaks ties.
pub fn compare_versions(a: [i32; 2], b: [i32; 2]) -> std::cmp::Ordering {
    a[0].cmp(&b[0]).then(a[1].cmp(&b[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("20").unwrap(),
            std::time::Duration::from_secs(20)
        );
        assert_eq!(
            parse_duration("5m").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_arch_name() {
        assert_eq!(arch_name(2).unwrap(), "x86_64");
        assert_eq!(arch_name(4).unwrap(), "aarch64");
        assert!(arch_name(0).is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions([10, 4], [10, 4]), Ordering::Equal);
        assert_eq!(compare_versions([11, 4], [10, 9]), Ordering::Greater);
        assert_eq!(compare_versions([10, 3], [10, 4]), Ordering::Less);
    }
}
