//! Remediation vocabulary and LAPI duration parsing
//!
//! The decision feed speaks three verdict kinds. Everything else it may
//! emit is coerced to a configurable fallback before entering the cache.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BouncerError, Result};

/// A verdict applied to a request.
///
/// Ordering follows enforcement priority: `Ban > Captcha > Bypass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Remediation {
    /// Sentinel "clean" verdict; the request proceeds.
    Bypass,
    /// Challenge the client before letting the request through.
    Captcha,
    /// Deny the request outright.
    Ban,
}

impl Remediation {
    /// Numeric enforcement priority, higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Remediation::Bypass => 0,
            Remediation::Captcha => 1,
            Remediation::Ban => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Remediation::Bypass => "bypass",
            Remediation::Captcha => "captcha",
            Remediation::Ban => "ban",
        }
    }

    /// Parse a kind received from LAPI, coercing unknown kinds to `fallback`.
    pub fn from_wire(kind: &str, fallback: Remediation) -> Remediation {
        match kind {
            "ban" => Remediation::Ban,
            "captcha" => Remediation::Captcha,
            "bypass" => Remediation::Bypass,
            _ => fallback,
        }
    }

    /// Parse a kind that must be one of the known verdicts.
    pub fn from_exact(kind: &str) -> Result<Remediation> {
        match kind {
            "ban" => Ok(Remediation::Ban),
            "captcha" => Ok(Remediation::Captcha),
            "bypass" => Ok(Remediation::Bypass),
            other => Err(BouncerError::Input(format!(
                "unknown remediation kind {other:?}"
            ))),
        }
    }

    /// Lower `self` to at most `cap`. Capping never raises a verdict.
    pub fn capped_at(self, cap: Remediation) -> Remediation {
        self.min(cap)
    }
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort kinds by descending enforcement priority (stable on ties).
pub fn sort_by_priority(kinds: &mut [Remediation]) {
    kinds.sort_by(|a, b| b.priority().cmp(&a.priority()));
}

// LAPI duration grammar: optional sign, optional hours (only with minutes),
// optional minutes, then a seconds term. The millisecond suffix is only
// legal on the fractional seconds form. Inputs such as "1h30s" (hours with
// no minutes) or "500ms" (no seconds base) do not match.
static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-)?(?:(?:(\d+)h)?(\d+)m)?(?:(\d+)\.\d+(m)?s|(\d+)s)$")
        .expect("duration pattern is valid")
});

/// Parse an LAPI duration string (e.g. `"3h59m58.654s"`) to whole seconds.
///
/// Fractional digits are discarded before unit conversion; the millisecond
/// multiplier applies afterwards and the result rounds half-to-even.
pub fn parse_duration(raw: &str) -> Result<i64> {
    let caps = DURATION_RE
        .captures(raw)
        .ok_or_else(|| BouncerError::Input(format!("unparsable duration {raw:?}")))?;

    let field = |idx: usize| -> Result<i64> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse::<i64>()
                .map_err(|e| BouncerError::Input(format!("duration component in {raw:?}: {e}"))),
            None => Ok(0),
        }
    };

    let hours = field(2)?;
    let minutes = field(3)?;
    // Seconds come from whichever alternative matched.
    let seconds = if caps.get(4).is_some() {
        field(4)?
    } else {
        field(6)?
    };

    let mut total = (hours * 3600 + minutes * 60 + seconds) as f64;
    if caps.get(5).is_some() {
        total *= 0.001;
    }
    if caps.get(1).is_some() {
        total = -total;
    }

    Ok(total.round_ties_even() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Remediation::Ban > Remediation::Captcha);
        assert!(Remediation::Captcha > Remediation::Bypass);
        assert_eq!(Remediation::Ban.priority(), 2);
        assert_eq!(Remediation::Bypass.priority(), 0);
    }

    #[test]
    fn test_from_wire_known() {
        assert_eq!(
            Remediation::from_wire("ban", Remediation::Captcha),
            Remediation::Ban
        );
        assert_eq!(
            Remediation::from_wire("bypass", Remediation::Captcha),
            Remediation::Bypass
        );
    }

    #[test]
    fn test_from_wire_unknown_uses_fallback() {
        assert_eq!(
            Remediation::from_wire("mfa", Remediation::Captcha),
            Remediation::Captcha
        );
        assert_eq!(
            Remediation::from_wire("throttle", Remediation::Ban),
            Remediation::Ban
        );
    }

    #[test]
    fn test_capped_at_only_lowers() {
        assert_eq!(
            Remediation::Ban.capped_at(Remediation::Captcha),
            Remediation::Captcha
        );
        assert_eq!(
            Remediation::Bypass.capped_at(Remediation::Ban),
            Remediation::Bypass
        );
        assert_eq!(
            Remediation::Captcha.capped_at(Remediation::Captcha),
            Remediation::Captcha
        );
    }

    #[test]
    fn test_sort_by_priority() {
        let mut kinds = vec![
            Remediation::Bypass,
            Remediation::Ban,
            Remediation::Captcha,
            Remediation::Ban,
        ];
        sort_by_priority(&mut kinds);
        assert_eq!(
            kinds,
            vec![
                Remediation::Ban,
                Remediation::Ban,
                Remediation::Captcha,
                Remediation::Bypass,
            ]
        );
    }

    #[test]
    fn test_parse_duration_full() {
        assert_eq!(parse_duration("3h59m58s").unwrap(), 14398);
        assert_eq!(parse_duration("4h0m0s").unwrap(), 14400);
        assert_eq!(parse_duration("24h0m0s").unwrap(), 86400);
    }

    #[test]
    fn test_parse_duration_negative() {
        assert_eq!(parse_duration("-1h0m0s").unwrap(), -3600);
        assert_eq!(parse_duration("-30s").unwrap(), -30);
    }

    #[test]
    fn test_parse_duration_minutes_without_hours() {
        assert_eq!(parse_duration("30m10s").unwrap(), 1810);
    }

    #[test]
    fn test_parse_duration_fractional_seconds() {
        // Fractional digits are discarded.
        assert_eq!(parse_duration("58.654s").unwrap(), 58);
        assert_eq!(parse_duration("3h59m58.999s").unwrap(), 14398);
    }

    #[test]
    fn test_parse_duration_millisecond_suffix() {
        assert_eq!(parse_duration("500.0ms").unwrap(), 0);
        assert_eq!(parse_duration("1500.0ms").unwrap(), 2);
        assert_eq!(parse_duration("4000.0ms").unwrap(), 4);
    }

    #[test]
    fn test_parse_duration_rejects_bare_ms() {
        assert!(parse_duration("500ms").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_hours_without_minutes() {
        assert!(parse_duration("1h30s").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("4h").is_err());
        assert!(parse_duration("1d4h0m0s").is_err());
        assert!(parse_duration("s").is_err());
    }
}
