//! Durations written the way Go's `time.ParseDuration` accepts them, e.g.
//! `300ms`, `1.5h` or `2h45m`.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("negative durations are not supported")]
    Negative,

    #[error("missing unit in {0:?}; expected one of ns, us, ms, s, m, h")]
    NoUnit(String),

    #[error("unknown unit {0:?}; expected one of ns, us, ms, s, m, h")]
    InvalidUnit(String),

    #[error("invalid number {0:?}")]
    NotANumber(String),
}

// === impl GoDuration ===

impl GoDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('+').unwrap_or(s);
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s == "0" {
            return Ok(Self::default());
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| ParseError::NoUnit(s.to_string()))?;
            let (num, tail) = rest.split_at(num_end);
            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);

            let value = num
                .parse::<f64>()
                .map_err(|_| ParseError::NotANumber(num.to_string()))?;
            total += unit_duration(unit)?.mul_f64(value);
            rest = tail;
        }

        Ok(Self(total))
    }
}

fn unit_duration(unit: &str) -> Result<Duration, ParseError> {
    Ok(match unit {
        "ns" => Duration::from_nanos(1),
        // Both the micro sign and the Greek mu are accepted.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        "" => return Err(ParseError::NoUnit(unit.to_string())),
        _ => return Err(ParseError::InvalidUnit(unit.to_string())),
    })
}

/// Formats like Go's `Duration.String`, e.g. `1h2m3.5s` or `250ms`.
impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        if d.is_zero() {
            return f.write_str("0s");
        }
        if d < Duration::from_secs(1) {
            let nanos = d.subsec_nanos();
            return if nanos % 1_000_000 == 0 {
                write!(f, "{}ms", nanos / 1_000_000)
            } else if nanos % 1_000 == 0 {
                write!(f, "{}us", nanos / 1_000)
            } else {
                write!(f, "{nanos}ns")
            };
        }

        let secs = d.as_secs();
        let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
        if h > 0 {
            write!(f, "{h}h")?;
        }
        if h > 0 || m > 0 {
            write!(f, "{m}m")?;
        }
        let frac = d.subsec_nanos();
        if frac == 0 {
            write!(f, "{s}s")
        } else {
            let frac = format!("{frac:09}");
            write!(f, "{s}.{}s", frac.trim_end_matches('0'))
        }
    }
}

impl TryFrom<String> for GoDuration {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GoDuration> for String {
    fn from(d: GoDuration) -> Self {
        d.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("+5s", Duration::from_secs(5)),
            ("300ms", Duration::from_millis(300)),
            ("1.5h", Duration::from_secs(90 * 60)),
            ("2h45m", Duration::from_secs(2 * 3600 + 45 * 60)),
            ("1m30.5s", Duration::from_millis(90_500)),
            ("10us", Duration::from_micros(10)),
            ("10\u{00b5}s", Duration::from_micros(10)),
            ("7ns", Duration::from_nanos(7)),
        ];
        for (input, expected) in cases {
            let parsed = input.parse::<GoDuration>();
            assert_eq!(parsed, Ok(GoDuration(*expected)), "{input}");
        }
    }

    #[test]
    fn rejects_invalid_durations() {
        assert_eq!("".parse::<GoDuration>(), Err(ParseError::Empty));
        assert_eq!("-1s".parse::<GoDuration>(), Err(ParseError::Negative));
        assert!(matches!("30".parse::<GoDuration>(), Err(ParseError::NoUnit(_))));
        assert!(matches!("3d".parse::<GoDuration>(), Err(ParseError::InvalidUnit(_))));
        assert!(matches!("1..2s".parse::<GoDuration>(), Err(ParseError::NotANumber(_))));
    }

    #[test]
    fn displays_like_go() {
        assert_eq!(GoDuration::default().to_string(), "0s");
        assert_eq!(GoDuration::from_millis(250).to_string(), "250ms");
        assert_eq!(GoDuration::from_secs(90).to_string(), "1m30s");
        assert_eq!(GoDuration::from_secs(3600).to_string(), "1h0m0s");
        assert_eq!(GoDuration::from_millis(1500).to_string(), "1.5s");
    }

    #[test]
    fn serde_uses_strings() {
        let d: GoDuration = serde_json::from_str("\"2m\"").unwrap();
        assert_eq!(d, GoDuration::from_secs(120));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"2m0s\"");
        assert!(serde_json::from_str::<GoDuration>("\"2\"").is_err());
    }
}
