//! Threshold expression parsing.
//!
//! Parses predicates like `> 5`, `<= -0.5`, `between 0 10` or
//! `outside -5 5` into a closed [`Threshold`] value, once, at config load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GhgError, Result};

/// Predicate applied to one aggregate statistic.
///
/// A statistic that satisfies the predicate flags the interval.
///
/// # Expression Format
///
/// - Comparisons: `>`, `>=`, `<`, `<=`, `==` (or `=`), `!=` followed by a number
/// - Ranges: `between LOW HIGH` (inclusive), `outside LOW HIGH` (exclusive)
///
/// ```
/// use ghg_processor::filter::Threshold;
///
/// let t: Threshold = "outside -5 5".parse().unwrap();
/// assert!(t.matches(7.5));
/// assert!(!t.matches(5.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Threshold {
    GreaterThan(f64),
    GreaterOrEqual(f64),
    LessThan(f64),
    LessOrEqual(f64),
    Equals(f64),
    NotEquals(f64),
    Between(f64, f64),
    Outside(f64, f64),
}

impl Threshold {
    /// Whether `value` satisfies the predicate; NaN never does
    pub fn matches(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match *self {
            Threshold::GreaterThan(t) => value > t,
            Threshold::GreaterOrEqual(t) => value >= t,
            Threshold::LessThan(t) => value < t,
            Threshold::LessOrEqual(t) => value <= t,
            Threshold::Equals(t) => value == t,
            Threshold::NotEquals(t) => value != t,
            Threshold::Between(low, high) => value >= low && value <= high,
            Threshold::Outside(low, high) => value < low || value > high,
        }
    }

    fn invalid(expression: &str, reason: impl Into<String>) -> GhgError {
        GhgError::InvalidThreshold {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    fn number(expression: &str, token: &str) -> Result<f64> {
        let value: f64 = token
            .parse()
            .map_err(|_| Self::invalid(expression, format!("'{}' is not a number", token)))?;
        if value.is_nan() {
            return Err(Self::invalid(expression, "NaN threshold"));
        }
        Ok(value)
    }

    fn range(expression: &str, rest: &str) -> Result<(f64, f64)> {
        let bounds: Vec<&str> = rest
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("and"))
            .collect();
        if bounds.len() != 2 {
            return Err(Self::invalid(expression, "expected two bounds"));
        }
        let low = Self::number(expression, bounds[0])?;
        let high = Self::number(expression, bounds[1])?;
        if low > high {
            return Err(Self::invalid(expression, "lower bound exceeds upper bound"));
        }
        Ok((low, high))
    }
}

impl FromStr for Threshold {
    type Err = GhgError;

    fn from_str(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(Self::invalid(expression, "empty expression"));
        }

        let lower = expr.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("between") {
            let (low, high) = Self::range(expression, rest)?;
            return Ok(Threshold::Between(low, high));
        }
        if let Some(rest) = lower.strip_prefix("outside") {
            let (low, high) = Self::range(expression, rest)?;
            return Ok(Threshold::Outside(low, high));
        }

        // Longest operators first so `>=` is not read as `>`
        let operators: [(&str, fn(f64) -> Threshold); 7] = [
            (">=", Threshold::GreaterOrEqual),
            ("<=", Threshold::LessOrEqual),
            ("==", Threshold::Equals),
            ("!=", Threshold::NotEquals),
            (">", Threshold::GreaterThan),
            ("<", Threshold::LessThan),
            ("=", Threshold::Equals),
        ];
        for (op, build) in operators {
            if let Some(rest) = expr.strip_prefix(op) {
                let rest = rest.trim();
                if rest.contains(char::is_whitespace) {
                    return Err(Self::invalid(expression, "unexpected trailing input"));
                }
                return Ok(build(Self::number(expression, rest)?));
            }
        }

        Err(Self::invalid(
            expression,
            "expected a comparison operator, 'between' or 'outside'",
        ))
    }
}

impl TryFrom<String> for Threshold {
    type Error = GhgError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Threshold> for String {
    fn from(value: Threshold) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::GreaterThan(t) => write!(f, "> {}", t),
            Threshold::GreaterOrEqual(t) => write!(f, ">= {}", t),
            Threshold::LessThan(t) => write!(f, "< {}", t),
            Threshold::LessOrEqual(t) => write!(f, "<= {}", t),
            Threshold::Equals(t) => write!(f, "== {}", t),
            Threshold::NotEquals(t) => write!(f, "!= {}", t),
            Threshold::Between(low, high) => write!(f, "between {} {}", low, high),
            Threshold::Outside(low, high) => write!(f, "outside {} {}", low, high),
        }
    }
}
