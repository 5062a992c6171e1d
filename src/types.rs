use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which draft the refinement loop accepts as a node's final output.
///
/// - `KeepLast`: whatever the final iteration produced, even if its score
///   regressed against an earlier iteration (default).
/// - `KeepBest`: the highest-scoring iteration's draft. If that is not the
///   last draft, it is committed again as a new store version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementPolicy {
    KeepLast,
    KeepBest,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        RefinementPolicy::KeepLast
    }
}

impl FromStr for RefinementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "keep_last" => Ok(RefinementPolicy::KeepLast),
            "keep_best" => Ok(RefinementPolicy::KeepBest),
            other => Err(format!(
                "invalid refinement policy: {other} (expected \"keep_last\" or \"keep_best\")"
            )),
        }
    }
}

/// Severity of a validation rule and of the findings it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

/// Hallucination-risk category reported by the quality assessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HallucinationRisk {
    Low,
    Medium,
    High,
}

/// Parse a duration string such as `"250ms"`, `"30s"`, `"15m"` or `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
