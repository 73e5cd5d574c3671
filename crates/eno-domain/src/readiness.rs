use chrono::{DateTime, Utc};
use serde_json::Value;

use eno_expr::{Context, ExprError, Program};

/// The moment a readiness check was (or is considered) satisfied.
///
/// Precise times come from the resource itself — a condition's
/// `lastTransitionTime` — and survive process restarts; imprecise times are
/// just "when the engine first noticed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTime {
    pub time: DateTime<Utc>,
    pub precise: bool,
}

/// One named readiness check, compiled at manifest ingestion and reused on
/// every reconcile.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub name: String,
    pub program: Program,
}

impl ReadinessCheck {
    pub fn new(name: impl Into<String>, expr: &str) -> Result<Self, ExprError> {
        Ok(ReadinessCheck {
            name: name.into(),
            program: Program::compile(expr)?,
        })
    }

    /// Evaluate against the current downstream object. `None` means not
    /// ready. A boolean `true` is ready as of `now` (imprecise); a
    /// condition-shaped result with `status: "True"` is ready as of its
    /// `lastTransitionTime` when that parses (precise).
    pub fn eval(&self, current: &Value, now: DateTime<Utc>) -> Option<ReadyTime> {
        let ctx = Context::new(current);
        match self.program.eval(&ctx) {
            Ok(Value::Bool(true)) => Some(ReadyTime {
                time: now,
                precise: false,
            }),
            Ok(Value::Object(map)) => {
                if map.get("status").and_then(Value::as_str) != Some("True") {
                    return None;
                }
                let precise = map
                    .get("lastTransitionTime")
                    .and_then(Value::as_str)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));
                Some(match precise {
                    Some(time) => ReadyTime { time, precise: true },
                    None => ReadyTime {
                        time: now,
                        precise: false,
                    },
                })
            }
            // Evaluation errors and non-true results both mean "not ready";
            // a user expression must never wedge the reconciler.
            _ => None,
        }
    }
}

/// Aggregate per-check results into resource readiness: all checks must be
/// ready; among them the maximum precise time wins, falling back to the
/// maximum imprecise time when no check reported a precise one.
pub fn aggregate_ready_times(times: &[ReadyTime]) -> Option<ReadyTime> {
    let precise = times
        .iter()
        .filter(|t| t.precise)
        .max_by_key(|t| t.time)
        .copied();
    precise.or_else(|| times.iter().max_by_key(|t| t.time).copied())
}
