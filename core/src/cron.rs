use crate::errors::{OrchestratorError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// [`CronExpression`] is a validated 5-field cron expression (minute, hour, day-of-month,
/// month, day-of-week) used to compute the recurring fire times of a schedule. Learn more
/// about cron expressions in [Wikipedia](https://en.wikipedia.org/wiki/Cron)
///
/// # Implementation Detail(s)
/// Under the hood, this uses the crate ``cron_parser`` to calculate the next time to
/// execute. Validation and computation go through the exact same parse, so an expression
/// accepted by [`CronExpression::is_valid`] is by construction computable by
/// [`CronExpression::next_after`]
///
/// # Usage Note(s)
/// Supported syntax per field: ``*``, lists (``a,b,c``), ranges (``a-b``), steps
/// (``*/n`` and ``a-b/n``). Times are local wall-clock; daylight-saving transitions
/// follow the library semantics (a forward jump skips the missing window, a backward
/// jump does not re-fire)
///
/// # Construction
/// [`CronExpression::parse`] is the only way to obtain one, which guarantees every held
/// expression is valid. The raw string survives serialization untouched
///
/// # Examples
///
/// ```ignore
/// // Run at 08:00 every day
/// let daily = CronExpression::parse("0 8 * * *")?;
///
/// // Run every 5 minutes
/// let frequent = CronExpression::parse("*/5 * * * *")?;
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression(String);

impl CronExpression {
    /// Validates and wraps a cron expression
    ///
    /// # Returns
    /// The validated [`CronExpression`], or [`OrchestratorError::InvalidCron`] when the
    /// expression does not parse
    pub fn parse(expr: &str) -> Result<Self> {
        if Self::is_valid(expr) {
            Ok(Self(expr.to_string()))
        } else {
            Err(OrchestratorError::InvalidCron(expr.to_string()))
        }
    }

    /// Checks whether an expression is acceptable to the cron dialect without
    /// constructing anything
    pub fn is_valid(expr: &str) -> bool {
        cron_parser::parse(expr, &Local::now()).is_ok()
    }

    /// Computes the smallest instant strictly greater than ``after`` that matches the
    /// expression. An instant that itself matches is skipped
    ///
    /// # Implementation Detail(s)
    /// ``cron_parser`` already resolves strictly after the reference instant, so the
    /// tie-break of "now matches now" is inherited rather than re-implemented
    pub fn next_after(&self, after: DateTime<Local>) -> Result<DateTime<Local>> {
        cron_parser::parse(&self.0, &after)
            .map_err(|_| OrchestratorError::InvalidCron(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = OrchestratorError;

    fn try_from(value: String) -> Result<Self> {
        CronExpression::parse(&value)
    }
}

impl From<CronExpression> for String {
    fn from(value: CronExpression) -> Self {
        value.0
    }
}
