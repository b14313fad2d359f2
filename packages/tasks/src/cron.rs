//! Cron expression evaluation for recurring schedules.

use chrono::{DateTime, Utc};
use croner::Cron;

use crate::error::{Result, TaskError};

/// A parsed 5-field cron expression (minute hour day month weekday).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| TaskError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// The first occurrence strictly after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|e| TaskError::InvalidExpression {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Parse `expression` and return its first occurrence after `after`.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression)?.next_occurrence(after)
}
