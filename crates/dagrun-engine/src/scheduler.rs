//! Cron scheduler
//!
//! Walks the configured DAGs, parses each cron expression (an embedded
//! `CRON_TZ=<zone>` prefix wins, else the scheduler's configured timezone,
//! else local time), and admits runs through the controller's queue path
//! at fire times. Suspended DAGs are skipped. Past-due fire times are
//! never coalesced: after downtime only the next scheduled instant is
//! honored, because the next fire is always computed from the current
//! clock.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dagrun_core::Dag;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Controller;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Cron expression did not parse
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidExpression {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    /// `CRON_TZ=` prefix without an expression after it
    #[error("schedule {0:?} has a timezone prefix but no expression")]
    MissingExpression(String),

    /// Unknown timezone name
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// One parsed schedule of a DAG
#[derive(Debug, Clone)]
pub struct CronEntry {
    schedule: cron::Schedule,
    timezone: Option<Tz>,
    raw: String,
}

impl CronEntry {
    /// The raw expression as written in the definition.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.timezone {
            Some(tz) => self
                .schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            None => self
                .schedule
                .after(&now.with_timezone(&chrono::Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Parse a schedule string, honoring a `CRON_TZ=<zone>` prefix.
///
/// Five-field expressions are accepted and normalized by pinning the
/// seconds field to zero.
pub fn parse_schedule(raw: &str, default_tz: Option<Tz>) -> Result<CronEntry, SchedulerError> {
    let (timezone, expr) = match raw.strip_prefix("CRON_TZ=") {
        Some(rest) => {
            let (zone, expr) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| SchedulerError::MissingExpression(raw.to_string()))?;
            let tz = Tz::from_str(zone)
                .map_err(|_| SchedulerError::InvalidTimezone(zone.to_string()))?;
            (Some(tz), expr.trim())
        }
        None => (default_tz, raw.trim()),
    };

    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|source| SchedulerError::InvalidExpression {
            expr: raw.to_string(),
            source,
        })?;

    Ok(CronEntry {
        schedule,
        timezone,
        raw: raw.to_string(),
    })
}

/// Fires workflow runs from cron expressions
pub struct Scheduler {
    controller: Arc<Controller>,
    default_tz: Option<Tz>,
    entries: Vec<(Arc<Dag>, CronEntry)>,
}

impl Scheduler {
    /// Build a scheduler over the given DAGs.
    ///
    /// Unparsable schedules are reported and skipped; they never take the
    /// scheduler down.
    pub fn new(
        controller: Arc<Controller>,
        dags: Vec<Arc<Dag>>,
        default_timezone: Option<&str>,
    ) -> Result<Self, SchedulerError> {
        let default_tz = match default_timezone {
            Some(name) => Some(
                Tz::from_str(name).map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))?,
            ),
            None => None,
        };

        let mut entries = Vec::new();
        for dag in dags {
            if dag.suspended {
                info!(workflow = %dag.name, "suspended, not scheduling");
                continue;
            }
            for raw in &dag.schedules {
                match parse_schedule(raw, default_tz) {
                    Ok(entry) => entries.push((Arc::clone(&dag), entry)),
                    Err(e) => warn!(workflow = %dag.name, "skipping schedule: {e}"),
                }
            }
        }

        Ok(Self {
            controller,
            default_tz,
            entries,
        })
    }

    /// Number of live schedule entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The configured default timezone.
    pub fn default_timezone(&self) -> Option<Tz> {
        self.default_tz
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.entries.is_empty() {
            info!("no schedules configured");
            cancel.cancelled().await;
            return;
        }
        info!(entries = self.entries.len(), "scheduler started");

        loop {
            let now = Utc::now();
            let mut next_fire: Option<DateTime<Utc>> = None;
            for (_, entry) in &self.entries {
                if let Some(at) = entry.next_after(now) {
                    next_fire = Some(match next_fire {
                        Some(current) => current.min(at),
                        None => at,
                    });
                }
            }
            let Some(at) = next_fire else {
                info!("no future fire times remain");
                cancel.cancelled().await;
                return;
            };

            let delay = (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));
            debug!(fire_at = %at, "sleeping until next fire time");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
            }

            // Fire every DAG with an entry matching this instant, once
            let mut fired: Vec<&str> = Vec::new();
            for (dag, entry) in &self.entries {
                if entry.next_after(now) != Some(at) {
                    continue;
                }
                if fired.contains(&dag.name.as_str()) {
                    continue;
                }
                fired.push(dag.name.as_str());

                info!(workflow = %dag.name, schedule = entry.raw(), "schedule fired");
                if let Err(e) = self.controller.start(dag, None).await {
                    warn!(workflow = %dag.name, "scheduled start rejected: {e}");
                }
            }
        }
    }
}
