//! Auto-refresh driver.
//!
//! Periodically evaluates the configured schedule expression and, when a
//! window opens, submits an auto-refresh change through the standard
//! construction pipeline. Which snaps actually need refreshing is the
//! catalog's business: the driver delegates construction to a
//! [`RefreshBuilder`] collaborator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::schedule::{self, Schedule, parse_schedule};
use crate::state::{State, StateLock};

/// Default refresh timer: four randomized windows across the day.
pub const DEFAULT_SCHEDULE: &str = "00:00~24:00/4";

/// State key holding the last successful auto-refresh submission time.
pub const LAST_REFRESH_KEY: &str = "last-refresh";

/// State key holding the configured schedule expression.
pub const REFRESH_TIMER_KEY: &str = "refresh-timer";

/// State key holding an operator hold: no auto-refresh before this time.
pub const REFRESH_HOLD_KEY: &str = "refresh-hold";

/// Change kind submitted by the driver.
pub const AUTO_REFRESH_KIND: &str = "auto-refresh";

/// Minimum spacing between attempts, suppressing retry storms when the
/// catalog is unreachable.
pub const MIN_ATTEMPT_SPACING: Duration = Duration::from_secs(10 * 60);

/// Policy hook: when the schedule is externally managed the parser is not
/// consulted and the driver stays idle.
pub trait RefreshPolicy: Send + Sync {
    fn managed(&self) -> bool;
}

/// The default policy: refreshes follow the configured schedule.
pub struct ScheduledPolicy;

impl RefreshPolicy for ScheduledPolicy {
    fn managed(&self) -> bool {
        false
    }
}

/// Collaborator that knows what to refresh and builds the change for it.
/// Returns the new change id, or `None` when everything is current.
pub trait RefreshBuilder: Send + Sync {
    fn build_auto_refresh(&self, st: &mut State) -> SnapResult<Option<String>>;
}

/// Builder for hosts with no catalog wired up: nothing is ever stale.
pub struct NoopRefreshBuilder;

impl RefreshBuilder for NoopRefreshBuilder {
    fn build_auto_refresh(&self, _st: &mut State) -> SnapResult<Option<String>> {
        Ok(None)
    }
}

/// The periodic driver; `ensure` is invoked from the runner's ensure
/// cycle (or any external poke).
pub struct AutoRefresh {
    state: Arc<StateLock>,
    builder: Arc<dyn RefreshBuilder>,
    policy: Arc<dyn RefreshPolicy>,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
}

impl AutoRefresh {
    pub fn new(
        state: Arc<StateLock>,
        builder: Arc<dyn RefreshBuilder>,
        policy: Arc<dyn RefreshPolicy>,
    ) -> Self {
        Self {
            state,
            builder,
            policy,
            last_attempt: Mutex::new(None),
        }
    }

    /// One driver tick at the given instant.
    ///
    /// Inside an open window this submits at most one auto-refresh change
    /// and stamps `last-refresh`; outside it schedules a wake-up for the
    /// sampled fire instant of the next window.
    pub fn ensure(&self, now: DateTime<Utc>) -> SnapResult<()> {
        if self.policy.managed() {
            return Ok(());
        }

        let mut st = self.state.lock();

        if let Ok(hold) = st.get::<DateTime<Utc>>(REFRESH_HOLD_KEY)
            && hold > now
        {
            let until = (hold - now).to_std().unwrap_or(Duration::ZERO);
            st.ensure_before(until);
            return Ok(());
        }

        let schedules = self.schedules(&st);
        let last = st
            .get::<DateTime<Utc>>(LAST_REFRESH_KEY)
            .unwrap_or(DateTime::UNIX_EPOCH);

        let in_flight = st
            .changes()
            .any(|c| c.kind() == AUTO_REFRESH_KIND && !st.change_is_ready(c.id()));
        if in_flight {
            return Ok(());
        }

        let Some(window) = schedule::next(&schedules, last) else {
            return Ok(());
        };

        if window.start > now {
            let fire = window.fire_time(&mut rand::rng());
            let until = (fire - now).to_std().unwrap_or(Duration::ZERO);
            st.ensure_before(until);
            return Ok(());
        }

        // Inside (or past) the window. Keep failed attempts spaced out.
        {
            let last_attempt = self.last_attempt.lock();
            if let Some(at) = *last_attempt {
                let spacing = chrono::Duration::from_std(MIN_ATTEMPT_SPACING).expect("fits");
                if at + spacing > now {
                    let until = ((at + spacing) - now).to_std().unwrap_or(Duration::ZERO);
                    st.ensure_before(until);
                    return Ok(());
                }
            }
        }
        *self.last_attempt.lock() = Some(now);

        match self.builder.build_auto_refresh(&mut st) {
            Ok(Some(change_id)) => {
                st.set(LAST_REFRESH_KEY, &now)?;
                tracing::info!(change_id = %change_id, "Submitted auto-refresh change");
                Ok(())
            }
            Ok(None) => {
                st.set(LAST_REFRESH_KEY, &now)?;
                tracing::debug!("Auto-refresh window open, nothing to refresh");
                Ok(())
            }
            Err(e) => {
                // last-refresh stays put so the window is retried after
                // the attempt spacing.
                tracing::warn!("Auto-refresh construction failed: {}", e);
                st.ensure_before(MIN_ATTEMPT_SPACING);
                Err(e)
            }
        }
    }

    /// The configured schedule, falling back to the default on a missing
    /// or unparsable expression.
    fn schedules(&self, st: &State) -> Vec<Schedule> {
        let expr = match st.get::<String>(REFRESH_TIMER_KEY) {
            Ok(expr) => expr,
            Err(SnapError::NoEntry { .. }) => DEFAULT_SCHEDULE.to_string(),
            Err(_) => DEFAULT_SCHEDULE.to_string(),
        };
        match parse_schedule(&expr) {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::warn!(expr = %expr, "Bad refresh timer, using default: {}", e);
                parse_schedule(DEFAULT_SCHEDULE).expect("default schedule parses")
            }
        }
    }
}
