//! Adaptive polling schedule.
//!
//! The schedule is **Active** while the active account has an unconfirmed
//! transaction on the active chain or a UI surface is open, and **Idle**
//! otherwise. Active polls on the fast interval, Idle on the slow one. The alarm
//! primitive cannot change a period in place, so every transition clears and
//! recreates the trigger.

use crate::alarm::{AlarmHost, MIN_ALARM_PERIOD};
use crate::lock::LockManager;
use crate::state::StateStore;
use crate::sync_settings::SyncSettings;
use crate::types::ChainFamily;
use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_ALARM_NAME: &str = "walletsync.poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Active,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleState::Idle => write!(f, "Idle"),
            ScheduleState::Active => write!(f, "Active"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingPlan {
    pub state: ScheduleState,
    pub family: ChainFamily,
    pub interval_minutes: f64,
}

impl PollingPlan {
    /// The interval as a timer period. Fails on negative, zero or non-finite
    /// intervals.
    pub fn period(&self) -> Result<Duration> {
        match Duration::try_from_secs_f64(self.interval_minutes * 60.0) {
            Ok(period) if !period.is_zero() => Ok(period),
            _ => Err(anyhow!(
                "invalid {} poll interval: {} min",
                self.family.label(),
                self.interval_minutes
            )),
        }
    }
}

pub struct PollingScheduler {
    alarm_name: String,
    alarms: Arc<dyn AlarmHost>,
    locks: Arc<dyn LockManager>,
    store: Arc<dyn StateStore>,
    settings: SyncSettings,
}

impl PollingScheduler {
    pub fn new(
        alarms: Arc<dyn AlarmHost>,
        locks: Arc<dyn LockManager>,
        store: Arc<dyn StateStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            alarm_name: DEFAULT_ALARM_NAME.to_string(),
            alarms,
            locks,
            store,
            settings,
        }
    }

    pub fn with_alarm_name(mut self, name: impl Into<String>) -> Self {
        self.alarm_name = name.into();
        self
    }

    pub fn alarm_name(&self) -> &str {
        &self.alarm_name
    }

    /// Decide Idle or Active from the active account's stored transactions and
    /// the UI flag.
    pub async fn choose_interval(&self) -> Result<PollingPlan> {
        let chain = self.store.active_chain().await?;

        let pending = match self.store.active_account().await? {
            Some(account) => self
                .store
                .transactions(&account.id, chain)
                .await?
                .iter()
                .any(|tx| tx.is_pending()),
            None => false,
        };
        let ui_open = self.store.ui_open().await?;

        let state = if pending || ui_open {
            ScheduleState::Active
        } else {
            ScheduleState::Idle
        };
        let interval_minutes = self
            .settings
            .interval_minutes(chain.family, state == ScheduleState::Active);

        debug!(
            "Schedule for {}: {} (pending: {}, ui open: {})",
            chain, state, pending, ui_open
        );
        Ok(PollingPlan {
            state,
            family: chain.family,
            interval_minutes,
        })
    }

    /// Clear and recreate the recurring trigger at the current interval.
    pub async fn install(&self) -> Result<PollingPlan> {
        let _guard = self.locks.acquire(&self.alarm_name).await?;

        self.alarms.clear(&self.alarm_name).await?;
        let plan = self.choose_interval().await?;
        self.alarms.create(&self.alarm_name, plan.period()?).await?;

        info!(
            "Installed '{}': {} on {} chain, every {} min",
            self.alarm_name,
            plan.state,
            plan.family.label(),
            plan.interval_minutes
        );
        Ok(plan)
    }

    /// First-time install. Returns `None` when a trigger with this name is
    /// already in place.
    pub async fn ensure_installed(&self) -> Result<Option<PollingPlan>> {
        if self.alarms.exists(&self.alarm_name).await? {
            debug!("Alarm '{}' already installed, skipping", self.alarm_name);
            return Ok(None);
        }
        self.install().await.map(Some)
    }

    /// Whether a wake event belongs to this scheduler.
    pub fn handle_wake(&self, name: &str) -> bool {
        if name == self.alarm_name {
            true
        } else {
            debug!("Ignoring wake '{}' (expecting '{}')", name, self.alarm_name);
            false
        }
    }

    /// Bring the next poll forward to `delay` from now.
    ///
    /// Delays the alarm primitive can honour reinstall the trigger with an early
    /// first fire; shorter ones go through a one-off delayed wake and leave the
    /// recurring trigger alone.
    pub async fn wake_after(&self, delay: Duration) -> Result<()> {
        if delay < MIN_ALARM_PERIOD {
            debug!("Early wake for '{}' in {:?} via one-shot", self.alarm_name, delay);
            return self.alarms.delay_once(&self.alarm_name, delay).await;
        }

        let _guard = self.locks.acquire(&self.alarm_name).await?;
        self.alarms.clear(&self.alarm_name).await?;
        let plan = self.choose_interval().await?;
        let period = plan.period()?;
        self.alarms
            .create_at(&self.alarm_name, delay.min(period), period)
            .await?;
        info!(
            "Rescheduled '{}': next poll in {:?}, then every {} min",
            self.alarm_name, delay.min(period), plan.interval_minutes
        );
        Ok(())
    }
}
