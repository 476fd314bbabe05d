//! Named recurring triggers.
//!
//! A trigger fires by sending its name on the wake channel; the consumer matches
//! the name before acting. Periods below [`MIN_ALARM_PERIOD`] are not honoured by
//! the recurring primitive, short one-off delays go through `delay_once`.

use crate::shared_file::SharedJsonFile;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const MIN_ALARM_PERIOD: Duration = Duration::from_secs(30);

#[async_trait]
pub trait AlarmHost: Send + Sync {
    /// Install a recurring trigger firing first after `first_fire`, then every
    /// `period`. An existing trigger with the same name is replaced.
    async fn create_at(&self, name: &str, first_fire: Duration, period: Duration) -> Result<()>;

    async fn create(&self, name: &str, period: Duration) -> Result<()> {
        self.create_at(name, period, period).await
    }

    /// Remove a trigger, returning whether one existed.
    async fn clear(&self, name: &str) -> Result<bool>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Fire `name` once after `delay`. Not subject to the minimum period.
    async fn delay_once(&self, name: &str, delay: Duration) -> Result<()>;
}

/// Installed triggers as recorded in the shared registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AlarmTable {
    #[serde(default)]
    alarms: BTreeMap<String, AlarmEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlarmEntry {
    owner: String,
    period_ms: u64,
    /// Renewed on every fire. Past this point the owner is presumed gone.
    expires_at_ms: i64,
}

impl AlarmEntry {
    fn is_live(&self) -> bool {
        self.expires_at_ms > Utc::now().timestamp_millis()
    }
}

/// Next expected fire plus one period of grace.
fn lease_expiry(next_fire: Duration, period: Duration) -> i64 {
    Utc::now().timestamp_millis() + (next_fire + period).as_millis() as i64
}

/// Extend `owner`'s lease on `name`. False once another host owns the trigger
/// or it was cleared.
async fn renew_lease(registry: &SharedJsonFile, name: &str, owner: &str, period: Duration) -> Result<bool> {
    registry
        .update(AlarmTable::default, |table| match table.alarms.get_mut(name) {
            Some(entry) if entry.owner == owner => {
                entry.expires_at_ms = lease_expiry(period, period);
                true
            }
            _ => false,
        })
        .await
}

/// [`AlarmHost`] backed by tokio interval tasks.
///
/// Without a registry the triggers are private to this process. With one, every
/// host pointed at the same registry file sees the same set of triggers: the
/// most recent `create` owns a name, and a host whose trigger was replaced or
/// cleared elsewhere stops firing it.
#[derive(Clone)]
pub struct TokioAlarmHost {
    alarms: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    wake_tx: mpsc::UnboundedSender<String>,
    owner: String,
    registry: Option<Arc<SharedJsonFile>>,
}

impl TokioAlarmHost {
    /// Returns the host and the receiving end of its wake channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let host = Self {
            alarms: Arc::new(Mutex::new(HashMap::new())),
            wake_tx,
            owner: hex::encode(rand::random::<[u8; 8]>()),
            registry: None,
        };
        (host, wake_rx)
    }

    /// Share trigger ownership with other hosts through the file at `path`.
    pub fn with_registry(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry = Some(Arc::new(SharedJsonFile::new(path)));
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn alarms(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_exists(&self, name: &str) -> bool {
        self.alarms()
            .get(name)
            .map_or(false, |handle| !handle.is_finished())
    }
}

#[async_trait]
impl AlarmHost for TokioAlarmHost {
    async fn create_at(&self, name: &str, first_fire: Duration, period: Duration) -> Result<()> {
        if period < MIN_ALARM_PERIOD || first_fire < MIN_ALARM_PERIOD {
            warn!(
                "Alarm '{}' timing ({:?} then every {:?}) is below the {:?} minimum, clamping",
                name, first_fire, period, MIN_ALARM_PERIOD
            );
        }
        let period = period.max(MIN_ALARM_PERIOD);
        let first_fire = first_fire.max(MIN_ALARM_PERIOD);

        if let Some(registry) = &self.registry {
            let entry = AlarmEntry {
                owner: self.owner.clone(),
                period_ms: period.as_millis() as u64,
                expires_at_ms: lease_expiry(first_fire, period),
            };
            registry
                .update(AlarmTable::default, |table| {
                    table.alarms.insert(name.to_string(), entry);
                })
                .await?;
        }

        let tx = self.wake_tx.clone();
        let registry = self.registry.clone();
        let owner = self.owner.clone();
        let alarm_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_fire, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(registry) = &registry {
                    match renew_lease(registry, &alarm_name, &owner, period).await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!("Alarm '{}' is now managed by another host, stopping", alarm_name);
                            break;
                        }
                        Err(e) => warn!("Failed to renew alarm '{}': {:#}", alarm_name, e),
                    }
                }
                if tx.send(alarm_name.clone()).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.alarms().insert(name.to_string(), handle) {
            previous.abort();
        }
        debug!("Alarm '{}' installed, first in {:?}, every {:?}", name, first_fire, period);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool> {
        let local = match self.alarms().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        let shared = match &self.registry {
            Some(registry) => {
                registry
                    .update(AlarmTable::default, |table| table.alarms.remove(name).is_some())
                    .await?
            }
            None => false,
        };
        Ok(local || shared)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match &self.registry {
            Some(registry) => {
                let table: AlarmTable = registry.read()?.unwrap_or_default();
                Ok(table.alarms.get(name).map_or(false, AlarmEntry::is_live))
            }
            None => Ok(self.local_exists(name)),
        }
    }

    async fn delay_once(&self, name: &str, delay: Duration) -> Result<()> {
        let tx = self.wake_tx.clone();
        let alarm_name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(alarm_name);
        });
        debug!("One-shot wake '{}' in {:?}", name, delay);
        Ok(())
    }
}

impl Drop for TokioAlarmHost {
    fn drop(&mut self) {
        // Only the last clone tears the timers down.
        if Arc::strong_count(&self.alarms) == 1 {
            for (_, handle) in self.alarms().drain() {
                handle.abort();
            }
        }
    }
}
