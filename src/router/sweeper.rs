//! Background restoration of quota-quarantined credentials.
//!
//! Runs on a fixed interval and additionally wakes at each backend's reset
//! hour so credentials come back as soon as their quota does. Also zeroes
//! daily token counters last written on an earlier UTC date, so a sweeper
//! started on a later day catches up on the first sweep.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::DatabaseError;
use crate::store::CredentialStore;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub restored: usize,
    pub tokens_reset: usize,
}

pub struct QuotaSweeper {
    store: Arc<dyn CredentialStore>,
    interval: Duration,
    schedules: Vec<cron::Schedule>,
}

impl QuotaSweeper {
    pub fn new(store: Arc<dyn CredentialStore>, config: &RouterConfig, interval: Duration) -> Self {
        let hours: BTreeSet<u32> = config.reset_hours.values().copied().collect();
        let schedules = hours
            .into_iter()
            .filter_map(|hour| {
                let expr = format!("0 0 {hour} * * *");
                match cron::Schedule::from_str(&expr) {
                    Ok(schedule) => Some(schedule),
                    Err(e) => {
                        warn!(hour, error = %e, "Skipping invalid reset hour");
                        None
                    }
                }
            })
            .collect();

        Self {
            store,
            interval,
            schedules,
        }
    }

    /// Earliest reset-hour firing strictly after `now`.
    pub fn next_reset_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&now).next())
            .min()
    }

    /// Restore every credential whose quota reset is due and zero token
    /// counters from earlier days.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let mut report = SweepReport::default();

        for credential in self.store.list_quota_due(now).await? {
            self.store.restore(credential.id).await?;
            debug!(credential_id = credential.id, backend = %credential.backend, "Quota reset, credential restored");
            report.restored += 1;
        }

        report.tokens_reset = self.store.reset_daily_tokens(now.date_naive()).await?;

        if report.restored > 0 || report.tokens_reset > 0 {
            info!(restored = report.restored, tokens_reset = report.tokens_reset, "Quota sweep");
        }
        Ok(report)
    }

    /// Spawn the sweep loop, sweeping once immediately. Stop it with
    /// [`SweeperHandle::stop`].
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep(Utc::now()).await {
                    warn!(error = %e, "Quota sweep failed");
                }

                let now = Utc::now();
                let wait = self
                    .next_reset_fire(now)
                    .and_then(|fire| (fire - now).to_std().ok())
                    .map_or(self.interval, |until| until.min(self.interval));

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Quota sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Quota sweeper task panicked");
        }
    }
}
