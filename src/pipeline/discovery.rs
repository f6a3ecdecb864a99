use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::context::RunnerContext;
use crate::epoch::EpochScheduler;
use crate::pipeline::SiteMsg;
use crate::source::JobSource;

const BACKOFF_STEP: Duration = Duration::from_secs(3 * 60);
const BACKOFF_CEILING: Duration = Duration::from_secs(60 * 60);

/// Counter of consecutive disabled discovery cycles, driving the growing
/// sleep window applied while the instance reports itself disabled.
///
/// The window grows geometrically (3, 6, 9, ... minutes) and self-heals:
/// the counter resets the moment the instance re-enables, when a known
/// re-enable timestamp would be passed by the sleep, or when the window
/// outgrows the one-hour ceiling.
#[derive(Debug, Default)]
pub struct DisabledBackoff {
    consecutive: u64,
}

impl DisabledBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter for one cycle.
    ///
    /// `disabled` is the instance's raw disabled value: `0` enabled, `1`
    /// disabled indefinitely, `>1` a re-enable epoch timestamp. Returns
    /// `None` when the instance is enabled and the cycle should proceed,
    /// or `Some(window)` to sleep and skip publishing. The window is
    /// clamped so a single step never exceeds one hour.
    pub fn next_window(&mut self, disabled: i64, now_unix: i64) -> Option<Duration> {
        if disabled == 0 {
            self.consecutive = 0;
            return None;
        }

        let candidate = self.consecutive + 1;
        let window = BACKOFF_STEP * candidate as u32;

        if disabled > 1 && now_unix + window.as_secs() as i64 >= disabled {
            // The sleep would carry us past the re-enable time; start over
            // next cycle so we notice promptly.
            self.consecutive = 0;
        } else if window > BACKOFF_CEILING {
            self.consecutive = 0;
        } else {
            self.consecutive = candidate;
        }

        Some(window.min(BACKOFF_CEILING))
    }

    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }
}

/// The site-discovery loop: wakes on an epoch-aligned cadence, fetches
/// instance status, applies the disabled backoff, and publishes discovered
/// sites for the retrieval pool.
pub struct SiteDiscoveryLoop {
    ctx: Arc<RunnerContext>,
    source: Arc<dyn JobSource>,
    scheduler: Arc<EpochScheduler>,
    interval_secs: u64,
    sites_tx: mpsc::Sender<SiteMsg>,
}

impl SiteDiscoveryLoop {
    pub fn new(
        ctx: Arc<RunnerContext>,
        source: Arc<dyn JobSource>,
        scheduler: Arc<EpochScheduler>,
        interval_secs: u64,
        sites_tx: mpsc::Sender<SiteMsg>,
    ) -> Self {
        Self {
            ctx,
            source,
            scheduler,
            interval_secs,
            sites_tx,
        }
    }

    pub async fn run(self) {
        let mut backoff = DisabledBackoff::new();

        loop {
            if !self
                .scheduler
                .wait_for_epoch("site-discovery", self.interval_secs)
                .await
                || self.ctx.shutdown_requested()
            {
                tracing::info!("Exiting site discovery loop");
                return;
            }

            let t0 = Instant::now();
            let status = match self.source.instance_status().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(error = %e, "Instance status fetch failed, treating as disabled");
                    self.ctx.metrics.record_get_sites(false, t0.elapsed());
                    // A fetch failure is handled like a disabled cycle.
                    backoff_sleep(&mut backoff, 1).await;
                    continue;
                }
            };

            if let Some(window) = backoff.next_window(status.disabled, unix_now()) {
                self.ctx.metrics.record_get_sites(true, t0.elapsed());
                if !window.is_zero() {
                    tracing::info!(
                        sleep_secs = window.as_secs(),
                        "Automatic execution disabled, backing off"
                    );
                    tokio::time::sleep(window).await;
                } else {
                    tracing::info!("Automatic execution disabled");
                }
                continue;
            }

            match self.source.list_sites(&status).await {
                Ok(sites) => {
                    self.ctx.metrics.record_get_sites(true, t0.elapsed());
                    for site in sites {
                        if self.sites_tx.send(SiteMsg::Site(site)).await.is_err() {
                            tracing::warn!("Sites channel closed, exiting site discovery loop");
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.ctx.metrics.record_get_sites(false, t0.elapsed());
                    tracing::warn!(error = %e, "Site listing failed, skipping cycle");
                }
            }
        }
    }
}

async fn backoff_sleep(backoff: &mut DisabledBackoff, disabled: i64) {
    if let Some(window) = backoff.next_window(disabled, unix_now()) {
        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_instance_resets_and_proceeds() {
        let mut backoff = DisabledBackoff::new();
        assert_eq!(backoff.next_window(1, 1_000), Some(BACKOFF_STEP));
        assert_eq!(backoff.consecutive(), 1);

        assert_eq!(backoff.next_window(0, 1_000), None);
        assert_eq!(backoff.consecutive(), 0);
    }

    #[test]
    fn window_grows_by_three_minutes_per_cycle() {
        let mut backoff = DisabledBackoff::new();
        let now = 1_700_000_000;

        assert_eq!(
            backoff.next_window(1, now),
            Some(Duration::from_secs(3 * 60))
        );
        assert_eq!(
            backoff.next_window(1, now),
            Some(Duration::from_secs(6 * 60))
        );
        assert_eq!(
            backoff.next_window(1, now),
            Some(Duration::from_secs(9 * 60))
        );
    }

    #[test]
    fn counter_resets_when_sleep_passes_reenable_time() {
        let mut backoff = DisabledBackoff::new();
        let now = 1_700_000_000i64;
        // Re-enables 600s from now: 3 and 6 and 9 minute windows fit, the
        // 12 minute window would pass it.
        let disabled_until = now + 600;

        assert_eq!(
            backoff.next_window(disabled_until, now),
            Some(Duration::from_secs(180))
        );
        assert_eq!(
            backoff.next_window(disabled_until, now),
            Some(Duration::from_secs(360))
        );
        assert_eq!(
            backoff.next_window(disabled_until, now),
            Some(Duration::from_secs(540))
        );
        assert_eq!(backoff.consecutive(), 3);

        assert_eq!(
            backoff.next_window(disabled_until, now),
            Some(Duration::from_secs(720))
        );
        assert_eq!(backoff.consecutive(), 0, "passing the re-enable time resets");
    }

    #[test]
    fn window_is_clamped_at_one_hour() {
        let mut backoff = DisabledBackoff::new();
        let now = 1_700_000_000;

        // Drive the counter up to the ceiling: 20 cycles reach exactly one
        // hour, the 21st would exceed it.
        for _ in 0..20 {
            let window = backoff.next_window(1, now).unwrap();
            assert!(window <= BACKOFF_CEILING);
        }
        assert_eq!(backoff.consecutive(), 20);

        let window = backoff.next_window(1, now).unwrap();
        assert_eq!(window, BACKOFF_CEILING, "step never exceeds one hour");
        assert_eq!(backoff.consecutive(), 0, "exceeding the ceiling resets");
    }

    #[test]
    fn indefinite_disable_keeps_growing_until_ceiling() {
        let mut backoff = DisabledBackoff::new();
        let now = 1_700_000_000;

        for expected in 1..=5u64 {
            let window = backoff.next_window(1, now).unwrap();
            assert_eq!(window, BACKOFF_STEP * expected as u32);
        }
    }
}
