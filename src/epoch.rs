use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio_util::sync::CancellationToken;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Maximum length of a single sleep slice. Short slices keep the wait
/// responsive to shutdown and to wall-clock anomalies.
const MAX_SLICE: Duration = Duration::from_secs(3);

/// Periodic-wake primitive aligned to multiples of wall-clock time from the
/// UNIX epoch, shifted by a stable per-identity random phase offset.
///
/// Epoch alignment makes independently-started processes converge on a
/// shared cadence; the per-identity offset desynchronizes the many runners
/// polling the same backend so they do not all wake in the same instant.
/// Once seeded, an identity's offset never changes for the process lifetime.
pub struct EpochScheduler {
    offsets: Mutex<HashMap<String, u64>>,
    shutdown: CancellationToken,
}

impl EpochScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            offsets: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Suspend until the next aligned boundary for `identity`.
    ///
    /// Returns `true` when the wait ran to completion and `false` when it
    /// was cut short by a shutdown request.
    pub async fn wait_for_epoch(&self, identity: &str, interval_secs: u64) -> bool {
        let interval_nanos = interval_secs * NANOS_PER_SEC;
        let delta = compute_delta(now_unix_nanos(), interval_nanos);
        let offset = self.offset_for(identity, interval_nanos);
        let target = now_unix_nanos() + delta + offset;

        // Bail out if slicing ever runs past two full intervals; that only
        // happens when the wall clock misbehaves underneath us.
        let budget = 2 * interval_nanos;
        let mut slept: u64 = 0;

        while now_unix_nanos() < target {
            if slept > budget {
                tracing::warn!(
                    identity,
                    interval_secs,
                    "epoch wait exceeded two intervals, bailing out"
                );
                break;
            }
            if self.shutdown.is_cancelled() {
                return false;
            }

            let remaining = Duration::from_nanos(target.saturating_sub(now_unix_nanos()));
            let slice = remaining.min(MAX_SLICE);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = self.shutdown.cancelled() => return false,
            }
            slept += slice.as_nanos() as u64;
        }

        true
    }

    /// Look up the stable phase offset for `identity`, seeding it on first
    /// use with a uniform value in `[0, interval)`.
    fn offset_for(&self, identity: &str, interval_nanos: u64) -> u64 {
        let mut offsets = self.offsets.lock().expect("offset table lock poisoned");
        *offsets
            .entry(identity.to_string())
            .or_insert_with(|| rand::thread_rng().gen_range(0..interval_nanos))
    }
}

/// Nanoseconds until the next multiple of `interval_nanos`, always at least
/// one second out so we never schedule a near-zero sleep.
fn compute_delta(now_nanos: u64, interval_nanos: u64) -> u64 {
    let mut delta = interval_nanos - (now_nanos % interval_nanos);
    if delta < NANOS_PER_SEC {
        delta += interval_nanos;
    }
    delta
}

fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_nanos() as u64
}
