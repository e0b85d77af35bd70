use std::time::Duration;

use tokio::time::Instant;

use crate::models::ProgressUpdate;

/// Minimum wall time between two speed samples.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Turns raw byte counters from a streaming fetch into progress updates.
///
/// Speed is a point sample, `bytes since last sample / seconds since last
/// sample`, taken at most once per [`SPEED_SAMPLE_INTERVAL`] and once more at
/// the final 100% callback. It is not smoothed.
#[derive(Debug)]
pub struct ProgressSampler {
    last_update: Instant,
    last_bytes: u64,
    last_progress: Option<u8>
}

impl ProgressSampler {
    pub fn new(now: Instant) -> Self {
        Self {
            last_update: now,
            last_bytes: 0,
            last_progress: None
        }
    }

    /// Returns an update when the percentage moved or a speed sample is due.
    pub fn sample(&mut self, downloaded: u64, total: u64, now: Instant) -> Option<ProgressUpdate> {
        let progress = percent(downloaded, total);
        let elapsed = now.saturating_duration_since(self.last_update);
        let is_final = total > 0 && downloaded >= total;
        let speed_due = elapsed >= SPEED_SAMPLE_INTERVAL || (is_final && !elapsed.is_zero());

        let speed = if speed_due {
            let bytes = downloaded.saturating_sub(self.last_bytes);
            self.last_update = now;
            self.last_bytes = downloaded;
            #[allow(clippy::cast_precision_loss)]
            Some(bytes as f64 / elapsed.as_secs_f64())
        } else {
            None
        };

        if speed.is_none() && progress == self.last_progress {
            return None;
        }
        self.last_progress = progress;

        Some(ProgressUpdate {
            progress,
            bytes_downloaded: Some(downloaded),
            total_bytes: (total > 0).then_some(total),
            speed,
            ..ProgressUpdate::default()
        })
    }
}

/// `round(downloaded / total * 100)` clamped to `0..=100`; `None` when the
/// total is unknown.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn percent(downloaded: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (downloaded as f64 / total as f64 * 100.0).round();
    Some(pct.clamp(0.0, 100.0) as u8)
}
