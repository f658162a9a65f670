//! Per-user background maintenance: expiry purge and page-vacuum,
//! scheduled opportunistically during normal request handling rather
//! than on its own timer thread.
//!
//! Grounded on the design notes' "spread purges over `[min, max]` hours"
//! policy (§9) and `syncstorage-settings::Pool`'s `vacuum_kb`/
//! `purge_{min,max}_hours` knobs; there's no teacher source for this
//! exact opportunistic-scheduling shape (the legacy implementation has no
//! maintenance scheduler at all), so the random-draw approach below is
//! this crate's own, built the way `rand::Rng::gen_range` is used
//! elsewhere in the pack for jittered scheduling.

use rand::Rng;

use syncstorage_common::SyncTimestamp;
use syncstorage_settings::Pool as PoolSettings;

use crate::models::UserDb;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Runs `db`'s purge if enough time has passed since its last purge,
/// where "enough" is drawn uniformly from `[purge_min_hours,
/// purge_max_hours]` so that many users' purges don't all land on the
/// same schedule. Also vacuums if the resulting free space clears
/// `vacuum_kb`. Returns the number of rows purged, or `None` if no purge
/// was due.
pub fn maybe_run(db: &UserDb, settings: &PoolSettings) -> Result<Option<i64>, syncstorage_common::DbError> {
    let now = SyncTimestamp::now().as_i64();
    let last_purge = db.last_purge()?.unwrap_or(0);
    let elapsed_hours = (now - last_purge).max(0) as f64 / MILLIS_PER_HOUR;

    let threshold_hours = if settings.purge_min_hours >= settings.purge_max_hours {
        settings.purge_min_hours as f64
    } else {
        rand::thread_rng().gen_range(settings.purge_min_hours as f64..=settings.purge_max_hours as f64)
    };

    if elapsed_hours < threshold_hours {
        return Ok(None);
    }

    let purged = db.purge_expired()?;

    if settings.vacuum_kb > 0 {
        let usage = db.usage()?;
        let free_kb = usage.free_pages.saturating_mul(usage.page_size_bytes) / 1024;
        if free_kb >= settings.vacuum_kb as i64 {
            db.vacuum()?;
        }
    }

    db.record_purge(now)?;
    Ok(Some(purged))
}
