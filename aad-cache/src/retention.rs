//! Purging of entries that were not authenticated online for a long time.

use rusqlite::{Connection, TransactionBehavior};

use crate::error::Context;
use crate::{schema, CacheError};

/// Revalidation period used when none is configured, in days.
pub const DEFAULT_EXPIRATION_DAYS: i32 = 90;

pub(crate) const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Entries whose last online authentication is older than this are purged.
///
/// `None` if purging is disabled (`expiration_days == 0`). A negative period disables offline
/// authentication but entries are still purged using the default period.
pub fn cutoff(now: i64, expiration_days: i32) -> Option<i64> {
    let days = match expiration_days {
        0 => return None,
        days if days < 0 => DEFAULT_EXPIRATION_DAYS,
        days => days,
    };
    Some(now - 2 * i64::from(days) * SECONDS_PER_DAY)
}

/// Delete stale entries in a single transaction. Returns the number of removed accounts.
pub fn clean_expired(
    conn: &mut Connection,
    now: i64,
    expiration_days: i32,
    with_shadow: bool,
) -> Result<usize, CacheError> {
    let Some(before) = cutoff(now, expiration_days) else {
        log::debug!("cache won't be cleaned up, credentials expiration is set to 0");
        return Ok(0);
    };

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("unable to start cleanup transaction")?;
    let removed = schema::delete_expired(&tx, before, with_shadow)?;
    tx.commit().context("unable to commit cleanup")?;

    if removed > 0 {
        log::info!("removed {removed} expired users from the cache");
    }
    Ok(removed)
}
