use std::fmt::Write as _;

use anyhow::{bail, Error};

fn localtime(epoch: i64) -> Result<libc::tm, Error> {
    // SAFETY: all-zero is a valid libc::tm
    let mut result: libc::tm = unsafe { std::mem::zeroed() };
    let epoch: libc::time_t = epoch.try_into()?;

    unsafe {
        if libc::localtime_r(&epoch, &mut result).is_null() {
            bail!("libc::localtime failed for '{epoch}'");
        }
    }

    Ok(result)
}

/// Format a Unix epoch as RFC3339 in local time.
pub fn epoch_to_rfc3339(epoch: i64) -> Result<String, Error> {
    let tm = localtime(epoch)?;

    let year = tm.tm_year + 1900;
    if !(0..=9999).contains(&year) {
        bail!("epoch_to_rfc3339: wrong year '{year}'");
    }

    let mut offset = tm.tm_gmtoff;
    let prefix = if offset < 0 {
        offset = -offset;
        '-'
    } else {
        '+'
    };
    let mins = offset / 60;

    let mut s = String::new();
    let _ = write!(
        s,
        "{year:04}-{:02}-{:02}T{:02}:{:02}:{:02}{prefix}{:02}:{:02}",
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        mins / 60,
        mins % 60,
    );
    Ok(s)
}
