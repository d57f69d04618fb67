//! Offline credential cache for Azure AD users.
//!
//! The cache consists of two SQLite databases in one directory:
//!
//! * `accounts.db`, world readable, holding the `passwd`, `groups` and `uid_gid` tables.
//! * `shadow.db`, readable by the `shadow` group only, holding the password hashes.
//!
//! Both are opened through a single connection (the shadow database is attached), so writes
//! spanning both files are atomic. Use [`Cache::open`] to get a handle:
//!
//! ```no_run
//! # use aad_cache::{Cache, CacheOptions};
//! # fn func() -> Result<(), aad_cache::CacheError> {
//! let cache = Cache::open(CacheOptions::new())?;
//! let user = cache.user_by_name("alice@example.com")?;
//! println!("{} has uid {}", user.login, user.uid);
//! # Ok(())
//! # }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

mod error;
pub use error::CacheError;

pub mod crypt;
pub mod home;
pub mod layout;
pub mod retention;
pub mod schema;
pub mod uid;

mod cache;
pub use cache::{Cache, CacheOptions, DEFAULT_TEARDOWN_DELAY};

pub use layout::ShadowMode;
pub use schema::{Attribute, AttributeValue, GroupRecord, ShadowRecord, UserRecord};

/// Unix epoch.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_secs()).unwrap_or(i64::MAX),
    }
}
