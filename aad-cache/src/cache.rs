//! The cache handle and the process wide registry of open databases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use crate::error::Context;
use crate::layout::{self, ShadowMode, StoreLayout};
use crate::retention::{self, SECONDS_PER_DAY};
use crate::schema::{
    self, Attribute, AttributeValue, GroupRecord, ShadowRecord, UserRecord, PASSWORD_PLACEHOLDER,
};
use crate::{crypt, epoch_i64, home, uid, CacheError};

/// How long an unused database stays open.
pub const DEFAULT_TEARDOWN_DELAY: Duration = Duration::from_secs(30);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for opening the cache. Handles opened with equal options share one database.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheOptions {
    cache_dir: PathBuf,
    root_uid: u32,
    root_gid: u32,
    shadow_gid: Option<u32>,
    passwd_perm: u32,
    shadow_perm: u32,
    shadow_mode: Option<ShadowMode>,
    read_only: bool,
    offline_credentials_expiration: i32,
    teardown_delay: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self {
            cache_dir: PathBuf::from(layout::DEFAULT_CACHE_DIR),
            root_uid: 0,
            root_gid: 0,
            shadow_gid: None,
            passwd_perm: layout::DEFAULT_PASSWD_PERM,
            shadow_perm: layout::DEFAULT_SHADOW_PERM,
            shadow_mode: None,
            read_only: false,
            offline_credentials_expiration: retention::DEFAULT_EXPIRATION_DAYS,
            teardown_delay: DEFAULT_TEARDOWN_DELAY,
        }
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Owner of both database files.
    pub fn root_uid(mut self, uid: u32) -> Self {
        self.root_uid = uid;
        self
    }

    /// Group of the accounts database.
    pub fn root_gid(mut self, gid: u32) -> Self {
        self.root_gid = gid;
        self
    }

    /// Group of the shadow database. Defaults to the system's `shadow` group.
    pub fn shadow_gid(mut self, gid: u32) -> Self {
        self.shadow_gid = Some(gid);
        self
    }

    pub fn passwd_perm(mut self, perm: u32) -> Self {
        self.passwd_perm = perm;
        self
    }

    pub fn shadow_perm(mut self, perm: u32) -> Self {
        self.shadow_perm = perm;
        self
    }

    /// Skip access detection and use this mode for the shadow database.
    pub fn force_shadow_mode(mut self, mode: ShadowMode) -> Self {
        self.shadow_mode = Some(mode);
        self
    }

    /// Never write, even if the caller could. Name service lookups open the cache this way.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Days an entry may be used offline after its last online authentication. `0` keeps
    /// entries forever, a negative value disables offline authentication.
    pub fn offline_credentials_expiration(mut self, days: i32) -> Self {
        self.offline_credentials_expiration = days;
        self
    }

    pub fn teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    pub fn get_cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[derive(Default)]
struct Cursor {
    last: Option<String>,
}

#[derive(Default)]
struct Cursors {
    users: Option<Cursor>,
    groups: Option<Cursor>,
    shadow: Option<Cursor>,
}

struct DbState {
    conn: Connection,
    cursors: Cursors,
}

struct CacheDb {
    state: Mutex<DbState>,
    shadow_mode: ShadowMode,
    expiration_days: i32,
}

impl CacheDb {
    fn open(options: &CacheOptions) -> Result<Self, CacheError> {
        let shadow_gid = match options.shadow_gid {
            Some(gid) => gid,
            None => layout::shadow_group_id()?,
        };

        let layout = StoreLayout::new(
            &options.cache_dir,
            options.root_uid,
            options.root_gid,
            shadow_gid,
            options.passwd_perm,
            options.shadow_perm,
        );
        layout.initialize()?;

        let mut shadow_mode = options
            .shadow_mode
            .unwrap_or_else(|| layout.detect_shadow_mode());
        if options.read_only {
            shadow_mode = shadow_mode.min(ShadowMode::ReadOnly);
        }
        log::debug!("opening cache in {:?}, shadow mode {shadow_mode:?}", layout.dir());

        let access = if shadow_mode == ShadowMode::ReadWrite {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        };
        let path = layout.passwd_path();
        let mut conn = Connection::open_with_flags(
            &path,
            access | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )
        .context(format!("unable to open {path:?}"))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("unable to set busy timeout")?;

        if shadow_mode >= ShadowMode::ReadOnly {
            schema::attach_shadow(&conn, &layout.shadow_path())?;
        }

        if shadow_mode == ShadowMode::ReadWrite {
            retention::clean_expired(
                &mut conn,
                epoch_i64(),
                options.offline_credentials_expiration,
                true,
            )?;
        }

        Ok(Self {
            state: Mutex::new(DbState {
                conn,
                cursors: Cursors::default(),
            }),
            shadow_mode,
            expiration_days: options.offline_credentials_expiration,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

struct Slot {
    db: Arc<CacheDb>,
    users: usize,
    /// Set while unused, the reaper drops the slot once this has passed.
    expires: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<CacheOptions, Slot>,
    reaper_running: bool,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(Default::default);
static REAPER_WAKEUP: Condvar = Condvar::new();

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|err| err.into_inner())
}

fn release(key: &CacheOptions) {
    let mut registry = registry();
    let Some(slot) = registry.slots.get_mut(key) else {
        return;
    };

    slot.users = slot.users.saturating_sub(1);
    if slot.users > 0 {
        return;
    }

    if key.teardown_delay.is_zero() {
        registry.slots.remove(key);
        return;
    }
    slot.expires = Some(Instant::now() + key.teardown_delay);

    if registry.reaper_running {
        REAPER_WAKEUP.notify_one();
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("aad-cache-reaper".to_string())
        .spawn(reap);
    match spawned {
        Ok(_) => registry.reaper_running = true,
        Err(err) => {
            log::warn!("unable to delay cache teardown: {err}");
            registry.slots.remove(key);
        }
    }
}

/// Drop expired slots until none is pending, then exit.
fn reap() {
    let mut registry = registry();
    loop {
        let now = Instant::now();
        registry.slots.retain(|key, slot| match slot.expires {
            Some(deadline) if deadline <= now => {
                log::debug!("closing unused cache in {:?}", key.cache_dir);
                false
            }
            _ => true,
        });

        let Some(next) = registry.slots.values().filter_map(|slot| slot.expires).min() else {
            registry.reaper_running = false;
            return;
        };

        registry = match REAPER_WAKEUP.wait_timeout(registry, next - now) {
            Ok((registry, _)) => registry,
            Err(err) => err.into_inner().0,
        };
    }
}

/// A handle on the cache.
///
/// Dropping the handle releases it. The database stays open for the configured teardown delay so
/// that quickly following opens can reuse it.
pub struct Cache {
    db: Arc<CacheDb>,
    key: CacheOptions,
}

impl Cache {
    /// Open the cache, or reuse a database already opened with the same options.
    pub fn open(options: CacheOptions) -> Result<Self, CacheError> {
        let mut registry = registry();

        if let Some(slot) = registry.slots.get_mut(&options) {
            slot.users += 1;
            slot.expires = None;
            return Ok(Self {
                db: Arc::clone(&slot.db),
                key: options,
            });
        }

        let db = Arc::new(CacheDb::open(&options)?);
        registry.slots.insert(
            options.clone(),
            Slot {
                db: Arc::clone(&db),
                users: 1,
                expires: None,
            },
        );

        Ok(Self { db, key: options })
    }

    /// Release the handle. Same as dropping it.
    pub fn close(self) {}

    pub fn shadow_mode(&self) -> ShadowMode {
        self.db.shadow_mode
    }

    pub fn shadow_readable(&self) -> bool {
        self.db.shadow_mode >= ShadowMode::ReadOnly
    }

    fn require_shadow_readable(&self) -> Result<(), CacheError> {
        if !self.shadow_readable() {
            return Err(CacheError::ShadowNotReadable);
        }
        Ok(())
    }

    pub fn user_by_name(&self, login: &str) -> Result<UserRecord, CacheError> {
        schema::user_by_name(&self.db.lock().conn, login)
    }

    pub fn user_by_uid(&self, uid: u32) -> Result<UserRecord, CacheError> {
        schema::user_by_uid(&self.db.lock().conn, uid)
    }

    pub fn group_by_name(&self, name: &str) -> Result<GroupRecord, CacheError> {
        schema::group_by_name(&self.db.lock().conn, name)
    }

    pub fn group_by_gid(&self, gid: u32) -> Result<GroupRecord, CacheError> {
        schema::group_by_gid(&self.db.lock().conn, gid)
    }

    pub fn shadow_by_name(&self, login: &str) -> Result<ShadowRecord, CacheError> {
        self.require_shadow_readable()?;
        schema::shadow_by_name(&self.db.lock().conn, login)
    }

    pub fn all_logins(&self) -> Result<Vec<String>, CacheError> {
        schema::all_logins(&self.db.lock().conn)
    }

    pub fn query_attribute(
        &self,
        login: &str,
        attribute: Attribute,
    ) -> Result<AttributeValue, CacheError> {
        if attribute == Attribute::ShadowPassword {
            self.require_shadow_readable()?;
        }
        schema::query_attribute(&self.db.lock().conn, login, attribute)
    }

    /// Change one of the [`Attribute::UPDATABLE`] attributes of an account.
    pub fn update_attribute(
        &self,
        login: &str,
        attribute: Attribute,
        value: &str,
    ) -> Result<(), CacheError> {
        if !attribute.is_updatable() {
            return Err(CacheError::ReadOnlyAttribute(attribute.to_string()));
        }
        if self.db.shadow_mode != ShadowMode::ReadWrite {
            return Err(CacheError::ReadOnly);
        }

        let mut state = self.db.lock();
        let tx = state
            .conn
            .transaction()
            .context("unable to start transaction")?;
        schema::update_account_attribute(&tx, login, attribute, value)?;
        tx.commit().context("unable to commit attribute update")
    }

    /// Restart the iteration over all accounts.
    pub fn start_user_iteration(&self) {
        self.db.lock().cursors.users = Some(Cursor::default());
    }

    /// Next account of the current iteration, `None` once all were returned. Starts an
    /// iteration if none is running.
    pub fn next_user(&self) -> Result<Option<UserRecord>, CacheError> {
        let mut state = self.db.lock();
        let DbState { conn, cursors } = &mut *state;
        let cursor = cursors.users.get_or_insert_with(Cursor::default);

        let user = schema::next_user(conn, cursor.last.as_deref())?;
        if let Some(user) = &user {
            cursor.last = Some(user.login.clone());
        }
        Ok(user)
    }

    pub fn close_user_iteration(&self) {
        self.db.lock().cursors.users = None;
    }

    pub fn start_group_iteration(&self) {
        self.db.lock().cursors.groups = Some(Cursor::default());
    }

    pub fn next_group(&self) -> Result<Option<GroupRecord>, CacheError> {
        let mut state = self.db.lock();
        let DbState { conn, cursors } = &mut *state;
        let cursor = cursors.groups.get_or_insert_with(Cursor::default);

        let group = schema::next_group(conn, cursor.last.as_deref())?;
        if let Some(group) = &group {
            cursor.last = Some(group.name.clone());
        }
        Ok(group)
    }

    pub fn close_group_iteration(&self) {
        self.db.lock().cursors.groups = None;
    }

    pub fn start_shadow_iteration(&self) -> Result<(), CacheError> {
        self.require_shadow_readable()?;
        self.db.lock().cursors.shadow = Some(Cursor::default());
        Ok(())
    }

    pub fn next_shadow(&self) -> Result<Option<ShadowRecord>, CacheError> {
        self.require_shadow_readable()?;

        let mut state = self.db.lock();
        let DbState { conn, cursors } = &mut *state;
        let cursor = cursors.shadow.get_or_insert_with(Cursor::default);

        let shadow = schema::next_shadow(conn, cursor.last.as_deref())?;
        if let Some(shadow) = &shadow {
            cursor.last = Some(shadow.login.clone());
        }
        Ok(shadow)
    }

    pub fn close_shadow_iteration(&self) {
        self.db.lock().cursors.shadow = None;
    }

    /// Verify a password against the cached hash, for logins while the directory is
    /// unreachable.
    pub fn can_authenticate(&self, login: &str, password: &str) -> Result<(), CacheError> {
        log::info!("try to authenticate {login:?} from cache");

        self.require_shadow_readable()?;
        if self.db.expiration_days < 0 {
            return Err(CacheError::OfflineAuthDisabled);
        }

        let (user, shadow) = {
            let state = self.db.lock();
            (
                schema::user_by_name(&state.conn, login)?,
                schema::shadow_by_name(&state.conn, login)?,
            )
        };

        if self.db.expiration_days > 0 {
            let valid_until =
                user.last_online_auth + i64::from(self.db.expiration_days) * SECONDS_PER_DAY;
            log::debug!(
                "last online login of {login:?} was at {}, valid until {valid_until}",
                user.last_online_auth
            );
            if epoch_i64() > valid_until {
                return Err(CacheError::CredentialsExpired(user.login));
            }
        }

        crypt::verify_password(password, &shadow.password)
    }

    /// Record a successful online authentication.
    ///
    /// Creates the account, its private group and shadow entry if the login is not cached yet,
    /// using `home_pattern` (see [`crate::home`]) and `shell`. Always stores a fresh hash of
    /// `password` and the current time as last online authentication.
    pub fn update(
        &self,
        login: &str,
        password: &str,
        home_pattern: &str,
        shell: &str,
    ) -> Result<(), CacheError> {
        if self.db.shadow_mode != ShadowMode::ReadWrite {
            return Err(CacheError::ShadowNotWritable);
        }

        let hash = crypt::hash_password(password)?;
        let now = epoch_i64();

        let mut state = self.db.lock();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("unable to start transaction")?;

        match schema::user_by_name(&tx, login) {
            Ok(user) => {
                log::debug!("updating cached entry of {login:?}");
                schema::update_last_auth_and_password(&tx, user.uid, &hash, now)?;
            }
            Err(CacheError::NotFound) => {
                let uid = uid::allocate(&tx, login)?;
                let user = UserRecord {
                    login: login.to_string(),
                    password: PASSWORD_PLACEHOLDER.to_string(),
                    uid,
                    gid: uid,
                    gecos: String::new(),
                    home: home::expand(home_pattern, login, uid)?,
                    shell: shell.to_string(),
                    last_online_auth: now,
                };
                log::info!("adding {login:?} to the cache");
                schema::insert_account(&tx, &user, &hash)?;
            }
            Err(err) => return Err(err),
        }

        tx.commit().context(format!("unable to commit update of {login:?}"))
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        release(&self.key);
    }
}

#[cfg(test)]
mod test {
    use nix::unistd::{Gid, Uid};

    use super::*;
    use crate::test_util::TestDir;

    fn options(dir: &TestDir) -> CacheOptions {
        CacheOptions::new()
            .cache_dir(dir.path().join("cache"))
            .root_uid(Uid::effective().as_raw())
            .root_gid(Gid::effective().as_raw())
            .shadow_gid(Gid::effective().as_raw())
            .force_shadow_mode(ShadowMode::ReadWrite)
    }

    fn registered(options: &CacheOptions) -> Option<usize> {
        registry().slots.get(options).map(|slot| slot.users)
    }

    #[test]
    fn test_reopen_shares_database() {
        let dir = TestDir::new();
        let options = options(&dir).teardown_delay(Duration::ZERO);

        let first = Cache::open(options.clone()).unwrap();
        let second = Cache::open(options.clone()).unwrap();
        assert!(Arc::ptr_eq(&first.db, &second.db));
        assert_eq!(registered(&options), Some(2));

        drop(first);
        assert_eq!(registered(&options), Some(1));
        second.close();
        assert_eq!(registered(&options), None);
    }

    #[test]
    fn test_different_options_do_not_share() {
        let dir = TestDir::new();
        let first = Cache::open(options(&dir)).unwrap();
        let second = Cache::open(options(&dir).offline_credentials_expiration(3)).unwrap();
        assert!(!Arc::ptr_eq(&first.db, &second.db));
    }

    #[test]
    fn test_delayed_teardown() {
        let dir = TestDir::new();
        let options = options(&dir).teardown_delay(Duration::from_millis(100));

        let cache = Cache::open(options.clone()).unwrap();
        drop(cache);
        assert_eq!(registered(&options), Some(0));

        // reopening within the delay cancels the teardown
        let cache = Cache::open(options.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(registered(&options), Some(1));

        drop(cache);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(registered(&options), None);
    }

    fn reaper_threads() -> usize {
        std::fs::read_dir("/proc/self/task")
            .unwrap()
            .flatten()
            .filter(|task| {
                std::fs::read_to_string(task.path().join("comm"))
                    .is_ok_and(|comm| comm.trim() == "aad-cache-reaper")
            })
            .count()
    }

    #[test]
    fn test_teardown_uses_one_thread() {
        let dir = TestDir::new();
        let options = options(&dir).teardown_delay(Duration::from_secs(5));

        for _ in 0..200 {
            drop(Cache::open(options.clone()).unwrap());
        }
        assert_eq!(registered(&options), Some(0));
        assert!(registry().reaper_running);
        // the thread names itself once it runs
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reaper_threads(), 1);

        // a shorter delay on another cache is not held up by the pending one
        let other = TestDir::new();
        let short = self::options(&other).teardown_delay(Duration::from_millis(50));
        drop(Cache::open(short.clone()).unwrap());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(registered(&short), None);
        assert_eq!(registered(&options), Some(0));
    }

    #[test]
    fn test_iteration_restart_and_close() {
        let dir = TestDir::new();
        let cache = Cache::open(options(&dir)).unwrap();
        cache.update("bob@example.com", "pw", "/home/%u", "/bin/sh").unwrap();
        cache.update("alice@example.com", "pw", "/home/%u", "/bin/sh").unwrap();

        cache.start_user_iteration();
        assert_eq!(cache.next_user().unwrap().unwrap().login, "alice@example.com");

        cache.start_user_iteration();
        assert_eq!(cache.next_user().unwrap().unwrap().login, "alice@example.com");
        assert_eq!(cache.next_user().unwrap().unwrap().login, "bob@example.com");
        assert!(cache.next_user().unwrap().is_none());
        assert!(cache.next_user().unwrap().is_none());

        cache.close_user_iteration();
        cache.close_user_iteration();
        assert_eq!(cache.next_user().unwrap().unwrap().login, "alice@example.com");
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = TestDir::new();
        drop(Cache::open(options(&dir)).unwrap());

        let cache =
            Cache::open(options(&dir).force_shadow_mode(ShadowMode::ReadOnly)).unwrap();
        assert!(matches!(
            cache.update("alice@example.com", "pw", "/home/%u", "/bin/sh"),
            Err(CacheError::ShadowNotWritable)
        ));
        assert!(matches!(
            cache.update_attribute("alice@example.com", Attribute::Shell, "/bin/sh"),
            Err(CacheError::ReadOnly)
        ));
    }

    #[test]
    fn test_read_only_option_caps_shadow_mode() {
        let dir = TestDir::new();
        let cache = Cache::open(options(&dir).read_only(true).teardown_delay(Duration::ZERO))
            .unwrap();
        assert_eq!(cache.shadow_mode(), ShadowMode::ReadOnly);
        assert!(cache.shadow_readable());

        let cache = Cache::open(
            options(&dir)
                .force_shadow_mode(ShadowMode::Unavailable)
                .read_only(true)
                .teardown_delay(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(cache.shadow_mode(), ShadowMode::Unavailable);
    }
}
