//! Cache lookups mapped to name service results.

use libc::c_int;

use aad_cache::{Cache, CacheError, CacheOptions, GroupRecord, ShadowRecord, UserRecord};

/// `enum nss_status` of glibc.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    TryAgain = -2,
    Unavail = -1,
    NotFound = 0,
    Success = 1,
}

/// A lookup which did not produce an entry, as status and errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Failure {
    pub status: Status,
    pub errno: c_int,
}

impl Failure {
    pub const NOT_FOUND: Failure = Failure::new(Status::NotFound, libc::ENOENT);
    /// End of an enumeration.
    pub const EXHAUSTED: Failure = Failure::new(Status::Success, libc::ENOENT);
    pub const BUFFER_TOO_SMALL: Failure = Failure::new(Status::TryAgain, libc::ERANGE);
    pub const TRY_AGAIN: Failure = Failure::new(Status::TryAgain, libc::EAGAIN);
    pub const UNAVAILABLE: Failure = Failure::new(Status::Unavail, libc::ENOENT);
    pub const UNCLASSIFIED: Failure = Failure::new(Status::Success, libc::EINVAL);

    const fn new(status: Status, errno: c_int) -> Self {
        Self { status, errno }
    }
}

impl From<CacheError> for Failure {
    fn from(err: CacheError) -> Self {
        if err.is_not_found() {
            log::debug!("no record found");
            return Failure::NOT_FOUND;
        }
        if err.is_transient() {
            log::warn!("cache busy: {err}");
            return Failure::TRY_AGAIN;
        }
        if err.is_unavailable() || matches!(err, CacheError::ShadowNotReadable) {
            log::warn!("cache unavailable: {err}");
            return Failure::UNAVAILABLE;
        }
        log::error!("cache lookup failed: {err}");
        Failure::UNCLASSIFIED
    }
}

/// Hide the hash, so that pam_unix never authenticates a cached account on its own.
fn masked(mut shadow: ShadowRecord) -> ShadowRecord {
    shadow.password = "*".to_string();
    shadow.last_pwd_change = -1;
    shadow.min_pwd_age = -1;
    shadow.max_pwd_age = -1;
    shadow.pwd_warn_period = -1;
    shadow.pwd_inactivity = -1;
    shadow.expiration_date = -1;
    shadow
}

/// Entry point for name service lookups.
#[derive(Clone, Debug)]
pub struct Gateway {
    options: CacheOptions,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(CacheOptions::new())
    }
}

impl Gateway {
    /// The cache is always opened read-only.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options: options.read_only(true),
        }
    }

    /// Default options, with overrides from `NSS_AAD_*` variables in integration test builds.
    pub fn from_env() -> Self {
        #[cfg(feature = "integration-tests")]
        return Self::new(env_overrides(CacheOptions::new()));

        #[cfg(not(feature = "integration-tests"))]
        Self::default()
    }

    fn open(&self) -> Result<Cache, Failure> {
        Ok(Cache::open(self.options.clone())?)
    }

    pub fn passwd_by_name(&self, name: &str) -> Result<UserRecord, Failure> {
        log::debug!("passwd lookup of {name:?}");
        Ok(self.open()?.user_by_name(&name.to_lowercase())?)
    }

    pub fn passwd_by_uid(&self, uid: u32) -> Result<UserRecord, Failure> {
        log::debug!("passwd lookup of uid {uid}");
        Ok(self.open()?.user_by_uid(uid)?)
    }

    pub fn group_by_name(&self, name: &str) -> Result<GroupRecord, Failure> {
        log::debug!("group lookup of {name:?}");
        let name = name.to_lowercase();
        // opening the cache resolves the shadow group itself
        if name == "shadow" {
            return Err(Failure::NOT_FOUND);
        }
        Ok(self.open()?.group_by_name(&name)?)
    }

    pub fn group_by_gid(&self, gid: u32) -> Result<GroupRecord, Failure> {
        log::debug!("group lookup of gid {gid}");
        Ok(self.open()?.group_by_gid(gid)?)
    }

    pub fn shadow_by_name(&self, name: &str) -> Result<ShadowRecord, Failure> {
        log::debug!("shadow lookup of {name:?}");
        Ok(masked(self.open()?.shadow_by_name(&name.to_lowercase())?))
    }

    /// Shadow entries have no id lookup.
    pub fn shadow_by_uid(&self, _uid: u32) -> Result<ShadowRecord, Failure> {
        Err(Failure::NOT_FOUND)
    }
}

#[cfg(feature = "integration-tests")]
fn env_overrides(mut options: CacheOptions) -> CacheOptions {
    fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
        let value = std::env::var(name).ok()?;
        match value.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring invalid {name}={value:?}");
                None
            }
        }
    }

    if let Ok(dir) = std::env::var("NSS_AAD_CACHEDIR") {
        options = options.cache_dir(dir);
    }
    if let Some(uid) = var("NSS_AAD_ROOT_UID") {
        options = options.root_uid(uid);
    }
    if let Some(gid) = var("NSS_AAD_ROOT_GID") {
        options = options.root_gid(gid);
    }
    if let Some(gid) = var("NSS_AAD_SHADOW_GID") {
        options = options.shadow_gid(gid);
    }
    if let Some(mode) = var("NSS_AAD_SHADOW_MODE") {
        options = options.force_shadow_mode(mode);
    }
    options
}

/// Cache calls for one kind of enumerable entry.
pub trait Entity: Sized {
    fn start(cache: &Cache) -> Result<(), CacheError>;
    fn next(cache: &Cache) -> Result<Option<Self>, CacheError>;
    fn close(cache: &Cache);
}

impl Entity for UserRecord {
    fn start(cache: &Cache) -> Result<(), CacheError> {
        cache.start_user_iteration();
        Ok(())
    }

    fn next(cache: &Cache) -> Result<Option<Self>, CacheError> {
        cache.next_user()
    }

    fn close(cache: &Cache) {
        cache.close_user_iteration()
    }
}

impl Entity for GroupRecord {
    fn start(cache: &Cache) -> Result<(), CacheError> {
        cache.start_group_iteration();
        Ok(())
    }

    fn next(cache: &Cache) -> Result<Option<Self>, CacheError> {
        cache.next_group()
    }

    fn close(cache: &Cache) {
        cache.close_group_iteration()
    }
}

impl Entity for ShadowRecord {
    fn start(cache: &Cache) -> Result<(), CacheError> {
        cache.start_shadow_iteration()
    }

    fn next(cache: &Cache) -> Result<Option<Self>, CacheError> {
        Ok(cache.next_shadow()?.map(masked))
    }

    fn close(cache: &Cache) {
        cache.close_shadow_iteration()
    }
}

/// State of a `set*ent`/`get*ent`/`end*ent` sequence.
///
/// The cache handle is held for the whole sequence so the cursor survives between calls. An
/// entry which did not fit the caller's buffer is kept and returned again by the next call.
pub struct Enumeration<T> {
    cache: Option<Cache>,
    pending: Option<T>,
}

impl<T> Default for Enumeration<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Enumeration<T> {
    pub const fn new() -> Self {
        Self {
            cache: None,
            pending: None,
        }
    }
}

impl<T: Entity> Enumeration<T> {
    /// Restart from the first entry.
    pub fn set(&mut self, gateway: &Gateway) -> Result<(), Failure> {
        self.pending = None;
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => gateway.open()?,
        };
        let started = T::start(&cache);
        self.cache = Some(cache);
        Ok(started?)
    }

    pub fn next(&mut self, gateway: &Gateway) -> Result<T, Failure> {
        if let Some(entry) = self.pending.take() {
            return Ok(entry);
        }
        if self.cache.is_none() {
            self.set(gateway)?;
        }
        let Some(cache) = &self.cache else {
            return Err(Failure::UNAVAILABLE);
        };
        match T::next(cache)? {
            Some(entry) => Ok(entry),
            None => Err(Failure::EXHAUSTED),
        }
    }

    /// Keep `entry` for the next call to [`next`](Self::next).
    pub fn put_back(&mut self, entry: T) {
        self.pending = Some(entry);
    }

    pub fn end(&mut self) {
        self.pending = None;
        if let Some(cache) = self.cache.take() {
            T::close(&cache);
        }
    }
}
