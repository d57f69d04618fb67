//! On-disk layout of the cache: the directory, the two database files and their permissions.

use std::fs::{DirBuilder, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat;
use nix::unistd::{Gid, Uid};

use crate::error::Context;
use crate::{schema, CacheError};

/// Default cache directory.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/aad/cache";

/// World readable database holding accounts and groups.
pub const PASSWD_DB: &str = "accounts.db";

/// Database holding the password hashes, restricted to root and the shadow group.
pub const SHADOW_DB: &str = "shadow.db";

pub const DEFAULT_PASSWD_PERM: u32 = 0o644;
pub const DEFAULT_SHADOW_PERM: u32 = 0o640;

const CACHE_DIR_PERM: u32 = 0o755;

/// Access the current process has to the shadow database.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShadowMode {
    Unavailable,
    ReadOnly,
    ReadWrite,
}

impl std::str::FromStr for ShadowMode {
    type Err = CacheError;

    /// Accepts the numeric form (0, 1, 2) used by the override variables as well as names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "0" | "unavailable" => ShadowMode::Unavailable,
            "1" | "ro" | "read-only" => ShadowMode::ReadOnly,
            "2" | "rw" | "read-write" => ShadowMode::ReadWrite,
            other => return Err(CacheError::InvalidAttribute(other.to_string())),
        })
    }
}

/// Ownership and mode applied to freshly created cache files.
#[derive(Clone, Copy, Debug)]
struct FileOptions {
    perm: stat::Mode,
    owner: Uid,
    group: Gid,
}

impl FileOptions {
    fn new(perm: u32, owner: u32, group: u32) -> Self {
        Self {
            perm: stat::Mode::from_bits_truncate(perm as libc::mode_t),
            owner: Uid::from_raw(owner),
            group: Gid::from_raw(group),
        }
    }

    fn apply_to(&self, file: &File, path: &Path) -> Result<(), CacheError> {
        stat::fchmod(file.as_raw_fd(), self.perm).context(format!("fchmod {path:?} failed"))?;

        let res = unsafe {
            libc::fchown(file.as_raw_fd(), self.owner.as_raw(), self.group.as_raw())
        };
        Errno::result(res).context(format!("fchown {path:?} failed"))?;

        Ok(())
    }

    /// Compare an existing file against the expected owner, group and mode.
    fn verify(&self, path: &Path) -> Result<(), CacheError> {
        let meta = std::fs::metadata(path).context(format!("unable to stat {path:?}"))?;

        let tampered = |reason: String| CacheError::Tampering {
            path: path.to_owned(),
            reason,
        };

        if meta.uid() != self.owner.as_raw() {
            return Err(tampered(format!(
                "owner is {}, expected {}",
                meta.uid(),
                self.owner
            )));
        }
        if meta.gid() != self.group.as_raw() {
            return Err(tampered(format!(
                "group is {}, expected {}",
                meta.gid(),
                self.group
            )));
        }
        let mode = meta.mode() & 0o7777;
        if mode != self.perm.bits() as u32 {
            return Err(tampered(format!(
                "mode is {mode:04o}, expected {:04o}",
                self.perm.bits()
            )));
        }

        Ok(())
    }
}

/// The cache directory with its two database files.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    dir: PathBuf,
    passwd: FileOptions,
    shadow: FileOptions,
    root_uid: u32,
    root_gid: u32,
}

impl StoreLayout {
    pub fn new(
        dir: impl Into<PathBuf>,
        root_uid: u32,
        root_gid: u32,
        shadow_gid: u32,
        passwd_perm: u32,
        shadow_perm: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            passwd: FileOptions::new(passwd_perm, root_uid, root_gid),
            shadow: FileOptions::new(shadow_perm, root_uid, shadow_gid),
            root_uid,
            root_gid,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn passwd_path(&self) -> PathBuf {
        self.dir.join(PASSWD_DB)
    }

    pub fn shadow_path(&self) -> PathBuf {
        self.dir.join(SHADOW_DB)
    }

    /// Make sure both database files exist with the expected permissions.
    ///
    /// If either file is missing the directory is wiped and recreated, which requires the
    /// process to run with the configured root ids. Existing files must match the expected
    /// owner, group and mode exactly.
    pub fn initialize(&self) -> Result<(), CacheError> {
        let passwd_path = self.passwd_path();
        let shadow_path = self.shadow_path();

        if passwd_path.exists() && shadow_path.exists() {
            self.passwd.verify(&passwd_path)?;
            self.shadow.verify(&shadow_path)?;
            return Ok(());
        }

        if Uid::effective().as_raw() != self.root_uid || Gid::effective().as_raw() != self.root_gid
        {
            return Err(CacheError::NotPrivileged(self.dir.clone()));
        }

        log::info!("creating new cache databases in {:?}", self.dir);

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err).context(format!("unable to clean up {:?}", self.dir)),
        }
        DirBuilder::new()
            .recursive(true)
            .mode(CACHE_DIR_PERM)
            .create(&self.dir)
            .context(format!("unable to create cache directory {:?}", self.dir))?;

        create_file(&passwd_path, &self.passwd)?;
        schema::create_passwd_schema(&passwd_path)?;

        create_file(&shadow_path, &self.shadow)?;
        schema::create_shadow_schema(&shadow_path)?;

        Ok(())
    }

    /// Check which access this process has to the shadow database.
    ///
    /// Opens the file instead of asking access(2), which checks the real ids and gets setuid
    /// callers like su or sudo wrong.
    pub fn detect_shadow_mode(&self) -> ShadowMode {
        let path = self.shadow_path();
        if OpenOptions::new().read(true).write(true).open(&path).is_ok() {
            ShadowMode::ReadWrite
        } else if File::open(&path).is_ok() {
            ShadowMode::ReadOnly
        } else {
            ShadowMode::Unavailable
        }
    }
}

fn create_file(path: &Path, options: &FileOptions) -> Result<(), CacheError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(options.perm.bits() as u32)
        .open(path)
        .context(format!("unable to create {path:?}"))?;
    options.apply_to(&file, path)
}

/// Look up the id of the `shadow` group.
pub fn shadow_group_id() -> Result<u32, CacheError> {
    match nix::unistd::Group::from_name("shadow") {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(CacheError::Inconsistent(
            "no 'shadow' group on this system".to_string(),
        )),
        Err(err) => Err(err).context("unable to look up the 'shadow' group"),
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::test_util::TestDir;

    fn layout(dir: &TestDir) -> StoreLayout {
        StoreLayout::new(
            dir.path().join("cache"),
            Uid::effective().as_raw(),
            Gid::effective().as_raw(),
            Gid::effective().as_raw(),
            DEFAULT_PASSWD_PERM,
            DEFAULT_SHADOW_PERM,
        )
    }

    #[test]
    fn test_initialize_creates_files() {
        let dir = TestDir::new();
        let layout = layout(&dir);

        layout.initialize().unwrap();

        let passwd = std::fs::metadata(layout.passwd_path()).unwrap();
        assert_eq!(passwd.permissions().mode() & 0o7777, 0o644);
        let shadow = std::fs::metadata(layout.shadow_path()).unwrap();
        assert_eq!(shadow.permissions().mode() & 0o7777, 0o640);

        // a second run only verifies
        layout.initialize().unwrap();
    }

    #[test]
    fn test_changed_mode_is_tampering() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        layout.initialize().unwrap();

        std::fs::set_permissions(
            layout.shadow_path(),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        assert!(matches!(
            layout.initialize(),
            Err(CacheError::Tampering { .. })
        ));
    }

    #[test]
    fn test_unprivileged_creation_fails() {
        let dir = TestDir::new();
        let layout = StoreLayout::new(
            dir.path().join("cache"),
            Uid::effective().as_raw().wrapping_add(1),
            Gid::effective().as_raw(),
            Gid::effective().as_raw(),
            DEFAULT_PASSWD_PERM,
            DEFAULT_SHADOW_PERM,
        );

        assert!(matches!(
            layout.initialize(),
            Err(CacheError::NotPrivileged(_))
        ));
        assert!(!layout.passwd_path().exists());
    }

    #[test]
    fn test_missing_file_recreates_cache() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        layout.initialize().unwrap();

        std::fs::remove_file(layout.shadow_path()).unwrap();
        std::fs::write(layout.dir().join("leftover"), b"x").unwrap();

        layout.initialize().unwrap();
        assert!(layout.shadow_path().exists());
        assert!(!layout.dir().join("leftover").exists());
    }

    #[test]
    fn test_detect_shadow_mode() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        layout.initialize().unwrap();
        assert_eq!(layout.detect_shadow_mode(), ShadowMode::ReadWrite);

        // root ignores permission bits
        if Uid::effective().is_root() {
            return;
        }

        let set_mode = |mode| {
            std::fs::set_permissions(layout.shadow_path(), std::fs::Permissions::from_mode(mode))
                .unwrap()
        };
        set_mode(0o440);
        assert_eq!(layout.detect_shadow_mode(), ShadowMode::ReadOnly);
        set_mode(0o000);
        assert_eq!(layout.detect_shadow_mode(), ShadowMode::Unavailable);
    }

    #[test]
    fn test_detect_shadow_mode_uses_effective_ids() {
        // needs a privileged process to change the real uid
        if !Uid::effective().is_root() {
            return;
        }

        let dir = TestDir::new();
        let layout = layout(&dir);
        layout.initialize().unwrap();

        let root = Uid::effective();
        let nobody = Uid::from_raw(65534);
        nix::unistd::setresuid(nobody, root, root).unwrap();
        let mode = layout.detect_shadow_mode();
        nix::unistd::setresuid(root, root, root).unwrap();

        assert_eq!(mode, ShadowMode::ReadWrite);
    }

    #[test]
    fn test_shadow_mode_parse() {
        assert_eq!("0".parse::<ShadowMode>().unwrap(), ShadowMode::Unavailable);
        assert_eq!("1".parse::<ShadowMode>().unwrap(), ShadowMode::ReadOnly);
        assert_eq!("rw".parse::<ShadowMode>().unwrap(), ShadowMode::ReadWrite);
        assert!("3".parse::<ShadowMode>().is_err());
        assert!(ShadowMode::ReadOnly < ShadowMode::ReadWrite);
    }
}
