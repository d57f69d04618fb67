use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{Gid, Uid};
use rusqlite::{params, Connection};

use aad_cache::uid::{initial_uid, UID_OFFSET};
use aad_cache::{epoch_i64, Attribute, AttributeValue, Cache, CacheError, CacheOptions, ShadowMode};

const DAY: i64 = 24 * 60 * 60;

struct TestCache {
    dir: PathBuf,
}

impl TestCache {
    fn new() -> Self {
        let dir = nix::unistd::mkdtemp(&std::env::temp_dir().join("aad-cache-test-XXXXXX"))
            .expect("unable to create temporary directory");
        Self { dir }
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.join("cache")
    }

    fn options(&self) -> CacheOptions {
        CacheOptions::new()
            .cache_dir(self.cache_dir())
            .root_uid(Uid::effective().as_raw())
            .root_gid(Gid::effective().as_raw())
            .shadow_gid(Gid::effective().as_raw())
            .force_shadow_mode(ShadowMode::ReadWrite)
            .teardown_delay(Duration::ZERO)
    }

    fn open(&self) -> Cache {
        Cache::open(self.options()).expect("unable to open cache")
    }

    /// Direct connection bypassing the cache, to prepare test states.
    fn raw(&self) -> Connection {
        let conn = Connection::open(self.cache_dir().join("accounts.db")).unwrap();
        let shadow = self.cache_dir().join("shadow.db");
        conn.execute(
            "ATTACH DATABASE ?1 AS shadow",
            params![shadow.to_str().unwrap()],
        )
        .unwrap();
        conn
    }

    fn set_last_online_auth(&self, login: &str, when: i64) {
        self.raw()
            .execute(
                "UPDATE passwd SET last_online_auth = ?1 WHERE login = ?2",
                params![when, login],
            )
            .unwrap();
    }

    fn count(&self, sql: &str) -> i64 {
        self.raw().query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

impl Drop for TestCache {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn assert_consistent(test: &TestCache) {
    // every account has its group, membership and shadow entry
    assert_eq!(
        test.count(
            "SELECT COUNT(*) FROM passwd p WHERE NOT EXISTS \
             (SELECT 1 FROM groups g JOIN uid_gid m ON m.gid = g.gid \
              WHERE g.gid = p.gid AND g.name = p.login AND m.uid = p.uid)"
        ),
        0
    );
    assert_eq!(
        test.count(
            "SELECT COUNT(*) FROM passwd p WHERE NOT EXISTS \
             (SELECT 1 FROM shadow.shadow s WHERE s.uid = p.uid)"
        ),
        0
    );
    assert_eq!(
        test.count(
            "SELECT COUNT(*) FROM groups g WHERE NOT EXISTS \
             (SELECT 1 FROM uid_gid m WHERE m.gid = g.gid)"
        ),
        0
    );
}

#[test]
fn first_online_login_creates_entries() {
    let test = TestCache::new();
    let cache = test.open();

    let before = epoch_i64();
    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();

    let user = cache.user_by_name("alice@example.com").unwrap();
    assert!(user.uid >= UID_OFFSET);
    assert_eq!(user.gid, user.uid);
    assert_eq!(user.password, "x");
    assert_eq!(user.home, "/home/alice");
    assert_eq!(user.shell, "/bin/bash");
    assert!(user.last_online_auth >= before);

    let group = cache.group_by_gid(user.gid).unwrap();
    assert_eq!(group.name, "alice@example.com");
    assert_eq!(group.members, vec!["alice@example.com".to_string()]);

    cache.can_authenticate("alice@example.com", "pw1").unwrap();
    assert!(matches!(
        cache.can_authenticate("alice@example.com", "wrong"),
        Err(CacheError::InvalidCredentials)
    ));

    assert_consistent(&test);
}

#[test]
fn update_keeps_ids_and_refreshes_password() {
    let test = TestCache::new();
    let cache = test.open();

    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();
    let first = cache.user_by_name("alice@example.com").unwrap();

    test.set_last_online_auth("alice@example.com", 0);
    cache
        .update("alice@example.com", "pw2", "/srv/%f", "/bin/zsh")
        .unwrap();
    let second = cache.user_by_name("alice@example.com").unwrap();

    assert_eq!(first.uid, second.uid);
    assert_eq!(first.gid, second.gid);
    // home and shell are only set on creation
    assert_eq!(second.home, "/home/alice");
    assert_eq!(second.shell, "/bin/bash");
    assert!(second.last_online_auth > 0);

    assert_eq!(test.count("SELECT COUNT(*) FROM passwd"), 1);
    assert_eq!(test.count("SELECT COUNT(*) FROM groups"), 1);
    assert_eq!(test.count("SELECT COUNT(*) FROM shadow.shadow"), 1);

    cache.can_authenticate("alice@example.com", "pw2").unwrap();
    assert!(cache.can_authenticate("alice@example.com", "pw1").is_err());
}

#[test]
fn lookup_ignores_case() {
    let test = TestCache::new();
    let cache = test.open();
    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();

    assert_eq!(
        cache.user_by_name("alice@example.com").unwrap(),
        cache.user_by_name("ALICE@EXAMPLE.COM").unwrap()
    );
    assert!(cache.user_by_name("BOB@EXAMPLE.COM").unwrap_err().is_not_found());
}

#[test]
fn uid_collision_probes_next_id() {
    let test = TestCache::new();
    let cache = test.open();

    // same characters, same product
    assert_eq!(initial_uid("ab@example.com"), initial_uid("ba@example.com"));

    cache.update("ab@example.com", "pw", "/home/%u", "/bin/sh").unwrap();
    cache.update("ba@example.com", "pw", "/home/%u", "/bin/sh").unwrap();

    let first = cache.user_by_name("ab@example.com").unwrap();
    let second = cache.user_by_name("ba@example.com").unwrap();
    assert_eq!(first.uid, initial_uid("ab@example.com"));
    assert_eq!(second.uid, first.uid + 1);
    assert_eq!(second.gid, first.gid + 1);

    assert_consistent(&test);
}

#[test]
fn offline_login_within_and_after_window() {
    let test = TestCache::new();
    let options = test.options().offline_credentials_expiration(90);
    let cache = Cache::open(options).unwrap();

    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();
    cache.can_authenticate("alice@example.com", "pw1").unwrap();

    test.set_last_online_auth("alice@example.com", epoch_i64() - 91 * DAY);
    assert!(matches!(
        cache.can_authenticate("alice@example.com", "pw1"),
        Err(CacheError::CredentialsExpired(_))
    ));
}

#[test]
fn zero_expiration_never_expires() {
    let test = TestCache::new();
    let cache = Cache::open(test.options().offline_credentials_expiration(0)).unwrap();

    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();
    test.set_last_online_auth("alice@example.com", epoch_i64() - 1000 * DAY);

    cache.can_authenticate("alice@example.com", "pw1").unwrap();
}

#[test]
fn negative_expiration_disables_offline_login() {
    let test = TestCache::new();
    let cache = Cache::open(test.options().offline_credentials_expiration(-1)).unwrap();

    cache
        .update("alice@example.com", "pw1", "/home/%u", "/bin/bash")
        .unwrap();
    assert!(matches!(
        cache.can_authenticate("alice@example.com", "pw1"),
        Err(CacheError::OfflineAuthDisabled)
    ));
}

#[test]
fn offline_login_of_unknown_user_fails() {
    let test = TestCache::new();
    let cache = test.open();
    assert!(cache
        .can_authenticate("nobody@example.com", "pw")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn retention_on_writable_open() {
    let test = TestCache::new();
    {
        let cache = test.open();
        for login in ["alice@example.com", "bob@example.com", "carol@example.com"] {
            cache.update(login, "pw", "/home/%u", "/bin/sh").unwrap();
        }
    }
    test.set_last_online_auth("bob@example.com", epoch_i64() - 181 * DAY);
    test.set_last_online_auth("carol@example.com", epoch_i64() - 200 * DAY);

    // between R and 2R the entry is kept
    test.set_last_online_auth("alice@example.com", epoch_i64() - 100 * DAY);

    let cache = test.open();
    cache.start_user_iteration();
    let user = cache.next_user().unwrap().unwrap();
    assert_eq!(user.login, "alice@example.com");
    assert!(cache.next_user().unwrap().is_none());

    assert_eq!(test.count("SELECT COUNT(*) FROM groups"), 1);
    assert_eq!(test.count("SELECT COUNT(*) FROM uid_gid"), 1);
    assert_eq!(test.count("SELECT COUNT(*) FROM shadow.shadow"), 1);

    // but can no longer be used offline
    assert!(matches!(
        cache.can_authenticate("alice@example.com", "pw"),
        Err(CacheError::CredentialsExpired(_))
    ));
}

#[test]
fn read_only_open_does_not_purge() {
    let test = TestCache::new();
    test.open()
        .update("bob@example.com", "pw", "/home/%u", "/bin/sh")
        .unwrap();
    test.set_last_online_auth("bob@example.com", 0);

    let cache = Cache::open(test.options().force_shadow_mode(ShadowMode::ReadOnly)).unwrap();
    assert!(cache.user_by_name("bob@example.com").is_ok());
}

#[test]
fn shadow_unavailable() {
    let test = TestCache::new();
    test.open()
        .update("alice@example.com", "pw", "/home/%u", "/bin/sh")
        .unwrap();

    let cache = Cache::open(test.options().force_shadow_mode(ShadowMode::Unavailable)).unwrap();
    assert!(!cache.shadow_readable());
    assert!(cache.user_by_name("alice@example.com").is_ok());
    assert!(matches!(
        cache.shadow_by_name("alice@example.com"),
        Err(CacheError::ShadowNotReadable)
    ));
    assert!(matches!(
        cache.can_authenticate("alice@example.com", "pw"),
        Err(CacheError::ShadowNotReadable)
    ));
    assert!(matches!(
        cache.query_attribute("alice@example.com", Attribute::ShadowPassword),
        Err(CacheError::ShadowNotReadable)
    ));
}

#[test]
fn attribute_round_trip() {
    let test = TestCache::new();
    let cache = test.open();
    cache
        .update("alice@example.com", "pw", "/home/%u", "/bin/sh")
        .unwrap();

    for (name, value) in [
        ("gecos", "Alice"),
        ("home_directory", "/srv/alice"),
        ("login_shell", "/bin/zsh"),
    ] {
        let attribute: Attribute = name.parse().unwrap();
        cache
            .update_attribute("alice@example.com", attribute, value)
            .unwrap();
        assert_eq!(
            cache.query_attribute("alice@example.com", attribute).unwrap(),
            AttributeValue::Text(value.to_string())
        );
    }

    assert!(matches!(
        cache.update_attribute("alice@example.com", Attribute::Uid, "0"),
        Err(CacheError::ReadOnlyAttribute(_))
    ));
    let user = cache.user_by_name("alice@example.com").unwrap();
    assert_eq!(user.gecos, "Alice");
    assert_eq!(user.home, "/srv/alice");
    assert_eq!(user.shell, "/bin/zsh");
}

#[test]
fn tampered_file_refuses_open() {
    use std::os::unix::fs::PermissionsExt;

    let test = TestCache::new();
    drop(test.open());

    let path: &Path = &test.cache_dir().join("accounts.db");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).unwrap();

    assert!(matches!(
        Cache::open(test.options()),
        Err(CacheError::Tampering { .. })
    ));
}

#[test]
fn empty_cache_iterations() {
    let test = TestCache::new();
    let cache = test.open();

    cache.start_user_iteration();
    assert!(cache.next_user().unwrap().is_none());
    cache.start_group_iteration();
    assert!(cache.next_group().unwrap().is_none());
    cache.start_shadow_iteration().unwrap();
    assert!(cache.next_shadow().unwrap().is_none());
    assert!(cache.all_logins().unwrap().is_empty());
}
