use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::{Gid, Uid};

use aad_cache::{Cache, CacheOptions, ShadowMode, UserRecord};
use nss_aad::gateway::{Enumeration, Failure, Gateway, Status};

struct TestCache {
    dir: PathBuf,
}

impl TestCache {
    fn new() -> Self {
        let dir = nix::unistd::mkdtemp(&std::env::temp_dir().join("nss-aad-test-XXXXXX"))
            .expect("unable to create temporary directory");
        Self { dir }
    }

    fn options(&self) -> CacheOptions {
        CacheOptions::new()
            .cache_dir(self.dir.join("cache"))
            .root_uid(Uid::effective().as_raw())
            .root_gid(Gid::effective().as_raw())
            .shadow_gid(Gid::effective().as_raw())
            .force_shadow_mode(ShadowMode::ReadWrite)
            .teardown_delay(Duration::ZERO)
    }

    fn with_users(self, logins: &[&str]) -> Self {
        let cache = Cache::open(self.options()).unwrap();
        for login in logins {
            cache.update(login, "pw1", "/home/%u", "/bin/bash").unwrap();
        }
        self
    }

    fn gateway(&self) -> Gateway {
        Gateway::new(self.options())
    }
}

impl Drop for TestCache {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn test_passwd_lookups() {
    let cache = TestCache::new().with_users(&["alice@example.com"]);
    let gateway = cache.gateway();

    let user = gateway.passwd_by_name("Alice@EXAMPLE.com").unwrap();
    assert_eq!(user.login, "alice@example.com");
    assert_eq!(user.password, "x");
    assert_eq!(user.home, "/home/alice");

    assert_eq!(gateway.passwd_by_uid(user.uid).unwrap(), user);
    assert_eq!(
        gateway.passwd_by_name("bob@example.com"),
        Err(Failure::NOT_FOUND)
    );
    assert_eq!(gateway.passwd_by_uid(1), Err(Failure::NOT_FOUND));
}

#[test]
fn test_group_lookups() {
    let cache = TestCache::new().with_users(&["alice@example.com"]);
    let gateway = cache.gateway();

    let user = gateway.passwd_by_name("alice@example.com").unwrap();
    let group = gateway.group_by_gid(user.gid).unwrap();
    assert_eq!(group.name, "alice@example.com");
    assert_eq!(group.members, vec!["alice@example.com".to_string()]);
    assert_eq!(gateway.group_by_name("ALICE@example.com").unwrap(), group);
}

#[test]
fn test_shadow_is_masked() {
    let cache = TestCache::new().with_users(&["alice@example.com"]);

    let shadow = cache.gateway().shadow_by_name("alice@example.com").unwrap();
    assert_eq!(shadow.password, "*");
    assert_eq!(shadow.last_pwd_change, -1);
    assert_eq!(shadow.expiration_date, -1);
}

#[test]
fn test_shadow_unavailable() {
    let cache = TestCache::new().with_users(&["alice@example.com"]);
    let gateway = Gateway::new(cache.options().force_shadow_mode(ShadowMode::Unavailable));

    assert_eq!(
        gateway.shadow_by_name("alice@example.com"),
        Err(Failure::UNAVAILABLE)
    );
    // passwd entries are still served
    assert!(gateway.passwd_by_name("alice@example.com").is_ok());
}

#[test]
fn test_unprivileged_without_cache() {
    let cache = TestCache::new();
    let gateway = Gateway::new(cache.options().root_uid(Uid::effective().as_raw() + 1));

    let failure = gateway.passwd_by_name("alice@example.com").unwrap_err();
    assert_eq!(failure, Failure::UNAVAILABLE);
    assert_eq!(failure.status, Status::Unavail);
    assert!(!cache.dir.join("cache").exists());
}

#[test]
fn test_enumeration_keeps_entry_after_erange() {
    let cache = TestCache::new().with_users(&["bob@example.com", "alice@example.com"]);
    let gateway = cache.gateway();

    let mut users: Enumeration<UserRecord> = Enumeration::new();
    users.set(&gateway).unwrap();

    let first = users.next(&gateway).unwrap();
    assert_eq!(first.login, "alice@example.com");

    // the entry did not fit, the next call returns it again
    users.put_back(first.clone());
    assert_eq!(users.next(&gateway).unwrap(), first);

    assert_eq!(users.next(&gateway).unwrap().login, "bob@example.com");
    assert_eq!(users.next(&gateway).unwrap_err(), Failure::EXHAUSTED);
    assert_eq!(users.next(&gateway).unwrap_err(), Failure::EXHAUSTED);

    users.set(&gateway).unwrap();
    assert_eq!(users.next(&gateway).unwrap().login, "alice@example.com");
    users.end();
}

#[test]
fn test_enumeration_starts_implicitly() {
    let cache = TestCache::new().with_users(&["alice@example.com"]);
    let gateway = cache.gateway();

    let mut users: Enumeration<UserRecord> = Enumeration::new();
    assert_eq!(users.next(&gateway).unwrap().login, "alice@example.com");
    assert_eq!(users.next(&gateway).unwrap_err(), Failure::EXHAUSTED);

    users.end();
    assert_eq!(users.next(&gateway).unwrap().login, "alice@example.com");
}

#[test]
fn test_empty_cache_enumeration() {
    let cache = TestCache::new().with_users(&[]);
    let gateway = cache.gateway();

    let mut users: Enumeration<UserRecord> = Enumeration::new();
    assert_eq!(users.next(&gateway).unwrap_err(), Failure::EXHAUSTED);
    assert_eq!(Failure::EXHAUSTED.status, Status::Success);
    assert_eq!(Failure::EXHAUSTED.errno, libc::ENOENT);
}
