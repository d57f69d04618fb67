//! Synthetic uid allocation.

use rusqlite::Connection;

use crate::{schema, CacheError};

/// Lowest id handed out, keeps clear of regular system and local users.
pub const UID_OFFSET: u32 = 100_000;

/// Deterministic starting point derived from the login.
pub fn initial_uid(login: &str) -> u32 {
    let seed = login
        .chars()
        .fold(1u32, |seed, c| seed.wrapping_mul(c as u32));
    seed % (u32::MAX - UID_OFFSET + 1) + UID_OFFSET
}

/// Find a free id for `login`, probing upwards from [`initial_uid`] until neither an account nor
/// a group uses it. The result serves as both uid and gid.
pub fn allocate(conn: &Connection, login: &str) -> Result<u32, CacheError> {
    let mut uid = initial_uid(login);
    loop {
        if !schema::id_in_use(conn, uid, login)? {
            log::info!("user id for {login:?} is {uid}");
            return Ok(uid);
        }
        uid = match uid.checked_add(1) {
            Some(uid) => uid,
            None => UID_OFFSET,
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_initial_uid() {
        // 'a' = 97, 'b' = 98
        assert_eq!(initial_uid("a"), 97 + UID_OFFSET);
        assert_eq!(initial_uid("ab"), 97 * 98 + UID_OFFSET);
        assert_eq!(initial_uid(""), 1 + UID_OFFSET);
        assert_eq!(initial_uid("alice@example.com"), initial_uid("alice@example.com"));
        assert!(initial_uid("alice@example.com") >= UID_OFFSET);
    }

    #[test]
    fn test_initial_uid_wraps() {
        // 'z' ^ 6 does not fit into 32 bits
        let expected = (122u64.pow(6) % (1u64 << 32)) as u32;
        assert_eq!(
            initial_uid("zzzzzz"),
            expected % (u32::MAX - UID_OFFSET + 1) + UID_OFFSET
        );
    }
}
