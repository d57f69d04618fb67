//! Tables, records and the SQL behind every query and writer.
//!
//! The shadow database is attached to the connection of the accounts database under the alias
//! [`SHADOW_ALIAS`], so a single transaction covers both files.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::Context;
use crate::CacheError;

pub const SHADOW_ALIAS: &str = "shadow";

/// Placeholder stored in the passwd and group password columns.
pub const PASSWORD_PLACEHOLDER: &str = "x";

/// Value of the unused shadow aging fields.
pub const SHADOW_UNSET: i64 = -1;

const PASSWD_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS passwd (
    login            TEXT NOT NULL UNIQUE,
    password         TEXT NOT NULL DEFAULT 'x',
    uid              INTEGER NOT NULL UNIQUE,
    gid              INTEGER NOT NULL,
    gecos            TEXT NOT NULL DEFAULT '',
    home             TEXT NOT NULL DEFAULT '',
    shell            TEXT NOT NULL DEFAULT '/bin/bash',
    last_online_auth INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY("uid")
);
CREATE TABLE IF NOT EXISTS groups (
    name     TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL DEFAULT 'x',
    gid      INTEGER NOT NULL UNIQUE,
    PRIMARY KEY("gid")
);
CREATE TABLE IF NOT EXISTS uid_gid (
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    PRIMARY KEY("uid", "gid")
);
CREATE UNIQUE INDEX IF NOT EXISTS "uid_gid_gid" ON uid_gid ("gid");
"#;

const SHADOW_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shadow (
    uid             INTEGER NOT NULL UNIQUE,
    password        TEXT NOT NULL,
    last_pwd_change INTEGER NOT NULL DEFAULT -1,
    min_pwd_age     INTEGER NOT NULL DEFAULT -1,
    max_pwd_age     INTEGER NOT NULL DEFAULT -1,
    pwd_warn_period INTEGER NOT NULL DEFAULT -1,
    pwd_inactivity  INTEGER NOT NULL DEFAULT -1,
    expiration_date INTEGER NOT NULL DEFAULT -1,
    PRIMARY KEY("uid")
);
"#;

pub(crate) fn create_passwd_schema(path: &Path) -> Result<(), CacheError> {
    let conn = Connection::open(path).context(format!("unable to open {path:?}"))?;
    conn.execute_batch(PASSWD_SCHEMA)
        .context("unable to create passwd schema")
}

pub(crate) fn create_shadow_schema(path: &Path) -> Result<(), CacheError> {
    let conn = Connection::open(path).context(format!("unable to open {path:?}"))?;
    conn.execute_batch(SHADOW_SCHEMA)
        .context("unable to create shadow schema")
}

/// Attach the shadow database to a connection opened on the accounts database.
pub(crate) fn attach_shadow(conn: &Connection, path: &Path) -> Result<(), CacheError> {
    let path = path
        .to_str()
        .ok_or_else(|| CacheError::Inconsistent(format!("non UTF-8 cache path {path:?}")))?;
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {SHADOW_ALIAS}"),
        params![path],
    )
    .context("unable to attach shadow database")?;
    Ok(())
}

/// A cached account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub login: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    pub last_online_auth: i64,
}

const USER_COLUMNS: &str = "login, password, uid, gid, gecos, home, shell, last_online_auth";

impl UserRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            login: row.get(0)?,
            password: row.get(1)?,
            uid: row.get(2)?,
            gid: row.get(3)?,
            gecos: row.get(4)?,
            home: row.get(5)?,
            shell: row.get(6)?,
            last_online_auth: row.get(7)?,
        })
    }

    /// `key = value` lines, as printed by the CLI.
    pub fn to_ini(&self) -> String {
        format!(
            "login = {}\npassword = {}\nuid = {}\ngid = {}\ngecos = {}\nhome = {}\nshell = {}\nlast_online_auth = {}\n",
            self.login,
            self.password,
            self.uid,
            self.gid,
            self.gecos,
            self.home,
            self.shell,
            self.last_online_auth,
        )
    }
}

/// A cached group. Every account has exactly one private group named after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub password: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// A shadow entry, with the real password hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowRecord {
    pub login: String,
    pub password: String,
    pub last_pwd_change: i64,
    pub min_pwd_age: i64,
    pub max_pwd_age: i64,
    pub pwd_warn_period: i64,
    pub pwd_inactivity: i64,
    pub expiration_date: i64,
}

const SHADOW_COLUMNS: &str = "p.login, s.password, s.last_pwd_change, s.min_pwd_age, \
    s.max_pwd_age, s.pwd_warn_period, s.pwd_inactivity, s.expiration_date";

impl ShadowRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            login: row.get(0)?,
            password: row.get(1)?,
            last_pwd_change: row.get(2)?,
            min_pwd_age: row.get(3)?,
            max_pwd_age: row.get(4)?,
            pwd_warn_period: row.get(5)?,
            pwd_inactivity: row.get(6)?,
            expiration_date: row.get(7)?,
        })
    }
}

/// Columns of the passwd table accessible through the CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribute {
    Login,
    Password,
    Uid,
    Gid,
    Gecos,
    Home,
    Shell,
    LastOnlineAuth,
    /// The password hash from the shadow database.
    ShadowPassword,
}

impl Attribute {
    /// Attributes which may be queried.
    pub const QUERYABLE: &'static [Attribute] = &[
        Attribute::Login,
        Attribute::Password,
        Attribute::Uid,
        Attribute::Gid,
        Attribute::Gecos,
        Attribute::Home,
        Attribute::Shell,
        Attribute::LastOnlineAuth,
        Attribute::ShadowPassword,
    ];

    /// Attributes which may be changed.
    pub const UPDATABLE: &'static [Attribute] =
        &[Attribute::Gecos, Attribute::Home, Attribute::Shell];

    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::Login => "login",
            Attribute::Password => "password",
            Attribute::Uid => "uid",
            Attribute::Gid => "gid",
            Attribute::Gecos => "gecos",
            Attribute::Home => "home",
            Attribute::Shell => "shell",
            Attribute::LastOnlineAuth => "last_online_auth",
            Attribute::ShadowPassword => "shadow_password",
        }
    }

    pub fn is_updatable(self) -> bool {
        Self::UPDATABLE.contains(&self)
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            Attribute::Uid | Attribute::Gid | Attribute::LastOnlineAuth
        )
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Attribute {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "login" => Attribute::Login,
            "password" | "password_placeholder" => Attribute::Password,
            "uid" => Attribute::Uid,
            "gid" => Attribute::Gid,
            "gecos" => Attribute::Gecos,
            "home" | "home_directory" => Attribute::Home,
            "shell" | "login_shell" => Attribute::Shell,
            "last_online_auth" => Attribute::LastOnlineAuth,
            "shadow_password" | "password_hash" => Attribute::ShadowPassword,
            other => return Err(CacheError::InvalidAttribute(other.to_string())),
        })
    }
}

/// Value of a single attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AttributeValue::Text(text) => f.write_str(text),
            AttributeValue::Integer(value) => write!(f, "{value}"),
        }
    }
}

// point lookups

pub fn user_by_name(conn: &Connection, login: &str) -> Result<UserRecord, CacheError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM passwd WHERE login = ?1 COLLATE NOCASE"),
        params![login],
        UserRecord::from_row,
    )
    .context(format!("failed to look up user {login:?}"))
}

pub fn user_by_uid(conn: &Connection, uid: u32) -> Result<UserRecord, CacheError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM passwd WHERE uid = ?1"),
        params![uid],
        UserRecord::from_row,
    )
    .context(format!("failed to look up uid {uid}"))
}

fn group_members(conn: &Connection, gid: u32) -> Result<Vec<String>, CacheError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT p.login FROM uid_gid m JOIN passwd p ON p.uid = m.uid \
             WHERE m.gid = ?1 ORDER BY p.login",
        )
        .context("failed to prepare group member query")?;
    let members = stmt
        .query_map(params![gid], |row| row.get(0))
        .context(format!("failed to query members of group {gid}"))?
        .collect::<Result<Vec<String>, _>>()
        .context(format!("failed to read members of group {gid}"))?;
    Ok(members)
}

fn group_from_row(conn: &Connection, row: (String, String, u32)) -> Result<GroupRecord, CacheError> {
    let (name, password, gid) = row;
    Ok(GroupRecord {
        members: group_members(conn, gid)?,
        name,
        password,
        gid,
    })
}

pub fn group_by_name(conn: &Connection, name: &str) -> Result<GroupRecord, CacheError> {
    let row = conn
        .query_row(
            "SELECT name, password, gid FROM groups WHERE name = ?1 COLLATE NOCASE",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .context(format!("failed to look up group {name:?}"))?;
    group_from_row(conn, row)
}

pub fn group_by_gid(conn: &Connection, gid: u32) -> Result<GroupRecord, CacheError> {
    let row = conn
        .query_row(
            "SELECT name, password, gid FROM groups WHERE gid = ?1",
            params![gid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .context(format!("failed to look up gid {gid}"))?;
    group_from_row(conn, row)
}

/// Requires the shadow database to be attached.
pub fn shadow_by_name(conn: &Connection, login: &str) -> Result<ShadowRecord, CacheError> {
    conn.query_row(
        &format!(
            "SELECT {SHADOW_COLUMNS} FROM {SHADOW_ALIAS}.shadow s JOIN passwd p ON p.uid = s.uid \
             WHERE p.login = ?1 COLLATE NOCASE"
        ),
        params![login],
        ShadowRecord::from_row,
    )
    .context(format!("failed to look up shadow entry for {login:?}"))
}

pub fn all_logins(conn: &Connection) -> Result<Vec<String>, CacheError> {
    let mut stmt = conn
        .prepare("SELECT login FROM passwd ORDER BY login")
        .context("failed to prepare login query")?;
    let logins = stmt
        .query_map([], |row| row.get(0))
        .context("failed to query logins")?
        .collect::<Result<Vec<String>, _>>()
        .context("failed to read logins")?;
    Ok(logins)
}

/// Query a single attribute. `shadow_password` requires the shadow database to be attached.
pub fn query_attribute(
    conn: &Connection,
    login: &str,
    attribute: Attribute,
) -> Result<AttributeValue, CacheError> {
    if attribute == Attribute::ShadowPassword {
        return Ok(AttributeValue::Text(shadow_by_name(conn, login)?.password));
    }

    let sql = format!("SELECT {attribute} FROM passwd WHERE login = ?1 COLLATE NOCASE");
    let context = format!("failed to query {attribute} of {login:?}");
    if attribute.is_integer() {
        conn.query_row(&sql, params![login], |row| row.get(0))
            .map(AttributeValue::Integer)
            .context(context)
    } else {
        conn.query_row(&sql, params![login], |row| row.get(0))
            .map(AttributeValue::Text)
            .context(context)
    }
}

// keyset iteration, each call returns the entry following `after`

pub fn next_user(conn: &Connection, after: Option<&str>) -> Result<Option<UserRecord>, CacheError> {
    conn.query_row(
        &format!(
            "SELECT {USER_COLUMNS} FROM passwd WHERE ?1 IS NULL OR login > ?1 \
             ORDER BY login LIMIT 1"
        ),
        params![after],
        UserRecord::from_row,
    )
    .optional()
    .context("failed to iterate users")
}

pub fn next_group(conn: &Connection, after: Option<&str>) -> Result<Option<GroupRecord>, CacheError> {
    let row = conn
        .query_row(
            "SELECT name, password, gid FROM groups WHERE ?1 IS NULL OR name > ?1 \
             ORDER BY name LIMIT 1",
            params![after],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("failed to iterate groups")?;
    row.map(|row| group_from_row(conn, row)).transpose()
}

pub fn next_shadow(
    conn: &Connection,
    after: Option<&str>,
) -> Result<Option<ShadowRecord>, CacheError> {
    conn.query_row(
        &format!(
            "SELECT {SHADOW_COLUMNS} FROM {SHADOW_ALIAS}.shadow s JOIN passwd p ON p.uid = s.uid \
             WHERE ?1 IS NULL OR p.login > ?1 ORDER BY p.login LIMIT 1"
        ),
        params![after],
        ShadowRecord::from_row,
    )
    .optional()
    .context("failed to iterate shadow entries")
}

/// Whether an id is used by any account or group. Fails if it belongs to `login` itself, which
/// means the caller tried to allocate an id for an existing user.
pub fn id_in_use(conn: &Connection, id: u32, login: &str) -> Result<bool, CacheError> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT login FROM passwd WHERE uid = ?1 UNION SELECT name FROM groups WHERE gid = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context(format!("failed to verify that {id} is unique"))?;

    match owner {
        None => Ok(false),
        Some(owner) if owner == login => Err(CacheError::Inconsistent(format!(
            "user {login:?} already exists"
        ))),
        Some(_) => Ok(true),
    }
}

// writers, all of them run inside the caller's transaction

/// Insert an account along with its private group, membership and shadow entry.
pub fn insert_account(
    tx: &Transaction,
    user: &UserRecord,
    password_hash: &str,
) -> Result<(), CacheError> {
    tx.execute(
        &format!("INSERT INTO passwd ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            user.login,
            PASSWORD_PLACEHOLDER,
            user.uid,
            user.gid,
            user.gecos,
            user.home,
            user.shell,
            user.last_online_auth,
        ],
    )
    .context(format!("failed to insert user {:?}", user.login))?;

    tx.execute(
        "INSERT INTO groups (name, password, gid) VALUES (?1, ?2, ?3)",
        params![user.login, PASSWORD_PLACEHOLDER, user.gid],
    )
    .context(format!("failed to insert group {:?}", user.login))?;

    tx.execute(
        "INSERT INTO uid_gid (uid, gid) VALUES (?1, ?2)",
        params![user.uid, user.gid],
    )
    .context(format!("failed to insert membership of {:?}", user.login))?;

    tx.execute(
        &format!(
            "INSERT INTO {SHADOW_ALIAS}.shadow (uid, password, last_pwd_change, min_pwd_age, \
             max_pwd_age, pwd_warn_period, pwd_inactivity, expiration_date) \
             VALUES (?1, ?2, ?3, ?3, ?3, ?3, ?3, ?3)"
        ),
        params![user.uid, password_hash, SHADOW_UNSET],
    )
    .context(format!("failed to insert shadow entry of {:?}", user.login))?;

    Ok(())
}

/// Refresh the password hash and the time of the last online authentication.
pub fn update_last_auth_and_password(
    tx: &Transaction,
    uid: u32,
    password_hash: &str,
    last_online_auth: i64,
) -> Result<(), CacheError> {
    let updated = tx
        .execute(
            "UPDATE passwd SET last_online_auth = ?1 WHERE uid = ?2",
            params![last_online_auth, uid],
        )
        .context(format!("failed to update last online authentication of {uid}"))?;
    if updated == 0 {
        return Err(CacheError::NotFound);
    }

    // entries created while shadow was not writable have no row yet
    tx.execute(
        &format!(
            "INSERT INTO {SHADOW_ALIAS}.shadow (uid, password) VALUES (?1, ?2) \
             ON CONFLICT(uid) DO UPDATE SET password = excluded.password"
        ),
        params![uid, password_hash],
    )
    .context(format!("failed to update password of {uid}"))?;

    Ok(())
}

/// Change one of the [`Attribute::UPDATABLE`] attributes.
pub fn update_account_attribute(
    tx: &Transaction,
    login: &str,
    attribute: Attribute,
    value: &str,
) -> Result<(), CacheError> {
    if !attribute.is_updatable() {
        return Err(CacheError::ReadOnlyAttribute(attribute.to_string()));
    }

    let updated = tx
        .execute(
            &format!("UPDATE passwd SET {attribute} = ?1 WHERE login = ?2 COLLATE NOCASE"),
            params![value, login],
        )
        .context(format!("failed to update {attribute} of {login:?}"))?;
    if updated == 0 {
        return Err(CacheError::NotFound);
    }

    Ok(())
}

/// Remove every account whose last online authentication is older than `before`, cascading to
/// shadow entries, memberships and memberless groups. Returns the number of removed accounts.
///
/// Shadow rows are only touched when the shadow database is attached.
pub fn delete_expired(tx: &Transaction, before: i64, with_shadow: bool) -> Result<usize, CacheError> {
    if with_shadow {
        tx.execute(
            &format!(
                "DELETE FROM {SHADOW_ALIAS}.shadow WHERE uid IN \
                 (SELECT uid FROM passwd WHERE last_online_auth < ?1)"
            ),
            params![before],
        )
        .context("failed to clean up shadow entries")?;
    }

    tx.execute(
        "DELETE FROM uid_gid WHERE uid IN (SELECT uid FROM passwd WHERE last_online_auth < ?1)",
        params![before],
    )
    .context("failed to clean up group memberships")?;

    let removed = tx
        .execute(
            "DELETE FROM passwd WHERE last_online_auth < ?1",
            params![before],
        )
        .context("failed to clean up users")?;

    tx.execute(
        "DELETE FROM groups WHERE gid NOT IN (SELECT DISTINCT gid FROM uid_gid)",
        [],
    )
    .context("failed to clean up groups")?;

    Ok(removed)
}
