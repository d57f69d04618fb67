//! Name service module serving Azure AD users from the offline cache.
//!
//! Installed as `libnss_aad.so.2` and enabled with `aad` in the `passwd`, `group` and `shadow`
//! lines of `/etc/nsswitch.conf`. The cache is only ever read here.

use std::ffi::CStr;
use std::sync::{Mutex, MutexGuard};

use libc::{c_char, c_int, gid_t, size_t, uid_t};

use aad_cache::{GroupRecord, ShadowRecord, UserRecord};
use aad_log::{LevelFilter, Logger, LOG_ENV};

pub mod buffer;
pub mod gateway;

use buffer::{fill_group, fill_passwd, fill_shadow};
use gateway::{Entity, Enumeration, Failure, Gateway, Status};

static PASSWD_ENT: Mutex<Enumeration<UserRecord>> = Mutex::new(Enumeration::new());
static GROUP_ENT: Mutex<Enumeration<GroupRecord>> = Mutex::new(Enumeration::new());
static SHADOW_ENT: Mutex<Enumeration<ShadowRecord>> = Mutex::new(Enumeration::new());

fn init() -> Gateway {
    let _ = Logger::from_env(LOG_ENV, LevelFilter::WARN).journald().init();
    Gateway::from_env()
}

fn lock<T>(state: &Mutex<Enumeration<T>>) -> MutexGuard<'_, Enumeration<T>> {
    state.lock().unwrap_or_else(|err| err.into_inner())
}

/// Store the errno and return the status for glibc.
///
/// glibc reads the output struct whenever it sees `NSS_STATUS_SUCCESS`, so a failure without an
/// entry (including the end of an enumeration) becomes `NSS_STATUS_NOTFOUND` here.
unsafe fn report(failure: Failure, errnop: *mut c_int) -> Status {
    if !errnop.is_null() {
        *errnop = failure.errno;
    }
    match failure.status {
        Status::Success => Status::NotFound,
        status => status,
    }
}

unsafe fn succeed(errnop: *mut c_int) -> Status {
    if !errnop.is_null() {
        *errnop = 0;
    }
    Status::Success
}

unsafe fn caller_buffer<'a>(buf: *mut c_char, buflen: size_t) -> Result<&'a mut [u8], Failure> {
    if buf.is_null() {
        return Err(Failure::BUFFER_TOO_SMALL);
    }
    Ok(std::slice::from_raw_parts_mut(buf.cast(), buflen))
}

unsafe fn name_arg<'a>(name: *const c_char) -> Result<&'a str, Failure> {
    if name.is_null() {
        return Err(Failure::NOT_FOUND);
    }
    CStr::from_ptr(name).to_str().map_err(|_| Failure::NOT_FOUND)
}

/// Shared body of the lookup functions.
unsafe fn lookup<T>(
    entry: impl FnOnce() -> Result<T, Failure>,
    fill: impl FnOnce(&T, &mut [u8]) -> Result<(), Failure>,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let result = entry().and_then(|entry| fill(&entry, caller_buffer(buf, buflen)?));
    match result {
        Ok(()) => succeed(errnop),
        Err(failure) => report(failure, errnop),
    }
}

unsafe fn set_ent<T: Entity>(state: &Mutex<Enumeration<T>>) -> Status {
    let gateway = init();
    match lock(state).set(&gateway) {
        Ok(()) => Status::Success,
        Err(failure) => report(failure, std::ptr::null_mut()),
    }
}

unsafe fn get_ent<T: Entity>(
    state: &Mutex<Enumeration<T>>,
    fill: impl FnOnce(&T, &mut [u8]) -> Result<(), Failure>,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    let mut state = lock(state);

    let entry = match state.next(&gateway) {
        Ok(entry) => entry,
        Err(failure) => return report(failure, errnop),
    };
    match caller_buffer(buf, buflen).and_then(|buf| fill(&entry, buf)) {
        Ok(()) => succeed(errnop),
        Err(failure) => {
            // the caller retries with a larger buffer
            state.put_back(entry);
            report(failure, errnop)
        }
    }
}

fn end_ent<T: Entity>(state: &Mutex<Enumeration<T>>) -> Status {
    lock(state).end();
    Status::Success
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getpwnam_r(
    name: *const c_char,
    pwd: *mut libc::passwd,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    lookup(
        || gateway.passwd_by_name(name_arg(name)?),
        |user, buf| fill_passwd(user, &mut *pwd, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getpwuid_r(
    uid: uid_t,
    pwd: *mut libc::passwd,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    lookup(
        || gateway.passwd_by_uid(uid),
        |user, buf| fill_passwd(user, &mut *pwd, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_setpwent(_stayopen: c_int) -> Status {
    set_ent(&PASSWD_ENT)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getpwent_r(
    pwd: *mut libc::passwd,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    get_ent(
        &PASSWD_ENT,
        |user, buf| fill_passwd(user, &mut *pwd, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub extern "C" fn _nss_aad_endpwent() -> Status {
    end_ent(&PASSWD_ENT)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getgrnam_r(
    name: *const c_char,
    grp: *mut libc::group,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    lookup(
        || gateway.group_by_name(name_arg(name)?),
        |group, buf| fill_group(group, &mut *grp, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getgrgid_r(
    gid: gid_t,
    grp: *mut libc::group,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    lookup(
        || gateway.group_by_gid(gid),
        |group, buf| fill_group(group, &mut *grp, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_setgrent(_stayopen: c_int) -> Status {
    set_ent(&GROUP_ENT)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getgrent_r(
    grp: *mut libc::group,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    get_ent(
        &GROUP_ENT,
        |group, buf| fill_group(group, &mut *grp, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub extern "C" fn _nss_aad_endgrent() -> Status {
    end_ent(&GROUP_ENT)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getspnam_r(
    name: *const c_char,
    spwd: *mut libc::spwd,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    let gateway = init();
    lookup(
        || gateway.shadow_by_name(name_arg(name)?),
        |shadow, buf| fill_shadow(shadow, &mut *spwd, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_setspent(_stayopen: c_int) -> Status {
    set_ent(&SHADOW_ENT)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_aad_getspent_r(
    spwd: *mut libc::spwd,
    buf: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> Status {
    get_ent(
        &SHADOW_ENT,
        |shadow, buf| fill_shadow(shadow, &mut *spwd, buf),
        buf,
        buflen,
        errnop,
    )
}

#[no_mangle]
pub extern "C" fn _nss_aad_endspent() -> Status {
    end_ent(&SHADOW_ENT)
}
