//! Packing entries into the buffer supplied by the caller of a `*_r` function.
//!
//! The strings of an entry are stored back to back, each NUL terminated, followed by the
//! NULL terminated pointer array for group members. The required size is checked before the
//! first write, so on `ERANGE` neither the buffer nor the output struct are touched.

use std::iter;
use std::mem::{align_of, size_of};
use std::ptr;

use libc::{c_char, c_long, c_ulong};

use aad_cache::{GroupRecord, ShadowRecord, UserRecord};

use crate::gateway::Failure;

type CharPtr = *mut c_char;

/// Offset of the pointer array following `offset` bytes of strings, aligned in memory.
fn pointer_array_offset(base: usize, offset: usize) -> usize {
    let align = align_of::<CharPtr>();
    offset + (align - (base + offset) % align) % align
}

fn check_size(buf: &[u8], strings: &[&str], pointers: usize) -> Result<(), Failure> {
    let mut needed: usize = strings.iter().map(|s| s.len() + 1).sum();
    if pointers > 0 {
        needed = pointer_array_offset(buf.as_ptr() as usize, needed) + pointers * size_of::<CharPtr>();
    }
    if needed > buf.len() {
        log::debug!("buffer too small, {needed} bytes needed, got {}", buf.len());
        return Err(Failure::BUFFER_TOO_SMALL);
    }
    Ok(())
}

/// Writes into a buffer already checked by [`check_size`].
struct Packer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Packer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn push_str(&mut self, s: &str) -> CharPtr {
        let start = self.pos;
        let end = start + s.len();
        self.buf[start..end].copy_from_slice(s.as_bytes());
        self.buf[end] = 0;
        self.pos = end + 1;
        self.buf[start..].as_mut_ptr().cast()
    }

    fn push_pointers(&mut self, pointers: &[CharPtr]) -> *mut CharPtr {
        let offset = pointer_array_offset(self.buf.as_ptr() as usize, self.pos);
        let array: *mut CharPtr = self.buf[offset..].as_mut_ptr().cast();
        for (i, pointer) in pointers.iter().chain(iter::once(&ptr::null_mut())).enumerate() {
            // SAFETY: aligned and in bounds, see check_size
            unsafe { array.add(i).write(*pointer) };
        }
        self.pos = offset + (pointers.len() + 1) * size_of::<CharPtr>();
        array
    }
}

pub fn fill_passwd(user: &UserRecord, out: &mut libc::passwd, buf: &mut [u8]) -> Result<(), Failure> {
    check_size(
        buf,
        &[
            user.login.as_str(),
            user.password.as_str(),
            user.gecos.as_str(),
            user.home.as_str(),
            user.shell.as_str(),
        ],
        0,
    )?;

    let mut packer = Packer::new(buf);
    out.pw_name = packer.push_str(&user.login);
    out.pw_passwd = packer.push_str(&user.password);
    out.pw_gecos = packer.push_str(&user.gecos);
    out.pw_dir = packer.push_str(&user.home);
    out.pw_shell = packer.push_str(&user.shell);
    out.pw_uid = user.uid;
    out.pw_gid = user.gid;
    Ok(())
}

pub fn fill_group(group: &GroupRecord, out: &mut libc::group, buf: &mut [u8]) -> Result<(), Failure> {
    let strings: Vec<&str> = [group.name.as_str(), group.password.as_str()]
        .into_iter()
        .chain(group.members.iter().map(String::as_str))
        .collect();
    check_size(buf, &strings, group.members.len() + 1)?;

    let mut packer = Packer::new(buf);
    out.gr_name = packer.push_str(&group.name);
    out.gr_passwd = packer.push_str(&group.password);
    let members: Vec<CharPtr> = group
        .members
        .iter()
        .map(|member| packer.push_str(member))
        .collect();
    out.gr_mem = packer.push_pointers(&members);
    out.gr_gid = group.gid;
    Ok(())
}

fn long(value: i64) -> c_long {
    c_long::try_from(value).unwrap_or(-1)
}

pub fn fill_shadow(shadow: &ShadowRecord, out: &mut libc::spwd, buf: &mut [u8]) -> Result<(), Failure> {
    check_size(buf, &[shadow.login.as_str(), shadow.password.as_str()], 0)?;

    let mut packer = Packer::new(buf);
    out.sp_namp = packer.push_str(&shadow.login);
    out.sp_pwdp = packer.push_str(&shadow.password);
    out.sp_lstchg = long(shadow.last_pwd_change);
    out.sp_min = long(shadow.min_pwd_age);
    out.sp_max = long(shadow.max_pwd_age);
    out.sp_warn = long(shadow.pwd_warn_period);
    out.sp_inact = long(shadow.pwd_inactivity);
    out.sp_expire = long(shadow.expiration_date);
    out.sp_flag = c_ulong::MAX;
    Ok(())
}
