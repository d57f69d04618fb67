//! Password hashing through libcrypt.
//!
//! New hashes are created with yescrypt. Verification accepts any method libcrypt knows about, so
//! caches written with bcrypt (`$2b$`) or sha256crypt (`$5$`) keep working.

use std::ffi::{CStr, CString};

use crate::CacheError;

// from libcrypt1, 'lib/crypt.h.in'
const CRYPT_OUTPUT_SIZE: usize = 384;
const CRYPT_MAX_PASSPHRASE_SIZE: usize = 512;
const CRYPT_DATA_RESERVED_SIZE: usize = 767;
const CRYPT_DATA_INTERNAL_SIZE: usize = 30720;
const CRYPT_GENSALT_OUTPUT_SIZE: usize = 192;

/// yescrypt, see `man crypt(5)`
pub const HASH_PREFIX: &str = "$y$";

// Matches `YESCRYPT_COST_FACTOR` in Debian's `/etc/login.defs`.
const HASH_COST: u64 = 5;

const SALT_BYTES: usize = 32;

#[repr(C)]
struct CryptData {
    output: [libc::c_char; CRYPT_OUTPUT_SIZE],
    setting: [libc::c_char; CRYPT_OUTPUT_SIZE],
    input: [libc::c_char; CRYPT_MAX_PASSPHRASE_SIZE],
    reserved: [libc::c_char; CRYPT_DATA_RESERVED_SIZE],
    initialized: libc::c_char,
    internal: [libc::c_char; CRYPT_DATA_INTERNAL_SIZE],
}

#[link(name = "crypt")]
unsafe extern "C" {
    #[link_name = "crypt_r"]
    fn __crypt_r(
        key: *const libc::c_char,
        salt: *const libc::c_char,
        data: *mut CryptData,
    ) -> *mut libc::c_char;

    #[link_name = "crypt_gensalt_rn"]
    fn __crypt_gensalt_rn(
        prefix: *const libc::c_char,
        count: libc::c_ulong,
        // declared as `const char *`, but the content is raw entropy
        rbytes: *const u8,
        nrbytes: libc::c_int,
        output: *mut libc::c_char,
        output_size: libc::c_int,
    ) -> *mut libc::c_char;
}

fn crypt(password: &[u8], setting: &[u8]) -> Result<String, CacheError> {
    if password.len() >= CRYPT_MAX_PASSPHRASE_SIZE {
        return Err(CacheError::Crypt("password too long".to_string()));
    }
    if setting.len() >= CRYPT_OUTPUT_SIZE {
        return Err(CacheError::Crypt("hash setting too long".to_string()));
    }

    // boxed, the struct is more than 32k
    let mut data: Box<CryptData> = Box::new(unsafe { std::mem::zeroed() });
    for (i, c) in setting.iter().enumerate() {
        data.setting[i] = *c as libc::c_char;
    }
    for (i, c) in password.iter().enumerate() {
        data.input[i] = *c as libc::c_char;
    }

    let hash = unsafe {
        let status = __crypt_r(
            data.input.as_ptr(),
            data.setting.as_ptr(),
            &mut *data as *mut CryptData,
        );
        if status.is_null() {
            return Err(CacheError::Crypt("crypt_r returned null pointer".to_string()));
        }

        // see crypt(3): on error an invalid hash starting with '*' is written to `output`
        if data.output[0] == '*' as libc::c_char {
            return Err(CacheError::Crypt("crypt_r returned invalid hash".to_string()));
        }
        CStr::from_ptr(data.output.as_ptr())
    };

    hash.to_str()
        .map(str::to_string)
        .map_err(|err| CacheError::Crypt(err.to_string()))
}

fn crypt_gensalt(prefix: &str, count: u64, rbytes: &[u8]) -> Result<String, CacheError> {
    let prefix = CString::new(prefix).map_err(|err| CacheError::Crypt(err.to_string()))?;

    let mut output = [0 as libc::c_char; CRYPT_GENSALT_OUTPUT_SIZE];

    let status = unsafe {
        __crypt_gensalt_rn(
            prefix.as_ptr(),
            count as libc::c_ulong,
            rbytes.as_ptr(),
            rbytes.len() as libc::c_int,
            output.as_mut_ptr(),
            output.len() as libc::c_int,
        )
    };

    if status.is_null() || output[0] == '*' as libc::c_char {
        return Err(CacheError::Crypt(
            "crypt_gensalt_rn could not create a valid salt".to_string(),
        ));
    }

    let salt = unsafe { CStr::from_ptr(output.as_ptr()) };
    salt.to_str()
        .map(str::to_string)
        .map_err(|err| CacheError::Crypt(err.to_string()))
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, CacheError> {
    let mut rbytes = [0u8; SALT_BYTES];
    openssl::rand::rand_bytes(&mut rbytes).map_err(|err| CacheError::Crypt(err.to_string()))?;

    let setting = crypt_gensalt(HASH_PREFIX, HASH_COST, &rbytes)?;

    crypt(password.as_bytes(), setting.as_bytes())
}

/// Check a password against a stored hash.
///
/// Returns [`CacheError::InvalidCredentials`] on mismatch.
pub fn verify_password(password: &str, hash: &str) -> Result<(), CacheError> {
    let verify = match crypt(password.as_bytes(), hash.as_bytes()) {
        Ok(verify) => verify,
        Err(err) => {
            log::debug!("unable to hash password for verification: {err}");
            return Err(CacheError::InvalidCredentials);
        }
    };

    // constant time with respect to the content
    if verify.len() != hash.len() || !openssl::memcmp::eq(verify.as_bytes(), hash.as_bytes()) {
        return Err(CacheError::InvalidCredentials);
    }

    Ok(())
}
