//! PAM module authenticating Azure AD users, with a local cache for offline logins.
//!
//! Module arguments:
//!
//! * `conf=<path>`: configuration file, defaults to `/etc/aad.conf`
//! * `debug`: log at debug level

use std::ffi::{c_char, c_int, CStr, CString};
use std::path::PathBuf;

use pam_sys::types::{PamHandle, PamItemType, PamMessageStyle, PamReturnCode};

use aad_config::DEFAULT_CONFIG_PATH;
use aad_directory::DirectoryAuth;
use aad_log::{LevelFilter, Logger, LOG_ENV};

pub mod flow;
use flow::{Conversation, PamFlow, PamResult};

#[link(name = "pam")]
extern "C" {
    fn pam_get_user(pamh: *mut PamHandle, user: *mut *const c_char, prompt: *const c_char)
        -> c_int;
    fn pam_get_authtok(
        pamh: *mut PamHandle,
        item: c_int,
        authtok: *mut *const c_char,
        prompt: *const c_char,
    ) -> c_int;
    fn pam_prompt(
        pamh: *mut PamHandle,
        style: c_int,
        response: *mut *mut c_char,
        fmt: *const c_char,
        ...
    ) -> c_int;
}

/// Parsed module arguments.
#[derive(Debug)]
struct ModuleArgs {
    conf: PathBuf,
    debug: bool,
    #[cfg(feature = "integration-tests")]
    cache_options: aad_cache::CacheOptions,
    #[cfg(feature = "integration-tests")]
    endpoint: Option<String>,
}

impl ModuleArgs {
    /// Returns the arguments and the ones which were not understood.
    fn parse<'a>(args: impl IntoIterator<Item = &'a str>) -> (Self, Vec<String>) {
        let mut parsed = ModuleArgs {
            conf: PathBuf::from(DEFAULT_CONFIG_PATH),
            debug: false,
            #[cfg(feature = "integration-tests")]
            cache_options: aad_cache::CacheOptions::new(),
            #[cfg(feature = "integration-tests")]
            endpoint: None,
        };
        let mut unknown = Vec::new();

        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (arg, None),
            };
            match (key, value) {
                ("conf", Some(value)) => parsed.conf = PathBuf::from(value),
                ("debug", None) => parsed.debug = true,
                #[cfg(feature = "integration-tests")]
                (key, Some(value)) if parsed.parse_test_override(key, value) => (),
                _ => unknown.push(arg.to_string()),
            }
        }

        (parsed, unknown)
    }

    #[cfg(feature = "integration-tests")]
    fn parse_test_override(&mut self, key: &str, value: &str) -> bool {
        let options = self.cache_options.clone();
        self.cache_options = match (key, value.parse::<u32>()) {
            ("cachedir", _) => options.cache_dir(value),
            ("root_uid", Ok(id)) => options.root_uid(id),
            ("root_gid", Ok(id)) => options.root_gid(id),
            ("shadow_gid", Ok(id)) => options.shadow_gid(id),
            ("shadow_mode", _) => match value.parse() {
                Ok(mode) => options.force_shadow_mode(mode),
                Err(_) => return false,
            },
            ("endpoint", _) => {
                self.endpoint = Some(value.to_string());
                return true;
            }
            _ => return false,
        };
        true
    }
}

/// Collect `argv` into owned strings, skipping entries which are not valid UTF-8.
unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() {
        return Vec::new();
    }
    (0..usize::try_from(argc).unwrap_or(0))
        .filter_map(|i| {
            let arg = *argv.add(i);
            if arg.is_null() {
                return None;
            }
            CStr::from_ptr(arg).to_str().ok().map(str::to_string)
        })
        .collect()
}

struct PamConversation(*mut PamHandle);

impl Conversation for PamConversation {
    fn info(&self, message: &str) {
        let Ok(message) = CString::new(message) else {
            return;
        };
        let rc = unsafe {
            pam_prompt(
                self.0,
                PamMessageStyle::TEXT_INFO as c_int,
                std::ptr::null_mut(),
                c"%s".as_ptr(),
                message.as_ptr(),
            )
        };
        if rc != PamReturnCode::SUCCESS as c_int {
            log::warn!("unable to show message to the user, PAM error {rc}");
        }
    }
}

fn init_logging(debug: bool) {
    let mut logger = Logger::from_env(LOG_ENV, LevelFilter::INFO);
    if debug {
        logger = logger.at_least(LevelFilter::DEBUG);
    }
    if let Err(err) = logger.journald().init() {
        eprintln!("unable to initialize logging: {err}");
    }
}

unsafe fn get_string(
    what: &str,
    get: impl FnOnce(*mut *const c_char) -> c_int,
) -> Result<String, c_int> {
    let mut ptr: *const c_char = std::ptr::null();
    let rc = get(&mut ptr);
    if rc != PamReturnCode::SUCCESS as c_int {
        log::error!("unable to get {what}, PAM error {rc}");
        return Err(rc);
    }
    if ptr.is_null() {
        log::error!("no {what} provided");
        return Err(PamReturnCode::AUTH_ERR as c_int);
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(value) => Ok(value.to_string()),
        Err(_) => {
            log::error!("{what} is not valid UTF-8");
            Err(PamReturnCode::AUTH_ERR as c_int)
        }
    }
}

fn authenticate(pamh: *mut PamHandle, args: ModuleArgs) -> c_int {
    let username = match unsafe {
        get_string("user", |ptr| pam_get_user(pamh, ptr, std::ptr::null()))
    } {
        Ok(username) => username,
        Err(rc) => return rc,
    };
    let password = match unsafe {
        get_string("password", |ptr| {
            pam_get_authtok(pamh, PamItemType::AUTHTOK as c_int, ptr, std::ptr::null())
        })
    } {
        Ok(password) => password,
        Err(rc) => return rc,
    };

    let directory = DirectoryAuth::new();
    #[cfg(feature = "integration-tests")]
    let directory = match &args.endpoint {
        Some(endpoint) => directory.endpoint(endpoint.as_str()),
        None => directory,
    };

    let flow = PamFlow::new(&args.conf, directory);
    #[cfg(feature = "integration-tests")]
    let flow = flow.cache_options(args.cache_options.clone());

    match flow.authenticate(&username, &password, &PamConversation(pamh)) {
        PamResult::Success => PamReturnCode::SUCCESS as c_int,
        PamResult::AuthError => PamReturnCode::AUTH_ERR as c_int,
        PamResult::SystemError => PamReturnCode::SYSTEM_ERR as c_int,
    }
}

/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_authenticate(
    pamh: *mut PamHandle,
    _flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    let raw_args = collect_args(argc, argv);
    let (args, unknown) = ModuleArgs::parse(raw_args.iter().map(String::as_str));
    init_logging(args.debug);
    for arg in unknown {
        log::warn!("unknown option: {arg}");
    }

    authenticate(pamh, args)
}

#[no_mangle]
pub extern "C" fn pam_sm_setcred(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::IGNORE as c_int
}

#[no_mangle]
pub extern "C" fn pam_sm_acct_mgmt(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::IGNORE as c_int
}

#[no_mangle]
pub extern "C" fn pam_sm_open_session(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

#[no_mangle]
pub extern "C" fn pam_sm_close_session(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_module_args() {
        let (args, unknown) = ModuleArgs::parse(["conf=/tmp/aad.conf", "debug", "foo", "debug=1"]);
        assert_eq!(args.conf, PathBuf::from("/tmp/aad.conf"));
        assert!(args.debug);
        assert_eq!(unknown, vec!["foo".to_string(), "debug=1".to_string()]);

        let (args, unknown) = ModuleArgs::parse([]);
        assert_eq!(args.conf, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.debug);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_collect_args() {
        let conf = CString::new("conf=/etc/other.conf").unwrap();
        let debug = CString::new("debug").unwrap();
        let argv = [conf.as_ptr(), debug.as_ptr()];
        let args = unsafe { collect_args(2, argv.as_ptr()) };
        assert_eq!(args, vec!["conf=/etc/other.conf", "debug"]);

        assert!(unsafe { collect_args(3, std::ptr::null()) }.is_empty());
    }

    #[test]
    fn test_ignored_hooks() {
        let null = std::ptr::null_mut();
        assert_eq!(
            pam_sm_setcred(null, 0, 0, std::ptr::null()),
            PamReturnCode::IGNORE as c_int
        );
        assert_eq!(
            pam_sm_acct_mgmt(null, 0, 0, std::ptr::null()),
            PamReturnCode::IGNORE as c_int
        );
        assert_eq!(
            pam_sm_open_session(null, 0, 0, std::ptr::null()),
            PamReturnCode::SUCCESS as c_int
        );
    }
}
