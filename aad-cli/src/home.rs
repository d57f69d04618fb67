//! Moving home directories of cached users.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, format_err, Error};

/// Fail if a process of `uid` is running in our root directory.
///
/// Processes in another root (containers, chroots) are ignored.
pub fn check_not_busy(proc_fs: &Path, uid: u32) -> Result<(), Error> {
    let our_root = fs::read_link(proc_fs.join("1").join("root")).ok();

    let entries = fs::read_dir(proc_fs)
        .map_err(|err| format_err!("unable to read {proc_fs:?}: {err}"))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.chars().all(|c| c.is_ascii_digit())) else {
            continue;
        };
        let dir = entry.path();

        if let Some(our_root) = &our_root {
            match fs::read_link(dir.join("root")) {
                Ok(root) if &root == our_root => (),
                _ => continue,
            }
        }

        if runs_as(&dir, uid) || tasks_run_as(&dir, uid) {
            bail!("user is currently used by process {pid}");
        }
    }

    Ok(())
}

fn tasks_run_as(dir: &Path, uid: u32) -> bool {
    let Ok(tasks) = fs::read_dir(dir.join("task")) else {
        return false;
    };
    tasks.flatten().any(|task| runs_as(&task.path(), uid))
}

/// Whether any of the real, effective, saved or filesystem uids in `<dir>/status` is `uid`.
fn runs_as(dir: &Path, uid: u32) -> bool {
    let Ok(status) = fs::read_to_string(dir.join("status")) else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .map(|ids| ids.split_whitespace().any(|id| id.parse::<u32>().ok() == Some(uid)))
        .unwrap_or(false)
}

/// Move the home directory from `from` to `to`, which must not exist yet.
pub fn move_home(from: &Path, to: &Path) -> Result<(), Error> {
    if to.exists() {
        bail!("directory {to:?} already exists");
    }

    let meta = fs::metadata(from).map_err(|err| format_err!("unable to stat {from:?}: {err}"))?;
    if !meta.is_dir() {
        bail!("{from:?} was not a directory, it is not removed and no home directories are created");
    }

    if fs::rename(from, to).is_ok() {
        log::debug!("moved {from:?} to {to:?}");
        return Ok(());
    }

    // cross-device move
    log::debug!("unable to rename {from:?} to {to:?}, trying with mv");
    let status = Command::new("mv")
        .arg(from)
        .arg(to)
        .status()
        .map_err(|err| format_err!("unable to run mv: {err}"))?;
    if !status.success() {
        bail!("moving {from:?} to {to:?} failed: {status}");
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;

    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = nix::unistd::mkdtemp(&std::env::temp_dir().join("aad-cli-XXXXXX")).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn fake_process(proc_fs: &Path, pid: &str, uid: u32, root: &str) {
        let dir = proc_fs.join(pid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\tbash\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\nGid:\t0\t0\t0\t0\n"),
        )
        .unwrap();
        symlink(root, dir.join("root")).unwrap();
    }

    #[test]
    fn test_busy() {
        let tmp = TempDir::new();
        fake_process(&tmp.0, "1", 0, "/");
        fake_process(&tmp.0, "42", 1000, "/");

        assert!(check_not_busy(&tmp.0, 1000).is_err());
        assert!(check_not_busy(&tmp.0, 1001).is_ok());
    }

    #[test]
    fn test_busy_in_other_root_is_ignored() {
        let tmp = TempDir::new();
        fake_process(&tmp.0, "1", 0, "/");
        fake_process(&tmp.0, "42", 1000, "/etc");

        assert!(check_not_busy(&tmp.0, 1000).is_ok());
    }

    #[test]
    fn test_busy_task() {
        let tmp = TempDir::new();
        fake_process(&tmp.0, "1", 0, "/");
        fake_process(&tmp.0, "42", 0, "/");
        let task = tmp.0.join("42").join("task").join("43");
        fs::create_dir_all(&task).unwrap();
        fs::write(task.join("status"), "Uid:\t1000\t1000\t1000\t1000\n").unwrap();

        assert!(check_not_busy(&tmp.0, 1000).is_err());
    }

    #[test]
    fn test_move_home() {
        let tmp = TempDir::new();
        let from = tmp.0.join("old");
        let to = tmp.0.join("new");
        fs::create_dir(&from).unwrap();
        fs::write(from.join(".profile"), "").unwrap();

        move_home(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.join(".profile").exists());

        // target exists
        fs::create_dir(&from).unwrap();
        assert!(move_home(&from, &to).is_err());

        // source is no directory
        let file = tmp.0.join("file");
        fs::write(&file, "").unwrap();
        assert!(move_home(&file, &tmp.0.join("other")).is_err());
    }
}
