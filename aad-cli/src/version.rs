use std::io::Write;
use std::process::Command;

use anyhow::Error;

const PACKAGES: &[&str] = &["libpam-aad", "libnss-aad"];

/// Print the version of the CLI and of the installed PAM and NSS modules.
pub fn print(dpkg_query: &str, out: &mut dyn Write) -> Result<(), Error> {
    writeln!(out, "aad-cli\t\t{}", env!("CARGO_PKG_VERSION"))?;

    for package in PACKAGES {
        let output = Command::new(dpkg_query)
            .args(["-W", "--showformat", "${Version}", *package])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                writeln!(out, "{package}\t{}", String::from_utf8_lossy(&output.stdout).trim())?
            }
            Ok(output) => {
                log::debug!("{dpkg_query} failed for {package}: {}", output.status);
                writeln!(out, "{package}\tnot installed")?;
            }
            Err(err) => {
                log::debug!("unable to run {dpkg_query}: {err}");
                writeln!(out, "{package}\tnot installed")?;
            }
        }
    }

    Ok(())
}
