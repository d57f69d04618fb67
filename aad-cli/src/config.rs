use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, format_err, Error};

use aad_config::{ConfigLoader, CONFIG_TEMPLATE};

use crate::Context;

fn loader(ctx: &Context) -> ConfigLoader {
    ConfigLoader::new().adduser_conf(ctx.adduser_conf.clone())
}

/// Print the configuration which applies to users of `domain`.
pub fn print(ctx: &Context, domain: &str, out: &mut dyn Write) -> Result<(), Error> {
    let config = loader(ctx).load(&ctx.config_path, domain)?;

    let section = if domain.is_empty() { "default" } else { domain };
    writeln!(out, "[{section}]")?;
    write!(out, "{}", config.to_ini())?;
    Ok(())
}

fn temp_path(ctx: &Context) -> PathBuf {
    let mut path = ctx.config_path.clone().into_os_string();
    path.push(".tmp");
    PathBuf::from(path)
}

/// Edit a copy of the configuration file and replace the original if the result is valid.
pub fn edit(ctx: &Context, out: &mut dyn Write) -> Result<(), Error> {
    let path = &ctx.config_path;
    let temp = temp_path(ctx);

    let previous = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => CONFIG_TEMPLATE.to_string(),
        Err(err) => bail!("could not read previous config file {path:?}: {err}"),
    };
    fs::write(&temp, previous)
        .map_err(|err| format_err!("failed to create temporary config file {temp:?}: {err}"))?;

    // through the shell, EDITOR may carry arguments
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("{} \"$1\"", ctx.editor))
        .arg("aad-cli")
        .arg(&temp)
        .status()
        .map_err(|err| format_err!("failed to edit config: unable to run {:?}: {err}", ctx.editor))?;
    if !status.success() {
        bail!("failed to edit config: {:?} {status}", ctx.editor);
    }

    if let Err(err) = loader(ctx).validate(&temp) {
        bail!("invalid config: {err}\nThe temporary file was saved at: {temp:?}");
    }
    fs::rename(&temp, path).map_err(|err| format_err!("failed to write config file: {err}"))?;

    writeln!(out, "The configuration at {path:?} has been successfully updated.")?;
    Ok(())
}
