use std::io::Write;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use aad_cache::{Attribute, AttributeValue, Cache, CacheError};

use crate::home::{check_not_busy, move_home};
use crate::time::epoch_to_rfc3339;
use crate::Context;

/// Arguments of `aad-cli user`.
#[derive(Debug, Default)]
pub struct UserArgs {
    pub name: String,
    pub all: bool,
    pub move_home: bool,
    pub key: Option<String>,
    pub value: Option<String>,
}

pub fn run(ctx: &Context, args: &UserArgs, out: &mut dyn Write) -> Result<(), Error> {
    let cache = Cache::open(ctx.cache_options.clone())?;
    let name = args.name.to_lowercase();

    let output = match (&args.key, &args.value) {
        (None, _) if args.all => cache.all_logins()?.join("\n"),
        (None, _) => cache
            .user_by_name(&name)
            .map_err(|err| user_error(&name, err))?
            .to_ini(),
        (Some(key), None) => query(&cache, &name, key.parse()?)?,
        (Some(key), Some(value)) => {
            return update(ctx, &cache, &name, key.parse()?, value, args.move_home);
        }
    };

    writeln!(out, "{}", output.trim())?;
    Ok(())
}

fn user_error(name: &str, err: CacheError) -> Error {
    match err {
        CacheError::NotFound => format_err!("no cached user named {name:?}"),
        err => err.into(),
    }
}

fn query(cache: &Cache, name: &str, attribute: Attribute) -> Result<String, Error> {
    let value = match cache.query_attribute(name, attribute) {
        Ok(value) => value,
        Err(CacheError::ShadowNotReadable) => {
            bail!("You do not have permission to read the shadow database")
        }
        Err(err) => return Err(user_error(name, err)),
    };

    match (attribute, value) {
        (Attribute::LastOnlineAuth, AttributeValue::Integer(epoch)) => epoch_to_rfc3339(epoch),
        (Attribute::LastOnlineAuth, value) => {
            bail!("failed to parse last_online_auth as the value isn't valid: {value}")
        }
        (_, value) => Ok(value.to_string()),
    }
}

fn update(
    ctx: &Context,
    cache: &Cache,
    name: &str,
    attribute: Attribute,
    value: &str,
    move_requested: bool,
) -> Result<(), Error> {
    let previous = cache
        .query_attribute(name, attribute)
        .map_err(|err| user_error(name, err))?
        .to_string();

    if previous == value {
        log::debug!("no change to {attribute:?} for {name}");
        return Ok(());
    }

    let moving = move_requested && attribute == Attribute::Home;
    if moving {
        let uid = cache.user_by_name(name)?.uid;
        check_not_busy(&ctx.proc_fs, uid)
            .map_err(|err| format_err!("couldn't update attribute: {err}"))?;
    }

    cache
        .update_attribute(name, attribute, value)
        .map_err(|err| format_err!("couldn't update attribute: {err}"))?;

    if moving {
        move_home(Path::new(&previous), Path::new(value))
            .map_err(|err| format_err!("unable to move home directory for {name}: {err}"))?;
    }

    Ok(())
}
