//! Manage Azure AD accounts configuration.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Error};
use clap::error::ErrorKind;
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};

use aad_cache::{Attribute, CacheOptions};
use aad_config::{ADDUSER_CONF_PATH, DEFAULT_CONFIG_PATH};
use aad_log::{LevelFilter, Logger, LOG_ENV};

mod config;
mod home;
mod time;
mod user;
mod version;

const DEFAULT_EDITOR: &str = "nano";

/// System paths and tools, replaceable in tests.
#[derive(Debug)]
pub struct Context {
    pub config_path: PathBuf,
    pub adduser_conf: Option<PathBuf>,
    pub editor: String,
    pub dpkg_query: String,
    pub proc_fs: PathBuf,
    pub cache_options: CacheOptions,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            adduser_conf: Some(PathBuf::from(ADDUSER_CONF_PATH)),
            editor: std::env::var("EDITOR")
                .ok()
                .filter(|editor| !editor.is_empty())
                .unwrap_or_else(|| DEFAULT_EDITOR.to_string()),
            dpkg_query: "dpkg-query".to_string(),
            proc_fs: PathBuf::from("/proc"),
            cache_options: CacheOptions::new(),
        }
    }
}

/// Name of the invoking user, empty if it cannot be resolved.
fn current_user() -> String {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => user.name,
        _ => String::new(),
    }
}

fn user_command() -> Command {
    let attributes: Vec<&str> = Attribute::QUERYABLE.iter().map(|a| a.as_str()).collect();
    let updatable: Vec<&str> = Attribute::UPDATABLE.iter().map(|a| a.as_str()).collect();

    Command::new("user")
        .about("Manage local Azure AD user information")
        .long_about(format!(
            "Manage local Azure AD user information\n\n\
             When called without arguments, this command will retrieve the cache record for the \
             current user.\n\n\
             Specific values can be retrieved by passing an attribute name ({}).\n\
             Values can be set by passing an attribute name and a value.\n\n\
             Currently the only modifiable attributes are: {}.",
            attributes.join(", "),
            updatable.join(", "),
        ))
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("LOGIN")
                .help("username to operate on, defaults to the current user"),
        )
        .arg(
            Arg::new("all")
                .short('a')
                .long("all")
                .action(ArgAction::SetTrue)
                .conflicts_with_all(["name", "move-home"])
                .help("list all users"),
        )
        .arg(
            Arg::new("move-home")
                .short('m')
                .long("move-home")
                .action(ArgAction::SetTrue)
                .help("if updating home, move the content of the home directory to the new location"),
        )
        .arg(Arg::new("key").help("attribute name"))
        .arg(Arg::new("value").help("new value of the attribute"))
}

fn config_command() -> Command {
    let domain = Arg::new("domain")
        .short('d')
        .long("domain")
        .help("domain to use for parsing the configuration, defaults to the current user's");

    Command::new("config")
        .about("Manage aad-auth configuration")
        .long_about(format!(
            "Manage aad-auth configuration\n\n\
             Edit or print the configuration file at {DEFAULT_CONFIG_PATH}. Without a subcommand \
             the configuration is printed."
        ))
        .arg(domain.clone())
        .args_conflicts_with_subcommands(true)
        .subcommand(
            Command::new("print")
                .about("Print the configuration which applies to a domain")
                .arg(domain),
        )
        .subcommand(
            Command::new("edit").about("Edit the configuration file in an external editor"),
        )
}

fn cli() -> Command {
    Command::new("aad-cli")
        .about("Azure AD CLI")
        .long_about("Manage Azure AD accounts configuration")
        .version(crate_version!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("issue INFO (-v) or DEBUG (-vv) output"),
        )
        .subcommand(user_command())
        .subcommand(config_command())
        .subcommand(Command::new("version").about(
            "Returns the version of aad-cli and the PAM/NSS libraries if available",
        ))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    if let Err(err) = Logger::from_env(LOG_ENV, LevelFilter::WARN)
        .at_least(level)
        .stderr()
        .init()
    {
        eprintln!("unable to initialize logging: {err}");
    }
}

fn user_args(matches: &ArgMatches) -> user::UserArgs {
    user::UserArgs {
        name: matches
            .get_one::<String>("name")
            .cloned()
            .unwrap_or_else(current_user),
        all: matches.get_flag("all"),
        move_home: matches.get_flag("move-home"),
        key: matches.get_one::<String>("key").cloned(),
        value: matches.get_one::<String>("value").cloned(),
    }
}

fn domain_arg(matches: &ArgMatches) -> String {
    match matches.get_one::<String>("domain") {
        Some(domain) => domain.clone(),
        None => current_user()
            .split_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_default(),
    }
}

fn run(ctx: &Context, matches: &ArgMatches) -> Result<(), Error> {
    let mut out = io::stdout().lock();

    match matches.subcommand() {
        Some(("user", matches)) => user::run(ctx, &user_args(matches), &mut out),
        Some(("config", matches)) => match matches.subcommand() {
            Some(("edit", _)) => config::edit(ctx, &mut out),
            Some(("print", matches)) => config::print(ctx, &domain_arg(matches), &mut out),
            _ => config::print(ctx, &domain_arg(matches), &mut out),
        },
        Some(("version", _)) => version::print(&ctx.dpkg_query, &mut out),
        Some((name, _)) => bail!("unknown command {name:?}"),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    let mut cli = cli();
    let matches = cli.get_matches_mut();

    if let Some(("user", user)) = matches.subcommand() {
        let sets_home = user.get_one::<String>("value").is_some()
            && user
                .get_one::<String>("key")
                .is_some_and(|key| matches!(key.parse::<Attribute>(), Ok(Attribute::Home)));
        if user.get_flag("move-home") && !sets_home {
            cli.error(
                ErrorKind::ArgumentConflict,
                "move-home can only be used when modifying home attribute",
            )
            .exit();
        }
    }

    init_logging(matches.get_count("verbose"));

    match run(&Context::default(), &matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
