//! Command-line entry point, grounded on
//! `zerotier-system-service::main`'s `clap` builder CLI and dispatch
//! pattern, scoped down to this daemon's own subcommands.

pub mod datadir;
pub mod error;
pub mod exitcode;
pub mod logging;
pub mod scripts;
pub mod service;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};

use crate::l;
use logging::Log;

fn make_help() -> String {
    format!(
        r###"mesh-service version {}
A peer-to-peer mesh VPN daemon.

Usage: mesh-service [-c <path>] [-d] [--logfile <path>] <command>

Global Options:

  -c <path>          Directory holding tinc.conf and hosts/
  -d                 Enable debug-level logging
  --logfile <path>   Also write logs to a rotating file at <path>

Commands:

  help               Show this help
  version            Print version (of this binary)
  service            Run the daemon in the foreground
                       (usually invoked by an init system)
  generate-keys      Generate RSA/ECDSA key pairs for this node, if missing

"###,
        env!("CARGO_PKG_VERSION"),
    )
}

pub fn print_help() {
    let h = make_help();
    let _ = std::io::stdout().write_all(h.as_bytes());
}

#[cfg(target_os = "macos")]
pub fn platform_default_home_path() -> String {
    "/Library/Application Support/mesh-service".into()
}

#[cfg(target_os = "linux")]
pub fn platform_default_home_path() -> String {
    "/var/lib/mesh-service".into()
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn platform_default_home_path() -> String {
    "./mesh-service".into()
}

pub struct Flags {
    pub base_path: String,
    pub debug: bool,
    pub log_file: Option<String>,
}

async fn async_main(flags: Flags, global_args: Box<ArgMatches>) -> i32 {
    let log = Arc::new(Log::new(flags.log_file.clone().map(PathBuf::from), 10 * 1024 * 1024, true, flags.debug));

    #[allow(unused)]
    match global_args.subcommand() {
        Some(("help", _)) => {
            print_help();
            exitcode::OK
        }
        Some(("version", _)) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            exitcode::OK
        }
        Some(("service", _)) => {
            drop(global_args); // free the parsed args before the reactor takes over
            service::run(PathBuf::from(flags.base_path), log)
        }
        Some(("generate-keys", _)) => match run_generate_keys(&flags.base_path, &log) {
            Ok(()) => exitcode::OK,
            Err(e) => {
                l!(log, "FATAL: {}", e);
                exitcode::ERR_IOERR
            }
        },
        _ => {
            eprintln!("Invalid command line. Use 'help' for help.");
            exitcode::ERR_USAGE
        }
    }
}

fn run_generate_keys(base_path: &str, log: &Log) -> error::Result<()> {
    use mesh_crypto::{EcdsaIdentity, RsaIdentity};

    let dd = datadir::DataDir::open(PathBuf::from(base_path))?;
    if dd.load_rsa_identity()?.is_none() {
        let id = RsaIdentity::generate(2048)?;
        dd.save_rsa_identity(&id)?;
        l!(log, "generated RSA key pair in {}", base_path);
    } else {
        l!(log, "RSA key pair already exists, leaving it in place");
    }
    if dd.load_ecdsa_identity()?.is_none() {
        let id = EcdsaIdentity::generate()?;
        dd.save_ecdsa_identity(&id)?;
        l!(log, "generated ECDSA key pair in {}", base_path);
    }
    Ok(())
}

fn main() {
    let global_args = Box::new({
        let help = make_help();
        Command::new("mesh-service")
            .arg(Arg::new("confbase").short('c').takes_value(true))
            .arg(Arg::new("debug").short('d'))
            .arg(Arg::new("logfile").long("logfile").takes_value(true))
            .subcommand_required(true)
            .subcommand(Command::new("help"))
            .subcommand(Command::new("version"))
            .subcommand(Command::new("service"))
            .subcommand(Command::new("generate-keys"))
            .override_help(help.as_str())
            .override_usage("")
            .disable_version_flag(true)
            .disable_help_subcommand(false)
            .disable_help_flag(true)
            .try_get_matches_from(std::env::args())
            .unwrap_or_else(|e| {
                if e.kind() == clap::ErrorKind::DisplayHelp || e.kind() == clap::ErrorKind::MissingSubcommand {
                    print_help();
                    std::process::exit(exitcode::OK);
                } else {
                    eprintln!("Invalid command line. Use 'help' for help.");
                    std::process::exit(exitcode::ERR_USAGE);
                }
            })
    });

    let flags = Flags {
        base_path: global_args.value_of("confbase").map_or_else(platform_default_home_path, |p| p.to_string()),
        debug: global_args.is_present("debug"),
        log_file: global_args.value_of("logfile").map(|p| p.to_string()),
    };

    std::process::exit(tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async_main(flags, global_args)));
}
