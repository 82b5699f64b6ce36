use log::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{crate_version, value_t, App, AppSettings, Arg, ArgMatches, SubCommand};

use baleen::classify::Classifier;
use baleen::fff;
use baleen::instrument::Instrumentation;
use baleen::logger::Logger;
use baleen::replay;

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    if let Some(level) = matches.value_of("loglevel") {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    // default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn allowlist(args: &ArgMatches, log_dir: &Path) -> HashSet<String> {
    if let Some(path) = args.value_of("allowlist") {
        match fff::load_allowlist(Path::new(path)) {
            Ok(names) => return names,
            Err(err) => {
                error!("{}", err);
                std::process::exit(1);
            }
        }
    }
    if args.is_present("finder") {
        return fff::discover("bfff", &log_dir.join("foreigns.txt"));
    }
    HashSet::new()
}

fn replay(args: &ArgMatches) {
    let trace = value_t!(args, "TRACE", PathBuf).unwrap_or_else(|e| e.exit());
    let log_dir = value_t!(args, "log-dir", PathBuf).unwrap_or_else(|e| e.exit());
    let report = value_t!(args, "report", PathBuf).unwrap_or_else(|e| e.exit());

    let names = allowlist(args, &log_dir);

    let logger = match Logger::create(&log_dir) {
        Ok(logger) => Arc::new(logger),
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };
    let tool = Instrumentation::new(Classifier::with_allowlist(names), logger, report);

    if let Err(err) = replay::run(&trace, &tool) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn main() {
    let replay_command = SubCommand::with_name("replay")
        .about("Replay a recorded instrumentation trace through the attribution engine.")
        .version(crate_version!())
        .arg(
            Arg::with_name("TRACE")
                .help("Path to the recorded event trace")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("allowlist")
                .long("allowlist")
                .takes_value(true)
                .help("Foreign-function finder output to load"),
        )
        .arg(
            Arg::with_name("finder")
                .long("finder")
                .conflicts_with("allowlist")
                .help("Run the external foreign-function finder (bfff)"),
        )
        .arg(
            Arg::with_name("log-dir")
                .long("log-dir")
                .takes_value(true)
                .default_value(".baleen")
                .help("Directory for the analysis log streams"),
        )
        .arg(
            Arg::with_name("report")
                .long("report")
                .takes_value(true)
                .default_value("baleen-report.log")
                .help("Report file written when the trace finishes"),
        );

    let main_app = App::new("baleen")
        .about("Attributes heap allocations and memory accesses to Rust or C.")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .conflicts_with("loglevel")
                .help("shorthand for --loglevel debug)"),
        )
        .arg(
            Arg::with_name("loglevel")
                .short("l")
                .takes_value(true)
                .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"),
        )
        .subcommand(replay_command);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        ("replay", Some(sub_matches)) => replay(sub_matches),
        _ => unreachable!(), // because of AppSettings::SubcommandRequiredElseHelp
    }
}
