use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::info;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use labstack::launcher::{
    create_sample_config, forward_os_signals, interrupt_channel, load_config,
    ConsoleStatusListener, Launcher, SessionEnd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Launch and keep the stack in the foreground.
    Up,
    /// Launch, report, and tear down immediately.
    Check,
}

fn cli() -> Command {
    Command::new("labstack")
        .version("0.1.0")
        .about("Labstack - launches a laboratory service stack in dependency order")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Stack definition file (defaults to the built-in lab stack)")
                .global(true),
        )
        .arg(
            Arg::new("poll-interval-ms")
                .long("poll-interval-ms")
                .value_name("MILLIS")
                .help("How often readiness probes are evaluated")
                .global(true),
        )
        .arg(
            Arg::new("grace-ms")
                .long("grace-ms")
                .value_name("MILLIS")
                .help("Grace period before a stopping service is killed")
                .global(true),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Directory for per-service output logs")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .global(true),
        )
        .arg(
            Arg::new("report-json")
                .long("report-json")
                .value_name("FILE")
                .help("Also write the launch report as JSON")
                .global(true),
        )
        .subcommand(Command::new("up").about("Launch the stack and keep it running (default)"))
        .subcommand(Command::new("check").about("Launch the stack, report, then stop it"))
        .subcommand(Command::new("plan").about("Print the resolved launch order"))
        .subcommand(
            Command::new("sample-config")
                .about("Write the built-in stack definition to a file")
                .arg(
                    Arg::new("path")
                        .value_name("PATH")
                        .required(true)
                        .help("Where to write the sample"),
                ),
        )
}

fn init_logging(matches: &ArgMatches) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = matches.get_one::<String>("log-level") {
        builder.parse_filters(level);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();

    let (command, sub_matches) = match matches.subcommand() {
        Some((name, sub)) => (name, sub),
        None => ("up", &matches),
    };
    init_logging(sub_matches);

    let code = match command {
        "sample-config" => {
            let path = sub_matches
                .get_one::<String>("path")
                .context("sample-config needs a PATH")?;
            create_sample_config(path)?;
            0
        }
        "plan" => {
            let config_path = sub_matches.get_one::<String>("config");
            let config = load_config(config_path.map(|s| s.as_str()), sub_matches)?;
            let stack = config.resolve()?;
            print!("{}", stack.plan());
            0
        }
        "check" => run(sub_matches, Mode::Check).await?,
        _ => run(sub_matches, Mode::Up).await?,
    };

    Ok(ExitCode::from(code as u8))
}

async fn run(matches: &ArgMatches, mode: Mode) -> Result<i32> {
    let config_path = matches.get_one::<String>("config");
    let config = load_config(config_path.map(|s| s.as_str()), matches)?;
    let stack = config.resolve()?;

    let (trigger, interrupts) = interrupt_channel();
    tokio::spawn(forward_os_signals(trigger));

    let launcher = Launcher::from_config(&config)
        .with_listener(Arc::new(ConsoleStatusListener))
        .with_interrupts(interrupts);

    let mut session = launcher.launch(&stack).await;
    println!("{}", session.report().summary());

    if let Some(path) = matches.get_one::<String>("report-json") {
        let json = session
            .report()
            .to_json()
            .context("Failed to serialize launch report")?;
        fs::write(path, json).with_context(|| format!("Failed to write report to: {path}"))?;
        info!("Launch report written to {path}");
    }

    if session.report().stack_usable() {
        if mode == Mode::Up {
            info!("Stack is up. Press Ctrl+C to shut down.");
            match session.supervise().await {
                SessionEnd::Interrupted => info!("Shutdown requested, stopping stack..."),
                SessionEnd::ServiceExited(service) => {
                    info!("{service} exited, stopping stack...")
                }
                SessionEnd::AllExited => info!("All services have exited"),
            }
        }

        let summary = session.teardown().await;
        if !summary.is_clean() {
            for error in &summary.errors {
                log::error!("{error}");
            }
        }
        info!("Labstack shutdown complete");
    }

    Ok(session.exit_code())
}
