use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use golfbox::backoff::Backoff;
use golfbox::{
    Config, DockerRuntime, ErrorKind, ExecutionError, Executor, RunOptions, RunRequest,
};

/// Default configuration path.
const DEFAULT_CONFIG_PATH: &str = "config/golfbox.toml";

/// Exit status when the program ran past its time limit.
const EXIT_TIME_LIMIT: i32 = 2;

/// Exit status when the program was OOM-killed.
const EXIT_MEMORY_LIMIT: i32 = 3;

/// Allowance for the kill/remove calls themselves on top of the teardown
/// retry delays.
const TEARDOWN_CALL_MARGIN: Duration = Duration::from_millis(500);

/// How long an interrupted run waits for the dropped unit's teardown before
/// exiting: the whole teardown schedule plus the call margin.
fn interrupt_grace() -> Duration {
    Backoff::for_teardown().remaining_budget() + TEARDOWN_CALL_MARGIN
}

fn print_help() {
    println!(
        "\
golfbox v{}

Runs a source file in a throwaway, network-less Docker container.

USAGE:
    golfbox [OPTIONS] <LANGUAGE> <SOURCE_FILE>
    golfbox [OPTIONS] --languages

ARGUMENTS:
    LANGUAGE       Language key from the config file (e.g. python)
    SOURCE_FILE    Program to run

OPTIONS:
    -c, --config <PATH>    Configuration file [default: {DEFAULT_CONFIG_PATH}]
    -i, --input <PATH>     File fed to the program's stdin ('-' for this
                           process's stdin) [default: empty]
        --trace            Writable mount, ptrace capability, trace log
        --disasm           Ask the image's entrypoint for a disassembly
        --languages        List configured languages and exit
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

EXIT STATUS:
    The program's own exit code when it ran to completion,
    {EXIT_TIME_LIMIT} on time limit, {EXIT_MEMORY_LIMIT} on memory limit, 1 on any other error.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG       Log level filter for tracing
                   (e.g. debug, golfbox=debug,warn)
    DOCKER_HOST    Docker daemon address when [docker] socket is unset

EXAMPLES:
    golfbox python hello.py
    golfbox -i input.txt ruby solve.rb
    RUST_LOG=golfbox=debug golfbox --trace c main.c",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Default)]
struct Args {
    config_path: Option<String>,
    input: Option<String>,
    options: RunOptions,
    list_languages: bool,
    positional: Vec<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                parsed.config_path =
                    Some(args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "-i" | "--input" => {
                parsed.input = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "--trace" => parsed.options.trace = true,
            "--disasm" => parsed.options.disasm = true,
            "--languages" => parsed.list_languages = true,
            other if other.starts_with('-') && other != "-" => {
                bail!("unknown option: {other} (see --help)")
            }
            _ => parsed.positional.push(arg),
        }
    }
    Ok(parsed)
}

fn read_input(input: Option<&str>) -> Result<Vec<u8>> {
    match input {
        None => Ok(Vec::new()),
        Some("-") => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("cannot read stdin")?;
            Ok(buf)
        }
        Some(path) => std::fs::read(path).with_context(|| format!("cannot read input {path}")),
    }
}

fn exit_status(err: &ExecutionError) -> i32 {
    match err.kind() {
        ErrorKind::TimeLimitExceeded => EXIT_TIME_LIMIT,
        ErrorKind::MemoryLimitExceeded => EXIT_MEMORY_LIMIT,
        ErrorKind::RuntimeError | ErrorKind::WorkspaceError => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("golfbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode); stderr is shared
    // with the program's output, so logs stay quiet by default
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("golfbox=warn")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config_path = args.config_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);

    info!("Loading configuration from {config_path}");
    let config = Config::load(config_path)?;
    let registry = config.registry();
    info!(
        "Languages: {}",
        registry.keys().collect::<Vec<_>>().join(", ")
    );

    if args.list_languages {
        for (key, profile) in registry.iter() {
            println!(
                "{key:<16} {:<32} {} MB",
                profile.image, profile.memory_limit_mb
            );
        }
        return Ok(());
    }

    let [language, source_path] = args.positional.as_slice() else {
        bail!("expected <LANGUAGE> <SOURCE_FILE> (see --help)");
    };
    let source = std::fs::read(source_path)
        .with_context(|| format!("cannot read source {source_path}"))?;
    let stdin = read_input(args.input.as_deref())?;

    let runtime = DockerRuntime::connect(&config.docker)?;
    runtime
        .ping()
        .await
        .map_err(|e| anyhow!("Docker daemon unreachable: {e}"))?;
    info!("Docker: connected");

    let executor = Executor::new(Arc::new(runtime), registry, config.executor.clone());
    let request = RunRequest::new(language.as_str(), source, stdin).with_options(args.options);

    let outcome = tokio::select! {
        outcome = executor.run(request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the run schedules a forced teardown of its unit
            info!("Interrupted, tearing down");
            tokio::time::sleep(interrupt_grace()).await;
            std::process::exit(130);
        }
    };

    match outcome {
        Ok(result) => {
            std::io::stdout().write_all(&result.stdout)?;
            std::io::stdout().flush()?;
            std::io::stderr().write_all(&result.stderr)?;
            info!(
                "Exit {} after {}ms",
                result.exit_code,
                result.elapsed.as_millis()
            );
            std::process::exit(i32::try_from(result.exit_code).unwrap_or(1));
        }
        Err(e) => {
            error!("{e}");
            eprintln!("golfbox: {e}");
            std::process::exit(exit_status(&e));
        }
    }
}
