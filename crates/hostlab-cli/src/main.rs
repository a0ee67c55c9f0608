use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod console;
mod script;

use console::{Console, ConsoleContext};
use script::TaskPool;

const LOG_ENV: &str = "HOSTLAB_LOG";
const DEFAULT_LOG_FILTER: &str = "info";
const PROMPT: &str = "hostlab> ";

#[derive(Parser)]
#[command(
    name = "hostlab",
    version = "0.3.0",
    about = "Host-side console for Android compliance suite runs"
)]
struct Cli {
    /// YAML config; `hostlab.yaml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// YAML script of console commands to run instead of the prompt.
    #[arg(long, conflicts_with = "command")]
    script: Option<PathBuf>,
    /// Print the command payload, or the error, as one JSON line.
    #[arg(long)]
    json: bool,
    /// A single console command, e.g. `hostlab retry --suite vts --count 5`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let json_mode = cli.json;
    match run(cli) {
        Ok(Some(payload)) => {
            if json_mode {
                emit_json(&payload);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<Option<Value>> {
    let config = config::load_config(cli.config.as_deref())?;
    let max_parallel = config.max_parallel;
    let console = Console::new(ConsoleContext::new(config));

    if let Some(path) = &cli.script {
        let steps = script::load_script(path)?;
        let pool = TaskPool::new(max_parallel)?;
        let failures = script::run_script(&console, &steps, &pool);
        if failures > 0 {
            return Err(anyhow!(
                "{} command(s) failed in script {}",
                failures,
                path.display()
            ));
        }
        return Ok(Some(json!({
            "ok": true,
            "command": "script",
            "script": path.display().to_string(),
            "steps": steps.len(),
        })));
    }

    if !cli.command.is_empty() {
        return console.execute_args(&cli.command);
    }

    interactive(&console)?;
    Ok(None)
}

fn interactive(console: &Console) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            println!();
            break;
        };
        console.onecmd(&line?);
        if console.exit_requested() {
            break;
        }
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
