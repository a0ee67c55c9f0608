use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use hostlab_archive::{bundle_result_set, fetch_bundle};
use hostlab_core::{
    run_checked_command, HostlabError, ResultSetIndex, ScratchDir, GCS_SCHEME_PREFIX,
};
use hostlab_report::{SheetOptions, SuiteReport};
use hostlab_runner::cleanup::wifi_commands;
use hostlab_runner::{
    run_retry, AdbDeviceCommander, JsonlRetrySink, NullRetrySink, RetryCollaborators,
    RetryInvocation, RetryOptions, RetrySink, TestRunner,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::console::{CommandHandler, Console, RESULT_ZIP_VAR};

const SUITES: [&str; 4] = ["vts", "cts", "gts", "sts"];

pub fn all_handlers() -> Vec<Box<dyn CommandHandler>> {
    vec![
        Box::new(RetryCommand),
        Box::new(TestCommand),
        Box::new(SheetCommand),
        Box::new(DutCommand),
        Box::new(ResultsCommand),
        Box::new(ReportCommand),
        Box::new(UploadCommand),
        Box::new(HelpCommand),
        Box::new(ExitCommand),
    ]
}

/// Parses `args` for the command `name`. `Ok(None)` means help was printed.
fn parse_args<P: Parser>(name: &str, args: &[String]) -> Result<Option<P>> {
    let argv = std::iter::once(name.to_string()).chain(args.iter().cloned());
    match P::try_parse_from(argv) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", err.render());
            Ok(None)
        }
        Err(err) => Err(anyhow!("{}", err.render().to_string().trim_end())),
    }
}

fn results_index(console: &Console, suite: &str) -> Result<ResultSetIndex> {
    let root = console.context.config.suites.results_root(suite)?;
    Ok(ResultSetIndex::new(root))
}

fn require_gcs_url(url: &str) -> Result<()> {
    if !url.starts_with(GCS_SCHEME_PREFIX) {
        return Err(HostlabError::invalid_locator(url, "not a gs:// url").into());
    }
    Ok(())
}

fn upload_file(console: &Console, local: &Path, dest: &str) -> Result<()> {
    require_gcs_url(dest)?;
    let storage = console.context.storage.as_ref();
    let tool = storage.tool_path().ok_or_else(|| {
        HostlabError::ToolUnavailable("check that gsutil is installed and on PATH".to_string())
    })?;
    if !storage.upload(&tool, local, dest) {
        return Err(anyhow!("upload of {} to {} failed", local.display(), dest));
    }
    tracing::info!(src = %local.display(), dest, "uploaded");
    Ok(())
}

/// Resolves a sheet source: `gs://` locators are copied into `scratch`,
/// anything else is a local path.
fn local_source(console: &Console, source: &str, scratch: &ScratchDir) -> Result<PathBuf> {
    if source.starts_with(GCS_SCHEME_PREFIX) {
        return Ok(fetch_bundle(console.context.storage.as_ref(), source, scratch)?);
    }
    let path = PathBuf::from(source);
    if !path.is_file() {
        return Err(anyhow!("cannot find a file: {}", path.display()));
    }
    Ok(path)
}

pub struct ConsoleTestRunner<'a> {
    console: &'a Console,
}

impl<'a> ConsoleTestRunner<'a> {
    pub fn new(console: &'a Console) -> Self {
        Self { console }
    }
}

impl TestRunner for ConsoleTestRunner<'_> {
    fn dispatch(&mut self, invocation: &RetryInvocation) -> Result<()> {
        let mut args = vec!["test".to_string()];
        args.extend(invocation.console_args());
        self.console.execute_args(&args).map(|_| ())
    }
}

#[derive(Parser, Debug)]
#[command(name = "retry", about = "Retries the last run test plan until every module passes")]
struct RetryArgs {
    #[arg(long, default_value = "vts", value_parser = SUITES)]
    suite: String,
    /// Maximum number of retry runs.
    #[arg(long, default_value_t = hostlab_runner::DEFAULT_RETRY_COUNT)]
    count: usize,
    /// Retry runs to perform even when everything already passed.
    #[arg(long = "force-count", default_value_t = hostlab_runner::DEFAULT_FORCE_RETRY_COUNT)]
    force_count: usize,
    /// gs:// url of a results_*.zip to retry instead of the newest local run.
    #[arg(long = "result-from-gcs")]
    result_from_gcs: Option<String>,
    #[arg(long = "serial", short = 's')]
    serial: Vec<String>,
    #[arg(long)]
    shards: Option<u32>,
    #[arg(long = "shard-count")]
    shard_count: Option<u32>,
    /// Wipe and reboot every serial before each retry; takes an optional true/false.
    #[arg(
        long = "cleanup-devices",
        alias = "cleanup_devices",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    cleanup_devices: bool,
}

struct RetryCommand;

impl CommandHandler for RetryCommand {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn detail(&self) -> &'static str {
        "Retries the last run test plan for a given suite."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<RetryArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let config = &console.context.config;
        let options = RetryOptions {
            suite: args.suite,
            retry_count: args.count,
            force_retry_count: args.force_count,
            result_from_gcs: args.result_from_gcs,
            serials: args.serial,
            shards: args.shards,
            shard_count: args.shard_count,
            cleanup_devices: args.cleanup_devices,
            access_point: config.wifi_ap.clone(),
        };
        let mut sink: Box<dyn RetrySink> = match &config.journal_dir {
            Some(dir) => Box::new(JsonlRetrySink::new(dir)?),
            None => Box::new(NullRetrySink),
        };
        let mut runner = ConsoleTestRunner::new(console);
        let mut devices = AdbDeviceCommander;
        let outcome = run_retry(
            &config.suites,
            &options,
            RetryCollaborators {
                runner: &mut runner,
                storage: console.context.storage.as_ref(),
                devices: &mut devices,
                sink: sink.as_mut(),
            },
        )?;

        println!("suite: {}", options.suite);
        println!("dispatches: {}", outcome.dispatches);
        if let Some(session_id) = outcome.last_session_id {
            println!("last_session_id: {}", session_id);
        }
        println!("stopped_early: {}", outcome.stopped_early);
        println!("final_result_set: {}", outcome.final_baseline);
        Ok(Some(json!({
            "ok": true,
            "command": "retry",
            "suite": options.suite,
            "dispatches": outcome.dispatches,
            "last_session_id": outcome.last_session_id,
            "stopped_early": outcome.stopped_early,
            "final_result_set": outcome.final_baseline,
        })))
    }
}

#[derive(Parser, Debug)]
#[command(name = "test", about = "Runs a test plan on the suite launcher")]
struct TestArgs {
    #[arg(long, default_value = "vts", value_parser = SUITES)]
    suite: String,
    /// Comma-separated device serials; defaults to the configured serials.
    #[arg(long, short = 's')]
    serial: Option<String>,
    /// Keep the run's log-result bundle path in the `result_zip` variable.
    #[arg(long = "keep-result")]
    keep_result: bool,
    /// Plan and launcher arguments; put them after `--` when they start with `-`.
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true, trailing_var_arg = true)]
    command: Vec<String>,
}

struct TestCommand;

impl TestCommand {
    fn keep_result_dir(suite: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "hostlab_keep_result_{}_{}",
            suite,
            std::process::id()
        ))
    }
}

impl CommandHandler for TestCommand {
    fn name(&self) -> &'static str {
        "test"
    }

    fn detail(&self) -> &'static str {
        "Executes a test plan through the suite launcher."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<TestArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let config = &console.context.config;
        let launcher = config.suites.launcher(&args.suite)?;
        let serials: Vec<String> = match &args.serial {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => config.serials.clone(),
        };

        let result_dir = if args.keep_result {
            let dir = Self::keep_result_dir(&args.suite);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("clear result dir {}", dir.display()))?;
            }
            fs::create_dir_all(&dir)
                .with_context(|| format!("create result dir {}", dir.display()))?;
            Some(dir)
        } else {
            None
        };

        let mut cmd = Command::new(launcher);
        cmd.args(["run", "commandAndExit"]).args(&args.command);
        for serial in &serials {
            cmd.arg("-s").arg(serial);
        }
        if let Some(dir) = &result_dir {
            cmd.arg("--log-file-path").arg(dir).arg("--use-log-saver");
        }
        println!("command: {:?}", cmd);
        let out = run_checked_command(cmd, "test")?;
        tracing::debug!(stdout = %String::from_utf8_lossy(&out.stdout), "test launcher finished");

        let mut result_zip = None;
        if let Some(dir) = &result_dir {
            let mut found: Vec<PathBuf> = walkdir::WalkDir::new(dir)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    let name = entry.file_name().to_string_lossy();
                    name.starts_with("log-result") && name.ends_with(".zip")
                })
                .map(|entry| entry.into_path())
                .collect();
            if found.len() != 1 {
                tracing::warn!(results = ?found, "unexpected number of log-result bundles");
            }
            if found.is_empty() {
                console.context.remove_variable(RESULT_ZIP_VAR);
            } else {
                let first = found.remove(0);
                console
                    .context
                    .set_variable(RESULT_ZIP_VAR, first.display().to_string());
                println!("{}: {}", RESULT_ZIP_VAR, first.display());
                result_zip = Some(first.display().to_string());
            }
        }
        Ok(Some(json!({
            "ok": true,
            "command": "test",
            "suite": args.suite,
            "serials": serials,
            "result_zip": result_zip,
        })))
    }
}

#[derive(Parser, Debug)]
#[command(name = "sheet", about = "Converts a test result to CSV")]
struct SheetArgs {
    /// Descriptor, bundle or gs:// locator; `{var}` is replaced with console variables.
    #[arg(long)]
    src: String,
    #[arg(long)]
    dest: PathBuf,
    /// Lines written before the result rows.
    #[arg(long = "extra-rows", num_args = 1..)]
    extra_rows: Vec<String>,
    /// Reference result to compare failures against.
    #[arg(long = "ref")]
    reference: Option<String>,
    #[arg(long = "max-rows")]
    max_rows: Option<usize>,
}

struct SheetCommand;

impl CommandHandler for SheetCommand {
    fn name(&self) -> &'static str {
        "sheet"
    }

    fn detail(&self) -> &'static str {
        "Exports a test result to a CSV sheet. In --src, variables enclosed in {} are replaced with console values."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<SheetArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let src = console.context.format_string(&args.src)?;
        let scratch = ScratchDir::new("sheet")?;
        let source = local_source(console, &src, &scratch)?;
        let ref_scratch = ScratchDir::new("sheet_ref")?;
        let reference = match &args.reference {
            Some(reference) => {
                let reference = console.context.format_string(reference)?;
                Some(local_source(console, &reference, &ref_scratch)?)
            }
            None => None,
        };

        let options = SheetOptions {
            max_rows: args
                .max_rows
                .unwrap_or(console.context.config.sheet_max_rows),
            reference,
            extra_rows: args.extra_rows,
        };
        let table = hostlab_report::export(&source, &options)?;
        fs::write(&args.dest, table.to_csv()?)
            .with_context(|| format!("write sheet {}", args.dest.display()))?;
        let rows = table.test_rows().count();
        println!("sheet: {}", args.dest.display());
        println!("rows: {}", rows);
        Ok(Some(json!({
            "ok": true,
            "command": "sheet",
            "source": src,
            "dest": args.dest.display().to_string(),
            "rows": rows,
        })))
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DutOperation {
    #[value(name = "wifi_on")]
    WifiOn,
    #[value(name = "wifi_off")]
    WifiOff,
}

#[derive(Parser, Debug)]
#[command(name = "dut", about = "Performs an operation on a device under test")]
struct DutArgs {
    #[arg(long, value_enum)]
    operation: DutOperation,
    /// Defaults to the first configured serial.
    #[arg(long)]
    serial: Option<String>,
    /// Access point to join for `wifi_on`.
    #[arg(long)]
    ap: Option<String>,
}

struct DutCommand;

impl CommandHandler for DutCommand {
    fn name(&self) -> &'static str {
        "dut"
    }

    fn detail(&self) -> &'static str {
        "Performs an operation on the selected device."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<DutArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let serial = args
            .serial
            .or_else(|| console.context.config.serials.first().cloned())
            .ok_or_else(|| anyhow!("no device serial given or configured"))?;
        let enable = matches!(args.operation, DutOperation::WifiOn);
        AdbDeviceCommander.run_commands(&wifi_commands(&serial, enable, args.ap.as_deref()))?;
        println!("serial: {}", serial);
        println!("wifi: {}", if enable { "on" } else { "off" });
        Ok(Some(json!({
            "ok": true,
            "command": "dut",
            "serial": serial,
            "wifi_enabled": enable,
        })))
    }
}

#[derive(Parser, Debug)]
#[command(name = "results", about = "Lists result sets with their session ids")]
struct ResultsArgs {
    #[arg(long, default_value = "vts", value_parser = SUITES)]
    suite: String,
}

struct ResultsCommand;

impl CommandHandler for ResultsCommand {
    fn name(&self) -> &'static str {
        "results"
    }

    fn detail(&self) -> &'static str {
        "Lists the result sets of a suite."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<ResultsArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let index = results_index(console, &args.suite)?;
        let snapshot = index.snapshot()?;
        let mut rows = Vec::new();
        for (session_id, name) in snapshot.sorted().into_iter().enumerate() {
            match index.result_set(&name).summary() {
                Ok(summary) => {
                    println!(
                        "{:>4}  {}  plan={} failed={} skipped_modules={}",
                        session_id,
                        name,
                        summary.suite_plan,
                        summary.failed_count,
                        summary.skipped_modules()
                    );
                    rows.push(json!({
                        "session_id": session_id,
                        "directory": name,
                        "suite_plan": summary.suite_plan,
                        "failed": summary.failed_count,
                        "skipped_modules": summary.skipped_modules(),
                    }));
                }
                Err(err) => {
                    println!("{:>4}  {}  ({})", session_id, name, err);
                    rows.push(json!({
                        "session_id": session_id,
                        "directory": name,
                        "error": { "code": err.kind(), "message": err.to_string() },
                    }));
                }
            }
        }
        Ok(Some(json!({
            "ok": true,
            "command": "results",
            "suite": args.suite,
            "results_root": index.root().display().to_string(),
            "result_sets": rows,
        })))
    }
}

#[derive(Parser, Debug)]
#[command(name = "report", about = "Summarizes the newest result set as JSON")]
struct ReportArgs {
    #[arg(long, default_value = "vts", value_parser = SUITES)]
    suite: String,
    #[arg(long)]
    output: PathBuf,
    /// gs:// url to upload the report to.
    #[arg(long)]
    dest: Option<String>,
    /// gs:// url where the run's logs were uploaded.
    #[arg(long = "result-path")]
    result_path: Option<String>,
}

struct ReportCommand;

impl CommandHandler for ReportCommand {
    fn name(&self) -> &'static str {
        "report"
    }

    fn detail(&self) -> &'static str {
        "Writes a summary report of the newest result set and optionally uploads it."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<ReportArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let index = results_index(console, &args.suite)?;
        let mut report = SuiteReport::from_result_set(&index)?;
        report.result_path = match &args.result_path {
            Some(path) => Some(console.context.format_string(path)?),
            None => None,
        };
        report.branch = console.context.variable("branch");
        report.target = console.context.variable("target");
        report.build_id = console.context.variable("build_id");
        report.write_json(&args.output)?;
        println!("report: {}", args.output.display());

        let mut uploaded_to = None;
        if let Some(dest) = &args.dest {
            let dest = console.context.format_string(dest)?;
            upload_file(console, &args.output, &dest)?;
            println!("uploaded: {}", dest);
            uploaded_to = Some(dest);
        }
        Ok(Some(json!({
            "ok": true,
            "command": "report",
            "result_set": report.result_set,
            "output": args.output.display().to_string(),
            "uploaded_to": uploaded_to,
        })))
    }
}

#[derive(Parser, Debug)]
#[command(name = "upload", about = "Uploads files or a bundled result set to cloud storage")]
struct UploadArgs {
    #[arg(long, default_value = "vts", value_parser = SUITES)]
    suite: String,
    /// Space-separated local files; `{var}` is replaced with console variables.
    #[arg(long)]
    src: Option<String>,
    /// Result set to bundle when --src is absent; defaults to the newest.
    #[arg(long = "result-set")]
    result_set: Option<String>,
    /// gs:// destination; a trailing `/` keeps the local file name.
    #[arg(long)]
    dest: String,
}

struct UploadCommand;

impl CommandHandler for UploadCommand {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn detail(&self) -> &'static str {
        "Uploads <src> files, or a zipped result set, to <dest> in cloud storage."
    }

    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>> {
        let Some(args) = parse_args::<UploadArgs>(self.name(), args)? else {
            return Ok(None);
        };
        let dest = console.context.format_string(&args.dest)?;
        require_gcs_url(&dest)?;
        let target_for = |local: &Path| -> String {
            if dest.ends_with('/') {
                let name = local
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}{}", dest, name)
            } else {
                dest.clone()
            }
        };

        let mut uploaded = Vec::new();
        match &args.src {
            Some(src) => {
                let src = console.context.format_string(src)?;
                let paths: Vec<PathBuf> = src.split_whitespace().map(PathBuf::from).collect();
                if paths.is_empty() {
                    return Err(anyhow!("--src names no files"));
                }
                if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
                    return Err(anyhow!("cannot find a file: {}", missing.display()));
                }
                for path in &paths {
                    let target = target_for(path);
                    upload_file(console, path, &target)?;
                    uploaded.push(target);
                }
            }
            None => {
                let index = results_index(console, &args.suite)?;
                let name = match &args.result_set {
                    Some(name) => name.clone(),
                    None => index
                        .require_snapshot()?
                        .sorted()
                        .pop()
                        .context("results root has no result sets")?,
                };
                let scratch = ScratchDir::new("upload")?;
                let bundle = scratch.path().join(format!("results_{}.zip", name));
                bundle_result_set(index.root(), &name, &bundle)?;
                let target = target_for(&bundle);
                upload_file(console, &bundle, &target)?;
                uploaded.push(target);
            }
        }
        for target in &uploaded {
            println!("uploaded: {}", target);
        }
        Ok(Some(json!({
            "ok": true,
            "command": "upload",
            "uploaded": uploaded,
        })))
    }
}

struct HelpCommand;

impl CommandHandler for HelpCommand {
    fn name(&self) -> &'static str {
        "help"
    }

    fn detail(&self) -> &'static str {
        "Lists the available commands; '<command> --help' shows its flags."
    }

    fn run(&self, console: &Console, _args: &[String]) -> Result<Option<Value>> {
        let mut commands = Vec::new();
        for handler in console.handlers() {
            println!("{:<10} {}", handler.name(), handler.detail());
            commands.push(json!({ "name": handler.name(), "detail": handler.detail() }));
        }
        Ok(Some(json!({ "ok": true, "command": "help", "commands": commands })))
    }
}

struct ExitCommand;

impl CommandHandler for ExitCommand {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn detail(&self) -> &'static str {
        "Exits the console."
    }

    fn run(&self, console: &Console, _args: &[String]) -> Result<Option<Value>> {
        console.request_exit();
        Ok(None)
    }
}
