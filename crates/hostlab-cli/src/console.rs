use anyhow::{anyhow, Result};
use hostlab_archive::{CloudStorage, Gsutil};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::ConsoleConfig;

/// Console variable holding the log bundle of the last `test --keep-result`.
pub const RESULT_ZIP_VAR: &str = "result_zip";
const TIMESTAMP_VAR: &str = "timestamp";

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn detail(&self) -> &'static str;
    /// `args` excludes the command name. `Ok(Some(_))` carries a JSON payload
    /// for callers that want structured output.
    fn run(&self, console: &Console, args: &[String]) -> Result<Option<Value>>;
}

/// State shared by every handler. Handlers may run concurrently from a
/// script's parallel groups.
pub struct ConsoleContext {
    pub config: ConsoleConfig,
    pub storage: Box<dyn CloudStorage + Send + Sync>,
    variables: Mutex<BTreeMap<String, String>>,
}

impl ConsoleContext {
    pub fn new(config: ConsoleConfig) -> Self {
        let storage = Box::new(Gsutil::new(config.gsutil.clone()));
        Self::with_storage(config, storage)
    }

    pub fn with_storage(
        config: ConsoleConfig,
        storage: Box<dyn CloudStorage + Send + Sync>,
    ) -> Self {
        Self {
            config,
            storage,
            variables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_variable(&self, name: &str, value: impl Into<String>) {
        if let Ok(mut vars) = self.variables.lock() {
            vars.insert(name.to_string(), value.into());
        }
    }

    pub fn remove_variable(&self, name: &str) {
        if let Ok(mut vars) = self.variables.lock() {
            vars.remove(name);
        }
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.variables
            .lock()
            .ok()
            .and_then(|vars| vars.get(name).cloned())
    }

    /// Replaces every `{name}` with the console variable `name`. `{{` and
    /// `}}` are literal braces; an unset variable is an error.
    pub fn format_string(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err(anyhow!("unterminated '{{' in '{}'", template)),
                        }
                    }
                    let value = if name == TIMESTAMP_VAR {
                        Some(chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string())
                    } else {
                        self.variable(&name)
                    };
                    match value {
                        Some(value) => out.push_str(&value),
                        None => {
                            return Err(anyhow!(
                                "unknown or uninitialized variable '{}' in '{}'",
                                name,
                                template
                            ))
                        }
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

pub struct Console {
    handlers: BTreeMap<&'static str, Box<dyn CommandHandler>>,
    pub context: ConsoleContext,
    exit_requested: AtomicBool,
}

impl Console {
    pub fn new(context: ConsoleContext) -> Self {
        Self::with_handlers(context, crate::commands::all_handlers())
    }

    pub fn with_handlers(context: ConsoleContext, handlers: Vec<Box<dyn CommandHandler>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.name(), h)).collect();
        Self {
            handlers,
            context,
            exit_requested: AtomicBool::new(false),
        }
    }

    pub fn handlers(&self) -> impl Iterator<Item = &dyn CommandHandler> {
        self.handlers.values().map(|h| h.as_ref())
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Splits `line` shell-style and runs it. Blank lines and `#` comments
    /// are no-ops.
    pub fn execute_line(&self, line: &str) -> Result<Option<Value>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        let args = shell_words::split(trimmed)
            .map_err(|e| anyhow!("cannot parse command line '{}': {}", trimmed, e))?;
        self.execute_args(&args)
    }

    pub fn execute_args(&self, args: &[String]) -> Result<Option<Value>> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let handler = self.handlers.get(name.as_str()).ok_or_else(|| {
            anyhow!(
                "unknown command '{}' (try 'help')",
                name
            )
        })?;
        tracing::debug!(command = %name, args = ?rest, "running console command");
        handler.run(self, rest)
    }

    /// Runs one line and reports failure instead of propagating it.
    pub fn onecmd(&self, line: &str) -> bool {
        match self.execute_line(line) {
            Ok(Some(payload)) => {
                tracing::debug!(line, payload = %payload, "command finished");
                true
            }
            Ok(None) => true,
            Err(err) => {
                tracing::error!(line, error = %format!("{:#}", err), "command failed");
                eprintln!("error: {:#}", err);
                false
            }
        }
    }
}
