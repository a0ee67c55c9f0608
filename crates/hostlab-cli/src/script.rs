use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{mpsc, Mutex};
use std::thread;

use crate::console::Console;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Command(String),
    Parallel(Vec<CommandGroup>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandGroup {
    Single(String),
    Sequence(Vec<String>),
}

impl CommandGroup {
    fn lines(&self) -> &[String] {
        match self {
            CommandGroup::Single(line) => std::slice::from_ref(line),
            CommandGroup::Sequence(lines) => lines,
        }
    }
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptStep>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse script {}", path.display()))
}

#[derive(Debug, Clone, Copy)]
pub struct TaskPool {
    workers: usize,
}

impl TaskPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("task pool requires workers > 0"));
        }
        Ok(Self { workers })
    }

    /// Applies `task` to every item and returns the results in input order.
    pub fn run<T, R, F>(&self, items: Vec<T>, task: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let count = items.len();
        if count == 0 {
            return Vec::new();
        }
        let queue = Mutex::new(items.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..self.workers.min(count) {
                let tx = tx.clone();
                let queue = &queue;
                let task = &task;
                scope.spawn(move || loop {
                    let next = match queue.lock() {
                        Ok(mut pending) => pending.pop_front(),
                        Err(_) => None,
                    };
                    let Some((index, item)) = next else {
                        break;
                    };
                    if tx.send((index, task(item))).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<R>> = (0..count).map(|_| None).collect();
        for (index, result) in rx {
            slots[index] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }
}

/// Runs `steps` in order and returns how many commands failed. A group stops
/// at its first failing command; `exit` ends the script once its step is done.
pub fn run_script(console: &Console, steps: &[ScriptStep], pool: &TaskPool) -> usize {
    let mut failures = 0;
    for (index, step) in steps.iter().enumerate() {
        match step {
            ScriptStep::Command(line) => {
                if !console.onecmd(line) {
                    failures += 1;
                }
            }
            ScriptStep::Parallel(groups) => {
                tracing::info!(step = index, groups = groups.len(), "running command groups");
                let results = pool.run(groups.iter().collect(), |group| run_group(console, group));
                failures += results.into_iter().sum::<usize>();
            }
        }
        if console.exit_requested() {
            tracing::info!(step = index, "exit requested; skipping remaining script steps");
            break;
        }
    }
    failures
}

fn run_group(console: &Console, group: &CommandGroup) -> usize {
    for line in group.lines() {
        if !console.onecmd(line) {
            return 1;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::console::{CommandHandler, ConsoleContext};
    use hostlab_core::ScratchDir;
    use serde_json::Value;
    use std::sync::Arc;

    struct Record(Arc<Mutex<Vec<String>>>);

    impl CommandHandler for Record {
        fn name(&self) -> &'static str {
            "record"
        }
        fn detail(&self) -> &'static str {
            "Records its arguments."
        }
        fn run(&self, _console: &Console, args: &[String]) -> Result<Option<Value>> {
            self.0.lock().expect("log lock").push(args.join(" "));
            Ok(None)
        }
    }

    struct Fail;

    impl CommandHandler for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }
        fn detail(&self) -> &'static str {
            "Always fails."
        }
        fn run(&self, _console: &Console, _args: &[String]) -> Result<Option<Value>> {
            Err(anyhow!("failing on purpose"))
        }
    }

    struct Exit;

    impl CommandHandler for Exit {
        fn name(&self) -> &'static str {
            "exit"
        }
        fn detail(&self) -> &'static str {
            "Stops the script."
        }
        fn run(&self, console: &Console, _args: &[String]) -> Result<Option<Value>> {
            console.request_exit();
            Ok(None)
        }
    }

    fn console() -> (Console, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let console = Console::with_handlers(
            ConsoleContext::new(ConsoleConfig::default()),
            vec![Box::new(Record(log.clone())), Box::new(Fail), Box::new(Exit)],
        );
        (console, log)
    }

    fn parse(yaml: &str) -> Vec<ScriptStep> {
        serde_yaml::from_str(yaml).expect("script yaml")
    }

    #[test]
    fn steps_and_groups_deserialize_untagged() {
        let steps = parse("- record setup\n- - record a\n  - [record b1, record b2]\n");
        assert_eq!(
            steps,
            vec![
                ScriptStep::Command("record setup".to_string()),
                ScriptStep::Parallel(vec![
                    CommandGroup::Single("record a".to_string()),
                    CommandGroup::Sequence(vec!["record b1".to_string(), "record b2".to_string()]),
                ]),
            ]
        );
    }

    #[test]
    fn groups_run_in_parallel_and_sequences_keep_their_order() {
        let (console, log) = console();
        let steps = parse(
            "- record setup\n- - record a\n  - [record b1, record b2]\n- exit\n- record never\n",
        );
        let failures = run_script(&console, &steps, &TaskPool::new(2).expect("pool"));
        assert_eq!(failures, 0);

        let log = log.lock().expect("log lock").clone();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "setup");
        let b1 = log.iter().position(|l| l == "b1").expect("b1 ran");
        let b2 = log.iter().position(|l| l == "b2").expect("b2 ran");
        assert!(b1 < b2);
        assert!(log.iter().any(|l| l == "a"));
        assert!(!log.iter().any(|l| l == "never"));
    }

    #[test]
    fn a_failing_command_stops_only_its_group() {
        let (console, log) = console();
        let steps = parse("- - [fail now, record after]\n  - record other\n- record next\n");
        let failures = run_script(&console, &steps, &TaskPool::new(4).expect("pool"));
        assert_eq!(failures, 1);
        let log = log.lock().expect("log lock").clone();
        assert!(!log.iter().any(|l| l == "after"));
        assert!(log.iter().any(|l| l == "other"));
        assert_eq!(log.last().map(String::as_str), Some("next"));
    }

    #[test]
    fn task_pool_returns_results_in_input_order() {
        let pool = TaskPool::new(3).expect("pool");
        let squares = pool.run((1..=10u64).collect(), |n| n * n);
        assert_eq!(squares, vec![1, 4, 9, 16, 25, 36, 49, 64, 81, 100]);
        assert!(pool.run(Vec::<u64>::new(), |n| n).is_empty());
        assert!(TaskPool::new(0).is_err());
    }

    #[test]
    fn load_script_reads_yaml_files() {
        let scratch = ScratchDir::new("script").expect("scratch");
        let path = scratch.path().join("nightly.yaml");
        fs::write(&path, "- record one\n").expect("script");
        assert_eq!(load_script(&path).expect("load").len(), 1);

        fs::write(&path, "").expect("script");
        assert!(load_script(&path).expect("empty").is_empty());

        fs::write(&path, "retry: vts\n").expect("script");
        assert!(load_script(&path).is_err());
    }
}
