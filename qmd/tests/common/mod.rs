#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use codex_qmd::CommandOutput;
use codex_qmd::CommandRunner;
use codex_qmd::EngineCommand;

type Script = dyn Fn(&[String]) -> CommandOutput + Send + Sync;

/// Answers engine commands from a script and records what it was asked.
pub struct ScriptedRunner {
    script: Box<Script>,
    delay: Duration,
    calls: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(&[String]) -> CommandOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &EngineCommand) -> io::Result<CommandOutput> {
        let args = command.engine_args().to_vec();
        self.calls.lock().unwrap().push(args.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok((self.script)(&args))
    }
}
