use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;

use crate::runner::CommandOutput;
use crate::runner::CommandRunner;
use crate::runner::EngineCommand;

/// What a scripted response sees about the call it answers.
pub(crate) struct FakeCall {
    /// Engine arguments without the `--index` prefix.
    pub args: Vec<String>,
    /// 1-based count of calls with these exact arguments.
    pub attempt: usize,
}

type Script = dyn Fn(&FakeCall) -> CommandOutput + Send + Sync;

/// Records every command and answers from a script instead of spawning.
pub(crate) struct FakeRunner {
    script: Box<Script>,
    delay: Duration,
    /// Subcommand that sleeps for the given time instead of `delay`.
    stall: Option<(String, Duration)>,
    unavailable: bool,
    calls: Mutex<Vec<EngineCommand>>,
    attempts: Mutex<HashMap<Vec<String>, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRunner {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&FakeCall) -> CommandOutput + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, script)
    }

    pub fn with_delay<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(&FakeCall) -> CommandOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            stall: None,
            unavailable: false,
            calls: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Makes calls to `subcommand` hang for `delay` instead of the base delay.
    pub fn stalling(mut self: Arc<Self>, subcommand: &str, delay: Duration) -> Arc<Self> {
        if let Some(inner) = Arc::get_mut(&mut self) {
            inner.stall = Some((subcommand.to_string(), delay));
        }
        self
    }

    /// Behaves like a missing executable.
    pub fn unavailable() -> Arc<Self> {
        let mut runner = Self::with_delay(Duration::ZERO, |_| CommandOutput::success(""));
        if let Some(inner) = Arc::get_mut(&mut runner) {
            inner.unavailable = true;
        }
        runner
    }

    pub fn calls(&self) -> Vec<EngineCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Engine arguments of every call, in order.
    pub fn engine_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .iter()
            .map(|command| command.engine_args().to_vec())
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.engine_calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &EngineCommand) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.clone());
        if self.unavailable {
            return Err(io::Error::new(io::ErrorKind::NotFound, "program not found"));
        }
        let args = command.engine_args().to_vec();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(args.clone()).or_default();
            *count += 1;
            *count
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = match &self.stall {
            Some((subcommand, stall)) if args.first() == Some(subcommand) => *stall,
            _ => self.delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok((self.script)(&FakeCall { args, attempt }))
    }
}
