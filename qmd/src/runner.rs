use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// One fully-specified engine subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, OsString)>,
}

impl EngineCommand {
    /// Shell-quoted command line for error messages and logs.
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).unwrap_or_else(|_| {
            std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Engine arguments without the leading `--index <name>` prefix.
    pub fn engine_args(&self) -> &[String] {
        match self.args.first().map(String::as_str) {
            Some("--index") if self.args.len() >= 2 => &self.args[2..],
            _ => &self.args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    /// stdout followed by stderr.
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            signal: None,
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<Vec<u8>>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            signal: None,
            output: output.into(),
        }
    }

    pub fn killed(signal: i32, output: impl Into<Vec<u8>>) -> Self {
        Self {
            success: false,
            exit_code: None,
            signal: Some(signal),
            output: output.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn exit_reason(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit status: {code}"),
            (None, Some(signal)) => format!("killed by signal {}", signal_name(signal)),
            (None, None) => "killed by signal".to_string(),
        }
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => other.to_string(),
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Runs engine subprocesses. Spawn failures are returned as `Err`; a
/// process that ran and failed is `Ok` with `success == false`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &EngineCommand) -> io::Result<CommandOutput>;
}

/// Spawns real processes. Dropping the returned future kills the child.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &EngineCommand) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        let output = cmd.output().await?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            signal: exit_signal(&output.status),
            output: combined,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sh(script: &str, cwd: PathBuf) -> EngineCommand {
        EngineCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd,
            env: vec![("QMD_TEST_VALUE".to_string(), OsString::from("from-env"))],
        }
    }

    #[tokio::test]
    async fn captures_stdout_then_stderr_and_exit_code() {
        let dir = tempdir().unwrap();
        let command = sh("echo out; echo err >&2; echo $QMD_TEST_VALUE; exit 3", dir.path().to_path_buf());
        let output = ProcessRunner.run(&command).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.text(), "out\nfrom-env\nerr\n");
    }

    #[tokio::test]
    async fn signal_exit_names_the_signal() {
        let dir = tempdir().unwrap();
        let command = sh("echo Expanding query; kill -KILL $$", dir.path().to_path_buf());
        let output = ProcessRunner.run(&command).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, None);
        assert_eq!(output.signal, Some(9));
        assert_eq!(output.exit_reason(), "killed by signal SIGKILL");
        assert_eq!(output.text(), "Expanding query\n");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempdir().unwrap();
        let command = EngineCommand {
            program: "definitely-not-a-real-qmd-binary".to_string(),
            args: Vec::new(),
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        let err = ProcessRunner.run(&command).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dropping_the_future_kills_the_child() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("finished");
        let command = sh("sleep 1; touch finished", dir.path().to_path_buf());
        let result = tokio::time::timeout(Duration::from_millis(100), ProcessRunner.run(&command)).await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn display_quotes_arguments() {
        let command = EngineCommand {
            program: "qmd".to_string(),
            args: vec!["--index".to_string(), "agent".to_string(), "query".to_string(), "two words".to_string()],
            cwd: PathBuf::from("/tmp"),
            env: Vec::new(),
        };
        assert_eq!(command.display(), "qmd --index agent query 'two words'");
        assert_eq!(command.engine_args(), ["query".to_string(), "two words".to_string()]);
    }
}
