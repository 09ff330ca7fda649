use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use codex_qmd::QmdConfig;
use codex_qmd::QmdService;
use codex_qmd::SidecarOptions;
use codex_qmd::WorkspaceWatcher;
use codex_qmd::run_sidecar;
use codex_qmd::sidecar::DEFAULT_DRAIN_TIMEOUT;
use codex_qmd::sidecar::DEFAULT_LISTEN_ADDR;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Markdown workspace search backed by the qmd engine.
#[derive(Debug, Parser)]
#[command(name = "codex-qmd", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE", env = "CODEX_QMD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one subdirectory per workspace
    #[arg(long, global = true, value_name = "DIR")]
    pub workspace_root: Option<PathBuf>,

    /// qmd executable to run
    #[arg(long, global = true, value_name = "PATH")]
    pub binary: Option<String>,

    /// Forward engine commands to a running sidecar
    #[arg(long, global = true, value_name = "URL")]
    pub sidecar_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search a workspace and print JSON results
    Search(SearchArgs),

    /// Print a markdown file or engine document
    Open(OpenArgs),

    /// Register, update and embed a workspace
    Index(WorkspaceArgs),

    /// Print the index status of a workspace
    Status(WorkspaceArgs),

    /// Serve engine commands over HTTP
    Sidecar(SidecarArgs),

    /// Re-index workspaces as their markdown files change
    Watch,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    #[arg(value_name = "WORKSPACE")]
    pub workspace: String,

    #[arg(value_name = "QUERY")]
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Parser)]
pub struct OpenArgs {
    #[arg(value_name = "WORKSPACE")]
    pub workspace: String,

    /// Relative markdown path or `#docid`
    #[arg(value_name = "TARGET")]
    pub target: String,
}

#[derive(Debug, Parser)]
pub struct WorkspaceArgs {
    #[arg(value_name = "WORKSPACE")]
    pub workspace: String,
}

#[derive(Debug, Parser)]
pub struct SidecarArgs {
    /// Address to listen on
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Seconds to let in-flight requests finish on shutdown
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_DRAIN_TIMEOUT.as_secs())]
    pub drain_timeout_secs: u64,
}

impl Cli {
    /// Layers defaults, the config file, `CODEX_QMD_*` variables and flags.
    pub fn load_config(&self) -> Result<QmdConfig> {
        let config = match &self.config {
            Some(path) => QmdConfig::from_toml_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => QmdConfig::default(),
        };
        let mut config = config.apply_env()?;
        if let Some(root) = &self.workspace_root {
            config.workspace_root = root.clone();
        }
        if let Some(binary) = &self.binary {
            config.binary = binary.clone();
        }
        if let Some(url) = &self.sidecar_url {
            config.sidecar_url = Some(url.clone());
        }
        Ok(config.normalized())
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Search(args) => {
                let service = QmdService::new(config)?;
                let results = service
                    .search(&args.workspace, &args.query, args.limit.unwrap_or_default())
                    .await;
                service.close();
                let results = results?;
                if results.is_empty() {
                    info!(workspace_id = %args.workspace, "{}", empty_search_hint(&args.workspace));
                }
                print_json(&results)
            }
            Command::Open(args) => {
                let service = QmdService::new(config)?;
                let opened = service.open_markdown(&args.workspace, &args.target).await;
                service.close();
                print_json(&opened?)
            }
            Command::Index(args) => {
                let service = QmdService::new(config)?;
                let indexed = service.index_workspace(&args.workspace).await;
                service.close();
                indexed?;
                info!(workspace_id = %args.workspace, "qmd index complete");
                Ok(())
            }
            Command::Status(args) => {
                let service = QmdService::new(config)?;
                let status = service.status(&args.workspace).await;
                service.close();
                print_json(&status?)
            }
            Command::Sidecar(args) => {
                let options = SidecarOptions {
                    listen: args.listen,
                    drain_timeout: Duration::from_secs(args.drain_timeout_secs),
                };
                run_sidecar(config, options, shutdown).await?;
                Ok(())
            }
            Command::Watch => {
                let service = QmdService::new(config)?;
                let watcher = WorkspaceWatcher::start(service.clone())
                    .context("failed to watch workspace root")?;
                shutdown.cancelled().await;
                drop(watcher);
                service.close();
                Ok(())
            }
        }
    }
}

/// An empty result list usually means the workspace was never indexed.
fn empty_search_hint(workspace: &str) -> String {
    format!("no results; run `codex-qmd index {workspace}` if the workspace has not been indexed yet")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmd.toml");
        std::fs::write(
            &path,
            "workspace_root = \"/srv/from-file\"\nbinary = \"qmd-file\"\nsearch_limit = 9\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "codex-qmd",
            "--config",
            path.to_str().unwrap(),
            "--binary",
            "/opt/qmd",
            "status",
            "team-a",
        ]);
        let config = cli.load_config().unwrap();

        assert_eq!(config.workspace_root, PathBuf::from("/srv/from-file"));
        assert_eq!(config.binary, "/opt/qmd");
        assert_eq!(config.search_limit, 9);
    }

    #[test]
    fn empty_search_hint_names_the_index_command() {
        assert_eq!(
            empty_search_hint("team-a"),
            "no results; run `codex-qmd index team-a` if the workspace has not been indexed yet"
        );
    }

    #[test]
    fn sidecar_defaults() {
        let cli = Cli::parse_from(["codex-qmd", "sidecar"]);
        match cli.command {
            Command::Sidecar(args) => {
                assert_eq!(args.listen, DEFAULT_LISTEN_ADDR.parse::<SocketAddr>().unwrap());
                assert_eq!(args.drain_timeout_secs, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from([
            "codex-qmd",
            "search",
            "team-a",
            "launch plan",
            "-n",
            "3",
            "--sidecar-url",
            "http://127.0.0.1:9000/",
        ]);
        assert_eq!(cli.sidecar_url.as_deref(), Some("http://127.0.0.1:9000/"));
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "launch plan");
                assert_eq!(args.limit, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
