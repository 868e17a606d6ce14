mod apps;
mod commands;
mod context;
mod cromwell;
mod error;
mod logging;
mod resource;
mod runner;

use clap::{Args, Parser, Subcommand, ValueEnum};
use context::ContextStore;
use error::{CliError, ErrorKind};
use logging::LogLevel;
use runner::{ProcessLauncher, RunnerOption, SystemLauncher};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "workbench", version, about = "Workbench CLI")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(long = "context-dir", global = true, hide = true)]
    context_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    Resource {
        #[command(subcommand)]
        command: ResourceCommand,
    },
    /// Print the cloud identifier of a workspace resource.
    Resolve {
        name: String,
    },
    App {
        #[command(subcommand)]
        command: AppCommand,
    },
    /// Same as `app run gcloud ...`.
    #[command(disable_help_flag = true)]
    Gcloud(ToolArgs),
    /// Same as `app run gsutil ...`.
    #[command(disable_help_flag = true)]
    Gsutil(ToolArgs),
    /// Same as `app run bq ...`.
    #[command(disable_help_flag = true)]
    Bq(ToolArgs),
    /// Same as `app run nextflow ...`.
    #[command(disable_help_flag = true)]
    Nextflow(ToolArgs),
    /// Same as `app run git ...`.
    #[command(disable_help_flag = true)]
    Git(ToolArgs),
    Cromwell {
        #[command(subcommand)]
        command: CromwellCommand,
    },
    Status,
}

#[derive(Args, Debug)]
struct ToolArgs {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    Login {
        #[arg(long)]
        email: String,
        /// Identity that runs workloads on the user's behalf.
        #[arg(long)]
        service_account: Option<String>,
    },
    Logout,
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    List,
    Get {
        #[arg(value_enum)]
        key: ConfigKey,
    },
    Set {
        #[command(subcommand)]
        command: ConfigSetCommand,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigKey {
    Runner,
    Image,
    Project,
    LogLevel,
}

#[derive(Subcommand, Debug)]
enum ConfigSetCommand {
    /// Where tool commands execute.
    Runner {
        #[arg(value_enum)]
        value: RunnerOption,
    },
    /// Container image used by the docker-container runner.
    Image { image: String },
    /// Project used when no workspace is active.
    Project { project_id: String },
    LogLevel {
        #[arg(value_enum)]
        level: LogLevel,
    },
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    Set {
        #[arg(long)]
        id: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        name: Option<String>,
    },
    Describe,
    Clear,
    /// Use a GCS bucket resource for `{workspace_bucket}` substitution.
    SetBucket { resource: String },
}

#[derive(Subcommand, Debug)]
enum ResourceCommand {
    List,
    Describe {
        name: String,
    },
    /// Reference an existing cloud resource.
    AddRef {
        #[command(subcommand)]
        command: AddRefCommand,
    },
    Remove {
        name: String,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Add references from a JSON file written by `workbench --json resource list`.
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum AddRefCommand {
    GcsBucket {
        #[arg(long)]
        name: String,
        #[arg(long)]
        bucket_name: String,
        #[arg(long)]
        description: Option<String>,
    },
    BqDataset {
        #[arg(long)]
        name: String,
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        dataset_id: String,
        #[arg(long)]
        description: Option<String>,
    },
    GitRepo {
        #[arg(long)]
        name: String,
        #[arg(long)]
        repo_url: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AppCommand {
    List,
    Enable {
        name: String,
    },
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Stop {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum CromwellCommand {
    /// Write cromwell.conf for the active workspace.
    GenerateConfig {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        bucket: BucketArgs,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct BucketArgs {
    /// GCS bucket resource in the active workspace.
    #[arg(long)]
    workspace_bucket_name: Option<String>,
    /// Any GCS bucket, e.g. gs://bucket-name.
    #[arg(long)]
    google_bucket_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
}

/// Per-invocation state shared by every command handler.
struct Session<'a> {
    store: ContextStore,
    json: bool,
    project_dir: PathBuf,
    launcher: &'a dyn ProcessLauncher,
}

fn main() {
    let cli = Cli::parse();
    let store = ContextStore::resolve(cli.context_dir.as_ref());
    let loaded = store.load();
    let level = loaded
        .as_ref()
        .map(|ctx| ctx.global.log_level)
        .unwrap_or_default();
    let log_path = logging::init(store.dir(), level);
    let json = cli.json;
    let launcher = SystemLauncher;

    let result = env::current_dir()
        .map_err(|err| {
            CliError::internal_with(format!("failed to read current directory: {err}"), err)
        })
        .and_then(|project_dir| {
            let session = Session {
                store,
                json,
                project_dir,
                launcher: &launcher,
            };
            let ctx = loaded?;
            info!(command = ?cli.command, "running command");
            commands::dispatch(&session, ctx, cli.command)
        });

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            report_error(json, &log_path, &err);
            std::process::exit(err.exit_code());
        }
    }
}

fn report_error(json: bool, log_path: &Path, err: &CliError) {
    match err.kind() {
        ErrorKind::UserFixable => info!(error = %err, "command failed"),
        ErrorKind::Internal => error!(causes = ?err.cause_chain(), "command failed"),
    }
    if json {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        };
        if print_json(&payload).is_ok() {
            return;
        }
    }
    match err.kind() {
        ErrorKind::UserFixable => eprintln!("{err}"),
        ErrorKind::Internal => {
            eprintln!("[ERROR] {err}");
            eprintln!("See {} for more information.", log_path.display());
        }
    }
}

fn output(session: &Session, payload: serde_json::Value, text: &str) -> Result<(), CliError> {
    if session.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_kind: None,
        };
        print_json(&wrapper)?;
    } else if !text.is_empty() {
        println!("{}", text.trim_end());
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
