use crate::context::Context;
use crate::error::CliError;
use crate::runner::{CommandOutput, CommandRunner, ExecutionRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppName {
    Gcloud,
    Gsutil,
    Bq,
    Nextflow,
    Git,
}

impl AppName {
    pub const ALL: [AppName; 5] = [
        AppName::Gcloud,
        AppName::Gsutil,
        AppName::Bq,
        AppName::Nextflow,
        AppName::Git,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppName::Gcloud => "gcloud",
            AppName::Gsutil => "gsutil",
            AppName::Bq => "bq",
            AppName::Nextflow => "nextflow",
            AppName::Git => "git",
        }
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppName {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppName::ALL
            .into_iter()
            .find(|app| app.as_str() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = AppName::ALL.iter().map(|app| app.as_str()).collect();
                CliError::user(format!(
                    "unsupported app '{s}'; supported apps: {}",
                    supported.join(", ")
                ))
            })
    }
}

/// Lifecycle of one supported tool. `project_dir` is the directory the user invoked us from.
pub trait AppHandler {
    fn binary(&self) -> &'static str;

    /// The binary followed by the user's arguments, untouched.
    fn command_line(&self, args: &[String]) -> Vec<String> {
        let mut tokens = Vec::with_capacity(args.len() + 1);
        tokens.push(self.binary().to_string());
        tokens.extend(args.iter().cloned());
        tokens
    }

    fn enable(&self, _project_dir: &Path) -> Result<(), CliError> {
        Ok(())
    }

    fn stop(&self, _project_dir: &Path) -> Result<(), CliError> {
        Ok(())
    }

    fn working_dir(&self, project_dir: &Path) -> Result<PathBuf, CliError> {
        Ok(project_dir.to_path_buf())
    }
}

struct PassthroughApp {
    binary: &'static str,
}

impl AppHandler for PassthroughApp {
    fn binary(&self) -> &'static str {
        self.binary
    }
}

struct NextflowApp;

const NEXTFLOW_DIR: &str = "nextflow";

impl AppHandler for NextflowApp {
    fn binary(&self) -> &'static str {
        "nextflow"
    }

    fn enable(&self, project_dir: &Path) -> Result<(), CliError> {
        let dir = project_dir.join(NEXTFLOW_DIR);
        fs::create_dir_all(&dir).map_err(|err| {
            CliError::internal_with(format!("failed to create {}: {err}", dir.display()), err)
        })
    }

    fn working_dir(&self, project_dir: &Path) -> Result<PathBuf, CliError> {
        let dir = project_dir.join(NEXTFLOW_DIR);
        if !dir.is_dir() {
            return Err(CliError::user(
                "Nextflow sub-directory not found. Run `workbench app enable nextflow`.",
            ));
        }
        Ok(dir)
    }
}

pub const SUPPORTED_APPS: &[(AppName, &dyn AppHandler)] = &[
    (AppName::Gcloud, &PassthroughApp { binary: "gcloud" }),
    (AppName::Gsutil, &PassthroughApp { binary: "gsutil" }),
    (AppName::Bq, &PassthroughApp { binary: "bq" }),
    (AppName::Nextflow, &NextflowApp),
    (AppName::Git, &PassthroughApp { binary: "git" }),
];

pub fn handler(app: AppName) -> Result<&'static dyn AppHandler, CliError> {
    SUPPORTED_APPS
        .iter()
        .find(|(name, _)| *name == app)
        .map(|(_, handler)| *handler)
        .ok_or_else(|| CliError::internal(format!("no handler registered for app '{app}'")))
}

/// Runs the handler's setup and records the app as enabled. Safe to repeat.
pub fn enable_app(ctx: &mut Context, app: AppName, project_dir: &Path) -> Result<(), CliError> {
    handler(app)?.enable(project_dir)?;
    ctx.global.set_app_enabled(app, true);
    info!(app = %app, "enabled app");
    Ok(())
}

pub fn stop_app(ctx: &mut Context, app: AppName, project_dir: &Path) -> Result<(), CliError> {
    handler(app)?.stop(project_dir)?;
    ctx.global.set_app_enabled(app, false);
    info!(app = %app, "stopped app");
    Ok(())
}

pub fn run_app(
    ctx: &Context,
    runner: &CommandRunner<'_>,
    app: AppName,
    args: &[String],
    project_dir: &Path,
) -> Result<CommandOutput, CliError> {
    let handler = handler(app)?;
    let working_dir = handler.working_dir(project_dir)?;
    let request = ExecutionRequest::new(handler.command_line(args), project_dir)
        .with_working_dir(working_dir);
    runner.run(ctx, request)
}
