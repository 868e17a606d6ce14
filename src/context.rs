use crate::apps::AppName;
use crate::error::CliError;
use crate::logging::LogLevel;
use crate::resource::Resource;
use crate::runner::RunnerOption;
use chrono::{DateTime, Utc};
use dirs::home_dir;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const CONTEXT_DIR_ENV: &str = "WORKBENCH_CONTEXT_DIR";
pub const CONTEXT_VERSION: u32 = 1;
pub const DEFAULT_DOCKER_IMAGE: &str = "ghcr.io/workbench/workbench-tools:stable";

const GLOBAL_CONTEXT_FILE: &str = "global-context.yaml";
const WORKSPACE_CONTEXT_FILE: &str = "workspace-context.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub service_account: Option<String>,
    pub logged_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GlobalContext {
    pub version: u32,
    pub user: Option<User>,
    pub default_project: Option<String>,
    pub runner: RunnerOption,
    pub docker_image: String,
    pub apps: BTreeMap<AppName, AppSettings>,
    pub log_level: LogLevel,
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self {
            version: CONTEXT_VERSION,
            user: None,
            default_project: None,
            runner: RunnerOption::default(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            apps: BTreeMap::new(),
            log_level: LogLevel::default(),
        }
    }
}

impl GlobalContext {
    pub fn app_enabled(&self, app: AppName) -> bool {
        self.apps.get(&app).is_some_and(|settings| settings.enabled)
    }

    pub fn set_app_enabled(&mut self, app: AppName, enabled: bool) {
        self.apps.entry(app).or_default().enabled = enabled;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceContext {
    pub version: u32,
    pub id: String,
    pub name: Option<String>,
    pub project_id: String,
    /// Name of the bucket resource that backs the workspace-bucket placeholder.
    pub bucket_resource: Option<String>,
    pub resources: BTreeMap<String, Resource>,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkspaceContext {
    fn default() -> Self {
        Self {
            version: CONTEXT_VERSION,
            id: String::new(),
            name: None,
            project_id: String::new(),
            bucket_resource: None,
            resources: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl WorkspaceContext {
    pub fn new(id: &str, project_id: &str, name: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            name,
            ..Self::default()
        }
    }

    pub fn resource(&self, name: &str) -> Result<&Resource, CliError> {
        self.resources.get(name).ok_or_else(|| {
            CliError::user(format!(
                "resource '{name}' not found in workspace '{}'; run `workbench resource list`",
                self.id
            ))
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Everything a command knows about the user and the active workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub global: GlobalContext,
    pub workspace: Option<WorkspaceContext>,
}

impl Context {
    pub fn require_workspace(&self) -> Result<&WorkspaceContext, CliError> {
        self.workspace.as_ref().ok_or_else(no_workspace_error)
    }

    pub fn require_workspace_mut(&mut self) -> Result<&mut WorkspaceContext, CliError> {
        self.workspace.as_mut().ok_or_else(no_workspace_error)
    }

    pub fn require_user(&self) -> Result<&User, CliError> {
        self.global.user.as_ref().ok_or_else(|| {
            CliError::user("login required; run `workbench auth login --email <EMAIL>`")
        })
    }

    /// The workspace project when a workspace is active, otherwise the configured default.
    pub fn project_id(&self) -> Option<&str> {
        match &self.workspace {
            Some(ws) if !ws.project_id.is_empty() => Some(ws.project_id.as_str()),
            _ => self.global.default_project.as_deref(),
        }
    }
}

fn no_workspace_error() -> CliError {
    CliError::user(
        "no active workspace; run `workbench workspace set --id <ID> --project <PROJECT>` first",
    )
}

#[derive(Debug, Clone)]
pub struct ContextStore {
    dir: PathBuf,
}

impl ContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Flag, then `WORKBENCH_CONTEXT_DIR`, then `~/.workbench`.
    pub fn resolve(override_dir: Option<&PathBuf>) -> Self {
        if let Some(dir) = override_dir {
            return Self::new(dir.clone());
        }
        if let Ok(dir) = env::var(CONTEXT_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Self::new(dir);
            }
        }
        let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
        base.push(".workbench");
        Self::new(base)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn global_path(&self) -> PathBuf {
        self.dir.join(GLOBAL_CONTEXT_FILE)
    }

    pub fn workspace_path(&self) -> PathBuf {
        self.dir.join(WORKSPACE_CONTEXT_FILE)
    }

    pub fn load(&self) -> Result<Context, CliError> {
        let global = read_record::<GlobalContext>(&self.global_path())?.unwrap_or_default();
        check_version(global.version, &self.global_path())?;
        let workspace = read_record::<WorkspaceContext>(&self.workspace_path())?;
        if let Some(ws) = &workspace {
            check_version(ws.version, &self.workspace_path())?;
        }
        debug!(
            dir = %self.dir.display(),
            workspace = workspace.as_ref().map(|ws| ws.id.as_str()).unwrap_or("none"),
            "loaded context"
        );
        Ok(Context { global, workspace })
    }

    pub fn save(&self, ctx: &Context) -> Result<(), CliError> {
        write_record(&self.global_path(), &ctx.global)?;
        match &ctx.workspace {
            Some(ws) => write_record(&self.workspace_path(), ws)?,
            None => match fs::remove_file(self.workspace_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CliError::internal_with(
                        format!(
                            "failed to remove {}: {err}",
                            self.workspace_path().display()
                        ),
                        err,
                    ))
                }
            },
        }
        debug!(dir = %self.dir.display(), "saved context");
        Ok(())
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CliError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(CliError::internal_with(
                format!("failed to read {}: {err}", path.display()),
                err,
            ))
        }
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&text).map(Some).map_err(|err| {
        CliError::internal_with(
            format!("failed to parse {}: {err}", path.display()),
            err,
        )
    })
}

fn check_version(version: u32, path: &Path) -> Result<(), CliError> {
    if version > CONTEXT_VERSION {
        return Err(CliError::internal(format!(
            "unsupported value {version} for field `version` in {} (this build reads up to {CONTEXT_VERSION})",
            path.display()
        )));
    }
    Ok(())
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), CliError> {
    let text = serde_yaml::to_string(value)?;
    write_atomic_text_file(path, &text).map_err(|err| match err {
        CliError::Internal { source, .. } => CliError::Internal {
            message: format!("failed to write {}", path.display()),
            source,
        },
        other => other,
    })
}

pub fn ensure_parent(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes a sibling temp file and renames it over `path`.
pub fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), CliError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "workbench".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
