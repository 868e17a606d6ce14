use crate::context::{Context, GlobalContext};
use crate::error::CliError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Replaced with the `gs://` path of the workspace bucket before anything is launched.
pub const WORKSPACE_BUCKET_PLACEHOLDER: &str = "{workspace_bucket}";

pub const CONTAINER_PROJECT_DIR: &str = "/workspace";
pub const CONTAINER_CONTEXT_DIR: &str = "/root/.workbench";

const DOCKER_RUNTIME_FAILURE_STATUS: i32 = 125;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerOption {
    #[default]
    DockerContainer,
    LocalProcess,
}

impl RunnerOption {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerOption::DockerContainer => "docker-container",
            RunnerOption::LocalProcess => "local-process",
        }
    }
}

impl fmt::Display for RunnerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Spawns one process and waits for it, capturing both output streams.
pub trait ProcessLauncher {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// A tool command line plus where and with what extra environment it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub tokens: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Host directory exposed to the tool; mounted at `/workspace` in a container.
    pub project_dir: PathBuf,
    /// Directory the tool starts in; `project_dir` or a directory below it.
    pub working_dir: PathBuf,
}

impl ExecutionRequest {
    pub fn new(tokens: Vec<String>, project_dir: &Path) -> Self {
        Self {
            tokens,
            env: BTreeMap::new(),
            project_dir: project_dir.to_path_buf(),
            working_dir: project_dir.to_path_buf(),
        }
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = working_dir;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Local,
    Containerized { image: String, context_dir: PathBuf },
}

pub struct CommandRunner<'a> {
    strategy: Strategy,
    launcher: &'a dyn ProcessLauncher,
}

impl<'a> CommandRunner<'a> {
    pub fn new(strategy: Strategy, launcher: &'a dyn ProcessLauncher) -> Self {
        Self { strategy, launcher }
    }

    /// The strategy comes from the persisted runner option, never from the call site.
    pub fn from_context(
        global: &GlobalContext,
        context_dir: &Path,
        launcher: &'a dyn ProcessLauncher,
    ) -> Self {
        let strategy = match global.runner {
            RunnerOption::LocalProcess => Strategy::Local,
            RunnerOption::DockerContainer => Strategy::Containerized {
                image: global.docker_image.clone(),
                context_dir: context_dir.to_path_buf(),
            },
        };
        Self::new(strategy, launcher)
    }

    /// Runs the request to completion. A non-zero tool status is returned as-is;
    /// only a failure to start the tool (or its container) is an error.
    pub fn run(
        &self,
        ctx: &Context,
        request: ExecutionRequest,
    ) -> Result<CommandOutput, CliError> {
        if request.tokens.is_empty() {
            return Err(CliError::internal("refusing to run an empty command"));
        }
        let tokens = substitute_placeholders(ctx, &request.tokens)?;
        let env = merge_env(context_env(ctx), &request.env)?;

        let (program, args) = match &self.strategy {
            Strategy::Local => (tokens[0].clone(), tokens[1..].to_vec()),
            Strategy::Containerized { image, context_dir } => (
                "docker".to_string(),
                docker_run_args(image, context_dir, &request, &env, &tokens)?,
            ),
        };
        let rendered = render_command(&program, &args);
        info!(command = %rendered, cwd = %request.working_dir.display(), "launching tool");

        let output = self
            .launcher
            .launch(&program, &args, &request.working_dir, &env)
            .map_err(|err| spawn_error(&program, &rendered, err))?;
        debug!(status = output.status_code, "tool exited");

        if let Strategy::Containerized { .. } = self.strategy {
            if let Some(err) = container_runtime_failure(&output, &rendered) {
                return Err(err);
            }
        }
        if !output.success() {
            warn!(status = output.status_code, command = %rendered, "tool exited non-zero");
        }
        Ok(output)
    }
}

/// Asks the container runtime whether `image` is present locally.
pub fn image_exists(
    launcher: &dyn ProcessLauncher,
    image: &str,
    cwd: &Path,
) -> Result<bool, CliError> {
    let args = vec![
        "image".to_string(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{.Id}}".to_string(),
        image.to_string(),
    ];
    let rendered = render_command("docker", &args);
    let output = launcher
        .launch("docker", &args, cwd, &BTreeMap::new())
        .map_err(|err| spawn_error("docker", &rendered, err))?;
    Ok(output.success())
}

pub fn workspace_bucket_path(ctx: &Context) -> Result<String, CliError> {
    let ws = ctx.require_workspace()?;
    let name = ws.bucket_resource.as_deref().ok_or_else(|| {
        CliError::user(
            "this command needs the workspace bucket, but none is set; run `workbench workspace set-bucket <RESOURCE>`",
        )
    })?;
    let resource = ws.resource(name)?;
    if !resource.is_gcs_bucket() {
        return Err(CliError::user(format!(
            "workspace bucket resource '{name}' is not a GCS bucket"
        )));
    }
    Ok(resource.cloud_id())
}

pub fn substitute_placeholders(
    ctx: &Context,
    tokens: &[String],
) -> Result<Vec<String>, CliError> {
    if !tokens.iter().any(|t| t.contains(WORKSPACE_BUCKET_PLACEHOLDER)) {
        return Ok(tokens.to_vec());
    }
    let bucket = workspace_bucket_path(ctx)?;
    Ok(tokens
        .iter()
        .map(|t| t.replace(WORKSPACE_BUCKET_PLACEHOLDER, &bucket))
        .collect())
}

/// Variables every tool sees, derived from the context.
pub fn context_env(ctx: &Context) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(project) = ctx.project_id() {
        env.insert("GOOGLE_CLOUD_PROJECT".to_string(), project.to_string());
        env.insert("CLOUDSDK_CORE_PROJECT".to_string(), project.to_string());
    }
    if let Some(user) = &ctx.global.user {
        env.insert("WORKBENCH_USER_EMAIL".to_string(), user.email.clone());
        if let Some(service_account) = &user.service_account {
            env.insert(
                "GOOGLE_SERVICE_ACCOUNT_EMAIL".to_string(),
                service_account.clone(),
            );
        }
    }
    if let Some(ws) = &ctx.workspace {
        env.insert("WORKBENCH_WORKSPACE_ID".to_string(), ws.id.clone());
        for resource in ws.resources.values() {
            env.insert(resource.env_var_name(), resource.cloud_id());
        }
    }
    env
}

fn merge_env(
    mut base: BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, CliError> {
    for (key, value) in extra {
        if base.contains_key(key) {
            return Err(CliError::internal(format!(
                "environment variable {key} is already set from the workspace context"
            )));
        }
        base.insert(key.clone(), value.clone());
    }
    Ok(base)
}

fn docker_run_args(
    image: &str,
    context_dir: &Path,
    request: &ExecutionRequest,
    env: &BTreeMap<String, String>,
    tokens: &[String],
) -> Result<Vec<String>, CliError> {
    let workdir = map_host_dir_to_container(&request.working_dir, &request.project_dir)?;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--volume".to_string(),
        format!("{}:{CONTAINER_PROJECT_DIR}", request.project_dir.display()),
        "--volume".to_string(),
        format!("{}:{CONTAINER_CONTEXT_DIR}", context_dir.display()),
        "--workdir".to_string(),
        workdir,
    ];
    // Values stay in the launcher environment; docker reads them by name.
    for key in env.keys() {
        args.push("--env".to_string());
        args.push(key.clone());
    }
    args.push(image.to_string());
    args.extend(tokens.iter().cloned());
    Ok(args)
}

pub fn map_host_dir_to_container(
    host_dir: &Path,
    project_dir: &Path,
) -> Result<String, CliError> {
    let relative = host_dir.strip_prefix(project_dir).map_err(|_| {
        CliError::internal(format!(
            "working directory must be inside the mounted directory (working_dir={}, mounted={})",
            host_dir.display(),
            project_dir.display()
        ))
    })?;
    if relative.as_os_str().is_empty() {
        return Ok(CONTAINER_PROJECT_DIR.to_string());
    }
    Ok(Path::new(CONTAINER_PROJECT_DIR)
        .join(relative)
        .to_string_lossy()
        .to_string())
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn spawn_error(program: &str, rendered: &str, err: io::Error) -> CliError {
    let hint = match err.kind() {
        io::ErrorKind::NotFound if program == "docker" => {
            "\nHint: install Docker and ensure `docker` is on your PATH, or run `workbench config set runner local-process`.".to_string()
        }
        io::ErrorKind::NotFound => format!(
            "\nHint: install `{program}` locally, or run `workbench config set runner docker-container`."
        ),
        io::ErrorKind::PermissionDenied => format!("\nHint: `{program}` is not executable."),
        _ => String::new(),
    };
    CliError::internal_with(format!("failed to start `{rendered}`: {err}{hint}"), err)
}

/// Tells a container runtime failure apart from the tool's own non-zero exit.
pub fn classify_container_failure(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.");
    }
    if lower.contains("unable to find image") && lower.contains("pull access denied") {
        return Some(
            "The tools image could not be pulled. Check `workbench config set image` and your registry login.",
        );
    }
    None
}

/// Only a non-zero status whose stderr came from the docker CLI counts. A tool inside the
/// container may exit 125 itself or print daemon-like text, and keeps its own outcome.
fn container_runtime_failure(output: &CommandOutput, rendered: &str) -> Option<CliError> {
    if output.success() {
        return None;
    }
    let stderr = output.stderr_text();
    let stderr = stderr.trim();
    let hint = classify_container_failure(stderr);
    let docker_cli_error =
        output.status_code == DOCKER_RUNTIME_FAILURE_STATUS && stderr.starts_with("docker:");
    if hint.is_none() && !docker_cli_error {
        return None;
    }
    let mut message = format!(
        "container runtime failed with status {} while running `{rendered}`",
        output.status_code
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(hint) = hint {
        message = format!("{message}\nHint: {hint}");
    }
    Some(CliError::internal(message))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::{User, WorkspaceContext};
    use crate::resource::{Resource, ResourceDetails, Stewardship};
    use chrono::Utc;
    use std::cell::RefCell;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
        pub cwd: PathBuf,
        pub env_overrides: BTreeMap<String, String>,
    }

    impl RecordedCall {
        pub fn argv(&self) -> Vec<String> {
            let mut argv = vec![self.program.clone()];
            argv.extend(self.args.iter().cloned());
            argv
        }
    }

    #[derive(Default)]
    pub(crate) struct MockLauncher {
        calls: RefCell<Vec<RecordedCall>>,
        outputs: RefCell<Vec<CommandOutput>>,
    }

    impl MockLauncher {
        pub fn push_output(&self, output: CommandOutput) {
            self.outputs.borrow_mut().push(output);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }
    }

    impl ProcessLauncher for MockLauncher {
        fn launch(
            &self,
            program: &str,
            args: &[String],
            cwd: &Path,
            env_overrides: &BTreeMap<String, String>,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
                cwd: cwd.to_path_buf(),
                env_overrides: env_overrides.clone(),
            });
            let mut queued = self.outputs.borrow_mut();
            if queued.is_empty() {
                return Ok(CommandOutput {
                    status_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }
            Ok(queued.remove(0))
        }
    }

    pub(crate) fn workspace_context() -> Context {
        let mut ws = WorkspaceContext::new("ws-42", "lab-project", None);
        ws.resources.insert(
            "scratch".to_string(),
            Resource {
                name: "scratch".to_string(),
                description: None,
                stewardship: Stewardship::Controlled,
                details: ResourceDetails::GcsBucket {
                    bucket_name: "lab-scratch".to_string(),
                },
            },
        );
        ws.bucket_resource = Some("scratch".to_string());
        let mut ctx = Context {
            workspace: Some(ws),
            ..Context::default()
        };
        ctx.global.user = Some(User {
            email: "ada@example.org".to_string(),
            service_account: None,
            logged_in_at: Utc::now(),
        });
        ctx
    }

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn local_strategy_spawns_tokens_directly() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 0,
            stdout: b"gs://lab-scratch/\n".to_vec(),
            stderr: Vec::new(),
        });
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let ctx = workspace_context();
        let request =
            ExecutionRequest::new(tokens(&["gcloud", "storage", "ls"]), Path::new("/tmp/p"));

        let output = runner.run(&ctx, request).unwrap();
        assert_eq!(output.stdout_text(), "gs://lab-scratch/\n");

        let calls = launcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].argv(), tokens(&["gcloud", "storage", "ls"]));
        assert_eq!(calls[0].cwd, PathBuf::from("/tmp/p"));
        assert_eq!(
            calls[0].env_overrides.get("GOOGLE_CLOUD_PROJECT").map(String::as_str),
            Some("lab-project")
        );
        assert_eq!(
            calls[0].env_overrides.get("WORKBENCH_SCRATCH").map(String::as_str),
            Some("gs://lab-scratch")
        );
    }

    #[test]
    fn nonzero_status_is_returned_unchanged() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 3,
            stdout: Vec::new(),
            stderr: b"ERROR: (gcloud) bad flag".to_vec(),
        });
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let output = runner
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["gcloud", "--bogus"]), Path::new(".")),
            )
            .unwrap();
        assert_eq!(output.status_code, 3);
        assert_eq!(output.stderr_text(), "ERROR: (gcloud) bad flag");
    }

    #[test]
    fn placeholder_is_replaced_before_launch() {
        let launcher = MockLauncher::default();
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let ctx = workspace_context();
        let request = ExecutionRequest::new(
            tokens(&["gsutil", "cp", "out.txt", "{workspace_bucket}/results/out.txt"]),
            Path::new("."),
        );
        runner.run(&ctx, request).unwrap();

        let argv = launcher.calls()[0].argv();
        assert!(argv.iter().all(|t| !t.contains(WORKSPACE_BUCKET_PLACEHOLDER)));
        assert_eq!(argv[3], "gs://lab-scratch/results/out.txt");
    }

    #[test]
    fn placeholder_without_workspace_is_user_fixable_and_launches_nothing() {
        let launcher = MockLauncher::default();
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let request =
            ExecutionRequest::new(tokens(&["gsutil", "ls", "{workspace_bucket}"]), Path::new("."));
        let err = runner
            .run(&Context::default(), request)
            .expect_err("no workspace");
        assert!(matches!(err, CliError::UserFixable(_)));
        assert!(launcher.calls().is_empty());
    }

    #[test]
    fn spawn_failure_is_internal() {
        struct MissingBinary;
        impl ProcessLauncher for MissingBinary {
            fn launch(
                &self,
                _program: &str,
                _args: &[String],
                _cwd: &Path,
                _env_overrides: &BTreeMap<String, String>,
            ) -> Result<CommandOutput, io::Error> {
                Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
            }
        }
        let launcher = MissingBinary;
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let err = runner
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["bq", "ls"]), Path::new(".")),
            )
            .expect_err("missing binary");
        assert!(matches!(err, CliError::Internal { .. }));
        assert!(err.to_string().contains("failed to start `bq ls`"));
        assert!(err.to_string().contains("install `bq`"));
    }

    #[test]
    fn caller_env_colliding_with_context_env_is_internal() {
        let launcher = MockLauncher::default();
        let runner = CommandRunner::new(Strategy::Local, &launcher);
        let ctx = workspace_context();
        let mut request = ExecutionRequest::new(tokens(&["gcloud"]), Path::new("."));
        request
            .env
            .insert("GOOGLE_CLOUD_PROJECT".to_string(), "other".to_string());
        let err = runner.run(&ctx, request).expect_err("conflict");
        assert!(matches!(err, CliError::Internal { .. }));
        assert!(launcher.calls().is_empty());
    }

    #[test]
    fn containerized_strategy_wraps_tokens_in_docker_run() {
        let launcher = MockLauncher::default();
        let runner = CommandRunner::new(
            Strategy::Containerized {
                image: "example/tools:1".to_string(),
                context_dir: PathBuf::from("/home/ada/.workbench"),
            },
            &launcher,
        );
        let ctx = workspace_context();
        let request = ExecutionRequest::new(
            tokens(&["nextflow", "run", "main.nf"]),
            Path::new("/home/ada/proj"),
        )
        .with_working_dir(PathBuf::from("/home/ada/proj/nextflow"));
        runner.run(&ctx, request).unwrap();

        let call = &launcher.calls()[0];
        assert_eq!(call.program, "docker");
        let args = &call.args;
        assert_eq!(&args[..2], &tokens(&["run", "--rm"])[..]);
        assert!(args.contains(&"/home/ada/proj:/workspace".to_string()));
        assert!(args.contains(&"/home/ada/.workbench:/root/.workbench".to_string()));
        let workdir = args.iter().position(|a| a == "--workdir").unwrap();
        assert_eq!(args[workdir + 1], "/workspace/nextflow");
        assert!(args.windows(2).any(|w| w[0] == "--env" && w[1] == "GOOGLE_CLOUD_PROJECT"));
        let image = args.iter().position(|a| a == "example/tools:1").unwrap();
        assert_eq!(&args[image + 1..], &tokens(&["nextflow", "run", "main.nf"])[..]);
        assert_eq!(
            call.env_overrides.get("GOOGLE_CLOUD_PROJECT").map(String::as_str),
            Some("lab-project")
        );
    }

    #[test]
    fn container_runtime_failure_is_internal() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 125,
            stdout: Vec::new(),
            stderr: b"docker: Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?".to_vec(),
        });
        let runner = CommandRunner::new(
            Strategy::Containerized {
                image: "example/tools:1".to_string(),
                context_dir: PathBuf::from("/ctx"),
            },
            &launcher,
        );
        let err = runner
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["gcloud", "info"]), Path::new("/p")),
            )
            .expect_err("daemon down");
        assert!(matches!(err, CliError::Internal { .. }));
        assert!(err.to_string().contains("Docker daemon is unreachable"));
    }

    #[test]
    fn tool_failure_inside_container_passes_through() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: b"ERROR: (gcloud.storage.ls) bucket not found".to_vec(),
        });
        let runner = CommandRunner::new(
            Strategy::Containerized {
                image: "example/tools:1".to_string(),
                context_dir: PathBuf::from("/ctx"),
            },
            &launcher,
        );
        let output = runner
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["gcloud", "storage", "ls"]), Path::new("/p")),
            )
            .unwrap();
        assert_eq!(output.status_code, 1);
    }

    fn containerized(launcher: &MockLauncher) -> CommandRunner<'_> {
        CommandRunner::new(
            Strategy::Containerized {
                image: "example/tools:1".to_string(),
                context_dir: PathBuf::from("/ctx"),
            },
            launcher,
        )
    }

    #[test]
    fn successful_tool_with_daemon_like_stderr_is_not_a_runtime_failure() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 0,
            stdout: b"ok\n".to_vec(),
            stderr: b"WARNING: retrying after error during connect to storage.googleapis.com"
                .to_vec(),
        });
        let output = containerized(&launcher)
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["gsutil", "ls"]), Path::new("/p")),
            )
            .unwrap();
        assert_eq!(output.status_code, 0);
        assert_eq!(output.stdout_text(), "ok\n");
        assert!(output.stderr_text().contains("error during connect"));
    }

    #[test]
    fn tool_exit_125_without_docker_stderr_passes_through() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 125,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        let output = containerized(&launcher)
            .run(
                &Context::default(),
                ExecutionRequest::new(
                    tokens(&["git", "bisect", "run", "./t.sh"]),
                    Path::new("/p"),
                ),
            )
            .unwrap();
        assert_eq!(output.status_code, 125);
    }

    #[test]
    fn docker_cli_error_with_status_125_is_internal() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 125,
            stdout: Vec::new(),
            stderr: b"docker: invalid reference format.".to_vec(),
        });
        let err = containerized(&launcher)
            .run(
                &Context::default(),
                ExecutionRequest::new(tokens(&["gcloud", "info"]), Path::new("/p")),
            )
            .expect_err("docker cli error");
        assert!(matches!(err, CliError::Internal { .. }));
        assert!(err.to_string().contains("invalid reference format"));
    }

    #[test]
    fn service_account_is_exported_when_set() {
        let mut ctx = workspace_context();
        assert!(!context_env(&ctx).contains_key("GOOGLE_SERVICE_ACCOUNT_EMAIL"));
        if let Some(user) = ctx.global.user.as_mut() {
            user.service_account = Some("runner@lab-project.iam.gserviceaccount.com".to_string());
        }
        let env = context_env(&ctx);
        assert_eq!(
            env.get("GOOGLE_SERVICE_ACCOUNT_EMAIL").map(String::as_str),
            Some("runner@lab-project.iam.gserviceaccount.com")
        );
        assert_eq!(
            env.get("WORKBENCH_USER_EMAIL").map(String::as_str),
            Some("ada@example.org")
        );
    }

    #[test]
    fn from_context_follows_runner_option() {
        let launcher = MockLauncher::default();
        let mut global = GlobalContext::default();
        let runner = CommandRunner::from_context(&global, Path::new("/ctx"), &launcher);
        assert_eq!(
            runner.strategy,
            Strategy::Containerized {
                image: global.docker_image.clone(),
                context_dir: PathBuf::from("/ctx"),
            }
        );
        global.runner = RunnerOption::LocalProcess;
        let runner = CommandRunner::from_context(&global, Path::new("/ctx"), &launcher);
        assert_eq!(runner.strategy, Strategy::Local);
    }

    #[test]
    fn map_host_dir_to_container_maps_root_and_nested_paths() {
        let project = PathBuf::from("/tmp/project");
        assert_eq!(map_host_dir_to_container(&project, &project).unwrap(), "/workspace");
        let nested = project.join("nextflow").join("work");
        assert_eq!(
            map_host_dir_to_container(&nested, &project).unwrap(),
            "/workspace/nextflow/work"
        );
        assert!(map_host_dir_to_container(Path::new("/elsewhere"), &project).is_err());
    }

    #[test]
    fn image_exists_reports_inspect_status() {
        let launcher = MockLauncher::default();
        launcher.push_output(CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: b"Error: No such image".to_vec(),
        });
        assert!(!image_exists(&launcher, "missing:latest", Path::new(".")).unwrap());
        assert!(image_exists(&launcher, "present:latest", Path::new(".")).unwrap());
        let calls = launcher.calls();
        assert_eq!(calls[1].args.last().map(String::as_str), Some("present:latest"));
    }
}
