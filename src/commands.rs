use crate::apps::{enable_app, run_app, stop_app, AppName, SUPPORTED_APPS};
use crate::context::{Context, User, WorkspaceContext};
use crate::cromwell::{generate_config, ExecutionBucket};
use crate::error::CliError;
use crate::logging::log_file_path;
use crate::resource::{
    validate_details, validate_name, Resource, ResourceDetails, Stewardship, UfResource,
};
use crate::runner::{image_exists, CommandOutput, CommandRunner, RunnerOption};
use crate::{
    output, AddRefCommand, AppCommand, AuthCommand, BucketArgs, Commands, ConfigCommand,
    ConfigKey, ConfigSetCommand, CromwellCommand, ResourceCommand, Session, WorkspaceCommand,
};
use chrono::Utc;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde_json::json;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Runs one command and returns the process exit code.
pub(crate) fn dispatch(
    session: &Session,
    ctx: Context,
    command: Commands,
) -> Result<i32, CliError> {
    match command {
        Commands::Auth { command } => handle_auth(session, ctx, command).map(|()| 0),
        Commands::Config { command } => handle_config(session, ctx, command).map(|()| 0),
        Commands::Workspace { command } => handle_workspace(session, ctx, command).map(|()| 0),
        Commands::Resource { command } => handle_resource(session, ctx, command).map(|()| 0),
        Commands::Resolve { name } => handle_resolve(session, &ctx, &name).map(|()| 0),
        Commands::App { command } => handle_app(session, ctx, command),
        Commands::Gcloud(tool) => run_tool(session, &ctx, AppName::Gcloud, &tool.args),
        Commands::Gsutil(tool) => run_tool(session, &ctx, AppName::Gsutil, &tool.args),
        Commands::Bq(tool) => run_tool(session, &ctx, AppName::Bq, &tool.args),
        Commands::Nextflow(tool) => run_tool(session, &ctx, AppName::Nextflow, &tool.args),
        Commands::Git(tool) => run_tool(session, &ctx, AppName::Git, &tool.args),
        Commands::Cromwell { command } => handle_cromwell(session, &ctx, command).map(|()| 0),
        Commands::Status => handle_status(session, &ctx).map(|()| 0),
    }
}

fn handle_auth(
    session: &Session,
    mut ctx: Context,
    command: AuthCommand,
) -> Result<(), CliError> {
    match command {
        AuthCommand::Login {
            email,
            service_account,
        } => {
            validate_email(&email)?;
            if let Some(sa) = &service_account {
                validate_email(sa)?;
            }
            ctx.global.user = Some(User {
                email: email.clone(),
                service_account: service_account.clone(),
                logged_in_at: Utc::now(),
            });
            session.store.save(&ctx)?;
            info!(email = %email, "logged in");
            output(
                session,
                json!({ "email": email, "service_account": service_account }),
                &format!("Logged in as {email}."),
            )
        }
        AuthCommand::Logout => {
            ctx.global.user = None;
            session.store.save(&ctx)?;
            output(session, json!({ "logged_in": false }), "Logged out.")
        }
        AuthCommand::Status => match &ctx.global.user {
            Some(user) => output(
                session,
                json!({
                    "logged_in": true,
                    "email": user.email,
                    "service_account": user.service_account,
                    "logged_in_at": user.logged_in_at,
                }),
                &format!("Logged in as {}.", user.email),
            ),
            None => output(session, json!({ "logged_in": false }), "Not logged in."),
        },
    }
}

fn validate_email(email: &str) -> Result<(), CliError> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
        && !email.chars().any(char::is_whitespace);
    if !valid {
        return Err(CliError::user(format!("invalid email address '{email}'")));
    }
    Ok(())
}

fn handle_config(
    session: &Session,
    mut ctx: Context,
    command: ConfigCommand,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::List => {
            let global = &ctx.global;
            let text = format!(
                "runner: {}\nimage: {}\nproject: {}\nlog-level: {}\ncontext-dir: {}",
                global.runner,
                global.docker_image,
                global.default_project.as_deref().unwrap_or(""),
                global.log_level,
                session.store.dir().display()
            );
            output(
                session,
                json!({
                    "runner": global.runner,
                    "image": global.docker_image,
                    "project": global.default_project,
                    "log_level": global.log_level,
                    "context_dir": session.store.dir(),
                }),
                &text,
            )
        }
        ConfigCommand::Get { key } => {
            let value = match key {
                ConfigKey::Runner => Some(ctx.global.runner.to_string()),
                ConfigKey::Image => Some(ctx.global.docker_image.clone()),
                ConfigKey::Project => ctx.global.default_project.clone(),
                ConfigKey::LogLevel => Some(ctx.global.log_level.to_string()),
            };
            let text = value.clone().unwrap_or_default();
            output(session, json!(value), &text)
        }
        ConfigCommand::Set { command } => {
            let text = match command {
                ConfigSetCommand::Runner { value } => {
                    ctx.global.runner = value;
                    format!("Runner set to {value}.")
                }
                ConfigSetCommand::Image { image } => {
                    let image = image.trim().to_string();
                    if image.is_empty() {
                        return Err(CliError::user("image reference must not be empty"));
                    }
                    if ctx.global.runner == RunnerOption::DockerContainer {
                        warn_if_image_missing(session, &image);
                    }
                    ctx.global.docker_image = image.clone();
                    format!("Image set to {image}.")
                }
                ConfigSetCommand::Project { project_id } => {
                    if project_id.trim().is_empty() {
                        return Err(CliError::user("project id must not be empty"));
                    }
                    ctx.global.default_project = Some(project_id.clone());
                    format!("Default project set to {project_id}.")
                }
                ConfigSetCommand::LogLevel { level } => {
                    ctx.global.log_level = level;
                    format!("Log level set to {level}.")
                }
            };
            session.store.save(&ctx)?;
            output(
                session,
                json!({
                    "runner": ctx.global.runner,
                    "image": ctx.global.docker_image,
                    "project": ctx.global.default_project,
                    "log_level": ctx.global.log_level,
                }),
                &text,
            )
        }
    }
}

fn warn_if_image_missing(session: &Session, image: &str) {
    match image_exists(session.launcher, image, &session.project_dir) {
        Ok(true) => {}
        Ok(false) => {
            warn!(image = %image, "image not present locally");
            if !session.json {
                eprintln!(
                    "Warning: image {image} is not present locally; docker will try to pull it on first use."
                );
            }
        }
        Err(err) => {
            warn!(image = %image, error = %err, "could not check image");
            if !session.json {
                eprintln!("Warning: could not check image {image}: {err}");
            }
        }
    }
}

fn handle_workspace(
    session: &Session,
    mut ctx: Context,
    command: WorkspaceCommand,
) -> Result<(), CliError> {
    match command {
        WorkspaceCommand::Set { id, project, name } => {
            if id.trim().is_empty() || project.trim().is_empty() {
                return Err(CliError::user("--id and --project must not be empty"));
            }
            let ws = match ctx.workspace.take() {
                Some(mut ws) if ws.id == id => {
                    ws.project_id = project.clone();
                    if name.is_some() {
                        ws.name = name;
                    }
                    ws.touch();
                    ws
                }
                _ => WorkspaceContext::new(&id, &project, name),
            };
            ctx.workspace = Some(ws);
            session.store.save(&ctx)?;
            info!(workspace = %id, project = %project, "workspace set");
            output(
                session,
                json!({ "id": id, "project_id": project }),
                &format!("Workspace {id} is now active (project {project})."),
            )
        }
        WorkspaceCommand::Describe => {
            let ws = ctx.require_workspace()?;
            let text = format!(
                "ID:               {}\nName:             {}\nProject:          {}\nWorkspace bucket: {}\nResources:        {}\nUpdated:          {}",
                ws.id,
                ws.name.as_deref().unwrap_or(""),
                ws.project_id,
                ws.bucket_resource.as_deref().unwrap_or(""),
                ws.resources.len(),
                ws.updated_at.to_rfc3339()
            );
            output(
                session,
                json!({
                    "id": ws.id,
                    "name": ws.name,
                    "project_id": ws.project_id,
                    "bucket_resource": ws.bucket_resource,
                    "resource_count": ws.resources.len(),
                    "updated_at": ws.updated_at,
                }),
                &text,
            )
        }
        WorkspaceCommand::Clear => {
            ctx.workspace = None;
            session.store.save(&ctx)?;
            output(session, json!({ "cleared": true }), "Workspace cleared.")
        }
        WorkspaceCommand::SetBucket { resource } => {
            let ws = ctx.require_workspace_mut()?;
            let found = ws.resource(&resource)?;
            if !found.is_gcs_bucket() {
                return Err(CliError::user(format!(
                    "resource '{resource}' is a {}, not a GCS bucket",
                    found.type_tag()
                )));
            }
            let cloud_id = found.cloud_id();
            ws.bucket_resource = Some(resource.clone());
            ws.touch();
            session.store.save(&ctx)?;
            output(
                session,
                json!({ "bucket_resource": resource, "cloud_id": cloud_id }),
                &format!("Workspace bucket set to {resource} ({cloud_id})."),
            )
        }
    }
}

fn handle_resource(
    session: &Session,
    mut ctx: Context,
    command: ResourceCommand,
) -> Result<(), CliError> {
    match command {
        ResourceCommand::List => {
            let ws = ctx.require_workspace()?;
            let resources: Vec<UfResource> =
                ws.resources.values().map(Resource::to_user_facing).collect();
            let text = if resources.is_empty() {
                "No resources.".to_string()
            } else {
                resources
                    .iter()
                    .map(|r| format!("{:<24} {:<11} {}", r.name, r.type_tag(), r.cloud_id))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            output(session, serde_json::to_value(&resources)?, &text)
        }
        ResourceCommand::Describe { name } => {
            let resource = ctx.require_workspace()?.resource(&name)?.to_user_facing();
            let mut text = Vec::new();
            resource.print(&mut text)?;
            output(
                session,
                serde_json::to_value(&resource)?,
                &String::from_utf8_lossy(&text),
            )
        }
        ResourceCommand::AddRef { command } => {
            let resource = resource_from_args(command);
            validate_name(&resource.name)?;
            validate_details(&resource.details)?;
            let ws = ctx.require_workspace_mut()?;
            ensure_name_free(ws, &resource.name)?;
            let uf = resource.to_user_facing();
            ws.resources.insert(resource.name.clone(), resource);
            ws.touch();
            session.store.save(&ctx)?;
            info!(resource = %uf.name, kind = uf.type_tag(), "added resource reference");
            let mut text = Vec::new();
            uf.print(&mut text)?;
            output(
                session,
                serde_json::to_value(&uf)?,
                &String::from_utf8_lossy(&text),
            )
        }
        ResourceCommand::Remove { name, yes } => {
            ctx.require_workspace()?.resource(&name)?;
            if !yes && !confirm(&format!("Remove resource '{name}' from this workspace?"))? {
                return output(session, json!({ "removed": false }), "Aborted.");
            }
            let ws = ctx.require_workspace_mut()?;
            ws.resources.remove(&name);
            if ws.bucket_resource.as_deref() == Some(name.as_str()) {
                ws.bucket_resource = None;
            }
            ws.touch();
            session.store.save(&ctx)?;
            info!(resource = %name, "removed resource");
            output(
                session,
                json!({ "removed": true, "name": name }),
                &format!("Removed resource {name}."),
            )
        }
        ResourceCommand::Import { file } => {
            let incoming = read_resource_file(&session.project_dir.join(file))?;
            let ws = ctx.require_workspace_mut()?;
            for uf in &incoming {
                let resource = uf.to_internal();
                validate_name(&resource.name)?;
                validate_details(&resource.details)?;
                if resource.cloud_id() != uf.cloud_id {
                    return Err(CliError::user(format!(
                        "resource '{}': cloudId {} does not match its fields ({})",
                        uf.name,
                        uf.cloud_id,
                        resource.cloud_id()
                    )));
                }
                ensure_name_free(ws, &resource.name)?;
                ws.resources.insert(resource.name.clone(), resource);
            }
            ws.touch();
            session.store.save(&ctx)?;
            let names: Vec<&str> = incoming.iter().map(|uf| uf.name.as_str()).collect();
            info!(count = names.len(), "imported resources");
            output(
                session,
                json!({ "imported": names }),
                &format!("Imported {} resource(s).", names.len()),
            )
        }
    }
}

/// Names share one `WORKBENCH_<NAME>` variable per uppercased spelling, so they must differ
/// ignoring case.
fn ensure_name_free(ws: &WorkspaceContext, name: &str) -> Result<(), CliError> {
    match ws
        .resources
        .keys()
        .find(|existing| existing.eq_ignore_ascii_case(name))
    {
        Some(existing) if existing == name => Err(CliError::user(format!(
            "a resource named '{name}' already exists in this workspace"
        ))),
        Some(existing) => Err(CliError::user(format!(
            "resource name '{name}' clashes with existing resource '{existing}'; names must differ ignoring case"
        ))),
        None => Ok(()),
    }
}

/// Accepts a single resource, a list, or the `--json` envelope around a list.
fn read_resource_file(path: &Path) -> Result<Vec<UfResource>, CliError> {
    let text = fs::read_to_string(path).map_err(|err| {
        CliError::user(format!("failed to read {}: {err}", path.display()))
    })?;
    let mut value: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
        CliError::user(format!("{} is not valid JSON: {err}", path.display()))
    })?;
    if let Some(result) = value.get_mut("result") {
        value = result.take();
    }
    let parsed = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|single| vec![single])
    };
    parsed.map_err(|err| {
        CliError::user(format!("{} does not describe resources: {err}", path.display()))
    })
}

fn resource_from_args(command: AddRefCommand) -> Resource {
    let (name, description, details) = match command {
        AddRefCommand::GcsBucket {
            name,
            bucket_name,
            description,
        } => (name, description, ResourceDetails::GcsBucket { bucket_name }),
        AddRefCommand::BqDataset {
            name,
            project_id,
            dataset_id,
            description,
        } => (
            name,
            description,
            ResourceDetails::BqDataset {
                project_id,
                dataset_id,
            },
        ),
        AddRefCommand::GitRepo {
            name,
            repo_url,
            description,
        } => (name, description, ResourceDetails::GitRepo { url: repo_url }),
    };
    Resource {
        name,
        description,
        stewardship: Stewardship::Referenced,
        details,
    }
}

fn confirm(prompt: &str) -> Result<bool, CliError> {
    if !io::stdin().is_terminal() {
        return Err(CliError::user(
            "confirmation requires a TTY; re-run with `--yes` to skip the prompt",
        ));
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn handle_resolve(session: &Session, ctx: &Context, name: &str) -> Result<(), CliError> {
    let cloud_id = ctx.require_workspace()?.resource(name)?.cloud_id();
    output(
        session,
        json!({ "name": name, "cloudId": cloud_id }),
        &cloud_id,
    )
}

fn handle_app(
    session: &Session,
    mut ctx: Context,
    command: AppCommand,
) -> Result<i32, CliError> {
    match command {
        AppCommand::List => {
            let apps: Vec<_> = SUPPORTED_APPS
                .iter()
                .map(|(app, _)| json!({ "name": app, "enabled": ctx.global.app_enabled(*app) }))
                .collect();
            let text = SUPPORTED_APPS
                .iter()
                .map(|(app, _)| {
                    let state = if ctx.global.app_enabled(*app) {
                        "enabled"
                    } else {
                        "disabled"
                    };
                    format!("{:<10} {state}", app.as_str())
                })
                .collect::<Vec<_>>()
                .join("\n");
            output(session, json!(apps), &text)?;
            Ok(0)
        }
        AppCommand::Enable { name } => {
            let app: AppName = name.parse()?;
            enable_app(&mut ctx, app, &session.project_dir)?;
            session.store.save(&ctx)?;
            output(
                session,
                json!({ "name": app, "enabled": true }),
                &format!("App {app} enabled."),
            )?;
            Ok(0)
        }
        AppCommand::Run { name, args } => {
            let app: AppName = name.parse()?;
            run_tool(session, &ctx, app, &args)
        }
        AppCommand::Stop { name } => {
            let app: AppName = name.parse()?;
            stop_app(&mut ctx, app, &session.project_dir)?;
            session.store.save(&ctx)?;
            output(
                session,
                json!({ "name": app, "enabled": false }),
                &format!("App {app} stopped."),
            )?;
            Ok(0)
        }
    }
}

/// Runs a supported tool and hands back its exit status for the process to reuse.
fn run_tool(
    session: &Session,
    ctx: &Context,
    app: AppName,
    args: &[String],
) -> Result<i32, CliError> {
    let runner =
        CommandRunner::from_context(&ctx.global, session.store.dir(), session.launcher);
    let result = run_app(ctx, &runner, app, args, &session.project_dir)?;
    emit_tool_output(session, app, &result)?;
    Ok(result.status_code)
}

fn emit_tool_output(
    session: &Session,
    app: AppName,
    result: &CommandOutput,
) -> Result<(), CliError> {
    if session.json {
        return output(
            session,
            json!({
                "app": app,
                "exit_code": result.status_code,
                "stdout": result.stdout_text(),
                "stderr": result.stderr_text(),
            }),
            "",
        );
    }
    relay_output(result, &mut io::stdout(), &mut io::stderr())
}

/// A reader that closed its end early (`| head`) does not change the tool's outcome.
fn relay_output<O: Write, E: Write>(
    result: &CommandOutput,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<(), CliError> {
    let relayed = stdout
        .write_all(&result.stdout)
        .and_then(|()| stdout.flush())
        .and_then(|()| stderr.write_all(&result.stderr));
    match relayed {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!("output pipe closed early");
            Ok(())
        }
        other => Ok(other?),
    }
}

fn handle_cromwell(
    session: &Session,
    ctx: &Context,
    command: CromwellCommand,
) -> Result<(), CliError> {
    match command {
        CromwellCommand::GenerateConfig { dir, bucket } => {
            let bucket = execution_bucket(bucket)?;
            let path = generate_config(ctx, &session.project_dir.join(dir), &bucket)?;
            output(
                session,
                json!({ "path": path }),
                &format!("Wrote {}", path.display()),
            )
        }
    }
}

fn execution_bucket(args: BucketArgs) -> Result<ExecutionBucket, CliError> {
    match (args.workspace_bucket_name, args.google_bucket_name) {
        (Some(name), None) => Ok(ExecutionBucket::WorkspaceResource(name)),
        (None, Some(bucket)) => Ok(ExecutionBucket::Google(bucket)),
        _ => Err(CliError::user(
            "specify exactly one of --workspace-bucket-name or --google-bucket-name",
        )),
    }
}

fn handle_status(session: &Session, ctx: &Context) -> Result<(), CliError> {
    let docker_on_path = which::which("docker").is_ok();
    let apps: Vec<_> = SUPPORTED_APPS
        .iter()
        .map(|(app, handler)| {
            json!({
                "name": app,
                "enabled": ctx.global.app_enabled(*app),
                "on_path": which::which(handler.binary()).is_ok(),
            })
        })
        .collect();
    let log_file = log_file_path(session.store.dir());

    let mut lines = vec![
        format!(
            "User:        {}",
            ctx.global
                .user
                .as_ref()
                .map(|u| u.email.as_str())
                .unwrap_or("(not logged in)")
        ),
        format!(
            "Workspace:   {}",
            ctx.workspace
                .as_ref()
                .map(|ws| format!("{} (project {})", ws.id, ws.project_id))
                .unwrap_or_else(|| "(none)".to_string())
        ),
        format!("Runner:      {}", ctx.global.runner),
        format!("Image:       {}", ctx.global.docker_image),
        format!(
            "Docker:      {}",
            if docker_on_path { "found" } else { "not found" }
        ),
        format!("Log file:    {}", log_file.display()),
        "Apps:".to_string(),
    ];
    for (app, handler) in SUPPORTED_APPS {
        let enabled = if ctx.global.app_enabled(*app) {
            "enabled"
        } else {
            "disabled"
        };
        let local = if which::which(handler.binary()).is_ok() {
            "on PATH"
        } else {
            "not on PATH"
        };
        lines.push(format!("  {:<10} {:<9} {local}", app.as_str(), enabled));
    }

    output(
        session,
        json!({
            "user": ctx.global.user.as_ref().map(|u| u.email.clone()),
            "workspace": ctx.workspace.as_ref().map(|ws| ws.id.clone()),
            "project": ctx.project_id(),
            "runner": ctx.global.runner,
            "image": ctx.global.docker_image,
            "docker_on_path": docker_on_path,
            "context_dir": session.store.dir(),
            "log_file": log_file,
            "apps": apps,
        }),
        &lines.join("\n"),
    )
}
