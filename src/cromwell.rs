use crate::context::{write_atomic_text_file, Context};
use crate::error::CliError;
use std::path::{Path, PathBuf};
use tracing::info;

const CROMWELL_TEMPLATE: &str = include_str!("../templates/cromwell.conf");
pub const CROMWELL_CONFIG_FILE: &str = "cromwell.conf";

/// Where workflow executions are rooted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionBucket {
    /// Name of a GCS bucket resource in the active workspace.
    WorkspaceResource(String),
    /// Any bucket, with or without the `gs://` prefix.
    Google(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CromwellSettings {
    pub project: String,
    pub service_account: String,
    pub execution_root: String,
}

impl CromwellSettings {
    pub fn from_context(ctx: &Context, bucket: &ExecutionBucket) -> Result<Self, CliError> {
        let ws = ctx.require_workspace()?;
        let user = ctx.require_user()?;
        let execution_root = match bucket {
            ExecutionBucket::WorkspaceResource(name) => {
                let resource = ws.resource(name)?;
                if !resource.is_gcs_bucket() {
                    return Err(CliError::user(format!(
                        "resource '{name}' is a {}, not a GCS bucket",
                        resource.type_tag()
                    )));
                }
                resource.cloud_id()
            }
            ExecutionBucket::Google(bucket) => {
                let bucket = bucket.trim().trim_end_matches('/');
                if bucket.is_empty() || bucket == "gs:" {
                    return Err(CliError::user("--google-bucket-name must not be empty"));
                }
                if bucket.starts_with("gs://") {
                    bucket.to_string()
                } else {
                    format!("gs://{bucket}")
                }
            }
        };
        Ok(Self {
            project: ws.project_id.clone(),
            service_account: user
                .service_account
                .clone()
                .unwrap_or_else(|| user.email.clone()),
            execution_root,
        })
    }

    pub fn render(&self) -> String {
        CROMWELL_TEMPLATE
            .replace("{project}", &self.project)
            .replace("{service_account}", &self.service_account)
            .replace("{execution_root}", &self.execution_root)
    }
}

pub fn generate_config(
    ctx: &Context,
    dir: &Path,
    bucket: &ExecutionBucket,
) -> Result<PathBuf, CliError> {
    let settings = CromwellSettings::from_context(ctx, bucket)?;
    let path = dir.join(CROMWELL_CONFIG_FILE);
    write_atomic_text_file(&path, &settings.render())?;
    info!(path = %path.display(), root = %settings.execution_root, "wrote cromwell config");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::workspace_context;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn google_bucket_gets_gs_prefix() {
        let ctx = workspace_context();
        let settings =
            CromwellSettings::from_context(&ctx, &ExecutionBucket::Google("runs".into())).unwrap();
        assert_eq!(settings.execution_root, "gs://runs");
        assert_eq!(settings.project, "lab-project");
        assert_eq!(settings.service_account, "ada@example.org");

        let settings =
            CromwellSettings::from_context(&ctx, &ExecutionBucket::Google("gs://runs/".into()))
                .unwrap();
        assert_eq!(settings.execution_root, "gs://runs");
    }

    #[test]
    fn workspace_bucket_resolves_resource() {
        let ctx = workspace_context();
        let settings = CromwellSettings::from_context(
            &ctx,
            &ExecutionBucket::WorkspaceResource("scratch".into()),
        )
        .unwrap();
        assert_eq!(settings.execution_root, "gs://lab-scratch");

        let err = CromwellSettings::from_context(
            &ctx,
            &ExecutionBucket::WorkspaceResource("missing".into()),
        )
        .expect_err("unknown resource");
        assert!(matches!(err, CliError::UserFixable(_)));
    }

    #[test]
    fn requires_workspace_and_login() {
        let err = CromwellSettings::from_context(
            &Context::default(),
            &ExecutionBucket::Google("runs".into()),
        )
        .expect_err("no workspace");
        assert!(err.to_string().contains("no active workspace"));

        let mut ctx = workspace_context();
        ctx.global.user = None;
        let err = CromwellSettings::from_context(&ctx, &ExecutionBucket::Google("runs".into()))
            .expect_err("no user");
        assert!(err.to_string().contains("login required"));
    }

    #[test]
    fn generate_config_writes_rendered_template() {
        let dir = tempdir().unwrap();
        let ctx = workspace_context();
        let path = generate_config(
            &ctx,
            &dir.path().join("build"),
            &ExecutionBucket::Google("runs".into()),
        )
        .unwrap();
        assert_eq!(path, dir.path().join("build").join("cromwell.conf"));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("project = \"lab-project\""));
        assert!(text.contains("root = \"gs://runs/workflows/cromwell-executions\""));
        assert!(text.contains("compute-service-account = \"ada@example.org\""));
        assert!(!text.contains("{project}"));
        assert!(!text.contains("{execution_root}"));
        assert!(!text.contains("{service_account}"));
    }
}
