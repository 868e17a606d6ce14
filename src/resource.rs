use crate::error::CliError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};

const RESERVED_NAMES: &[&str] = &["workspace_id", "user_email"];
const ENV_PREFIX: &str = "WORKBENCH_";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stewardship {
    #[default]
    Referenced,
    Controlled,
}

impl fmt::Display for Stewardship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stewardship::Referenced => "REFERENCED",
            Stewardship::Controlled => "CONTROLLED",
        })
    }
}

/// Resource record as persisted in the workspace context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stewardship: Stewardship,
    pub details: ResourceDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceDetails {
    GcsBucket { bucket_name: String },
    BqDataset { project_id: String, dataset_id: String },
    GitRepo { url: String },
}

impl Resource {
    pub fn type_tag(&self) -> &'static str {
        match self.details {
            ResourceDetails::GcsBucket { .. } => "GCS_BUCKET",
            ResourceDetails::BqDataset { .. } => "BQ_DATASET",
            ResourceDetails::GitRepo { .. } => "GIT_REPO",
        }
    }

    pub fn is_gcs_bucket(&self) -> bool {
        matches!(self.details, ResourceDetails::GcsBucket { .. })
    }

    /// The identifier tools use to address the resource.
    pub fn cloud_id(&self) -> String {
        match &self.details {
            ResourceDetails::GcsBucket { bucket_name } => format!("gs://{bucket_name}"),
            ResourceDetails::BqDataset {
                project_id,
                dataset_id,
            } => format!("{project_id}.{dataset_id}"),
            ResourceDetails::GitRepo { url } => url.clone(),
        }
    }

    pub fn env_var_name(&self) -> String {
        format!("{ENV_PREFIX}{}", self.name.to_uppercase())
    }

    pub fn to_user_facing(&self) -> UfResource {
        let details = match &self.details {
            ResourceDetails::GcsBucket { bucket_name } => UfResourceDetails::GcsBucket {
                bucket_name: bucket_name.clone(),
            },
            ResourceDetails::BqDataset {
                project_id,
                dataset_id,
            } => UfResourceDetails::BqDataset {
                project_id: project_id.clone(),
                dataset_id: dataset_id.clone(),
            },
            ResourceDetails::GitRepo { url } => UfResourceDetails::GitRepo {
                git_repo_url: url.clone(),
            },
        };
        UfResource {
            name: self.name.clone(),
            description: self.description.clone(),
            stewardship: self.stewardship,
            cloud_id: self.cloud_id(),
            details,
        }
    }
}

/// Resource as shown to users and scripts. `resourceType` selects the field set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UfResource {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stewardship: Stewardship,
    pub cloud_id: String,
    #[serde(flatten)]
    pub details: UfResourceDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "resourceType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UfResourceDetails {
    #[serde(rename_all = "camelCase")]
    GcsBucket { bucket_name: String },
    #[serde(rename_all = "camelCase")]
    BqDataset { project_id: String, dataset_id: String },
    #[serde(rename_all = "camelCase")]
    GitRepo { git_repo_url: String },
}

impl UfResource {
    pub fn type_tag(&self) -> &'static str {
        match self.details {
            UfResourceDetails::GcsBucket { .. } => "GCS_BUCKET",
            UfResourceDetails::BqDataset { .. } => "BQ_DATASET",
            UfResourceDetails::GitRepo { .. } => "GIT_REPO",
        }
    }

    /// Rebuilds the internal record. `cloud_id` is derived, so it is not carried over.
    pub fn to_internal(&self) -> Resource {
        let details = match &self.details {
            UfResourceDetails::GcsBucket { bucket_name } => ResourceDetails::GcsBucket {
                bucket_name: bucket_name.clone(),
            },
            UfResourceDetails::BqDataset {
                project_id,
                dataset_id,
            } => ResourceDetails::BqDataset {
                project_id: project_id.clone(),
                dataset_id: dataset_id.clone(),
            },
            UfResourceDetails::GitRepo { git_repo_url } => ResourceDetails::GitRepo {
                url: git_repo_url.clone(),
            },
        };
        Resource {
            name: self.name.clone(),
            description: self.description.clone(),
            stewardship: self.stewardship,
            details,
        }
    }

    /// Shared fields first, then the kind-specific ones. Scripts parse this.
    pub fn print<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Name:         {}", self.name)?;
        writeln!(
            out,
            "Description:  {}",
            self.description.as_deref().unwrap_or("")
        )?;
        writeln!(out, "Type:         {}", self.type_tag())?;
        writeln!(out, "Stewardship:  {}", self.stewardship)?;
        writeln!(out, "Cloud id:     {}", self.cloud_id)?;
        match &self.details {
            UfResourceDetails::GcsBucket { bucket_name } => {
                writeln!(out, "Bucket name:  {bucket_name}")?;
            }
            UfResourceDetails::BqDataset {
                project_id,
                dataset_id,
            } => {
                writeln!(out, "Project id:   {project_id}")?;
                writeln!(out, "Dataset id:   {dataset_id}")?;
            }
            UfResourceDetails::GitRepo { git_repo_url } => {
                writeln!(out, "Repo url:     {git_repo_url}")?;
            }
        }
        Ok(())
    }
}

pub fn validate_name(name: &str) -> Result<(), CliError> {
    if name.is_empty() {
        return Err(CliError::user("resource name must not be empty"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CliError::user(format!(
            "invalid resource name '{name}': only letters, numbers and underscores are allowed"
        )));
    }
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(CliError::user(format!("resource name '{name}' is reserved")));
    }
    Ok(())
}

pub fn validate_details(details: &ResourceDetails) -> Result<(), CliError> {
    match details {
        ResourceDetails::GcsBucket { bucket_name } => {
            if bucket_name.is_empty()
                || bucket_name.starts_with("gs://")
                || bucket_name.contains('/')
            {
                return Err(CliError::user(format!(
                    "invalid bucket name '{bucket_name}': pass the bare bucket name without gs:// or a path"
                )));
            }
        }
        ResourceDetails::BqDataset {
            project_id,
            dataset_id,
        } => {
            if project_id.is_empty() || dataset_id.is_empty() {
                return Err(CliError::user(
                    "BigQuery datasets need both --project-id and --dataset-id",
                ));
            }
            if !dataset_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(CliError::user(format!(
                    "invalid dataset id '{dataset_id}': only letters, numbers and underscores are allowed"
                )));
            }
        }
        ResourceDetails::GitRepo { url } => {
            if url.trim().is_empty() {
                return Err(CliError::user("git repository url must not be empty"));
            }
        }
    }
    Ok(())
}
