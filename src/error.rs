use serde::Serialize;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Every failure that reaches the command boundary is one of these two kinds.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad input or state the user controls. Printed as-is.
    #[error("{0}")]
    UserFixable(String),
    /// Anything else. The message is shown, the cause chain only goes to the log.
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserFixable,
    Internal,
}

impl CliError {
    pub fn user(message: impl Into<String>) -> Self {
        CliError::UserFixable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CliError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CliError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CliError::UserFixable(_) => ErrorKind::UserFixable,
            CliError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::UserFixable => 1,
            ErrorKind::Internal => 2,
        }
    }

    /// The error message followed by every nested cause, outermost first.
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = self.source();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }
        chain
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        CliError::internal_with(format!("io error: {err}"), err)
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::internal_with(format!("yaml error: {err}"), err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::internal_with(format!("json error: {err}"), err)
    }
}

impl From<dialoguer::Error> for CliError {
    fn from(err: dialoguer::Error) -> Self {
        CliError::internal_with(format!("prompt error: {err}"), err)
    }
}
