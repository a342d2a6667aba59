use snafu::Snafu;

use crate::topic::ValidationError;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Error returned from database"))]
    Storage {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid message: {source}"))]
    Validation {
        #[snafu(source)]
        source: ValidationError,
    },

    #[snafu(display("Error reading configuration from environment"))]
    Environment {
        #[snafu(source)]
        source: envy::Error,
    },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<ValidationError> for Error {
    fn from(source: ValidationError) -> Self {
        Self::Validation { source }
    }
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Environment { source }
    }
}

impl Error {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn message_not_found(id: i64) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }
}
