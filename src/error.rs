use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Internal error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Payload too large: {size} bytes (max: {max})"))]
    PayloadTooLarge { size: usize, max: usize },

    #[snafu(display("Queue {queue} is full: {size} live messages (max: {max})"))]
    QueueFull { queue: String, size: i64, max: i64 },

    #[snafu(display("Error serializing message data"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Queue engine is shutting down"))]
    ShuttingDown,

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Missing parameter: {message}"))]
    MissingParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::MissingParameter {
            message: message.into(),
        }
    }

    /// Errors raised before anything is persisted. The caller can fix the
    /// input and try again.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. }
                | Self::QueueFull { .. }
                | Self::InvalidParameter { .. }
                | Self::MissingParameter { .. }
        )
    }

    /// Errors that originate in the store itself rather than in the input.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Sqlx { .. } | Self::MigrationError { .. })
    }
}
