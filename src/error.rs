use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmBloomError>;

#[derive(Error, Debug)]
pub enum ShmBloomError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Corrupt region: {0}")]
    CorruptState(String),

    #[error("Storage operation failed while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Region has already been released")]
    Released,

    #[error("Failed to parse environment variable {var_name}: value '{value}' - {error}")]
    EnvParseError {
        var_name: String,
        value: String,
        error: String,
    },
}

impl ShmBloomError {
    /// Both configuration and key failures are argument errors from the
    /// caller's point of view.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::InvalidKey(_))
    }

    pub(crate) fn storage(
        context: impl Into<String>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Storage { context, source }
    }
}
