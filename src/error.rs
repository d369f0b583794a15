use thiserror::Error;

#[derive(Error, Debug)]
pub enum UbiError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid metadata magic")]
    InvalidFormat,
    #[error("unsupported metadata version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("backing device I/O failed: {0}")]
    BackingIo(#[source] std::io::Error),
    #[error("image file I/O failed: {0}")]
    ImageIo(#[source] std::io::Error),
    #[error("out of resources: {0}")]
    ResourceExhausted(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    InternalError(&'static str),
}

impl UbiError {
    /// True for errors caused by bad user input rather than runtime failure.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            UbiError::InvalidConfig(_)
                | UbiError::InvalidFormat
                | UbiError::UnsupportedVersion { .. }
        )
    }
}
