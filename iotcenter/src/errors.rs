use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Store returned HTTP {status}: {body}")]
    Store { status: u16, body: String },

    #[error("Store response could not be parsed: {0}")]
    Parse(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Geolocation failed: {0}")]
    Geolocation(String),

    #[error("Unsupported by this store: {0}")]
    Unsupported(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
