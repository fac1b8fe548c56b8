use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("routing provider unavailable: {0}")]
    Unavailable(String),
    #[error("routing provider returned status {0}")]
    Status(String),
    #[error("routing request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected routing response: {0}")]
    Decode(String),
}
