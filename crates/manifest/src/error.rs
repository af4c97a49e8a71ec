use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid resolution `{0}`")]
    InvalidResolution(String),
}
