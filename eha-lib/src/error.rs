#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough bits")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Caller handed a value the API contract forbids. No partial mutation
    /// has occurred when this is returned.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("decom error: {0}")]
    Decom(String),

    /// Malformed SFDU/CHDO envelope. Aborts the remaining records of the
    /// envelope only, never the pipeline.
    #[error("envelope error: {0}")]
    Envelope(String),

    #[error("derivation error: {0}")]
    Derivation(String),

    #[error("EU conversion error: {0}")]
    EuConversion(String),

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
