/// Result alias that carries the custom [`MusicToolsError`] type.
pub type Result<T> = std::result::Result<T, MusicToolsError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MusicToolsError {
    /// Tempo was zero, negative, not finite or outside the configured range.
    #[error("invalid tempo {0} BPM: tempo must be a positive number within the configured range")]
    InvalidTempo(f64),
    /// Tempo input could not be parsed as a number at all.
    #[error("invalid tempo `{0}`: expected a number of beats per minute")]
    InvalidTempoInput(String),
    /// The audio source could not be turned into sample data.
    #[error("failed to decode audio: {0}")]
    DecodeFailure(String),
    /// The audio backend is closed or refused to resume.
    #[error("audio backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A caller-supplied value or configuration setting is out of range.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Free-form error message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Settings, config or peak JSON could not be read or written.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// WAV encoding or decoding error from `hound`.
    #[error("{0}")]
    Wav(#[from] hound::Error),
}

impl MusicToolsError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for MusicToolsError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MusicToolsError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
