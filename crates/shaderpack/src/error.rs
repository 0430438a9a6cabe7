use thiserror::Error;

/// Failures that abort configuration of a single program. Other programs in
/// the same pack are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShaderPackError {
    #[error("shader source contains the reserved marker {marker}")]
    InputRejected { marker: &'static str },

    #[error("GLSL source pre-processing failed at line {line}: {message}")]
    PreprocessFailed { line: usize, message: String },

    #[error("malformed {directive} directive '{payload}': {reason}")]
    MalformedDirective {
        directive: &'static str,
        payload: String,
        reason: String,
    },

    #[error("render target {index} is not supported by this driver")]
    UnknownRenderTarget { index: u32 },
}

impl ShaderPackError {
    pub(crate) fn preprocess(line: usize, message: impl Into<String>) -> Self {
        Self::PreprocessFailed {
            line,
            message: message.into(),
        }
    }
}
