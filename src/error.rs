use thiserror::Error;

/// Crate errors
#[derive(Error, Debug)]
pub enum XmitError {
    #[error("Truncated input at offset {offset}. Needed {needed} bytes, {remaining} remain.")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Input does not look like an XMI, AWS or HET container.")]
    UnknownContainer,

    #[error("Malformed record at offset {offset}: {reason}.")]
    MalformedRecord { offset: usize, reason: String },

    #[error("Transmission was produced by the unsupported utility {0:?}.")]
    UnsupportedUtility(String),

    #[error("Unsupported feature: {0}.")]
    UnsupportedFeature(String),

    #[error("Decoding error: {0}.")]
    Decoding(String),

    #[error("Record of {size} bytes exceeds the configured limit of {limit} bytes.")]
    PolicyViolation { size: usize, limit: usize },

    #[error("Failed to read bytes from the input file")]
    Io(#[from] std::io::Error),
}

impl XmitError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        XmitError::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }
}
