use thiserror::Error;

/// Failure taxonomy for the processing pipeline. Every variant is caught at
/// the per-essay orchestration boundary and converted into essay state;
/// nothing crosses the batch loop.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{provider} API key is not configured")]
    MissingApiKey { provider: &'static str },

    #[error("{0}")]
    Vendor(String),

    #[error("OCR polling timed out for document {document_id}; the transcript can be recovered from the vendor dashboard")]
    OcrTimeout { document_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("model returned malformed output: {0}")]
    MalformedResponse(String),

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<crate::models::essay::TransitionError> for ProcessingError {
    fn from(err: crate::models::essay::TransitionError) -> Self {
        ProcessingError::Other(anyhow::anyhow!(err))
    }
}

impl ProcessingError {
    /// Cancellation is routed to a separate terminal state than plain
    /// errors, so it must stay recognizable after crossing the transport.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ProcessingError::Cancelled => true,
            ProcessingError::Http(err) => {
                // reqwest surfaces an aborted in-flight request as a request
                // error wrapping the abort; match on the message marker.
                err.to_string().contains("cancel")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_variant_is_recognized() {
        assert!(ProcessingError::Cancelled.is_cancelled());
        assert!(!ProcessingError::Vendor("boom".to_string()).is_cancelled());
        assert!(!ProcessingError::MissingApiKey { provider: "openai" }.is_cancelled());
    }

    #[test]
    fn timeout_names_the_document() {
        let err = ProcessingError::OcrTimeout { document_id: "doc-42".to_string() };
        assert!(err.to_string().contains("doc-42"));
    }
}
