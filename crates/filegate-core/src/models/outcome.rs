use bytes::Bytes;

use crate::error::ProcessingFailure;

/// Processed file returned to the client.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub data: Bytes,
    pub file_name: String,
    pub mime_type: String,
}

impl Artifact {
    pub fn new(data: impl Into<Bytes>, file_name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Result of one dispatch. Consumed exactly once by the response envelope.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Artifact(Artifact),
    StatusPayload(serde_json::Value),
    Failure(ProcessingFailure),
}

impl ProcessingOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ProcessingOutcome::Failure(_))
    }
}

impl From<ProcessingFailure> for ProcessingOutcome {
    fn from(failure: ProcessingFailure) -> Self {
        ProcessingOutcome::Failure(failure)
    }
}

impl From<Artifact> for ProcessingOutcome {
    fn from(artifact: Artifact) -> Self {
        ProcessingOutcome::Artifact(artifact)
    }
}
