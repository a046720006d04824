//! Core traits for capability handlers
//!
//! Every capability is implemented behind [`CapabilityHandler`]. The dispatcher
//! owns staging and timeouts; a handler only reads its staged inputs, writes
//! into its work directory and returns an outcome.

use std::path::PathBuf;

use async_trait::async_trait;
use filegate_core::{Options, ProcessingOutcome, StagedFile};

/// Everything a handler receives for one request. Owned so the handler can run
/// on its own task.
#[derive(Debug, Clone)]
pub struct HandlerJob {
    pub capability: String,
    pub inputs: Vec<StagedFile>,
    pub options: Options,
    /// Scratch directory inside the request's staging directory. Removed with it.
    pub work_dir: PathBuf,
}

impl HandlerJob {
    /// Inputs that arrived in the given multipart field.
    pub fn inputs_in_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a StagedFile> + 'a {
        self.inputs.iter().filter(move |f| f.field == field)
    }
}

/// Capability handler trait - one processing operation
///
/// `Ok(ProcessingOutcome::Failure(..))` reports an expected failure such as a
/// wrong password. `Err(..)` and panics are treated as a crashed handler.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn process(&self, job: HandlerJob) -> anyhow::Result<ProcessingOutcome>;
}
