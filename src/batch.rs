//! Multi-run execution: several inputs, each under its own `run_id`.
//!
//! Runs share nothing but the output root, so they proceed concurrently up
//! to `config.concurrency`. [`run_batch`] waits for all of them and returns
//! outcomes in input order; [`run_stream`] yields each outcome as soon as
//! its run finishes (completion order, tagged with the input index).

use crate::error::PipelineError;
use crate::orchestrator::Pipeline;
use crate::output::RunOutput;
use crate::region::Stage;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// Outcome of one input in a batch.
#[derive(Debug)]
pub struct BatchItem {
    /// Position of the input in the submitted list.
    pub index: usize,
    pub input: String,
    pub result: Result<RunOutput, PipelineError>,
}

/// A boxed stream of batch outcomes.
pub type RunStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Run every input to `target` and collect the outcomes in input order.
///
/// One failing input never stops the others.
pub async fn run_batch(pipeline: &Pipeline, inputs: &[String], target: Stage) -> Vec<BatchItem> {
    let mut items: Vec<BatchItem> = run_stream(pipeline.clone(), inputs.to_vec(), target)
        .collect()
        .await;
    items.sort_by_key(|item| item.index);
    let failed = items.iter().filter(|i| i.result.is_err()).count();
    info!("Batch finished: {} ok, {} failed", items.len() - failed, failed);
    items
}

/// Run every input to `target`, yielding outcomes as they complete.
pub fn run_stream(pipeline: Pipeline, inputs: Vec<String>, target: Stage) -> RunStream {
    let concurrency = pipeline.config().concurrency.max(1);
    info!("Starting batch of {} inputs ({} at a time)", inputs.len(), concurrency);

    let s = stream::iter(inputs.into_iter().enumerate().map(move |(index, input)| {
        let pipeline = pipeline.clone();
        async move {
            let result = pipeline.run_until(&input, target).await;
            BatchItem { index, input, result }
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}
