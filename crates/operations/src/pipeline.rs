//! Depth-first streaming composition of a filter chain.

use cadenza_core::{Chunk, ChunkStream, Operation};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An ordered list of filter stages applied to each input chunk.
///
/// Every output of stage `n` is fed through stage `n + 1` before stage `n`
/// is polled again, so leaves are produced as soon as their upstream chunk
/// exists. A splitting filter fans one input into many independent leaves.
/// The walk keeps an explicit stack of open stage streams, so chain length
/// never turns into call depth.
pub struct FilterPipeline {
    stages: Vec<Arc<Operation>>,
    cancel: Option<CancellationToken>,
}

impl FilterPipeline {
    pub fn new(stages: Vec<Arc<Operation>>) -> Self {
        Self {
            stages,
            cancel: None,
        }
    }

    /// Stop producing output once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one chunk through every stage. An empty pipeline yields the input.
    pub fn run(self, input: Chunk) -> ChunkStream {
        let FilterPipeline { stages, cancel } = self;
        Box::pin(async_stream::try_stream! {
            if stages.is_empty() {
                yield input;
            } else {
                let mut open: Vec<(usize, ChunkStream)> = vec![(0, stages[0].invoke(input))];
                loop {
                    if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        debug!(pending = open.len(), "Filter pipeline cancelled");
                        break;
                    }
                    let Some((depth, stream)) = open.last_mut() else {
                        break;
                    };
                    let depth = *depth;
                    let next_item = stream.next().await;
                    match next_item {
                        None => {
                            open.pop();
                        }
                        Some(item) => {
                            let chunk = item?;
                            let next = depth + 1;
                            if next == stages.len() {
                                yield chunk;
                            } else {
                                open.push((next, stages[next].invoke(chunk)));
                            }
                        }
                    }
                }
            }
        })
    }
}
