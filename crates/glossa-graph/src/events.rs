//! Events observed by a streaming run's consumer

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::state::RunOutput;

/// Events yielded by [`KnowledgeGraph::run_streaming`](crate::KnowledgeGraph::run_streaming)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental answer text, in generation order
    Delta { text: String },
    /// End of generation; the run finalized with this summary
    Done { output: RunOutput },
    /// The run failed; no summary follows
    Error { message: String },
}

/// The stream returned for a streaming run. Dropping it cancels the run.
pub type RunStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;
