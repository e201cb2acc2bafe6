//! Resumable chunk streams over a [`FactPipeline`].
//!
//! A stream is the deterministic [`chunk_text`] partition of one generation,
//! numbered from zero. Resuming with `start_at = k` re-derives the partition
//! and yields exactly chunks `k..`, so a client that reconnects after chunk
//! `k - 1` sees neither duplicates nor gaps. A `start_at` past the end
//! yields nothing.
//!
//! Dropping a stream drops the pipeline's fragment producer with it, and any
//! pending inter-chunk delay is cancelled at the same time.
//!
//! [`chunk_text`]: crate::chunk_text

use crate::{
    error::{Error, Result},
    stream::{Chunker, FactPipeline},
};
use async_stream::try_stream;
use core::time::Duration;
use futures::{Stream, StreamExt, stream::BoxStream};
use std::sync::Arc;

/// One chunk of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    /// Zero-based position of the chunk in the full stream.
    pub index: usize,
    pub text: String,
    /// Whether the stream was resumed from a non-zero cursor.
    pub is_replay: bool,
}

/// Drives a [`FactPipeline`] and cuts its output into [`StreamChunk`]s.
#[derive(Clone)]
pub struct FactStreamer {
    pipeline: Arc<dyn FactPipeline>,
    chunk_size: usize,
    delay: Duration,
}

impl core::fmt::Debug for FactStreamer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FactStreamer")
            .field("chunk_size", &self.chunk_size)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl FactStreamer {
    /// `chunk_size` is clamped to at least one character.
    pub fn new(pipeline: Arc<dyn FactPipeline>, chunk_size: usize) -> Self {
        Self {
            pipeline,
            chunk_size: chunk_size.max(1),
            delay: Duration::ZERO,
        }
    }

    /// Pause between two emitted chunks.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Streams the chunks of the text generated for `query`, starting at
    /// index `start_at`.
    ///
    /// Chunks are cut as soon as the producer closes them, so incremental
    /// producers reach the client before generation finishes. A producer
    /// failure is the last item of the stream.
    pub fn stream(&self, query: impl Into<String>, start_at: usize) -> BoxStream<'static, Result<StreamChunk>> {
        chunks(
            Arc::clone(&self.pipeline),
            query.into(),
            self.chunk_size,
            self.delay,
            start_at,
        )
        .boxed()
    }
}

fn chunks(
    pipeline: Arc<dyn FactPipeline>,
    query: String,
    chunk_size: usize,
    delay: Duration,
    start_at: usize,
) -> impl Stream<Item = Result<StreamChunk>> + Send + 'static {
    try_stream! {
        let is_replay = start_at > 0;
        let mut fragments = match pipeline.fragments(&query) {
            Some(fragments) => fragments,
            None => {
                let pipeline = Arc::clone(&pipeline);
                let query = query.clone();
                futures::stream::once(async move { pipeline.run(&query).await }).boxed()
            }
        };
        let mut chunker = Chunker::new(chunk_size);
        let mut index = 0;
        let mut emitted = 0;
        let mut done = false;

        while !done {
            let closed = match fragments.next().await {
                Some(fragment) => chunker.push(&fragment.map_err(Error::from)?),
                None => {
                    done = true;
                    chunker.finish().into_iter().collect()
                }
            };
            for text in closed {
                if index >= start_at {
                    if emitted > 0 && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    emitted += 1;
                    yield StreamChunk { index, text, is_replay };
                }
                index += 1;
            }
        }
    }
}
