use async_trait::async_trait;
use futures::stream::{self, BoxStream};

/// Failures of a [`FactPipeline`].
///
/// Surfaced to clients as a single terminal `error` event; a stream is never
/// retried within the same connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("No facts found for '{query}'")]
    NoFacts { query: String },

    #[error("{0}")]
    Failed(String),
}

/// A producer of generated text.
///
/// The streamer only needs the whole text from [`run`]; producers that can
/// emit output incrementally also implement [`fragments`], whose
/// concatenated output must equal what `run` returns for the same query.
///
/// [`run`]: FactPipeline::run
/// [`fragments`]: FactPipeline::fragments
#[async_trait]
pub trait FactPipeline: Send + Sync {
    /// Generates the full text for `query`.
    async fn run(&self, query: &str) -> Result<String, PipelineError>;

    /// Generates the text for `query` as a sequence of fragments, if the
    /// producer supports it.
    fn fragments(&self, _query: &str) -> Option<BoxStream<'static, Result<String, PipelineError>>> {
        None
    }
}

/// A self-contained producer that echoes the query back as one sentence.
///
/// The query is trimmed, inner whitespace collapsed to single spaces and a
/// terminal period added when it has no sentence-ending punctuation.
/// Fragments are the words, each but the last followed by a space.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalPipeline;

impl LocalPipeline {
    fn normalize(query: &str) -> Result<String, PipelineError> {
        let mut sentence = query.split_whitespace().collect::<Vec<_>>().join(" ");
        if sentence.is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        if !sentence.ends_with(['.', '!', '?', '…']) {
            sentence.push('.');
        }
        Ok(sentence)
    }
}

#[async_trait]
impl FactPipeline for LocalPipeline {
    async fn run(&self, query: &str) -> Result<String, PipelineError> {
        Self::normalize(query)
    }

    fn fragments(&self, query: &str) -> Option<BoxStream<'static, Result<String, PipelineError>>> {
        let fragments = match Self::normalize(query) {
            Ok(sentence) => {
                let words: Vec<&str> = sentence.split(' ').collect();
                let last = words.len() - 1;
                words
                    .into_iter()
                    .enumerate()
                    .map(|(i, word)| {
                        if i < last {
                            Ok(format!("{word} "))
                        } else {
                            Ok(word.to_owned())
                        }
                    })
                    .collect::<Vec<_>>()
            }
            Err(e) => vec![Err(e)],
        };
        Some(Box::pin(stream::iter(fragments)))
    }
}
