/// Splits `text` into chunks of roughly `limit` characters.
///
/// Boundaries only fall where a token (a run of non-whitespace) starts, so a
/// token is never cut; a token longer than `limit` becomes its own oversized
/// chunk. Whitespace stays attached to the end of the chunk before it, which
/// makes the partition lossless: concatenating the chunks gives back `text`.
/// Text with no token at all yields no chunks.
///
/// The partition depends only on `(text, limit)`, so a resumed stream can
/// re-derive the exact same boundaries from a cursor index.
///
/// ```
/// use factgate::chunk_text;
///
/// let chunks = chunk_text("alpha beta gamma", 6);
/// assert_eq!(chunks, ["alpha ", "beta ", "gamma"]);
/// ```
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunker = Chunker::new(limit);
    let mut chunks = chunker.push(text);
    chunks.extend(chunker.finish());
    chunks
}

/// Incremental form of [`chunk_text`].
///
/// Feeding a text in fragments of any size and then calling [`finish`]
/// produces exactly the chunks `chunk_text` produces for the whole text.
/// Only chunks that no future input can change are handed out by [`push`].
///
/// [`push`]: Chunker::push
/// [`finish`]: Chunker::finish
#[derive(Clone, Debug)]
pub struct Chunker {
    limit: usize,
    pending: String,
}

impl Chunker {
    /// `limit` is clamped to at least one character.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            pending: String::new(),
        }
    }

    /// Appends `fragment` and returns every chunk it closed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.pending.push_str(fragment);
        let (closed, rest) = split_closed(&self.pending, self.limit);
        self.pending.drain(..rest);
        closed
    }

    /// Flushes the trailing chunk, if it holds any token.
    pub fn finish(&mut self) -> Option<String> {
        let rest = core::mem::take(&mut self.pending);
        rest.chars().any(|c| !c.is_whitespace()).then_some(rest)
    }
}

/// Scans `buf` and returns the chunks that are closed, plus the byte offset
/// where the still-open tail starts.
///
/// A chunk closes when a later token pushes the running length past `limit`;
/// the boundary is the start of that token. A chunk always holds at least one
/// token.
fn split_closed(buf: &str, limit: usize) -> (Vec<String>, usize) {
    let mut closed = Vec::new();
    let mut start = 0;
    let mut len = 0;
    let mut token_start: Option<usize> = None;
    let mut token_len = 0;
    let mut has_token = false;

    for (i, c) in buf.char_indices() {
        len += 1;
        if c.is_whitespace() {
            if token_start.take().is_some() {
                has_token = true;
            }
            continue;
        }
        let at = *token_start.get_or_insert_with(|| {
            token_len = 0;
            i
        });
        token_len += 1;
        if has_token && len > limit {
            closed.push(buf[start..at].to_owned());
            start = at;
            len = token_len;
            has_token = false;
        }
    }

    (closed, start)
}
