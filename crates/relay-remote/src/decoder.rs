use futures::{Stream, StreamExt};
use serde_json::Value;

use relay_core::RuntimeError;

/// Incremental newline-delimited JSON decoder.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split
/// across chunks decode correctly. Blank lines are skipped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>, RuntimeError> {
        self.pending.extend_from_slice(chunk);
        let mut values = Vec::new();
        let mut start = 0;
        let mut outcome = Ok(());
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            self.scanned = end + 1;
            match decode_line(&self.pending[start..end]) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        self.scanned = if outcome.is_ok() { self.pending.len() } else { 0 };
        outcome.map(|()| values)
    }

    /// Decodes whatever is left once the input has ended.
    pub fn finish(&mut self) -> Result<Option<Value>, RuntimeError> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<Value>, RuntimeError> {
    let text = std::str::from_utf8(line)
        .map_err(|err| RuntimeError::stream(format!("invalid UTF-8 in stream line: {err}")))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Value>(text).map(Some).map_err(|err| {
        RuntimeError::stream(format!(
            "malformed JSON line ({err}): {}",
            truncate_for_error(text, 200)
        ))
    })
}

/// Adapts a byte stream into a stream of JSON values, one per line.
///
/// Transport errors are classified with [`classify_transport_error`]; the
/// stream ends after the first error.
pub fn decode_json_lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<Value, RuntimeError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<anyhow::Error> + Send,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = LineDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(classify_transport_error(&err.into()));
                    return;
                }
            };
            match decoder.push(chunk.as_ref()) {
                Ok(values) => {
                    for value in values {
                        yield Ok(value);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
        match decoder.finish() {
            Ok(Some(value)) => yield Ok(value),
            Ok(None) => {}
            Err(err) => yield Err(err),
        }
    }
}

/// Maps a transport failure onto the error taxonomy. Refused, reset or
/// dropped connections and timeouts become `NETWORK_ERROR`; structured errors
/// keep their code; anything else is `UNKNOWN_ERROR`.
pub fn classify_transport_error(err: &anyhow::Error) -> RuntimeError {
    if let Some(structured) = err.chain().find_map(|cause| cause.downcast_ref::<RuntimeError>()) {
        return structured.clone();
    }
    let transport = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<reqwest::Error>());
    if let Some(transport) = transport {
        if transport.is_connect()
            || transport.is_timeout()
            || transport.is_body()
            || transport.is_request()
        {
            return RuntimeError::network(format!("{err:#}"));
        }
    }
    RuntimeError::from_anyhow(err)
}

pub(crate) fn truncate_for_error(input: &str, max_chars: usize) -> String {
    let mut out = input.chars().take(max_chars).collect::<String>();
    if input.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
