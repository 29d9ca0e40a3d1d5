//! Shared SSE plumbing for the provider adapters.
//!
//! All three wire formats stream the same way: chunked `text/event-stream`
//! bodies, events split on `\n\n`, payloads on `data:` lines. Providers
//! differ only in how a payload maps to [`StreamEvent`]s.

use tarsy_domain::error::Error;
use tarsy_domain::Result;

use crate::traits::{BoxStream, StreamEvent};

/// Pull complete `data:` payloads out of an SSE buffer, leaving any
/// trailing partial event in place.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }
    payloads
}

/// Turn an SSE response into a [`StreamEvent`] stream using a
/// provider-specific payload parser. Guarantees a final `Done` event even
/// when the provider never sends one.
pub(crate) fn event_stream<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for payload in drain_data_lines(&mut buffer) {
                        for event in parse(&payload) {
                            done |= matches!(event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for payload in drain_data_lines(&mut buffer) {
                            for event in parse(&payload) {
                                done |= matches!(event, Ok(StreamEvent::Done { .. }));
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(Error::Http(e.to_string()));
                    break;
                }
            }
        }

        if !done {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: None });
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_events_only() {
        let mut buffer =
            String::from("event: message\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: partial");
        let payloads = drain_data_lines(&mut buffer);
        assert_eq!(payloads, ["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, "data: partial");
    }

    #[test]
    fn skips_empty_data_lines() {
        let mut buffer = String::from("data:\n\ndata: real\n\n");
        assert_eq!(drain_data_lines(&mut buffer), ["real"]);
    }

    #[test]
    fn multiple_data_lines_per_event() {
        let mut buffer = String::from("data: one\ndata: two\n\n");
        assert_eq!(drain_data_lines(&mut buffer), ["one", "two"]);
    }
}
