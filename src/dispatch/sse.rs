use http_body_util::BodyExt;
use hyper::body::{Bytes, Frame};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Scanner buffer ceiling. On overflow the newest half window is kept so a
/// partial line survives.
const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const KEEP_BYTES: usize = 512 * 1024;

/// Channel depth for the passthrough body. Each item is one upstream chunk.
const STREAM_CHANNEL_BUFFER: usize = 64;

/// Incremental `data:` line scanner for SSE bodies. Forwarding is handled
/// elsewhere; the scanner only extracts `token_count` rate-limit events.
pub struct SseScanner<F> {
    buffer: Vec<u8>,
    on_rate_limits: F,
}

impl<F> SseScanner<F>
where
    F: FnMut(&serde_json::Value),
{
    pub fn new(on_rate_limits: F) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            on_rate_limits,
        }
    }

    /// Feed one chunk. Complete lines are parsed; the unterminated tail is
    /// buffered up to the ceiling.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        loop {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1]);
        }

        if self.buffer.len() > MAX_BUFFER_BYTES {
            let start = self.buffer.len() - KEEP_BYTES;
            self.buffer.drain(..start);
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let line = line.trim_end_matches('\r');

        let data = if let Some(stripped) = line.strip_prefix("data: ") {
            stripped
        } else if let Some(stripped) = line.strip_prefix("data:") {
            stripped
        } else {
            return;
        };

        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        if event.get("type").and_then(|t| t.as_str()) != Some("token_count") {
            return;
        }
        if let Some(rate_limits) = event.get("rate_limits") {
            (self.on_rate_limits)(rate_limits);
        }
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// A streaming response body backed by an `mpsc` channel. Each received
/// `Bytes` value is emitted as a single DATA frame; when the sender drops
/// the body signals end-of-stream.
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap an upstream body in a passthrough that scans `data:` lines for
/// quota telemetry while forwarding bytes unchanged. Telemetry is
/// best-effort and never blocks chunk delivery; byte order is preserved.
pub fn tap_sse_body<F>(upstream: hyper::body::Incoming, on_rate_limits: F) -> ChannelBody
where
    F: FnMut(&serde_json::Value) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_BUFFER);
    let mut scanner = SseScanner::new(on_rate_limits);
    let mut upstream = upstream;

    tokio::spawn(async move {
        loop {
            match upstream.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        scanner.feed(&data);
                        if tx.send(data).await.is_err() {
                            // Client went away; stop reading upstream
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "upstream stream error");
                    break;
                }
                None => break,
            }
        }
    });

    ChannelBody::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scanner_extracts_token_count_rate_limits() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut scanner = SseScanner::new(move |v: &serde_json::Value| {
            sink.lock().push(v.clone());
        });

        scanner.feed(
            b"data: {\"type\":\"token_count\",\"rate_limits\":{\"primary\":{\"used_percent\":42,\"window_minutes\":300,\"resets_at\":1700000000}}}\n\n",
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["primary"]["used_percent"], 42);
    }

    #[test]
    fn test_scanner_handles_split_chunks() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let mut scanner = SseScanner::new(move |_: &serde_json::Value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        // Event split mid-JSON across chunks
        scanner.feed(b"data: {\"type\":\"token_count\",");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scanner.feed(b"\"rate_limits\":{\"primary\":{\"used_percent\":10}}}\n");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scanner_ignores_other_events_and_done() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let mut scanner = SseScanner::new(move |_: &serde_json::Value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        scanner.feed(b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n");
        scanner.feed(b"event: something\n");
        scanner.feed(b"data: [DONE]\n");
        scanner.feed(b"data: not json\n");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scanner_handles_crlf_lines() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let mut scanner = SseScanner::new(move |_: &serde_json::Value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        scanner.feed(b"data: {\"type\":\"token_count\",\"rate_limits\":{\"primary\":{\"used_percent\":5}}}\r\n\r\n");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_ceiling_keeps_newest_half_window() {
        let mut scanner = SseScanner::new(|_: &serde_json::Value| {});

        // A single line longer than the ceiling, never terminated
        let chunk = vec![b'x'; 300 * 1024];
        for _ in 0..5 {
            scanner.feed(&chunk);
        }
        assert!(scanner.buffered() <= MAX_BUFFER_BYTES);
        assert!(scanner.buffered() >= KEEP_BYTES.min(chunk.len()));

        // The scanner still works after overflow
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let mut scanner = SseScanner::new(move |_: &serde_json::Value| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        scanner.feed(&vec![b'x'; 2 * 1024 * 1024]);
        scanner.feed(b"\ndata: {\"type\":\"token_count\",\"rate_limits\":{\"primary\":{\"used_percent\":1}}}\n");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
