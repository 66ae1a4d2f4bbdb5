//! Serializes outbound events to a single writer under a mutex (spec.md §4.4).
//!
//! Mirrors the teacher's "one writer behind a lock, one JSON object per
//! line" discipline (`ws/mod.rs`'s `browser_clients` fan-out), simplified to
//! a single stdout sink since there is exactly one editor connection per
//! process here.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::Event;

/// Serializes [`Event`]s to an async writer, one JSON object per line.
/// Cloneable and cheap to share across stream tasks.
pub struct EventWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for EventWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> EventWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Send one event. Concurrent sends never interleave bytes — the whole
    /// line is written while the mutex is held.
    pub async fn send(&self, event: Event) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Phase;
    use std::sync::Arc as StdArc;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl AsyncWrite for SharedBuf {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                let mut guard = match self.0.try_lock() {
                    Ok(g) => g,
                    Err(_) => {
                        cx.waker().wake_by_ref();
                        return std::task::Poll::Pending;
                    }
                };
                guard.extend_from_slice(buf);
                std::task::Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let writer = EventWriter::new(SharedBuf(Arc::clone(&buf)));
        let barrier = StdArc::new(Barrier::new(10));
        let mut handles = Vec::new();
        for i in 0..10 {
            let writer = writer.clone();
            let barrier = StdArc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                writer
                    .send(Event::status(format!("s{i}"), Phase::Booting))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let contents = buf.lock().await;
        let text = String::from_utf8(contents.clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 10);
        for line in lines {
            let _: serde_json::Value = serde_json::from_str(line).expect("self-contained JSON");
        }
    }
}
