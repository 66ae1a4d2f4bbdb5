//! Video relay worker (spec.md §4.10).
//!
//! Opens the companion's video stream, drains to the latest queued frame on
//! each tick (frames are independent so only the newest is worth encoding),
//! and emits JPEG-encoded `Frame` events. Retry/backoff follows the same
//! doubling shape the teacher uses for its own reconnect loops, generalized
//! from a fixed step count to the spec's 500ms→5s/5-retry schedule.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::buildlock::CancelToken;
use crate::wire::{Event, EventWriter};

const FPS: u32 = 30;
const SCALE: f64 = 0.5;
const JPEG_QUALITY: u8 = 85;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub rgba: Vec<u8>,
}

/// Client-side boundary for the companion's video surface: one production
/// implementation driving the real gRPC stream, one fake for tests
/// (spec.md §3 item 14).
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Open a raw-RGBA video stream at the given frame rate and scale.
    async fn open(&self, udid: &str, fps: u32, scale: f64) -> anyhow::Result<mpsc::Receiver<anyhow::Result<RawFrame>>>;
}

/// Run the relay until `cancel` fires or retries are exhausted. `failed` is
/// set to `true` only on permanent (retry-exhausted) failure, never on a
/// clean cancellation, so the stream's event loop can tell the two apart and
/// stop the stream with `RuntimeError` only in the former case (spec.md
/// §4.10: "final failure posts to the stream's error channel").
#[allow(clippy::too_many_arguments)]
pub async fn run_relay<W: tokio::io::AsyncWrite + Unpin + Send>(
    source: &dyn VideoSource,
    udid: &str,
    device: &str,
    file: &str,
    stream_id: &str,
    events: &EventWriter<W>,
    screen_aspect: f64,
    cancel: CancelToken,
    failed: watch::Sender<bool>,
) {
    let mut attempt = 0u32;
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut rx = match source.open(udid, FPS, SCALE).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(stream_id, error = %e, "video source open failed");
                match backoff_or_cancel(&mut attempt, &mut backoff, &cancel).await {
                    Backoff::Retry => continue 'reconnect,
                    Backoff::Cancelled => return,
                    Backoff::Exhausted => {
                        let _ = failed.send(true);
                        return;
                    }
                }
            }
        };

        attempt = 0;
        backoff = INITIAL_BACKOFF;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                frame = rx.recv() => frame,
            };

            let Some(result) = received else {
                warn!(stream_id, "video stream closed unexpectedly");
                match backoff_or_cancel(&mut attempt, &mut backoff, &cancel).await {
                    Backoff::Retry => continue 'reconnect,
                    Backoff::Cancelled => return,
                    Backoff::Exhausted => {
                        let _ = failed.send(true);
                        return;
                    }
                }
            };

            let mut frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(stream_id, error = %e, "video stream error");
                    match backoff_or_cancel(&mut attempt, &mut backoff, &cancel).await {
                        Backoff::Retry => continue 'reconnect,
                        Backoff::Cancelled => return,
                        Backoff::Exhausted => {
                            let _ = failed.send(true);
                            return;
                        }
                    }
                }
            };

            while let Ok(Ok(newer)) = rx.try_recv() {
                frame = newer;
            }

            let expected_width = (1000.0 * screen_aspect * SCALE) as u32;
            let Some((width, height)) = detect_dimensions(frame.rgba.len(), expected_width.max(1), screen_aspect) else {
                warn!(stream_id, "could not detect frame dimensions; dropping frame");
                continue;
            };

            match encode_jpeg(&frame.rgba, width, height) {
                Ok(jpeg) => {
                    let data = base64::engine::general_purpose::STANDARD.encode(jpeg);
                    let event = Event::frame(stream_id, device.to_string(), file.to_string(), data);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(stream_id, error = %e, "jpeg encode failed"),
            }
        }
    }
}

enum Backoff {
    Retry,
    Cancelled,
    Exhausted,
}

/// Sleep for the current backoff (racing cancellation), double it up to the
/// cap, and report whether another attempt should be made.
async fn backoff_or_cancel(attempt: &mut u32, backoff: &mut Duration, cancel: &CancelToken) -> Backoff {
    *attempt += 1;
    if *attempt > MAX_RETRIES {
        return Backoff::Exhausted;
    }
    tokio::select! {
        _ = tokio::time::sleep(*backoff) => {}
        _ = cancel.cancelled() => return Backoff::Cancelled,
    }
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    Backoff::Retry
}

/// Search for a `(width, height)` pair whose aspect ratio matches the
/// screen's within 5%, scanning widths within ±20px of the expected value
/// (spec.md §4.10).
fn detect_dimensions(byte_len: usize, expected_width: u32, screen_aspect: f64) -> Option<(u32, u32)> {
    let pixels = byte_len / 4;
    let lo = expected_width.saturating_sub(20).max(1);
    let hi = expected_width + 20;
    for width in lo..=hi {
        if !pixels.is_multiple_of(width as usize) {
            continue;
        }
        let height = pixels / width as usize;
        if height == 0 {
            continue;
        }
        let aspect = width as f64 / height as f64;
        if ((aspect - screen_aspect).abs() / screen_aspect) <= 0.05 {
            return Some((width, height as u32));
        }
    }
    None
}

fn encode_jpeg(rgba: &[u8], width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let image = image::RgbaImage::from_raw(width, height, rgba.to_vec())
        .ok_or_else(|| anyhow::anyhow!("frame buffer does not match detected dimensions"))?;
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(&image::DynamicImage::ImageRgba8(image))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dimensions_near_expected_width() {
        let (w, h) = (390u32, 844u32);
        let aspect = w as f64 / h as f64;
        let buf_len = (w * h * 4) as usize;
        let detected = detect_dimensions(buf_len, w - 5, aspect).unwrap();
        assert_eq!(detected, (w, h));
    }

    #[test]
    fn rejects_dimensions_outside_tolerance() {
        // A buffer that only factors into aspect ratios far from the screen's.
        let detected = detect_dimensions(4 * 7, 100, 390.0 / 844.0);
        assert!(detected.is_none());
    }

    #[test]
    fn encodes_solid_frame_to_jpeg() {
        let rgba = vec![255u8; 4 * 4 * 4];
        let jpeg = encode_jpeg(&rgba, 4, 4).unwrap();
        assert!(!jpeg.is_empty());
    }

    struct AlwaysFailsSource;

    #[async_trait]
    impl VideoSource for AlwaysFailsSource {
        async fn open(&self, _udid: &str, _fps: u32, _scale: f64) -> anyhow::Result<mpsc::Receiver<anyhow::Result<RawFrame>>> {
            anyhow::bail!("source unavailable")
        }
    }

    /// A relay cancelled mid-retry must exit quietly, never signaling
    /// permanent failure — only retry exhaustion does that (spec.md §4.10).
    #[tokio::test]
    async fn cancelled_relay_does_not_report_permanent_failure() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let (failed_tx, failed_rx) = watch::channel(false);
        let events: EventWriter<Vec<u8>> = EventWriter::new(Vec::new());

        run_relay(&AlwaysFailsSource, "udid", "device", "/p/V.swift", "s1", &events, 1.0, cancel, failed_tx).await;

        assert!(!*failed_rx.borrow(), "cancellation must not be reported as a permanent relay failure");
    }
}
