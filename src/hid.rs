//! HID input handler (spec.md §4.11).
//!
//! Converts normalised (0..1) coordinates to pixels using the cached screen
//! size and drives the companion's touch/text surface. Each input kind runs
//! in its own spawned worker so a slow HID call never blocks the stream's
//! command loop, mirroring the teacher's "never hold a mutex across a
//! subprocess or network call" discipline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::wire::InputParams;

/// ≈60 Hz: touchMove events closer together than this are dropped.
const MOVE_THROTTLE: Duration = Duration::from_millis(16);

/// Client-side boundary for the companion's HID surface (spec.md §3 item 14).
#[async_trait]
pub trait HidClient: Send + Sync {
    async fn tap(&self, x: u32, y: u32) -> anyhow::Result<()>;
    async fn swipe(&self, from: (u32, u32), to: (u32, u32), duration: Duration) -> anyhow::Result<()>;
    async fn text(&self, value: &str) -> anyhow::Result<()>;
    async fn open_touch_stream(&self, at: (u32, u32)) -> anyhow::Result<Box<dyn TouchStream>>;
}

#[async_trait]
pub trait TouchStream: Send {
    async fn move_to(&mut self, x: u32, y: u32) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

pub const DEFAULT_SWIPE_DURATION: Duration = Duration::from_millis(500);

struct ActiveTouch {
    stream: Box<dyn TouchStream>,
    last_move: Instant,
}

/// A nil `client` (no companion yet ready) makes every method a silent
/// no-op rather than a crash (spec.md §4.11).
pub struct HidHandler {
    client: Option<Arc<dyn HidClient>>,
    screen_size: (u32, u32),
    active_touch: Mutex<Option<ActiveTouch>>,
}

impl HidHandler {
    pub fn new(client: Option<Arc<dyn HidClient>>, screen_size: (u32, u32)) -> Self {
        Self {
            client,
            screen_size,
            active_touch: Mutex::new(None),
        }
    }

    fn to_pixels(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        let (w, h) = self.screen_size;
        if w == 0 || h == 0 {
            return None;
        }
        Some(((x * w as f64) as u32, (y * h as f64) as u32))
    }

    pub async fn handle(self: &Arc<Self>, input: InputParams) {
        let Some(client) = self.client.clone() else {
            return;
        };

        match input {
            InputParams::Text { value } => {
                tokio::spawn(async move {
                    if let Err(e) = client.text(&value).await {
                        warn!(error = %e, "hid text input failed");
                    }
                });
            }
            InputParams::TouchDown { x, y } => {
                let Some(point) = self.to_pixels(x, y) else {
                    return;
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.touch_down(client, point).await;
                });
            }
            InputParams::TouchMove { x, y } => {
                let Some(point) = self.to_pixels(x, y) else {
                    return;
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.touch_move(point).await;
                });
            }
            InputParams::TouchUp { .. } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.touch_up().await;
                });
            }
            InputParams::Tap { x, y } => {
                let Some(point) = self.to_pixels(x, y) else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = client.tap(point.0, point.1).await {
                        warn!(error = %e, "hid tap failed");
                    }
                });
            }
            InputParams::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => {
                let (Some(from), Some(to)) = (self.to_pixels(from_x, from_y), self.to_pixels(to_x, to_y)) else {
                    return;
                };
                let duration = duration_ms.map(Duration::from_millis).unwrap_or(DEFAULT_SWIPE_DURATION);
                tokio::spawn(async move {
                    if let Err(e) = client.swipe(from, to, duration).await {
                        warn!(error = %e, "hid swipe failed");
                    }
                });
            }
        }
    }

    async fn touch_down(&self, client: Arc<dyn HidClient>, point: (u32, u32)) {
        let mut stream = match client.open_touch_stream(point).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "touchDown stream open failed");
                return;
            }
        };

        if let Err(e) = stream.move_to(point.0, point.1).await {
            warn!(error = %e, "touchDown initial move failed; closing stream");
            let _ = stream.close().await;
            return;
        }

        *self.active_touch.lock().await = Some(ActiveTouch {
            stream,
            last_move: Instant::now(),
        });
    }

    async fn touch_move(&self, point: (u32, u32)) {
        let mut active = self.active_touch.lock().await;
        let Some(touch) = active.as_mut() else {
            return;
        };
        if touch.last_move.elapsed() < MOVE_THROTTLE {
            return;
        }
        if let Err(e) = touch.stream.move_to(point.0, point.1).await {
            warn!(error = %e, "touchMove failed");
            return;
        }
        touch.last_move = Instant::now();
    }

    async fn touch_up(&self) {
        let mut active = self.active_touch.lock().await;
        if let Some(mut touch) = active.take() {
            let _ = touch.stream.close().await;
        }
    }
}
