//! Popup control: geometry and streaming.
//!
//! The popup surface itself (an overlay window that never takes keyboard
//! focus and is registered capture-exempt) is rendered by an external
//! layer; this module owns everything the daemon decides: where the popup
//! goes relative to the pointer, and how streamed chunks are paced into it.
//!
//! Chunk appends are coalesced to ~30 FPS so a fast worker cannot flood
//! the render layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Vertical offset from the pointer to the popup's top edge.
const POINTER_OFFSET_Y: i32 = 20;

/// Coalescing interval for streamed chunks (~30 FPS).
const CHUNK_FLUSH_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2,
            y: self.y + self.height / 2,
        }
    }
}

/// Place the popup near the pointer: 20 px below, flipped above when it
/// would cross the work-area bottom, shifted horizontally to stay inside.
pub fn anchor_popup(pointer: Point, popup: Size, work_area: Rect) -> Point {
    let mut y = pointer.y + POINTER_OFFSET_Y;
    if y + popup.height > work_area.bottom() {
        y = pointer.y - POINTER_OFFSET_Y - popup.height;
    }
    let y = y.max(work_area.y);

    let mut x = pointer.x;
    if x + popup.width > work_area.right() {
        x = work_area.right() - popup.width;
    }
    let x = x.max(work_area.x);

    Point { x, y }
}

/// Rendering surface contract. The implementation lives outside the
/// daemon (overlay process / UI shell); tests record calls.
pub trait PopupSink: Send + Sync + 'static {
    fn show_stream_at(&self, pos: Point);
    fn append(&self, text: &str);
    fn end_stream(&self);
    fn show_complete(&self, text: &str, pos: Point);
    fn show_error(&self, message: &str);
    fn hide(&self);
    /// Focusable variant: the user types a vision instruction into it.
    fn show_vision_prompt(&self);
    /// Coding-mode explanation window, streamed separately.
    fn append_explanation(&self, text: &str);
    fn end_explanation(&self);
    fn toggle_overlay(&self);
}

/// A sink that drops everything (headless operation, tests).
pub struct NullSink;

impl PopupSink for NullSink {
    fn show_stream_at(&self, _pos: Point) {}
    fn append(&self, _text: &str) {}
    fn end_stream(&self) {}
    fn show_complete(&self, _text: &str, _pos: Point) {}
    fn show_error(&self, _message: &str) {}
    fn hide(&self) {}
    fn show_vision_prompt(&self) {}
    fn append_explanation(&self, _text: &str) {}
    fn end_explanation(&self) {}
    fn toggle_overlay(&self) {}
}

/// Positions, shows, updates, and hides the popup surfaces.
pub struct PopupController {
    sink: Arc<dyn PopupSink>,
    work_area: Rect,
    popup_size: Size,
    pending: Arc<Mutex<String>>,
    pending_explanation: Arc<Mutex<String>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl PopupController {
    pub fn new(sink: Arc<dyn PopupSink>, work_area: Rect, popup_size: Size) -> Arc<Self> {
        let controller = Arc::new(Self {
            sink,
            work_area,
            popup_size,
            pending: Arc::new(Mutex::new(String::new())),
            pending_explanation: Arc::new(Mutex::new(String::new())),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        });
        Self::spawn_coalescer(&controller);
        controller
    }

    /// Compute the anchored position for a pointer reading; a missing
    /// pointer centers the popup in the work area.
    pub fn position_for(&self, pointer: Option<Point>) -> Point {
        let pointer = pointer.unwrap_or_else(|| self.work_area.center());
        anchor_popup(pointer, self.popup_size, self.work_area)
    }

    pub fn show_streaming(&self, pointer: Option<Point>) {
        self.sink.show_stream_at(self.position_for(pointer));
    }

    pub fn append_chunk(&self, text: &str) {
        self.pending.lock().unwrap().push_str(text);
        self.wake.notify_one();
    }

    pub fn end_stream(&self) {
        self.flush_pending();
        self.sink.end_stream();
    }

    pub fn show_complete(&self, text: &str, pointer: Option<Point>) {
        self.sink.show_complete(text, self.position_for(pointer));
    }

    pub fn show_error(&self, message: &str) {
        self.sink.show_error(message);
    }

    pub fn hide(&self) {
        self.pending.lock().unwrap().clear();
        self.pending_explanation.lock().unwrap().clear();
        self.sink.hide();
    }

    pub fn show_vision_prompt(&self) {
        self.sink.show_vision_prompt();
    }

    pub fn append_explanation(&self, text: &str) {
        self.pending_explanation.lock().unwrap().push_str(text);
        self.wake.notify_one();
    }

    pub fn end_explanation(&self) {
        self.flush_pending();
        self.sink.end_explanation();
    }

    pub fn toggle_overlay(&self) {
        self.sink.toggle_overlay();
    }

    /// Push anything buffered straight to the sink. The lock is held across
    /// the sink call so concurrent flushes cannot reorder appends.
    fn flush_pending(&self) {
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.is_empty() {
                let text = std::mem::take(&mut *pending);
                self.sink.append(&text);
            }
        }
        {
            let mut pending = self.pending_explanation.lock().unwrap();
            if !pending.is_empty() {
                let text = std::mem::take(&mut *pending);
                self.sink.append_explanation(&text);
            }
        }
    }

    fn spawn_coalescer(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let cancel = this.cancel.clone();
        let wake = this.wake.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => {}
                }
                // Batch whatever accumulates over one frame.
                tokio::time::sleep(CHUNK_FLUSH_INTERVAL).await;
                let Some(controller) = weak.upgrade() else { break };
                controller.flush_pending();
            }
        });
    }
}

impl Drop for PopupController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
