//! Window compositor contract
//!
//! The kernel defines the window slot table, the z-order, the per-window
//! event rings and the input routing rules; the desktop program drives a
//! [`Compositor`] instance and registers its entry points into the kapi
//! windowing family. Rendering is deliberately 1-bit -- black on white
//! with a dithered desktop -- composed into a private backbuffer and
//! blitted to the framebuffer once per frame.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::graphics::colors::{BLACK, WHITE};
use crate::graphics::Framebuffer;

/// Window slot capacity.
pub const MAX_WINDOWS: usize = 16;
/// Title length limit in bytes.
pub const MAX_TITLE: usize = 32;
/// Title bar height in pixels (content area starts below it).
pub const TITLE_BAR_HEIGHT: u32 = 20;
/// Per-window event ring capacity.
pub const EVENT_QUEUE_LEN: usize = 32;

/// Mouse button bitmap shared with the HAL.
pub const BUTTON_LEFT: u8 = 1;

/// Window event type codes (ABI: these values cross the kapi boundary).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    None = 0,
    MouseDown = 1,
    MouseUp = 2,
    MouseMove = 3,
    Key = 4,
    Close = 5,
    Focus = 6,
    Unfocus = 7,
    Resize = 8,
}

/// One event as delivered to programs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEvent {
    pub kind: EventType,
    pub data1: i32,
    pub data2: i32,
    pub data3: i32,
}

impl WindowEvent {
    pub const fn new(kind: EventType, data1: i32, data2: i32, data3: i32) -> Self {
        Self {
            kind,
            data1,
            data2,
            data3,
        }
    }
}

const EMPTY_EVENT: WindowEvent = WindowEvent::new(EventType::None, 0, 0, 0);

/// Bounded event queue; a full ring drops the newest event.
struct EventRing {
    events: [WindowEvent; EVENT_QUEUE_LEN],
    head: usize,
    tail: usize,
}

impl EventRing {
    const fn new() -> Self {
        Self {
            events: [EMPTY_EVENT; EVENT_QUEUE_LEN],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, event: WindowEvent) {
        let next = (self.tail + 1) % EVENT_QUEUE_LEN;
        if next == self.head {
            // Full: drop the newest rather than overwrite history.
            return;
        }
        self.events[self.tail] = event;
        self.tail = next;
    }

    fn pop(&mut self) -> Option<WindowEvent> {
        if self.head == self.tail {
            return None;
        }
        let event = self.events[self.head];
        self.head = (self.head + 1) % EVENT_QUEUE_LEN;
        Some(event)
    }
}

/// One window slot: frame geometry (title bar included), title, owned
/// content pixels and the event ring.
pub struct Window {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    title: [u8; MAX_TITLE],
    title_len: usize,
    buffer: Vec<u32>,
    pub dirty: bool,
    events: EventRing,
}

impl Window {
    fn new(x: i32, y: i32, w: u32, h: u32, title: &str) -> Self {
        let mut window = Self {
            x,
            y,
            w,
            h,
            title: [0; MAX_TITLE],
            title_len: 0,
            buffer: vec![WHITE; (w * h.saturating_sub(TITLE_BAR_HEIGHT)) as usize],
            dirty: true,
            events: EventRing::new(),
        };
        window.set_title(title);
        window
    }

    pub fn set_title(&mut self, title: &str) {
        let bytes = title.as_bytes();
        let len = bytes.len().min(MAX_TITLE);
        self.title[..len].copy_from_slice(&bytes[..len]);
        self.title_len = len;
    }

    pub fn title_str(&self) -> &str {
        core::str::from_utf8(&self.title[..self.title_len]).unwrap_or("")
    }

    /// Content area width (same as the frame).
    pub fn content_width(&self) -> u32 {
        self.w
    }

    /// Content area height (frame minus title bar).
    pub fn content_height(&self) -> u32 {
        self.h.saturating_sub(TITLE_BAR_HEIGHT)
    }

    fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.w as i32 && y < self.y + self.h as i32
    }

    fn in_title_bar(&self, y: i32) -> bool {
        y < self.y + TITLE_BAR_HEIGHT as i32
    }

    /// The close box is a square at the top-left of the title bar.
    fn in_close_box(&self, x: i32, y: i32) -> bool {
        self.in_title_bar(y) && x < self.x + TITLE_BAR_HEIGHT as i32
    }
}

/// Window id handed to programs (slot index).
pub type WindowId = usize;

/// The compositor state machine.
pub struct Compositor {
    slots: [Option<Window>; MAX_WINDOWS],
    /// Slot indices, index 0 topmost.
    z_order: Vec<WindowId>,
    focused: Option<WindowId>,
    screen_w: u32,
    screen_h: u32,
    backbuffer: Vec<u32>,
    drag: Option<(WindowId, i32, i32)>,
    prev_buttons: u8,
}

impl Compositor {
    pub fn new(screen_w: u32, screen_h: u32) -> Self {
        Self {
            slots: [const { None }; MAX_WINDOWS],
            z_order: Vec::new(),
            focused: None,
            screen_w,
            screen_h,
            backbuffer: vec![BLACK; (screen_w * screen_h) as usize],
            drag: None,
            prev_buttons: 0,
        }
    }

    // -----------------------------------------------------------------
    // Window lifecycle
    // -----------------------------------------------------------------

    /// Claim the first free slot: the window comes up topmost and
    /// focused, with a white content buffer.
    pub fn create(&mut self, x: i32, y: i32, w: u32, h: u32, title: &str) -> Option<WindowId> {
        let id = self.slots.iter().position(|s| s.is_none())?;
        self.slots[id] = Some(Window::new(x, y, w, h, title));
        self.z_order.insert(0, id);
        self.set_focus(Some(id));
        Some(id)
    }

    /// Vacate a slot; focus falls to the new topmost window.
    pub fn destroy(&mut self, id: WindowId) {
        if self.slots.get(id).map_or(true, |s| s.is_none()) {
            return;
        }
        self.slots[id] = None;
        self.z_order.retain(|&w| w != id);
        if self.drag.map_or(false, |(d, _, _)| d == id) {
            self.drag = None;
        }
        if self.focused == Some(id) {
            self.focused = None;
            let top = self.z_order.first().copied();
            self.set_focus(top);
        }
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.slots.get(id)?.as_ref()
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// The window's content pixels and their dimensions.
    pub fn buffer_mut(&mut self, id: WindowId) -> Option<(&mut [u32], u32, u32)> {
        let window = self.slots.get_mut(id)?.as_mut()?;
        let (w, h) = (window.content_width(), window.content_height());
        Some((&mut window.buffer, w, h))
    }

    /// Pop one pending event.
    pub fn poll_event(&mut self, id: WindowId) -> Option<WindowEvent> {
        self.window_mut(id)?.events.pop()
    }

    /// Mark a window's content changed; the paint cycle coalesces
    /// invalidations.
    pub fn invalidate(&mut self, id: WindowId) {
        if let Some(window) = self.window_mut(id) {
            window.dirty = true;
        }
    }

    pub fn focused(&self) -> Option<WindowId> {
        self.focused
    }

    pub fn topmost(&self) -> Option<WindowId> {
        self.z_order.first().copied()
    }

    pub fn window_count(&self) -> usize {
        self.z_order.len()
    }

    fn push_event(&mut self, id: WindowId, event: WindowEvent) {
        if let Some(window) = self.window_mut(id) {
            window.events.push(event);
        }
    }

    fn set_focus(&mut self, id: Option<WindowId>) {
        if self.focused == id {
            return;
        }
        if let Some(old) = self.focused {
            self.push_event(old, WindowEvent::new(EventType::Unfocus, 0, 0, 0));
        }
        self.focused = id;
        if let Some(new) = id {
            self.push_event(new, WindowEvent::new(EventType::Focus, 0, 0, 0));
        }
    }

    /// Raise a window to the top of the z-order and focus it.
    pub fn raise(&mut self, id: WindowId) {
        if self.window(id).is_none() {
            return;
        }
        self.z_order.retain(|&w| w != id);
        self.z_order.insert(0, id);
        self.set_focus(Some(id));
    }

    // -----------------------------------------------------------------
    // Input routing
    // -----------------------------------------------------------------

    /// Topmost window under a screen point.
    fn hit_test(&self, x: i32, y: i32) -> Option<WindowId> {
        self.z_order
            .iter()
            .copied()
            .find(|&id| self.window(id).map_or(false, |w| w.contains(x, y)))
    }

    /// Feed one mouse state sample (screen coordinates + button bitmap).
    pub fn handle_mouse(&mut self, x: i32, y: i32, buttons: u8) {
        let pressed = buttons & BUTTON_LEFT != 0 && self.prev_buttons & BUTTON_LEFT == 0;
        let released = buttons & BUTTON_LEFT == 0 && self.prev_buttons & BUTTON_LEFT != 0;
        self.prev_buttons = buttons;

        if pressed {
            if let Some(id) = self.hit_test(x, y) {
                let (close, title_bar, wx, wy) = {
                    let window = self.window(id).unwrap();
                    (
                        window.in_close_box(x, y),
                        window.in_title_bar(y),
                        window.x,
                        window.y,
                    )
                };
                self.raise(id);
                if close {
                    self.push_event(id, WindowEvent::new(EventType::Close, 0, 0, 0));
                } else if title_bar {
                    self.drag = Some((id, x - wx, y - wy));
                } else {
                    self.push_event(
                        id,
                        WindowEvent::new(
                            EventType::MouseDown,
                            x - wx,
                            y - wy - TITLE_BAR_HEIGHT as i32,
                            buttons as i32,
                        ),
                    );
                }
            }
            return;
        }

        if released {
            self.drag = None;
            if let Some(id) = self.focused {
                if let Some((wx, wy)) = self.window(id).map(|w| (w.x, w.y)) {
                    self.push_event(
                        id,
                        WindowEvent::new(
                            EventType::MouseUp,
                            x - wx,
                            y - wy - TITLE_BAR_HEIGHT as i32,
                            buttons as i32,
                        ),
                    );
                }
            }
            return;
        }

        if let Some((id, dx, dy)) = self.drag {
            // Relocate, clamped so the title bar stays reachable.
            let max_x = (self.screen_w as i32 - 1).max(0);
            let max_y = (self.screen_h as i32 - 1).max(0);
            if let Some(window) = self.window_mut(id) {
                window.x = (x - dx).clamp(-(window.w as i32) + 8, max_x);
                window.y = (y - dy).clamp(0, max_y);
                window.dirty = true;
            }
            return;
        }

        // Plain motion goes to the window under the cursor.
        if let Some(id) = self.hit_test(x, y) {
            let hit = {
                let window = self.window(id).unwrap();
                (!window.in_title_bar(y)).then(|| (window.x, window.y))
            };
            if let Some((wx, wy)) = hit {
                self.push_event(
                    id,
                    WindowEvent::new(
                        EventType::MouseMove,
                        x - wx,
                        y - wy - TITLE_BAR_HEIGHT as i32,
                        buttons as i32,
                    ),
                );
            }
        }
    }

    /// Deliver a key code to the focused window.
    pub fn handle_key(&mut self, code: i32) {
        if let Some(id) = self.focused {
            self.push_event(id, WindowEvent::new(EventType::Key, code, 0, 0));
        }
    }

    // -----------------------------------------------------------------
    // Painting
    // -----------------------------------------------------------------

    fn back_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x < 0 || y < 0 || x >= self.screen_w as i32 || y >= self.screen_h as i32 {
            return;
        }
        self.backbuffer[(y as u32 * self.screen_w + x as u32) as usize] = color;
    }

    /// Compose the full scene into the backbuffer: dithered desktop,
    /// then every window bottom-to-top with border, title bar, close box
    /// and content.
    pub fn compose(&mut self) {
        // Diagonal checkerboard desktop.
        for y in 0..self.screen_h {
            for x in 0..self.screen_w {
                let color = if (x + y) & 1 == 0 { BLACK } else { WHITE };
                self.backbuffer[(y * self.screen_w + x) as usize] = color;
            }
        }

        for &id in self.z_order.clone().iter().rev() {
            self.paint_window(id);
        }
    }

    fn paint_window(&mut self, id: WindowId) {
        // Copy out everything the paint needs so the slot borrow ends
        // before the per-pixel calls.
        let (wx, wy, ww, wh, content, cw, title) = {
            let Some(window) = self.slots.get_mut(id).and_then(|s| s.as_mut()) else {
                return;
            };
            window.dirty = false;
            (
                window.x,
                window.y,
                window.w as i32,
                window.h as i32,
                window.buffer.clone(),
                window.content_width() as i32,
                String::from(window.title_str()),
            )
        };
        let focused = self.focused == Some(id);

        // Frame and title bar background.
        for y in 0..wh {
            for x in 0..ww {
                let border = x == 0 || y == 0 || x == ww - 1 || y == wh - 1;
                let in_title = y < TITLE_BAR_HEIGHT as i32;
                let color = if border {
                    BLACK
                } else if in_title {
                    WHITE
                } else {
                    let cy = y - TITLE_BAR_HEIGHT as i32;
                    *content.get((cy * cw + x) as usize).unwrap_or(&WHITE)
                };
                self.back_pixel(wx + x, wy + y, color);
            }
        }

        // Focused windows get the classic pinstriped title bar.
        if focused {
            for y in (3..TITLE_BAR_HEIGHT as i32 - 3).step_by(2) {
                for x in TITLE_BAR_HEIGHT as i32 + 2..ww - 4 {
                    self.back_pixel(wx + x, wy + y, BLACK);
                }
            }
        }

        // Close box outline at the top-left of the title bar.
        let cb = TITLE_BAR_HEIGHT as i32;
        for y in 0..cb {
            self.back_pixel(wx + cb - 1, wy + y, BLACK);
        }
        for d in 4..cb - 4 {
            self.back_pixel(wx + d, wy + d, BLACK);
        }

        // Title text, centered-ish; drawn over the bar.
        let tx = wx + cb + 6;
        let ty = wy + 2;
        let mut pen = tx;
        for &b in title.as_bytes().iter().take((ww / 8).max(0) as usize) {
            self.draw_back_glyph(pen, ty, b);
            pen += 8;
        }
    }

    fn draw_back_glyph(&mut self, x: i32, y: i32, c: u8) {
        let glyph = &crate::console::font::FONT_8X16[c as usize];
        for (gy, &bits) in glyph.iter().enumerate() {
            for gx in 0..8 {
                if bits & (0x80 >> gx) != 0 {
                    self.back_pixel(x + gx, y + gy as i32, BLACK);
                }
            }
        }
    }

    /// Blit the backbuffer to the framebuffer (one flip per frame).
    pub fn flip(&self, fb: &mut Framebuffer) {
        fb.blit_full(&self.backbuffer);
    }

    /// Raw backbuffer pixels (tests).
    pub fn backbuffer(&self) -> &[u32] {
        &self.backbuffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp() -> Compositor {
        Compositor::new(800, 600)
    }

    #[test]
    fn create_focuses_and_tops() {
        let mut c = comp();
        let a = c.create(10, 10, 200, 150, "first").unwrap();
        let b = c.create(50, 50, 200, 150, "second").unwrap();

        assert_ne!(a, b);
        assert_eq!(c.focused(), Some(b));
        assert_eq!(c.topmost(), Some(b));

        // First window saw focus then unfocus.
        assert_eq!(c.poll_event(a).unwrap().kind, EventType::Focus);
        assert_eq!(c.poll_event(a).unwrap().kind, EventType::Unfocus);
    }

    #[test]
    fn destroy_refocuses_topmost() {
        let mut c = comp();
        let a = c.create(0, 0, 100, 100, "a").unwrap();
        let b = c.create(10, 10, 100, 100, "b").unwrap();

        c.destroy(b);
        assert_eq!(c.focused(), Some(a));
        assert_eq!(c.window_count(), 1);

        c.destroy(a);
        assert_eq!(c.focused(), None);
        assert_eq!(c.window_count(), 0);
    }

    #[test]
    fn slots_are_reused_after_destroy() {
        let mut c = comp();
        let ids: Vec<WindowId> = (0..MAX_WINDOWS)
            .map(|_| c.create(0, 0, 50, 50, "w").unwrap())
            .collect();
        assert!(c.create(0, 0, 50, 50, "overflow").is_none());

        c.destroy(ids[3]);
        let reused = c.create(0, 0, 50, 50, "again").unwrap();
        assert_eq!(reused, ids[3]);
    }

    #[test]
    fn buffer_exposes_content_area_only() {
        let mut c = comp();
        let id = c.create(0, 0, 120, 100, "sized").unwrap();
        let (buf, w, h) = c.buffer_mut(id).unwrap();
        assert_eq!(w, 120);
        assert_eq!(h, 100 - TITLE_BAR_HEIGHT);
        assert_eq!(buf.len(), (120 * (100 - TITLE_BAR_HEIGHT)) as usize);
    }

    #[test]
    fn event_ring_drops_newest_when_full() {
        let mut ring = EventRing::new();
        for i in 0..EVENT_QUEUE_LEN as i32 + 10 {
            ring.push(WindowEvent::new(EventType::Key, i, 0, 0));
        }
        // Capacity is LEN-1 slots; the overflowing events vanished.
        let mut seen = 0;
        let mut last = -1;
        while let Some(e) = ring.pop() {
            assert_eq!(e.data1, last + 1);
            last = e.data1;
            seen += 1;
        }
        assert_eq!(seen, EVENT_QUEUE_LEN - 1);
    }

    #[test]
    fn content_click_delivers_local_coordinates() {
        let mut c = comp();
        let id = c.create(100, 100, 200, 150, "w").unwrap();
        while c.poll_event(id).is_some() {}

        // Click at screen (150, 160): local (50, 60 - title bar).
        c.handle_mouse(150, 160, BUTTON_LEFT);
        let event = c.poll_event(id).unwrap();
        assert_eq!(event.kind, EventType::MouseDown);
        assert_eq!(event.data1, 50);
        assert_eq!(event.data2, 160 - 100 - TITLE_BAR_HEIGHT as i32);

        c.handle_mouse(150, 160, 0);
        assert_eq!(c.poll_event(id).unwrap().kind, EventType::MouseUp);
    }

    #[test]
    fn close_box_click_emits_close() {
        let mut c = comp();
        let id = c.create(100, 100, 200, 150, "w").unwrap();
        while c.poll_event(id).is_some() {}

        c.handle_mouse(105, 105, BUTTON_LEFT);
        assert_eq!(c.poll_event(id).unwrap().kind, EventType::Close);
    }

    #[test]
    fn title_bar_drag_moves_and_clamps() {
        let mut c = comp();
        let id = c.create(100, 100, 200, 150, "w").unwrap();

        // Grab the title bar right of the close box, drag.
        c.handle_mouse(150, 105, BUTTON_LEFT);
        c.handle_mouse(250, 205, BUTTON_LEFT);
        {
            let w = c.window(id).unwrap();
            assert_eq!((w.x, w.y), (200, 200));
        }

        // Dragging far up-left clamps to the screen.
        c.handle_mouse(-500, -500, BUTTON_LEFT);
        {
            let w = c.window(id).unwrap();
            assert!(w.y >= 0);
            assert!(w.x >= -(w.w as i32) + 8);
        }
        c.handle_mouse(0, 0, 0);
    }

    #[test]
    fn clicking_raises_and_refocuses() {
        let mut c = comp();
        let a = c.create(0, 0, 200, 200, "a").unwrap();
        let b = c.create(300, 300, 200, 200, "b").unwrap();
        assert_eq!(c.topmost(), Some(b));

        c.handle_mouse(100, 100, BUTTON_LEFT);
        assert_eq!(c.topmost(), Some(a));
        assert_eq!(c.focused(), Some(a));
        c.handle_mouse(100, 100, 0);
    }

    #[test]
    fn keys_go_to_the_focused_window() {
        let mut c = comp();
        let a = c.create(0, 0, 100, 100, "a").unwrap();
        let b = c.create(200, 200, 100, 100, "b").unwrap();
        while c.poll_event(a).is_some() {}
        while c.poll_event(b).is_some() {}

        c.handle_key(0x41);
        assert!(c.poll_event(a).is_none());
        let event = c.poll_event(b).unwrap();
        assert_eq!(event.kind, EventType::Key);
        assert_eq!(event.data1, 0x41);
    }

    #[test]
    fn compose_paints_windows_over_desktop() {
        let mut c = comp();
        let id = c.create(10, 10, 100, 80, "paint").unwrap();
        {
            let (buf, _, _) = c.buffer_mut(id).unwrap();
            buf.fill(WHITE);
        }
        c.compose();

        // Content pixel inside the window is white.
        let px = |x: u32, y: u32| c.backbuffer()[(y * 800 + x) as usize];
        assert_eq!(px(60, 50), WHITE);
        // Border pixel is black.
        assert_eq!(px(10, 10), BLACK);
        // Desktop outside is the dither pattern.
        assert_eq!(px(500, 500), if (500 + 500) & 1 == 0 { BLACK } else { WHITE });
        // Window is no longer dirty after a paint.
        assert!(!c.window(id).unwrap().dirty);
    }
}
