//! Framebuffer text console
//!
//! A fixed character grid over the HAL framebuffer using the 8x16
//! bitmap font. Until a framebuffer is available (or when the platform
//! has none) console output falls back to the serial port, so early
//! boot messages are never lost.

pub mod font;

use core::fmt;

use spin::Mutex;

use crate::graphics::{colors, Framebuffer};
use font::{FONT_HEIGHT, FONT_WIDTH};

/// Console state over a framebuffer surface.
pub struct Console {
    fb: Framebuffer,
    rows: u32,
    cols: u32,
    cursor_row: u32,
    cursor_col: u32,
    fg: u32,
    bg: u32,
}

impl Console {
    pub fn new(fb: Framebuffer) -> Self {
        Self {
            rows: fb.height() / FONT_HEIGHT as u32,
            cols: fb.width() / FONT_WIDTH as u32,
            fb,
            cursor_row: 0,
            cursor_col: 0,
            fg: colors::WHITE,
            bg: colors::BLACK,
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn cursor(&self) -> (u32, u32) {
        (self.cursor_row, self.cursor_col)
    }

    pub fn set_cursor(&mut self, row: u32, col: u32) {
        if row < self.rows {
            self.cursor_row = row;
        }
        if col < self.cols {
            self.cursor_col = col;
        }
    }

    pub fn set_color(&mut self, fg: u32, bg: u32) {
        self.fg = fg;
        self.bg = bg;
    }

    fn draw_at_cursor(&mut self, c: u8) {
        let x = self.cursor_col * FONT_WIDTH as u32;
        let y = self.cursor_row * FONT_HEIGHT as u32;
        self.fb.draw_char(x, y, c, self.fg, self.bg);
    }

    fn newline(&mut self) {
        self.cursor_col = 0;
        self.cursor_row += 1;
        if self.cursor_row >= self.rows {
            self.fb.scroll_up(FONT_HEIGHT as u32, self.bg);
            self.cursor_row = self.rows - 1;
        }
    }

    /// Put one character, interpreting LF, CR, TAB and BS. Printable
    /// ASCII is blitted and advances the cursor; everything else is
    /// dropped.
    pub fn put_char(&mut self, c: u8) {
        match c {
            b'\n' => self.newline(),
            b'\r' => self.cursor_col = 0,
            b'\t' => {
                // Advance to the next multiple of 8 columns.
                self.cursor_col = (self.cursor_col + 8) & !7;
                if self.cursor_col >= self.cols {
                    self.newline();
                }
            }
            0x08 => {
                if self.cursor_col > 0 {
                    self.cursor_col -= 1;
                    self.draw_at_cursor(b' ');
                }
            }
            0x20..=0x7E => {
                self.draw_at_cursor(c);
                self.cursor_col += 1;
                if self.cursor_col >= self.cols {
                    self.newline();
                }
            }
            _ => {}
        }
    }

    pub fn put_str(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.put_char(b);
        }
    }

    /// Clear the surface to the background color and home the cursor.
    pub fn clear(&mut self) {
        self.fb.clear(self.bg);
        self.cursor_row = 0;
        self.cursor_col = 0;
    }

    /// The underlying surface (shared with the kapi framebuffer family).
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.fb
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_str(s);
        Ok(())
    }
}

static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

/// Attach the global console to a framebuffer.
pub fn init(fb: Framebuffer) {
    *CONSOLE.lock() = Some(Console::new(fb));
}

/// Run `f` against the global console, if one is attached.
pub fn with_console<R>(f: impl FnOnce(&mut Console) -> R) -> Option<R> {
    CONSOLE.lock().as_mut().map(f)
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Everything the kernel prints is mirrored to serial, so QEMU's
    // -serial stdio shows the same transcript as the screen.
    crate::hal::serial::_print(args);
    if let Some(console) = CONSOLE.lock().as_mut() {
        let _ = fmt::Write::write_fmt(console, args);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    fn console(w: u32, h: u32) -> (Vec<u32>, Console) {
        let mut buf = vec![0u32; (w * h) as usize];
        let fb = unsafe { Framebuffer::from_raw(buf.as_mut_ptr(), w, h, w * 4) };
        (buf, Console::new(fb))
    }

    fn cell_matches_glyph(c: &Console, row: u32, col: u32, glyph: u8) -> bool {
        let x0 = col * FONT_WIDTH as u32;
        let y0 = row * FONT_HEIGHT as u32;
        let bitmap = &font::FONT_8X16[glyph as usize];
        for (gy, &bits) in bitmap.iter().enumerate() {
            for gx in 0..FONT_WIDTH {
                let lit = bits & (0x80 >> gx) != 0;
                let px = c.fb.pixel(x0 + gx as u32, y0 + gy as u32);
                if lit != (px == colors::WHITE) {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn grid_derives_from_font_size() {
        let (_buf, c) = console(800, 600);
        assert_eq!(c.cols(), 100);
        assert_eq!(c.rows(), 37);
    }

    #[test]
    fn printable_advances_and_wraps() {
        let (_buf, mut c) = console(128, 64); // 16 cols x 4 rows
        for _ in 0..17 {
            c.put_char(b'x');
        }
        // 16 chars fill row 0, the 17th wraps.
        assert_eq!(c.cursor(), (1, 1));
    }

    #[test]
    fn carriage_return_overstrikes() {
        let (_buf, mut c) = console(128, 64);
        c.put_str("AB\rC");
        assert!(cell_matches_glyph(&c, 0, 0, b'C'));
        assert!(cell_matches_glyph(&c, 0, 1, b'B'));
        assert_eq!(c.cursor(), (0, 1));
    }

    #[test]
    fn tab_advances_to_multiple_of_eight() {
        let (_buf, mut c) = console(128, 64); // 16 cols
        c.put_char(b'A');
        c.put_char(b'\t');
        assert_eq!(c.cursor(), (0, 8));
        // A second tab runs past the right edge and wraps.
        c.put_char(b'\t');
        assert_eq!(c.cursor(), (1, 0));
    }

    #[test]
    fn backspace_erases_previous_cell(){
        let (_buf, mut c) = console(128, 64);
        c.put_char(b'A');
        c.put_char(0x08);
        assert_eq!(c.cursor(), (0, 0));
        assert!(cell_matches_glyph(&c, 0, 0, b' '));
    }

    #[test]
    fn overflow_scrolls_and_clear_restores_origin() {
        let (_buf, mut c) = console(128, 64); // 4 rows
        let rows = c.rows();
        for _ in 0..rows + 1 {
            c.put_str("A\n");
        }
        // The top row still shows an 'A' and the cursor sits on the
        // last row.
        assert!(cell_matches_glyph(&c, 0, 0, b'A'));
        assert_eq!(c.cursor().0, rows - 1);

        c.clear();
        assert_eq!(c.cursor(), (0, 0));
        assert!(cell_matches_glyph(&c, 0, 0, b' '));
    }
}
