//! Kernel API table ("kapi")
//!
//! A `#[repr(C)]` table of function pointers and singleton data handed
//! to every program at entry. Programs call kernel services directly
//! through it -- no traps. The table is populated once at boot and never
//! reallocated; the windowing and stdio-redirection families start null
//! and are filled in through the dedicated install entry points when
//! the desktop and terminal programs come up.

use core::cell::UnsafeCell;
use core::ptr;

use crate::console;
use crate::fs;
use crate::net;
use crate::process;

/// kapi version reported in the table header.
pub const KAPI_VERSION: u32 = 2;

/// The kernel API table. Field order and types are ABI; programs are
/// compiled against this exact layout.
#[repr(C)]
pub struct KernelApi {
    pub version: u32,

    // ---- console I/O ----
    pub putc: Option<unsafe extern "C" fn(u8)>,
    pub puts: Option<unsafe extern "C" fn(*const u8)>,
    pub uart_puts: Option<unsafe extern "C" fn(*const u8)>,
    /// Non-blocking; negative when no input is pending.
    pub getc: Option<unsafe extern "C" fn() -> i32>,
    pub set_color: Option<unsafe extern "C" fn(u32, u32)>,
    pub clear: Option<unsafe extern "C" fn()>,
    pub set_cursor: Option<unsafe extern "C" fn(i32, i32)>,
    pub console_rows: Option<unsafe extern "C" fn() -> i32>,
    pub console_cols: Option<unsafe extern "C" fn() -> i32>,

    // ---- keyboard ----
    pub has_key: Option<unsafe extern "C" fn() -> i32>,

    // ---- memory ----
    pub malloc: Option<unsafe extern "C" fn(usize) -> *mut u8>,
    pub free: Option<unsafe extern "C" fn(*mut u8)>,
    pub realloc: Option<unsafe extern "C" fn(*mut u8, usize) -> *mut u8>,
    pub calloc: Option<unsafe extern "C" fn(usize, usize) -> *mut u8>,

    // ---- filesystem (path-based, NUL-terminated paths) ----
    pub fs_read: Option<unsafe extern "C" fn(*const u8, *mut u8, usize) -> i32>,
    pub fs_write: Option<unsafe extern "C" fn(*const u8, *const u8, usize) -> i32>,
    pub fs_size: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub fs_is_dir: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub fs_create: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub fs_mkdir: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub fs_delete: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub fs_rename: Option<unsafe extern "C" fn(*const u8, *const u8) -> i32>,
    /// Fetch directory entry `index`; fills name/type/size outputs.
    /// Returns 1 on success, 0 past the end, negative on error.
    pub fs_readdir:
        Option<unsafe extern "C" fn(*const u8, i32, *mut u8, usize, *mut i32, *mut u32) -> i32>,

    // ---- process control ----
    pub exit: Option<unsafe extern "C" fn(i32) -> !>,
    pub exec: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub exec_args: Option<unsafe extern "C" fn(*const u8, i32, *const *const u8) -> i32>,
    pub spawn: Option<unsafe extern "C" fn(*const u8) -> i32>,
    pub yield_: Option<unsafe extern "C" fn()>,

    // ---- framebuffer ----
    pub fb_base: *mut u32,
    pub fb_width: u32,
    pub fb_height: u32,
    pub fb_put_pixel: Option<unsafe extern "C" fn(u32, u32, u32)>,
    pub fb_fill_rect: Option<unsafe extern "C" fn(u32, u32, u32, u32, u32)>,
    pub fb_draw_char: Option<unsafe extern "C" fn(u32, u32, u8, u32, u32)>,
    pub fb_draw_string: Option<unsafe extern "C" fn(u32, u32, *const u8, u32, u32)>,
    /// 256 glyphs x 16 bytes (8x16 bitmap font).
    pub font_data: *const u8,

    // ---- mouse ----
    pub mouse_get_pos: Option<unsafe extern "C" fn(*mut i32, *mut i32)>,
    pub mouse_get_buttons: Option<unsafe extern "C" fn() -> u8>,
    pub mouse_poll: Option<unsafe extern "C" fn()>,

    // ---- windowing (installed by the desktop, initially null) ----
    pub window_create: Option<unsafe extern "C" fn(i32, i32, i32, i32, *const u8) -> i32>,
    pub window_destroy: Option<unsafe extern "C" fn(i32)>,
    pub window_get_buffer: Option<unsafe extern "C" fn(i32, *mut i32, *mut i32) -> *mut u32>,
    pub window_poll_event:
        Option<unsafe extern "C" fn(i32, *mut i32, *mut i32, *mut i32, *mut i32) -> i32>,
    pub window_invalidate: Option<unsafe extern "C" fn(i32)>,
    pub window_set_title: Option<unsafe extern "C" fn(i32, *const u8)>,

    // ---- stdio redirection (installed by the terminal, initially null) ----
    pub stdio_putc: Option<unsafe extern "C" fn(u8)>,
    pub stdio_puts: Option<unsafe extern "C" fn(*const u8)>,
    /// Non-blocking; negative when no input is pending (contractual).
    pub stdio_getc: Option<unsafe extern "C" fn() -> i32>,
    pub stdio_has_key: Option<unsafe extern "C" fn() -> i32>,

    // ---- system info ----
    pub get_uptime_ticks: Option<unsafe extern "C" fn() -> u64>,
    pub get_ram_size: Option<unsafe extern "C" fn() -> u64>,
    pub mem_used: Option<unsafe extern "C" fn() -> usize>,
    pub mem_free: Option<unsafe extern "C" fn() -> usize>,
    pub proc_pid: Option<unsafe extern "C" fn() -> i32>,
    pub proc_name: Option<unsafe extern "C" fn(*mut u8, usize) -> i32>,

    // ---- disk info ----
    pub disk_total_kb: Option<unsafe extern "C" fn() -> u32>,
    pub disk_free_kb: Option<unsafe extern "C" fn() -> u32>,

    // ---- RTC ----
    /// Seconds since the epoch; 0 when no RTC is present.
    pub rtc_read: Option<unsafe extern "C" fn() -> u64>,

    // ---- timing ----
    pub sleep_ms: Option<unsafe extern "C" fn(u32)>,
    pub time_us: Option<unsafe extern "C" fn() -> u64>,

    // ---- sound (null without an audio device) ----
    pub sound_play: Option<unsafe extern "C" fn(*const i16, usize, u32) -> i32>,
    pub sound_stop: Option<unsafe extern "C" fn()>,

    // ---- networking ----
    pub net_get_ip: Option<unsafe extern "C" fn() -> u32>,
    pub net_get_mac: Option<unsafe extern "C" fn(*mut u8)>,
    pub net_poll: Option<unsafe extern "C" fn()>,
    /// 0 on success, negative on timeout.
    pub net_ping: Option<unsafe extern "C" fn(u32, u16, u32) -> i32>,
    pub ip_send: Option<unsafe extern "C" fn(u32, u8, *const u8, usize) -> i32>,
    // Higher protocols are collaborator hooks, null until installed.
    pub dns_lookup: Option<unsafe extern "C" fn(*const u8, *mut u32) -> i32>,
    pub tcp_connect: Option<unsafe extern "C" fn(u32, u16) -> i32>,
    pub tcp_send: Option<unsafe extern "C" fn(i32, *const u8, usize) -> i32>,
    pub tcp_recv: Option<unsafe extern "C" fn(i32, *mut u8, usize) -> i32>,
    pub tcp_close: Option<unsafe extern "C" fn(i32)>,
    pub tls_connect: Option<unsafe extern "C" fn(u32, u16, *const u8) -> i32>,
    pub tls_send: Option<unsafe extern "C" fn(i32, *const u8, usize) -> i32>,
    pub tls_recv: Option<unsafe extern "C" fn(i32, *mut u8, usize) -> i32>,
    pub tls_close: Option<unsafe extern "C" fn(i32)>,

    // ---- TrueType rasterizer hook (null; bitmap font fallback) ----
    pub ttf_draw_string: Option<unsafe extern "C" fn(u32, u32, *const u8, u32, u32, u32) -> i32>,

    // ---- GPIO LED ----
    pub led_on: Option<unsafe extern "C" fn()>,
    pub led_off: Option<unsafe extern "C" fn()>,
    pub led_toggle: Option<unsafe extern "C" fn()>,
}

impl KernelApi {
    const fn empty() -> Self {
        Self {
            version: 0,
            putc: None,
            puts: None,
            uart_puts: None,
            getc: None,
            set_color: None,
            clear: None,
            set_cursor: None,
            console_rows: None,
            console_cols: None,
            has_key: None,
            malloc: None,
            free: None,
            realloc: None,
            calloc: None,
            fs_read: None,
            fs_write: None,
            fs_size: None,
            fs_is_dir: None,
            fs_create: None,
            fs_mkdir: None,
            fs_delete: None,
            fs_rename: None,
            fs_readdir: None,
            exit: None,
            exec: None,
            exec_args: None,
            spawn: None,
            yield_: None,
            fb_base: ptr::null_mut(),
            fb_width: 0,
            fb_height: 0,
            fb_put_pixel: None,
            fb_fill_rect: None,
            fb_draw_char: None,
            fb_draw_string: None,
            font_data: ptr::null(),
            mouse_get_pos: None,
            mouse_get_buttons: None,
            mouse_poll: None,
            window_create: None,
            window_destroy: None,
            window_get_buffer: None,
            window_poll_event: None,
            window_invalidate: None,
            window_set_title: None,
            stdio_putc: None,
            stdio_puts: None,
            stdio_getc: None,
            stdio_has_key: None,
            get_uptime_ticks: None,
            get_ram_size: None,
            mem_used: None,
            mem_free: None,
            proc_pid: None,
            proc_name: None,
            disk_total_kb: None,
            disk_free_kb: None,
            rtc_read: None,
            sleep_ms: None,
            time_us: None,
            sound_play: None,
            sound_stop: None,
            net_get_ip: None,
            net_get_mac: None,
            net_poll: None,
            net_ping: None,
            ip_send: None,
            dns_lookup: None,
            tcp_connect: None,
            tcp_send: None,
            tcp_recv: None,
            tcp_close: None,
            tls_connect: None,
            tls_send: None,
            tls_recv: None,
            tls_close: None,
            ttf_draw_string: None,
            led_on: None,
            led_off: None,
            led_toggle: None,
        }
    }
}

struct KapiCell(UnsafeCell<KernelApi>);

// SAFETY: the table is written during single-threaded boot and by the
// install entry points; programs only read it. Never touched from IRQ
// handlers.
unsafe impl Sync for KapiCell {}

static KAPI: KapiCell = KapiCell(UnsafeCell::new(KernelApi::empty()));

/// The pointer handed to every program. Valid for the machine's
/// lifetime.
pub fn table_ptr() -> *mut KernelApi {
    KAPI.0.get()
}

fn table_mut() -> &'static mut KernelApi {
    // SAFETY: see KapiCell -- all mutation happens outside IRQ context
    // in the single-threaded kernel.
    unsafe { &mut *KAPI.0.get() }
}

fn table() -> &'static KernelApi {
    // SAFETY: as above.
    unsafe { &*KAPI.0.get() }
}

// ---------------------------------------------------------------------
// C-string helpers
// ---------------------------------------------------------------------

/// Borrow a NUL-terminated C string as `&str` (lossy on bad UTF-8
/// returns None).
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated byte string.
unsafe fn cstr<'a>(ptr: *const u8) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    // SAFETY: caller guarantees NUL termination.
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    // SAFETY: the range [ptr, ptr+len) was just walked.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    core::str::from_utf8(bytes).ok()
}

/// Copy a string into a caller buffer with NUL termination.
unsafe fn fill_cstr(out: *mut u8, cap: usize, s: &str) {
    if out.is_null() || cap == 0 {
        return;
    }
    let n = s.len().min(cap - 1);
    // SAFETY: caller provides `cap` writable bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(s.as_ptr(), out, n);
        *out.add(n) = 0;
    }
}

// ---------------------------------------------------------------------
// Console family (queries the stdio hooks first, per the redirection
// contract)
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_putc(c: u8) {
    if let Some(hook) = table().stdio_putc {
        // SAFETY: hook installed through install_stdio_hooks.
        unsafe { hook(c) };
        return;
    }
    let _ = console::with_console(|con| con.put_char(c));
}

unsafe extern "C" fn kapi_puts(s: *const u8) {
    if let Some(hook) = table().stdio_puts {
        // SAFETY: hook installed through install_stdio_hooks.
        unsafe { hook(s) };
        return;
    }
    // SAFETY: kapi contract -- NUL-terminated string.
    if let Some(text) = unsafe { cstr(s) } {
        let _ = console::with_console(|con| con.put_str(text));
    }
}

unsafe extern "C" fn kapi_uart_puts(s: *const u8) {
    // SAFETY: kapi contract -- NUL-terminated string.
    if let Some(text) = unsafe { cstr(s) } {
        serial_print!("{}", text);
    }
}

unsafe extern "C" fn kapi_getc() -> i32 {
    if let Some(hook) = table().stdio_getc {
        // SAFETY: hook installed through install_stdio_hooks.
        return unsafe { hook() };
    }
    crate::hal::keyboard_getc().map_or(-1, |k| k as i32)
}

unsafe extern "C" fn kapi_has_key() -> i32 {
    if let Some(hook) = table().stdio_has_key {
        // SAFETY: hook installed through install_stdio_hooks.
        return unsafe { hook() };
    }
    crate::hal::keyboard_has_key() as i32
}

unsafe extern "C" fn kapi_set_color(fg: u32, bg: u32) {
    let _ = console::with_console(|con| con.set_color(fg, bg));
}

unsafe extern "C" fn kapi_clear() {
    let _ = console::with_console(|con| con.clear());
}

unsafe extern "C" fn kapi_set_cursor(row: i32, col: i32) {
    let _ = console::with_console(|con| con.set_cursor(row.max(0) as u32, col.max(0) as u32));
}

unsafe extern "C" fn kapi_console_rows() -> i32 {
    console::with_console(|con| con.rows() as i32).unwrap_or(0)
}

unsafe extern "C" fn kapi_console_cols() -> i32 {
    console::with_console(|con| con.cols() as i32).unwrap_or(0)
}

// ---------------------------------------------------------------------
// Memory family
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_malloc(size: usize) -> *mut u8 {
    crate::heap_alloc(size)
}

unsafe extern "C" fn kapi_free(ptr: *mut u8) {
    // SAFETY: kapi contract -- ptr came from kapi_malloc.
    unsafe { crate::heap_free(ptr) }
}

unsafe extern "C" fn kapi_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    // SAFETY: kapi contract -- ptr came from kapi_malloc.
    unsafe { crate::heap_realloc(ptr, size) }
}

unsafe extern "C" fn kapi_calloc(count: usize, size: usize) -> *mut u8 {
    crate::heap_calloc(count, size)
}

// ---------------------------------------------------------------------
// Filesystem family
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_fs_read(path: *const u8, buf: *mut u8, max: usize) -> i32 {
    // SAFETY: kapi contract -- NUL-terminated path, `max` writable bytes.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    if buf.is_null() {
        return -1;
    }
    // SAFETY: caller provides the buffer.
    let out = unsafe { core::slice::from_raw_parts_mut(buf, max) };
    match fs::with_volume(|vol| vol.read_file(path, out)) {
        Ok(n) => n as i32,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_write(path: *const u8, buf: *const u8, size: usize) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    if buf.is_null() && size > 0 {
        return -1;
    }
    // SAFETY: caller provides `size` readable bytes.
    let data = unsafe { core::slice::from_raw_parts(buf, size) };
    match fs::with_volume(|vol| vol.write_file(path, data)) {
        Ok(n) => n as i32,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_size(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.file_size(path)) {
        Ok(n) => n as i32,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_is_dir(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.is_directory(path)) {
        Ok(b) => b as i32,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_create(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.create_file(path)) {
        Ok(()) => 0,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_mkdir(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.make_directory(path)) {
        Ok(()) => 0,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_delete(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.delete(path)) {
        Ok(()) => 0,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_rename(path: *const u8, new_name: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let (Some(path), Some(new_name)) = (unsafe { cstr(path) }, unsafe { cstr(new_name) }) else {
        return -1;
    };
    match fs::with_volume(|vol| vol.rename(path, new_name)) {
        Ok(()) => 0,
        Err(e) => fs::fat32::error_code(&e),
    }
}

unsafe extern "C" fn kapi_fs_readdir(
    path: *const u8,
    index: i32,
    name_out: *mut u8,
    name_cap: usize,
    is_dir_out: *mut i32,
    size_out: *mut u32,
) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    if index < 0 {
        return -1;
    }
    let listing = match fs::with_volume(|vol| vol.list_dir(path)) {
        Ok(l) => l,
        Err(e) => return fs::fat32::error_code(&e),
    };
    let Some(entry) = listing.get(index as usize) else {
        return 0;
    };
    // SAFETY: caller provides the output buffers.
    unsafe {
        fill_cstr(name_out, name_cap, &entry.name);
        if !is_dir_out.is_null() {
            *is_dir_out = entry.is_dir as i32;
        }
        if !size_out.is_null() {
            *size_out = entry.size;
        }
    }
    1
}

// ---------------------------------------------------------------------
// Process family
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_exit(status: i32) -> ! {
    process::exit(status)
}

unsafe extern "C" fn kapi_exec(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    process::exec(path).unwrap_or(-1)
}

unsafe extern "C" fn kapi_exec_args(path: *const u8, argc: i32, argv: *const *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    let mut args: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    for i in 0..argc.max(0) as usize {
        // SAFETY: caller supplies argc valid argv entries.
        let arg = unsafe { cstr(*argv.add(i)) };
        match arg {
            Some(a) => args.push(a),
            None => return -1,
        }
    }
    process::exec_args(path, &args).unwrap_or(-1)
}

unsafe extern "C" fn kapi_spawn(path: *const u8) -> i32 {
    // SAFETY: kapi contract.
    let Some(path) = (unsafe { cstr(path) }) else {
        return -1;
    };
    process::spawn(path).map_or(-1, |pid| pid as i32)
}

unsafe extern "C" fn kapi_yield() {
    process::yield_now();
}

// ---------------------------------------------------------------------
// Framebuffer / mouse families
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_fb_put_pixel(x: u32, y: u32, color: u32) {
    if let Some(mut fb) = crate::hal::framebuffer() {
        fb.put_pixel(x, y, color);
    }
}

unsafe extern "C" fn kapi_fb_fill_rect(x: u32, y: u32, w: u32, h: u32, color: u32) {
    if let Some(mut fb) = crate::hal::framebuffer() {
        fb.fill_rect(x, y, w, h, color);
    }
}

unsafe extern "C" fn kapi_fb_draw_char(x: u32, y: u32, c: u8, fg: u32, bg: u32) {
    if let Some(mut fb) = crate::hal::framebuffer() {
        fb.draw_char(x, y, c, fg, bg);
    }
}

unsafe extern "C" fn kapi_fb_draw_string(x: u32, y: u32, s: *const u8, fg: u32, bg: u32) {
    // SAFETY: kapi contract.
    let Some(text) = (unsafe { cstr(s) }) else {
        return;
    };
    if let Some(mut fb) = crate::hal::framebuffer() {
        fb.draw_string(x, y, text, fg, bg);
    }
}

unsafe extern "C" fn kapi_mouse_get_pos(x_out: *mut i32, y_out: *mut i32) {
    let state = crate::hal::mouse_state();
    // SAFETY: caller provides the output slots.
    unsafe {
        if !x_out.is_null() {
            *x_out = state.x;
        }
        if !y_out.is_null() {
            *y_out = state.y;
        }
    }
}

unsafe extern "C" fn kapi_mouse_get_buttons() -> u8 {
    crate::hal::mouse_state().buttons
}

unsafe extern "C" fn kapi_mouse_poll() {
    crate::hal::input_poll();
}

// ---------------------------------------------------------------------
// System info / timing / net / LED
// ---------------------------------------------------------------------

unsafe extern "C" fn kapi_uptime_ticks() -> u64 {
    crate::hal::ticks()
}

unsafe extern "C" fn kapi_ram_size() -> u64 {
    crate::hal::ram_size()
}

unsafe extern "C" fn kapi_mem_used() -> usize {
    crate::heap_used()
}

unsafe extern "C" fn kapi_mem_free() -> usize {
    crate::heap_free_bytes()
}

unsafe extern "C" fn kapi_proc_pid() -> i32 {
    process::current_status().map_or(-1, |(pid, ..)| pid as i32)
}

unsafe extern "C" fn kapi_proc_name(out: *mut u8, cap: usize) -> i32 {
    match process::with_current(|p| alloc::string::String::from(p.name())) {
        Some(name) => {
            // SAFETY: caller provides the buffer.
            unsafe { fill_cstr(out, cap, &name) };
            name.len() as i32
        }
        None => -1,
    }
}

unsafe extern "C" fn kapi_disk_total_kb() -> u32 {
    fs::with_volume(|vol| {
        Ok(vol.total_clusters() as u64 * vol.cluster_bytes() as u64 / 1024)
    })
    .map_or(0, |kb| kb as u32)
}

unsafe extern "C" fn kapi_disk_free_kb() -> u32 {
    fs::with_volume(|vol| {
        let free = vol.free_cluster_count()?;
        Ok(free as u64 * vol.cluster_bytes() as u64 / 1024)
    })
    .map_or(0, |kb| kb as u32)
}

unsafe extern "C" fn kapi_rtc_read() -> u64 {
    crate::drivers::rtc::read_epoch().unwrap_or(0)
}

unsafe extern "C" fn kapi_sleep_ms(ms: u32) {
    crate::hal::sleep_ms(ms);
}

unsafe extern "C" fn kapi_time_us() -> u64 {
    crate::hal::time_us()
}

unsafe extern "C" fn kapi_net_get_ip() -> u32 {
    net::with_stack(|s| s.ip().to_u32()).unwrap_or(0)
}

unsafe extern "C" fn kapi_net_get_mac(out: *mut u8) {
    if out.is_null() {
        return;
    }
    if let Some(mac) = net::with_stack(|s| s.mac()) {
        // SAFETY: caller provides six writable bytes.
        unsafe { core::ptr::copy_nonoverlapping(mac.0.as_ptr(), out, 6) };
    }
}

unsafe extern "C" fn kapi_net_poll() {
    net::poll();
}

unsafe extern "C" fn kapi_net_ping(ip: u32, seq: u16, timeout_ms: u32) -> i32 {
    let dst = net::Ipv4Address::from_u32(ip);
    match net::with_stack(|s| s.ping(dst, seq, timeout_ms)) {
        Some(Ok(())) => 0,
        _ => -1,
    }
}

unsafe extern "C" fn kapi_ip_send(ip: u32, protocol: u8, data: *const u8, len: usize) -> i32 {
    if data.is_null() && len > 0 {
        return -1;
    }
    // SAFETY: caller provides `len` readable bytes.
    let payload = unsafe { core::slice::from_raw_parts(data, len) };
    let dst = net::Ipv4Address::from_u32(ip);
    match net::with_stack(|s| s.ip_send(dst, protocol, payload)) {
        Some(Ok(())) => 0,
        Some(Err(crate::error::KernelError::NetError(crate::error::NetError::ArpUnresolved))) => {
            // Distinguished would-block code; caller polls and retries.
            -11
        }
        _ => -1,
    }
}

unsafe extern "C" fn kapi_led_on() {
    crate::hal::led_on();
}

unsafe extern "C" fn kapi_led_off() {
    crate::hal::led_off();
}

unsafe extern "C" fn kapi_led_toggle() {
    crate::hal::led_toggle();
}

// ---------------------------------------------------------------------
// Population and install entry points
// ---------------------------------------------------------------------

/// Populate the table. Called once at boot after the subsystems it
/// fronts are up.
pub fn init() {
    let api = table_mut();
    api.version = KAPI_VERSION;

    api.putc = Some(kapi_putc);
    api.puts = Some(kapi_puts);
    api.uart_puts = Some(kapi_uart_puts);
    api.getc = Some(kapi_getc);
    api.set_color = Some(kapi_set_color);
    api.clear = Some(kapi_clear);
    api.set_cursor = Some(kapi_set_cursor);
    api.console_rows = Some(kapi_console_rows);
    api.console_cols = Some(kapi_console_cols);
    api.has_key = Some(kapi_has_key);

    api.malloc = Some(kapi_malloc);
    api.free = Some(kapi_free);
    api.realloc = Some(kapi_realloc);
    api.calloc = Some(kapi_calloc);

    api.fs_read = Some(kapi_fs_read);
    api.fs_write = Some(kapi_fs_write);
    api.fs_size = Some(kapi_fs_size);
    api.fs_is_dir = Some(kapi_fs_is_dir);
    api.fs_create = Some(kapi_fs_create);
    api.fs_mkdir = Some(kapi_fs_mkdir);
    api.fs_delete = Some(kapi_fs_delete);
    api.fs_rename = Some(kapi_fs_rename);
    api.fs_readdir = Some(kapi_fs_readdir);

    api.exit = Some(kapi_exit);
    api.exec = Some(kapi_exec);
    api.exec_args = Some(kapi_exec_args);
    api.spawn = Some(kapi_spawn);
    api.yield_ = Some(kapi_yield);

    if let Some(fb) = crate::hal::framebuffer() {
        api.fb_base = fb.base_ptr();
        api.fb_width = fb.width();
        api.fb_height = fb.height();
    }
    api.fb_put_pixel = Some(kapi_fb_put_pixel);
    api.fb_fill_rect = Some(kapi_fb_fill_rect);
    api.fb_draw_char = Some(kapi_fb_draw_char);
    api.fb_draw_string = Some(kapi_fb_draw_string);
    api.font_data = crate::console::font::FONT_8X16.as_ptr() as *const u8;

    api.mouse_get_pos = Some(kapi_mouse_get_pos);
    api.mouse_get_buttons = Some(kapi_mouse_get_buttons);
    api.mouse_poll = Some(kapi_mouse_poll);

    // Windowing and stdio hooks stay null until installed.

    api.get_uptime_ticks = Some(kapi_uptime_ticks);
    api.get_ram_size = Some(kapi_ram_size);
    api.mem_used = Some(kapi_mem_used);
    api.mem_free = Some(kapi_mem_free);
    api.proc_pid = Some(kapi_proc_pid);
    api.proc_name = Some(kapi_proc_name);
    api.disk_total_kb = Some(kapi_disk_total_kb);
    api.disk_free_kb = Some(kapi_disk_free_kb);
    api.rtc_read = Some(kapi_rtc_read);
    api.sleep_ms = Some(kapi_sleep_ms);
    api.time_us = Some(kapi_time_us);

    api.net_get_ip = Some(kapi_net_get_ip);
    api.net_get_mac = Some(kapi_net_get_mac);
    api.net_poll = Some(kapi_net_poll);
    api.net_ping = Some(kapi_net_ping);
    api.ip_send = Some(kapi_ip_send);

    api.led_on = Some(kapi_led_on);
    api.led_off = Some(kapi_led_off);
    api.led_toggle = Some(kapi_led_toggle);

    println!("[KAPI] Kernel API table populated (v{})", KAPI_VERSION);
}

/// The windowing entry points a desktop program provides.
#[derive(Clone, Copy)]
pub struct WindowBackend {
    pub create: unsafe extern "C" fn(i32, i32, i32, i32, *const u8) -> i32,
    pub destroy: unsafe extern "C" fn(i32),
    pub get_buffer: unsafe extern "C" fn(i32, *mut i32, *mut i32) -> *mut u32,
    pub poll_event: unsafe extern "C" fn(i32, *mut i32, *mut i32, *mut i32, *mut i32) -> i32,
    pub invalidate: unsafe extern "C" fn(i32),
    pub set_title: unsafe extern "C" fn(i32, *const u8),
}

/// Install the windowing family. The kernel owns the table; the desktop
/// goes through this entry point instead of poking fields.
pub fn install_window_backend(backend: WindowBackend) {
    let api = table_mut();
    api.window_create = Some(backend.create);
    api.window_destroy = Some(backend.destroy);
    api.window_get_buffer = Some(backend.get_buffer);
    api.window_poll_event = Some(backend.poll_event);
    api.window_invalidate = Some(backend.invalidate);
    api.window_set_title = Some(backend.set_title);
    println!("[KAPI] Window backend installed");
}

/// The stdio redirection hooks a terminal emulator provides.
/// `getc` must be non-blocking (negative when no input is pending).
#[derive(Clone, Copy)]
pub struct StdioHooks {
    pub putc: unsafe extern "C" fn(u8),
    pub puts: unsafe extern "C" fn(*const u8),
    pub getc: unsafe extern "C" fn() -> i32,
    pub has_key: unsafe extern "C" fn() -> i32,
}

pub fn install_stdio_hooks(hooks: StdioHooks) {
    let api = table_mut();
    api.stdio_putc = Some(hooks.putc);
    api.stdio_puts = Some(hooks.puts);
    api.stdio_getc = Some(hooks.getc);
    api.stdio_has_key = Some(hooks.has_key);
}

/// Remove the stdio hooks (terminal shutdown): console I/O falls back
/// to the direct path.
pub fn clear_stdio_hooks() {
    let api = table_mut();
    api.stdio_putc = None;
    api.stdio_puts = None;
    api.stdio_getc = None;
    api.stdio_has_key = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

    unsafe extern "C" fn fake_getc() -> i32 {
        0x55
    }

    unsafe extern "C" fn fake_putc(_c: u8) {}
    unsafe extern "C" fn fake_puts(_s: *const u8) {}
    unsafe extern "C" fn fake_has_key() -> i32 {
        1
    }

    #[test]
    fn init_populates_core_families_and_leaves_installed_ones_null() {
        let _guard = TEST_LOCK.lock();
        init();
        let api = table();

        assert_eq!(api.version, KAPI_VERSION);
        assert!(api.putc.is_some());
        assert!(api.malloc.is_some());
        assert!(api.fs_read.is_some());
        assert!(api.exec.is_some());
        assert!(api.net_ping.is_some());
        assert!(!api.font_data.is_null());

        // Installed-later families are null at boot.
        assert!(api.window_create.is_none());
        assert!(api.stdio_putc.is_none());
        // Collaborator hooks never populated by the core.
        assert!(api.tcp_connect.is_none());
        assert!(api.dns_lookup.is_none());
        assert!(api.ttf_draw_string.is_none());
        clear_stdio_hooks();
    }

    #[test]
    fn stdio_hooks_redirect_getc() {
        let _guard = TEST_LOCK.lock();
        let _input_guard = crate::hal::INPUT_TEST_LOCK.lock();
        init();

        install_stdio_hooks(StdioHooks {
            putc: fake_putc,
            puts: fake_puts,
            getc: fake_getc,
            has_key: fake_has_key,
        });
        let got = unsafe { (table().getc.unwrap())() };
        assert_eq!(got, 0x55);
        assert_eq!(unsafe { (table().has_key.unwrap())() }, 1);

        clear_stdio_hooks();
        // Without hooks and with an empty keyboard queue, getc reports
        // no input.
        while crate::hal::keyboard_getc().is_some() {}
        let got = unsafe { (table().getc.unwrap())() };
        assert_eq!(got, -1);
    }

    #[test]
    fn cstr_round_trip() {
        let _guard = TEST_LOCK.lock();
        let s = b"hello\0";
        assert_eq!(unsafe { cstr(s.as_ptr()) }, Some("hello"));
        assert_eq!(unsafe { cstr(core::ptr::null()) }, None);

        let mut out = [0u8; 4];
        unsafe { fill_cstr(out.as_mut_ptr(), out.len(), "toolong") };
        assert_eq!(&out, b"too\0");
    }
}
