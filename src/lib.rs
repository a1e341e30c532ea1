//! Video workers for a surveillance supervisor: a capture worker that ingests
//! one live RTSP camera into rolling recordings plus JPEG snapshots, and a
//! playback worker that streams paced snapshots out of a finished recording.
//! Both talk to the supervisor over standard output as length-framed msgpack
//! records.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

pub mod capture;
pub mod channel;
pub mod clock;
pub mod error;
pub mod input;
pub mod jpeg;
pub mod metrics;
pub mod output;
pub mod playback;

/// Process-wide initialization: route our own log records and the native
/// library's log lines onto the supervisor channel.
pub fn init() {
    channel::init_logging();
    if let Err(e) = ffmpeg::init() {
        log::error!("ffmpeg init failed: {e}");
    }
    unsafe {
        ffi::av_log_set_level(ffi::AV_LOG_INFO as c_int);
        ffi::av_log_set_callback(Some(forward_av_log));
    }
}

unsafe extern "C" fn forward_av_log(
    avcl: *mut c_void,
    level: c_int,
    fmt: *const c_char,
    vl: *mut ffi::__va_list_tag,
) {
    if level > ffi::av_log_get_level() {
        return;
    }
    let mut line = [0 as c_char; 2048];
    let mut print_prefix: c_int = 1;
    ffi::av_log_format_line(
        avcl,
        level,
        fmt,
        vl,
        line.as_mut_ptr(),
        line.len() as c_int,
        &mut print_prefix,
    );
    let message = CStr::from_ptr(line.as_ptr()).to_string_lossy();
    let message = message.trim_end();
    if message.is_empty() {
        return;
    }
    if channel::send_log(channel::av_level_name(level), message).is_err() {
        std::process::exit(5);
    }
}
