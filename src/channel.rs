//! Supervisor channel: length-framed msgpack records on standard output.
//!
//! Every record is a self-describing map prefixed by a big-endian u32 byte
//! length covering the payload only. The channel is process-global and a
//! single mutex serializes all writers, including the log forwarders.

use std::io::{self, Write};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rmp::encode;

use crate::error::WorkerError;

/// One decoded frame ready for the supervisor, already JPEG-encoded.
pub struct FrameMessage<'a> {
    pub jpeg: &'a [u8],
    /// Microseconds from the start of the current recording file.
    pub offset: i64,
    pub unscaled_width: i32,
    pub unscaled_height: i32,
}

static CHANNEL: Lazy<Mutex<io::Stdout>> = Lazy::new(|| Mutex::new(io::stdout()));

fn write_record(payload: &[u8]) -> Result<(), WorkerError> {
    let mut out = CHANNEL.lock().unwrap();
    out.write_all(&(payload.len() as u32).to_be_bytes())
        .map_err(|_| WorkerError::Serialize)?;
    out.write_all(payload).map_err(|_| WorkerError::Serialize)?;
    out.flush().map_err(|_| WorkerError::Serialize)?;
    Ok(())
}

fn put_key(buf: &mut Vec<u8>, key: &str) -> Result<(), WorkerError> {
    encode::write_str(buf, key).map_err(|_| WorkerError::Serialize)
}

fn put_str(buf: &mut Vec<u8>, key: &str, value: &str) -> Result<(), WorkerError> {
    put_key(buf, key)?;
    encode::write_str(buf, value).map_err(|_| WorkerError::Serialize)
}

fn put_int(buf: &mut Vec<u8>, key: &str, value: i64) -> Result<(), WorkerError> {
    put_key(buf, key)?;
    encode::write_sint(buf, value)
        .map(|_| ())
        .map_err(|_| WorkerError::Serialize)
}

fn put_bin(buf: &mut Vec<u8>, key: &str, value: &[u8]) -> Result<(), WorkerError> {
    put_key(buf, key)?;
    encode::write_bin(buf, value).map_err(|_| WorkerError::Serialize)
}

fn encode_frame(msg: &FrameMessage) -> Result<Vec<u8>, WorkerError> {
    let mut buf = Vec::with_capacity(msg.jpeg.len() + 128);
    encode::write_map_len(&mut buf, 5).map_err(|_| WorkerError::Serialize)?;
    put_str(&mut buf, "type", "frame")?;
    put_bin(&mut buf, "jpegFrame", msg.jpeg)?;
    put_int(&mut buf, "offset", msg.offset)?;
    put_int(&mut buf, "unscaledWidth", i64::from(msg.unscaled_width))?;
    put_int(&mut buf, "unscaledHeight", i64::from(msg.unscaled_height))?;
    Ok(buf)
}

fn encode_scaled_frame(msg: &FrameMessage, height: i32) -> Result<Vec<u8>, WorkerError> {
    let mut buf = Vec::with_capacity(msg.jpeg.len() + 128);
    encode::write_map_len(&mut buf, 6).map_err(|_| WorkerError::Serialize)?;
    put_str(&mut buf, "type", "frameScaled")?;
    put_bin(&mut buf, "jpegFrameScaled", msg.jpeg)?;
    put_int(&mut buf, "height", i64::from(height))?;
    put_int(&mut buf, "offset", msg.offset)?;
    put_int(&mut buf, "unscaledWidth", i64::from(msg.unscaled_width))?;
    put_int(&mut buf, "unscaledHeight", i64::from(msg.unscaled_height))?;
    Ok(buf)
}

fn encode_file_event(kind: &str, time_key: &str, filename: &str, time: &str) -> Result<Vec<u8>, WorkerError> {
    let mut buf = Vec::with_capacity(256);
    encode::write_map_len(&mut buf, 3).map_err(|_| WorkerError::Serialize)?;
    put_str(&mut buf, "type", kind)?;
    put_str(&mut buf, "filename", filename)?;
    put_str(&mut buf, time_key, time)?;
    Ok(buf)
}

fn encode_log(level: &str, message: &str) -> Result<Vec<u8>, WorkerError> {
    let mut buf = Vec::with_capacity(message.len() + 64);
    encode::write_map_len(&mut buf, 3).map_err(|_| WorkerError::Serialize)?;
    put_str(&mut buf, "type", "log")?;
    put_str(&mut buf, "level", level)?;
    put_str(&mut buf, "message", message)?;
    Ok(buf)
}

pub fn send_frame(msg: &FrameMessage) -> Result<(), WorkerError> {
    write_record(&encode_frame(msg)?)
}

pub fn send_scaled_frame(msg: &FrameMessage, height: i32) -> Result<(), WorkerError> {
    write_record(&encode_scaled_frame(msg, height)?)
}

pub fn send_new_file(filename: &str, iso_begin_time: &str) -> Result<(), WorkerError> {
    write_record(&encode_file_event("newFile", "beginTime", filename, iso_begin_time)?)
}

pub fn send_end_file(filename: &str, iso_end_time: &str) -> Result<(), WorkerError> {
    write_record(&encode_file_event("endFile", "endTime", filename, iso_end_time)?)
}

pub fn send_log(level: &str, message: &str) -> Result<(), WorkerError> {
    write_record(&encode_log(level, message)?)
}

/// True once the supervisor has closed its end of our standard input.
pub fn supervisor_hangup() -> bool {
    let mut pfd = libc::pollfd {
        fd: 0,
        events: 0,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, 0) };
    pfd.revents & libc::POLLHUP != 0
}

/// Wire name for a native-library log level.
pub fn av_level_name(level: i32) -> &'static str {
    use ffmpeg_next::ffi;
    match level {
        l if l == ffi::AV_LOG_QUIET as i32 => "quiet",
        l if l == ffi::AV_LOG_PANIC as i32 => "panic",
        l if l == ffi::AV_LOG_FATAL as i32 => "fatal",
        l if l == ffi::AV_LOG_ERROR as i32 => "error",
        l if l == ffi::AV_LOG_WARNING as i32 => "warning",
        l if l == ffi::AV_LOG_INFO as i32 => "info",
        l if l == ffi::AV_LOG_DEBUG as i32 => "debug",
        _ => "unknown",
    }
}

struct ChannelLogger;

static LOGGER: ChannelLogger = ChannelLogger;

impl log::Log for ChannelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let level = match record.level() {
            log::Level::Error => "error",
            log::Level::Warn => "warning",
            log::Level::Info => "info",
            log::Level::Debug | log::Level::Trace => "debug",
        };
        if send_log(level, &record.args().to_string()).is_err() {
            // Nothing sane left to report to; the channel is the worker's
            // only output surface.
            std::process::exit(5);
        }
    }

    fn flush(&self) {}
}

/// Route `log` macros onto the supervisor channel.
pub fn init_logging() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn frame_record_is_a_five_entry_map() {
        let jpeg = [0xffu8, 0xd8, 0xff, 0xd9];
        let msg = FrameMessage {
            jpeg: &jpeg,
            offset: 1_500_000,
            unscaled_width: 1920,
            unscaled_height: 1080,
        };
        let buf = encode_frame(&msg).unwrap();
        // fixmap with 5 entries
        assert_eq!(buf[0], 0x85);
        assert!(contains(&buf, b"type"));
        assert!(contains(&buf, b"frame"));
        assert!(contains(&buf, b"jpegFrame"));
        assert!(contains(&buf, &jpeg));
        assert!(contains(&buf, b"unscaledWidth"));
        assert!(contains(&buf, b"unscaledHeight"));
    }

    #[test]
    fn scaled_frame_record_is_a_six_entry_map() {
        let jpeg = [1u8, 2, 3];
        let msg = FrameMessage {
            jpeg: &jpeg,
            offset: 0,
            unscaled_width: 640,
            unscaled_height: 360,
        };
        let buf = encode_scaled_frame(&msg, 480).unwrap();
        assert_eq!(buf[0], 0x86);
        assert!(contains(&buf, b"frameScaled"));
        assert!(contains(&buf, b"jpegFrameScaled"));
        assert!(contains(&buf, b"height"));
    }

    #[test]
    fn file_events_round_trip_through_a_map_reader() {
        let buf = encode_file_event("newFile", "beginTime", "/tmp/a.mkv", "2026-08-01T10:00:00.000+0000").unwrap();
        let mut rd = &buf[..];
        let len = rmp::decode::read_map_len(&mut rd).unwrap();
        assert_eq!(len, 3);
        assert!(contains(&buf, b"newFile"));
        assert!(contains(&buf, b"/tmp/a.mkv"));

        let buf = encode_file_event("endFile", "endTime", "", "1970-01-01T00:00:00Z").unwrap();
        assert!(contains(&buf, b"endFile"));
        assert!(contains(&buf, b"1970-01-01T00:00:00Z"));
    }

    #[test]
    fn log_record_levels() {
        let buf = encode_log("warning", "reorder queue overflow").unwrap();
        assert_eq!(buf[0], 0x83);
        assert!(contains(&buf, b"warning"));
        assert!(contains(&buf, b"reorder queue overflow"));
    }

    #[test]
    fn framing_length_is_big_endian_payload_size() {
        let payload = encode_log("info", "x").unwrap();
        let framed_len = (payload.len() as u32).to_be_bytes();
        // a conforming reader sees exactly be_u32(|R|) then |R| bytes
        let mut framed = framed_len.to_vec();
        framed.extend_from_slice(&payload);
        let read_len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(read_len, framed.len() - 4);
        assert_eq!(&framed[4..], &payload[..]);
    }

    #[test]
    fn av_level_names_cover_the_wire_set() {
        use ffmpeg_next::ffi;
        assert_eq!(av_level_name(ffi::AV_LOG_ERROR as i32), "error");
        assert_eq!(av_level_name(ffi::AV_LOG_INFO as i32), "info");
        assert_eq!(av_level_name(1234), "unknown");
    }
}
