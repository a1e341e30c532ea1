//! Output session: one rolling Matroska recording file at a time, opened and
//! closed only on keyframes, with the end-time metadata patched into the
//! finished file.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

use chrono::{DateTime, Local};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::packet::Mut;
use ffmpeg_next::{format, Dictionary, Packet, Rational};
use rand::Rng;

use crate::channel;
use crate::clock;
use crate::error::WorkerError;
use crate::input::InputSession;

/// A file is closed at the first keyframe after its size crosses this.
pub const MAX_FILE_SIZE: i64 = 10 * 1024 * 1024;

/// Placeholder scan key: the tag key `ENDTIME` is followed in the container
/// by the tag-string element id byte 0x44 ('D'), and the value starts three
/// bytes past that.
const END_TIME_SENTINEL: &[u8] = b"ENDTIMED";
const SENTINEL_VALUE_OFFSET: usize = END_TIME_SENTINEL.len() + 2;

pub struct OutputSession {
    directory: PathBuf,
    octx: Option<format::context::Output>,
    path: PathBuf,
    stream_index: usize,
    first_pts: i64,
    prev_pts: i64,
    size: i64,
}

impl OutputSession {
    pub fn new(directory: &Path) -> OutputSession {
        OutputSession {
            directory: directory.to_path_buf(),
            octx: None,
            path: PathBuf::new(),
            stream_index: 0,
            first_pts: -1,
            prev_pts: -1,
            size: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.octx.is_some()
    }

    /// PTS of the first packet accepted into the current file, the
    /// subtrahend for every timestamp written into it.
    pub fn first_pts(&self) -> i64 {
        self.first_pts
    }

    /// Rolling-file transitions for one packet: close an oversized file on a
    /// keyframe, open a new file on a keyframe while closed. Muxer errors
    /// abandon the current file; the next keyframe retries.
    pub fn handle_packet(&mut self, input: &InputSession, packet: &Packet) -> Result<(), WorkerError> {
        if packet.stream() != input.stream_index() {
            return Ok(());
        }

        if self.is_open() && self.size >= MAX_FILE_SIZE && packet.is_key() {
            self.close()?;
        }

        if !self.is_open() && packet.is_key() {
            if let Err(e) = self.open(input, packet) {
                match e {
                    WorkerError::Serialize => return Err(e),
                    _ => {
                        log::error!("failed to open recording file: {e}");
                        self.abandon();
                    }
                }
            }
        }

        Ok(())
    }

    fn open(&mut self, input: &InputSession, packet: &Packet) -> Result<(), WorkerError> {
        let now = clock::realtime_now();
        let nonce = rand::thread_rng().gen_range(0..i32::MAX);
        let path = recording_path(&self.directory, &now, nonce);
        log::info!("opening recording file {}", path.display());

        let mut octx = format::output(&path).map_err(WorkerError::Muxer)?;

        unsafe {
            set_muxer_option(&mut octx, "fflags", "+flush_packets");
            set_muxer_option(&mut octx, "avioflags", "+direct");

            let ost = ffi::avformat_new_stream(octx.as_mut_ptr(), ptr::null());
            if ost.is_null() {
                return Err(WorkerError::Muxer(ffmpeg::Error::Unknown));
            }
            let codecpar = input.stream_codecpar();
            if codecpar.is_null() {
                return Err(WorkerError::Muxer(ffmpeg::Error::StreamNotFound));
            }
            let err = ffi::avcodec_parameters_copy((*ost).codecpar, codecpar);
            if err < 0 {
                return Err(WorkerError::Muxer(ffmpeg::Error::from(err)));
            }
            (*(*ost).codecpar).codec_tag = 0;
            (*ost).time_base = input.time_base().into();
        }

        // ENDTIME is a sized placeholder; the muxer accepts metadata only
        // before the header is written, so the close path patches the bytes.
        let timestring = clock::iso8601(&now);
        let mut metadata = Dictionary::new();
        metadata.set("ENDTIME", &timestring);
        metadata.set("BEGINTIME", &timestring);
        octx.set_metadata(metadata);

        octx.write_header().map_err(WorkerError::Muxer)?;

        self.stream_index = input.stream_index();
        self.first_pts = packet.pts().unwrap_or(0);
        self.prev_pts = -1;
        self.size = 0;
        self.path = path;
        self.octx = Some(octx);

        channel::send_new_file(&self.path.to_string_lossy(), &timestring)?;
        Ok(())
    }

    /// Append one packet to the open file, rewriting its timestamps into the
    /// output timebase relative to the file start.
    pub fn write_packet(&mut self, input_tb: Rational, packet: &mut Packet) -> Result<(), WorkerError> {
        let octx = match self.octx.as_mut() {
            Some(octx) => octx,
            None => return Ok(()),
        };
        if packet.stream() != self.stream_index {
            return Ok(());
        }
        let pts = packet.pts().unwrap_or(-1);
        if !accepts_pts(self.prev_pts, pts) {
            return Ok(());
        }
        self.prev_pts = pts;
        if self.first_pts == -1 {
            self.first_pts = pts;
        }

        let out_tb = octx.stream(0).map(|s| s.time_base()).unwrap_or(input_tb);
        let out_pts = clock::rescale_q(pts - self.first_pts, input_tb, out_tb);
        packet.set_pts(Some(out_pts));
        // the recording must never carry a dts ahead of pts
        packet.set_dts(Some(out_pts));
        packet.set_duration(clock::rescale_q(packet.duration(), input_tb, out_tb));
        packet.set_stream(0);

        self.size += packet.size() as i64;

        // av_write_frame returns 1 once everything is flushed; only negative
        // values are failures
        let err = unsafe { ffi::av_write_frame(octx.as_mut_ptr(), packet.as_mut_ptr()) };
        if err < 0 {
            let e = WorkerError::Muxer(ffmpeg::Error::from(err));
            log::error!("recording write failed: {e}, abandoning {}", self.path.display());
            self.abandon();
            return Ok(());
        }
        // push the packet out to disk immediately
        unsafe { ffi::av_write_frame(octx.as_mut_ptr(), ptr::null_mut()) };
        Ok(())
    }

    /// Finish the current file: trailer, end-time patch, `endFile` record.
    pub fn close(&mut self) -> Result<(), WorkerError> {
        let mut octx = match self.octx.take() {
            Some(octx) => octx,
            None => return Ok(()),
        };
        let end = clock::realtime_now();
        let end_time = clock::iso8601(&end);

        if let Err(e) = octx.write_trailer() {
            log::error!("failed to write trailer for {}: {e}", self.path.display());
        }
        drop(octx);

        if let Err(e) = patch_end_time(&self.path, &end_time) {
            log::error!("failed to patch end time into {}: {e}", self.path.display());
        }

        channel::send_end_file(&self.path.to_string_lossy(), &end_time)?;

        self.first_pts = -1;
        self.prev_pts = -1;
        self.size = 0;
        Ok(())
    }

    /// Drop the current file without the close bookkeeping, after a muxer
    /// failure. A fresh file starts at the next keyframe.
    fn abandon(&mut self) {
        self.octx = None;
        self.first_pts = -1;
        self.prev_pts = -1;
        self.size = 0;
    }
}

/// Monotonicity filter for the write path: negative timestamps and
/// regressions are dropped rather than written.
fn accepts_pts(prev_pts: i64, pts: i64) -> bool {
    if pts < 0 {
        return false;
    }
    !(prev_pts > 0 && pts < prev_pts)
}

fn recording_path(directory: &Path, now: &DateTime<Local>, nonce: i32) -> PathBuf {
    directory.join(format!(
        "{}_{}_{}.mkv",
        now.timestamp(),
        clock::iso8601_compact(now),
        nonce
    ))
}

unsafe fn set_muxer_option(octx: &mut format::context::Output, key: &str, value: &str) {
    let key = std::ffi::CString::new(key).unwrap_or_default();
    let value = std::ffi::CString::new(value).unwrap_or_default();
    ffi::av_opt_set(octx.as_mut_ptr() as *mut c_void, key.as_ptr(), value.as_ptr(), 0);
}

/// Overwrite the end-time placeholder inside a finished recording. The
/// replacement is byte-for-byte the same length as the placeholder, so the
/// container stays valid.
fn patch_end_time(path: &Path, end_time: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    if let Some(pos) = contents
        .windows(END_TIME_SENTINEL.len())
        .position(|w| w == END_TIME_SENTINEL)
    {
        file.seek(SeekFrom::Start((pos + SENTINEL_VALUE_OFFSET) as u64))?;
        file.write_all(end_time.as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn pts_filter_drops_negative_and_regressing_timestamps() {
        assert!(!accepts_pts(-1, -5));
        assert!(accepts_pts(-1, 0));
        assert!(accepts_pts(100, 100));
        assert!(accepts_pts(100, 150));
        assert!(!accepts_pts(100, 99));
        // prev_pts not yet latched past zero never blocks
        assert!(accepts_pts(0, 5));
    }

    #[test]
    fn recording_path_has_seconds_isotime_and_nonce() {
        let now = clock::realtime_now();
        let path = recording_path(Path::new("/var/recordings"), &now, 424242);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".mkv"));
        let parts: Vec<&str> = name.trim_end_matches(".mkv").splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], now.timestamp().to_string());
        assert_eq!(parts[1], clock::iso8601_compact(&now));
        assert_eq!(parts[2], "424242");
    }

    #[test]
    fn end_time_patch_replaces_the_value_in_place() {
        let begin = "2026-08-01T10:00:00.000+0000";
        let end = "2026-08-01T10:05:33.123+0000";
        assert_eq!(begin.len(), end.len());

        // container-ish layout: key bytes, tag-string element id 0x44 0x87,
        // a size byte, then the placeholder value
        let mut contents = b"\x1a\x45\xdf\xa3 header junk ".to_vec();
        contents.extend_from_slice(b"ENDTIME");
        contents.push(0x44);
        contents.push(0x87);
        contents.push(begin.len() as u8 | 0x80);
        contents.extend_from_slice(begin.as_bytes());
        contents.extend_from_slice(b" trailing cluster data");
        let original_len = contents.len();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&contents).unwrap();
        file.flush().unwrap();

        patch_end_time(file.path(), end).unwrap();

        let patched = std::fs::read(file.path()).unwrap();
        assert_eq!(patched.len(), original_len);
        let pos = patched
            .windows(END_TIME_SENTINEL.len())
            .position(|w| w == END_TIME_SENTINEL)
            .unwrap();
        let value_start = pos + SENTINEL_VALUE_OFFSET;
        assert_eq!(&patched[value_start..value_start + end.len()], end.as_bytes());
        // bytes before the value are untouched
        assert_eq!(&patched[..value_start], &contents[..value_start]);
    }

    #[test]
    fn files_without_the_sentinel_are_left_alone() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"no tags in here").unwrap();
        file.flush().unwrap();
        patch_end_time(file.path(), "2026-08-01T10:05:33.123+0000").unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"no tags in here");
    }
}
