//! Playback pipeline: seek into a finished recording and emit a paced JPEG
//! frame stream, honoring wall-clock timing and a playback-rate multiplier.

use std::time::{Duration, Instant};

use ffmpeg_next::{frame, Packet, Rational};

use crate::channel::{self, FrameMessage};
use crate::clock;
use crate::error::WorkerError;
use crate::input::{Backend, InputSession};
use crate::jpeg::FrameEncoder;

/// End-of-playback marker; the supervisor keys on the empty filename and
/// epoch timestamp.
const PLAYBACK_END_FILENAME: &str = "";
const PLAYBACK_END_TIME: &str = "1970-01-01T00:00:00Z";

struct Player {
    begin: Instant,
    offset_ts: i64,
    playback_rate: i64,
    first_pts: i64,
    frame_count: i64,
    got_key_frame: bool,
    encoder: FrameEncoder,
}

pub fn run(path: &str, offset_us: i64, playback_rate: i64) -> Result<(), WorkerError> {
    let mut session = InputSession::open(path, Backend::None)?;

    let offset_ts = clock::rescale_q(offset_us, clock::MICROSECOND, session.time_base());
    if let Err(e) = session.seek(offset_ts) {
        log::warn!("seek to {offset_us}µs failed: {e}, playing from the current position");
    }

    log::info!("playing {path} from {offset_us}µs at {playback_rate}x");

    let mut player = Player {
        begin: Instant::now(),
        offset_ts,
        playback_rate,
        first_pts: -1,
        frame_count: 0,
        got_key_frame: false,
        encoder: FrameEncoder::new(Backend::None),
    };

    let mut packet = Packet::empty();
    let mut frame = frame::Video::empty();

    while !channel::supervisor_hangup() {
        match session.read_packet(&mut packet) {
            Ok(()) => {}
            Err(WorkerError::EndOfStream) | Err(WorkerError::Interrupted) => break,
            Err(e) => {
                log::error!("packet read failed: {e}");
                break;
            }
        }

        if packet.stream() != session.stream_index() {
            continue;
        }
        // decoding must start on a keyframe
        if !player.got_key_frame {
            if !packet.is_key() {
                continue;
            }
            player.got_key_frame = true;
        }

        if let Err(e) = session.send_packet(&packet) {
            log::info!("decode error: {e}, skipping packet");
            continue;
        }
        while session.receive_frame(&mut frame).is_ok() {
            player.play_frame(&session, &mut frame)?;
        }
    }

    // drain whatever the decoder still holds
    if session.send_eof().is_ok() {
        while session.receive_frame(&mut frame).is_ok() {
            player.play_frame(&session, &mut frame)?;
        }
    }

    channel::send_end_file(PLAYBACK_END_FILENAME, PLAYBACK_END_TIME)?;
    Ok(())
}

impl Player {
    /// Pace and emit one decoded frame. Frames before the requested offset
    /// are leftovers from the keyframe the seek landed on and are dropped.
    fn play_frame(&mut self, session: &InputSession, frame: &mut frame::Video) -> Result<(), WorkerError> {
        let pts = frame.pts().unwrap_or(0);
        if pts < self.offset_ts {
            return Ok(());
        }
        if self.first_pts == -1 {
            self.first_pts = pts;
        }
        self.frame_count += 1;

        // fast-forward compresses the timeline proportionally
        let pts = pts / self.playback_rate;
        if self.frame_count % self.playback_rate != 0 {
            return Ok(());
        }

        pace(self.begin, pts - self.first_pts, session.time_base());

        let offset = clock::rescale_q(pts, session.time_base(), clock::MICROSECOND);
        let unscaled_width = frame.width() as i32;
        let unscaled_height = frame.height() as i32;
        let jpeg = match self.encoder.encode_full(frame) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::warn!("jpeg encode failed: {e}, skipping frame");
                return Ok(());
            }
        };
        channel::send_frame(&FrameMessage {
            jpeg: &jpeg,
            offset,
            unscaled_width,
            unscaled_height,
        })
    }
}

/// Sleep until the frame's position on the session timeline. Timestamps more
/// than two seconds ahead of the wall clock play immediately instead of
/// stalling the stream.
fn pace(begin: Instant, pts_delta: i64, time_base: Rational) {
    let target_ns = clock::rescale_q(pts_delta, time_base, clock::NANOSECOND);
    if target_ns <= 0 {
        return;
    }
    let target = Duration::from_nanos(target_ns as u64);
    loop {
        let elapsed = begin.elapsed();
        if elapsed >= target {
            return;
        }
        let remaining = target - elapsed;
        if remaining > Duration::from_secs(2) {
            return;
        }
        std::thread::sleep(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pace_waits_for_the_frame_timestamp() {
        let begin = Instant::now();
        // 40ms at 90kHz
        pace(begin, 3600, Rational(1, 90_000));
        assert!(begin.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn pace_returns_immediately_when_behind() {
        let begin = Instant::now() - Duration::from_millis(500);
        let before = Instant::now();
        pace(begin, 3600, Rational(1, 90_000));
        assert!(before.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn pace_caps_runaway_timestamps() {
        let begin = Instant::now();
        let before = Instant::now();
        // ten minutes ahead of the wall clock
        pace(begin, 600 * 90_000, Rational(1, 90_000));
        assert!(before.elapsed() < Duration::from_millis(20));
    }
}
