//! Capture pipeline: live RTSP ingest into rolling recording files plus
//! full and thumbnail JPEG snapshots on the supervisor channel.

use std::path::Path;

use ffmpeg_next::{frame, Packet};

use crate::channel::{self, FrameMessage};
use crate::clock;
use crate::error::WorkerError;
use crate::input::{Backend, InputSession};
use crate::jpeg::FrameEncoder;
use crate::metrics::{CaptureMetrics, Phase};
use crate::output::OutputSession;

pub fn run(url: &str, directory: &Path, backend: Backend) -> Result<(), WorkerError> {
    let mut session = InputSession::open(url, backend)?;
    let mut output = OutputSession::new(directory);
    let mut encoder = FrameEncoder::new(session.backend());
    let mut metrics = CaptureMetrics::new();

    let mut packet = Packet::empty();
    let mut frame = frame::Video::empty();

    let finish = loop {
        match session.read_packet(&mut packet) {
            Ok(()) => {}
            Err(WorkerError::EndOfStream) => {
                log::info!("input stream ended, closing recording");
                break Ok(());
            }
            Err(WorkerError::Interrupted) => {
                log::info!("read interrupted, shutting down");
                break Ok(());
            }
            Err(e) => {
                log::error!("packet read failed: {e}");
                break Err(e);
            }
        }

        if packet.stream() != session.stream_index() {
            continue;
        }

        metrics.begin(Phase::Loop);

        let (pts, duration) = session.emit_timestamp(&packet);
        packet.set_pts(Some(pts));
        packet.set_dts(Some(pts));
        packet.set_duration(duration);

        output.handle_packet(&session, &packet)?;
        if !output.is_open() {
            // still waiting for the first keyframe
            continue;
        }

        metrics.begin(Phase::Decode);
        let decoded = match session.send_packet(&packet) {
            Ok(()) => session.receive_frame(&mut frame).is_ok(),
            Err(e) => {
                // the packet is still remuxed below, recording is unaffected
                log::info!("decode error: {e}, skipping frame");
                false
            }
        };
        metrics.end(Phase::Decode);

        if decoded {
            emit_snapshots(&session, &mut encoder, &mut metrics, &output, &mut frame)?;
        }

        output.write_packet(session.time_base(), &mut packet)?;

        metrics.end(Phase::Loop);
        metrics.advance();
    };

    output.close()?;
    finish
}

/// Encode and send the full-resolution and thumbnail JPEGs for one decoded
/// frame, full first. Encode failures skip the frame but never stop capture.
fn emit_snapshots(
    session: &InputSession,
    encoder: &mut FrameEncoder,
    metrics: &mut CaptureMetrics,
    output: &OutputSession,
    frame: &mut frame::Video,
) -> Result<(), WorkerError> {
    let offset = clock::rescale_q(
        frame.pts().unwrap_or(0) - output.first_pts(),
        session.time_base(),
        clock::MICROSECOND,
    );
    let unscaled_width = frame.width() as i32;
    let unscaled_height = frame.height() as i32;

    metrics.begin(Phase::JpegFull);
    let full = encoder.encode_full(frame);
    metrics.end(Phase::JpegFull);
    match full {
        Ok(jpeg) => channel::send_frame(&FrameMessage {
            jpeg: &jpeg,
            offset,
            unscaled_width,
            unscaled_height,
        })?,
        Err(e) => log::warn!("jpeg encode failed: {e}, skipping frame"),
    }

    let (scaled_width, scaled_height) = (session.scaled_width(), session.scaled_height());
    metrics.begin(Phase::JpegScaled);
    let scaled = encoder.encode_scaled(session, frame, scaled_width, scaled_height);
    metrics.end(Phase::JpegScaled);
    match scaled {
        Ok(jpeg) => channel::send_scaled_frame(
            &FrameMessage {
                jpeg: &jpeg,
                offset,
                unscaled_width,
                unscaled_height,
            },
            scaled_height as i32,
        )?,
        Err(e) => log::warn!("scaled jpeg encode failed: {e}, skipping frame"),
    }

    Ok(())
}
