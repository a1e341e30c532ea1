//! JPEG encoding for decoded frames. Hardware-backed frames go through the
//! matching MJPEG hardware encoder where one exists; everything else is
//! compressed in software with turbojpeg.

use std::os::raw::c_void;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{codec, encoder, filter, frame, picture, software, util, Packet, Rational};

use crate::error::WorkerError;
use crate::input::{Backend, InputSession};

pub const JPEG_QUALITY: i32 = 80;

pub struct FrameEncoder {
    backend: Backend,
    vaapi_scaler: Option<filter::Graph>,
}

impl FrameEncoder {
    pub fn new(backend: Backend) -> FrameEncoder {
        FrameEncoder {
            backend,
            vaapi_scaler: None,
        }
    }

    /// Full-resolution JPEG for one decoded frame.
    pub fn encode_full(&mut self, frame: &mut frame::Video) -> Result<Vec<u8>, WorkerError> {
        normalize_jpeg_range(frame);
        if !is_hw_frame(frame) {
            return encode_software(frame);
        }
        match self.backend {
            Backend::QuickSync => encode_hw(frame, "mjpeg_qsv"),
            Backend::Vaapi => encode_hw(frame, "mjpeg_vaapi"),
            _ => {
                let sw = transfer_to_system(frame)?;
                encode_software(&sw)
            }
        }
    }

    /// Thumbnail JPEG at `width × height`.
    pub fn encode_scaled(
        &mut self,
        input: &InputSession,
        frame: &mut frame::Video,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, WorkerError> {
        normalize_jpeg_range(frame);
        if is_hw_frame(frame) {
            if self.backend == Backend::Vaapi {
                let mut scaled = self.scale_vaapi(input, frame, width, height)?;
                return encode_hw(&mut scaled, "mjpeg_vaapi");
            }
            // no same-backend scaler available, take the software route
            let sw = transfer_to_system(frame)?;
            let scaled = scale_software(&sw, width, height)?;
            return encode_software(&scaled);
        }
        let scaled = scale_software(frame, width, height)?;
        encode_software(&scaled)
    }

    fn scale_vaapi(
        &mut self,
        input: &InputSession,
        frame: &frame::Video,
        width: u32,
        height: u32,
    ) -> Result<frame::Video, WorkerError> {
        if self.vaapi_scaler.is_none() {
            self.vaapi_scaler = Some(build_vaapi_scaler(input, frame, width, height)?);
        }
        let graph = match self.vaapi_scaler.as_mut() {
            Some(graph) => graph,
            None => return Err(WorkerError::Encode("vaapi scaler unavailable".into())),
        };

        graph
            .get("in")
            .ok_or_else(|| WorkerError::Encode("vaapi scaler source missing".into()))?
            .source()
            .add(frame)
            .map_err(|e| WorkerError::Encode(e.to_string()))?;

        let mut scaled = frame::Video::empty();
        graph
            .get("out")
            .ok_or_else(|| WorkerError::Encode("vaapi scaler sink missing".into()))?
            .sink()
            .frame(&mut scaled)
            .map_err(|e| WorkerError::Encode(e.to_string()))?;
        Ok(scaled)
    }
}

/// The legacy full-range pixel format carries its range in the format tag;
/// rewrite it to the plain planar label plus an explicit range.
fn normalize_jpeg_range(frame: &mut frame::Video) {
    if frame.format() == Pixel::YUVJ420P {
        frame.set_format(Pixel::YUV420P);
        frame.set_color_range(util::color::Range::JPEG);
    }
}

fn is_hw_frame(frame: &frame::Video) -> bool {
    unsafe {
        let desc = ffi::av_pix_fmt_desc_get(frame.format().into());
        !desc.is_null() && ((*desc).flags & ffi::AV_PIX_FMT_FLAG_HWACCEL as u64) != 0
    }
}

/// Copy a hardware frame back into system memory.
fn transfer_to_system(frame: &frame::Video) -> Result<frame::Video, WorkerError> {
    let mut sw = frame::Video::empty();
    unsafe {
        let err = ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0);
        if err < 0 {
            return Err(WorkerError::Encode(format!(
                "hardware frame transfer failed: {}",
                ffmpeg::Error::from(err)
            )));
        }
        ffi::av_frame_copy_props(sw.as_mut_ptr(), frame.as_ptr());
    }
    Ok(sw)
}

fn scale_software(frame: &frame::Video, width: u32, height: u32) -> Result<frame::Video, WorkerError> {
    let mut scaled = frame::Video::new(Pixel::YUV420P, width, height);
    let mut scaler = software::scaling::Context::get(
        frame.format(),
        frame.width(),
        frame.height(),
        Pixel::YUV420P,
        width,
        height,
        software::scaling::flag::Flags::BICUBIC,
    )
    .map_err(|e| WorkerError::Encode(e.to_string()))?;
    scaler
        .run(frame, &mut scaled)
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    scaled.set_pts(frame.pts());
    Ok(scaled)
}

fn encode_software(frame: &frame::Video) -> Result<Vec<u8>, WorkerError> {
    if frame.format() != Pixel::YUV420P {
        // hardware transfers come back as NV12
        let converted = scale_software(frame, frame.width(), frame.height())?;
        return compress_yuv420(&converted);
    }
    compress_yuv420(frame)
}

/// Single-shot turbojpeg compression of a planar YUV 4:2:0 frame.
fn compress_yuv420(frame: &frame::Video) -> Result<Vec<u8>, WorkerError> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let chroma_width = (width + 1) / 2;
    let chroma_height = (height + 1) / 2;

    // planes are padded to the decoder's alignment; turbojpeg wants them
    // packed tight
    let mut pixels = Vec::with_capacity(width * height + 2 * chroma_width * chroma_height);
    for (plane, plane_width, plane_height) in [
        (0, width, height),
        (1, chroma_width, chroma_height),
        (2, chroma_width, chroma_height),
    ] {
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for row in 0..plane_height {
            pixels.extend_from_slice(&data[row * stride..row * stride + plane_width]);
        }
    }

    let image = turbojpeg::YuvImage {
        pixels: pixels.as_slice(),
        width,
        align: 1,
        height,
        subsamp: turbojpeg::Subsamp::Sub2x2,
    };
    let mut compressor = turbojpeg::Compressor::new()?;
    compressor.set_quality(JPEG_QUALITY)?;
    compressor.set_subsamp(turbojpeg::Subsamp::Sub2x2)?;
    let mut output = turbojpeg::OutputBuf::new_owned();
    compressor.compress_yuv(image, &mut output)?;
    Ok(output.to_vec())
}

/// Encode a hardware frame in place with the backend's MJPEG encoder, built
/// fresh per frame on top of the frame's own hardware frames pool.
fn encode_hw(frame: &mut frame::Video, name: &str) -> Result<Vec<u8>, WorkerError> {
    let codec = encoder::find_by_name(name)
        .ok_or_else(|| WorkerError::Encode(format!("{name} encoder not available")))?;

    let ctx_ptr = unsafe { ffi::avcodec_alloc_context3(codec.as_ptr()) };
    if ctx_ptr.is_null() {
        return Err(WorkerError::Encode("failed to allocate encoder context".into()));
    }
    let context = unsafe { codec::context::Context::wrap(ctx_ptr, None) };
    let mut video = context
        .encoder()
        .video()
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    video.set_width(frame.width());
    video.set_height(frame.height());
    video.set_format(frame.format());
    video.set_time_base(Rational(1, 25));

    unsafe {
        let frames_ctx = (*frame.as_ptr()).hw_frames_ctx;
        if frames_ctx.is_null() {
            return Err(WorkerError::Encode("hardware frame without frames context".into()));
        }
        (*ctx_ptr).hw_frames_ctx = ffi::av_buffer_ref(frames_ctx);
        if (*ctx_ptr).hw_frames_ctx.is_null() {
            return Err(WorkerError::Encode("failed to reference hardware frames context".into()));
        }
    }

    let mut encoder = video.open().map_err(|e| WorkerError::Encode(e.to_string()))?;

    frame.set_pts(Some(1));
    frame.set_kind(picture::Type::None);
    encoder
        .send_frame(frame)
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    encoder
        .send_eof()
        .map_err(|e| WorkerError::Encode(e.to_string()))?;

    let mut packet = Packet::empty();
    encoder
        .receive_packet(&mut packet)
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    match packet.data() {
        Some(data) if !data.is_empty() => Ok(data.to_vec()),
        _ => Err(WorkerError::Encode(format!("{name} produced an empty packet"))),
    }
}

fn build_vaapi_scaler(
    input: &InputSession,
    frame: &frame::Video,
    width: u32,
    height: u32,
) -> Result<filter::Graph, WorkerError> {
    let tb = input.time_base();
    let mut graph = filter::Graph::new();
    let args = format!(
        "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
        frame.width(),
        frame.height(),
        ffi::AVPixelFormat::AV_PIX_FMT_VAAPI as i32,
        tb.numerator(),
        tb.denominator(),
    );

    let buffer = filter::find("buffer")
        .ok_or_else(|| WorkerError::Encode("buffer filter missing".into()))?;
    let buffersink = filter::find("buffersink")
        .ok_or_else(|| WorkerError::Encode("buffersink filter missing".into()))?;
    graph
        .add(&buffer, "in", &args)
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    graph
        .add(&buffersink, "out", "")
        .map_err(|e| WorkerError::Encode(e.to_string()))?;

    unsafe {
        // the source must know about the decoder's frames pool before the
        // graph is configured
        if let Some(mut src) = graph.get("in") {
            let par = ffi::av_buffersrc_parameters_alloc();
            if par.is_null() {
                return Err(WorkerError::Encode("failed to allocate buffersrc parameters".into()));
            }
            (*par).hw_frames_ctx = input.decoder_hw_frames();
            let err = ffi::av_buffersrc_parameters_set(src.as_mut_ptr(), par);
            ffi::av_free(par as *mut c_void);
            if err < 0 {
                return Err(WorkerError::Encode(format!(
                    "failed to bind hardware frames to scaler: {}",
                    ffmpeg::Error::from(err)
                )));
            }
        }
    }

    graph
        .output("in", 0)
        .and_then(|p| p.input("out", 0))
        .and_then(|p| p.parse(&format!("format=vaapi,scale_vaapi=w={width}:h={height}")))
        .map_err(|e| WorkerError::Encode(e.to_string()))?;

    unsafe {
        let g = graph.as_mut_ptr();
        for i in 0..(*g).nb_filters as usize {
            let f = *(*g).filters.add(i);
            (*f).hw_device_ctx = ffi::av_buffer_ref(input.hw_device());
            if (*f).hw_device_ctx.is_null() {
                return Err(WorkerError::Encode("failed to reference hardware device".into()));
            }
        }
    }

    graph
        .validate()
        .map_err(|e| WorkerError::Encode(e.to_string()))?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32) -> frame::Video {
        let mut frame = frame::Video::new(Pixel::YUV420P, width, height);
        for plane in 0..3 {
            let value = if plane == 0 { 40u8 } else { 128u8 };
            let stride = frame.stride(plane);
            let rows = if plane == 0 { height } else { height.div_ceil(2) } as usize;
            let data = frame.data_mut(plane);
            for row in 0..rows {
                for b in &mut data[row * stride..(row + 1) * stride] {
                    *b = value;
                }
            }
        }
        frame
    }

    #[test]
    fn software_path_produces_a_jpeg() {
        let frame = gray_frame(64, 48);
        let jpeg = encode_software(&frame).unwrap();
        // SOI marker
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);
    }

    #[test]
    fn odd_dimensions_are_handled() {
        let frame = gray_frame(31, 17);
        let jpeg = encode_software(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn legacy_full_range_format_is_relabeled() {
        let mut frame = frame::Video::new(Pixel::YUVJ420P, 16, 16);
        normalize_jpeg_range(&mut frame);
        assert_eq!(frame.format(), Pixel::YUV420P);
        assert_eq!(frame.color_range(), util::color::Range::JPEG);
    }

    #[test]
    fn system_memory_frames_are_not_hardware() {
        let frame = gray_frame(16, 16);
        assert!(!is_hw_frame(&frame));
    }
}
