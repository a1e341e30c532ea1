//! Input session: demuxer + decoder for one video source, with the watchdog
//! interrupt that bounds blocking network reads and the optional hardware
//! decode backend.

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{codec, decoder, format, frame, media, Codec, Packet, Rational};

use crate::channel;
use crate::clock;
use crate::error::{OpenPhase, WorkerError};

/// A read stalled longer than this is cancelled by the watchdog.
pub const READ_TIMEOUT_MS: i64 = 5000;

/// Warmup before PTS regressions trigger the walltime fallback.
const PTS_WARMUP_PACKETS: i64 = 100;

const RTP_TIMEBASE: Rational = Rational(1, 90_000);

/// Hardware decode backend requested on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    None,
    Cuda,
    Vaapi,
    QuickSync,
}

impl Backend {
    pub fn parse(name: &str) -> Option<Backend> {
        match name {
            "none" => Some(Backend::None),
            "cuda" => Some(Backend::Cuda),
            "vaapi" => Some(Backend::Vaapi),
            "qsv" => Some(Backend::QuickSync),
            _ => None,
        }
    }

    fn device_type(self) -> ffi::AVHWDeviceType {
        use ffi::AVHWDeviceType::*;
        match self {
            Backend::None => AV_HWDEVICE_TYPE_NONE,
            Backend::Cuda => AV_HWDEVICE_TYPE_CUDA,
            Backend::Vaapi => AV_HWDEVICE_TYPE_VAAPI,
            Backend::QuickSync => AV_HWDEVICE_TYPE_QSV,
        }
    }

    fn surface_format(self) -> ffi::AVPixelFormat {
        use ffi::AVPixelFormat::*;
        match self {
            Backend::None => AV_PIX_FMT_NONE,
            Backend::Cuda => AV_PIX_FMT_CUDA,
            Backend::Vaapi => AV_PIX_FMT_VAAPI,
            Backend::QuickSync => AV_PIX_FMT_QSV,
        }
    }
}

/// State the demuxer's interrupt callback polls while a read blocks. The
/// owning loop is the only writer; the callback only loads.
struct Watchdog {
    last_read_ms: AtomicI64,
}

unsafe extern "C" fn interrupt_cb(opaque: *mut c_void) -> c_int {
    let watchdog = &*(opaque as *const Watchdog);
    let waited = clock::monotonic_ms() - watchdog.last_read_ms.load(Ordering::Relaxed);
    // The supervisor closing our stdin means shut down, same as a stall.
    (waited > READ_TIMEOUT_MS || channel::supervisor_hangup()) as c_int
}

unsafe extern "C" fn get_hw_format(
    _ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    use ffi::AVPixelFormat::*;
    let mut p = formats;
    while *p != AV_PIX_FMT_NONE {
        if matches!(*p, AV_PIX_FMT_CUDA | AV_PIX_FMT_VAAPI | AV_PIX_FMT_QSV) {
            return *p;
        }
        p = p.add(1);
    }
    AV_PIX_FMT_NONE
}

/// Owned reference to a hardware device context, released after the decoder
/// and demuxer.
struct HwDeviceRef(*mut ffi::AVBufferRef);

impl Drop for HwDeviceRef {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { ffi::av_buffer_unref(&mut self.0) };
        }
    }
}

pub struct InputSession {
    decoder: decoder::Video,
    input: format::context::Input,
    hw_device: HwDeviceRef,
    watchdog: Box<Watchdog>,
    stream_index: usize,
    time_base: Rational,
    backend: Backend,
    scaled_width: u32,
    scaled_height: u32,
    opened_at: Instant,
    // emit-timestamp state
    last_pts: i64,
    last_emit: Instant,
    packet_count: i64,
    walltime_fallback: bool,
}

impl InputSession {
    /// Open `url`, probe it, pick the best video stream and build a decoder
    /// for the requested backend. All failures here are fatal to the worker.
    pub fn open(url: &str, requested: Backend) -> Result<InputSession, WorkerError> {
        let watchdog = Box::new(Watchdog {
            last_read_ms: AtomicI64::new(clock::monotonic_ms()),
        });

        let input = open_demuxer(url, &watchdog)?;

        let (stream_index, time_base, params) = {
            let stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or_else(|| WorkerError::open(OpenPhase::StreamSelect, ffmpeg::Error::StreamNotFound))?;
            (stream.index(), stream.time_base(), stream.parameters())
        };

        let codec_id = params.id();
        let profile = unsafe { (*params.as_ptr()).profile };

        let mut backend = requested;
        // The QuickSync decoder cannot handle h264 Baseline streams.
        if backend == Backend::QuickSync
            && codec_id == codec::Id::H264
            && profile == ffi::FF_PROFILE_H264_BASELINE as c_int
        {
            log::info!("stream is h264 Baseline, decoding in software instead of QuickSync");
            backend = Backend::None;
        }

        let mut hw_device = HwDeviceRef(ptr::null_mut());

        let decoder = match backend {
            Backend::None => codec::context::Context::from_parameters(params)
                .map_err(|e| WorkerError::open(OpenPhase::ParameterCopy, e))?
                .decoder()
                .video()
                .map_err(|e| WorkerError::open(OpenPhase::CodecOpen, e))?,
            Backend::QuickSync => {
                let codec = decoder::find_by_name("h264_qsv")
                    .ok_or_else(|| WorkerError::open(OpenPhase::DecoderLookup, ffmpeg::Error::DecoderNotFound))?;
                let mut ctx = alloc_decoder_context(codec)?;
                ctx.set_parameters(params)
                    .map_err(|e| WorkerError::open(OpenPhase::ParameterCopy, e))?;
                unsafe {
                    (*ctx.as_mut_ptr()).get_format = Some(get_hw_format);
                    hw_device = init_hw_device(backend, ctx.as_mut_ptr())?;
                }
                ctx.decoder()
                    .video()
                    .map_err(|e| WorkerError::open(OpenPhase::CodecOpen, e))?
            }
            Backend::Vaapi | Backend::Cuda => {
                let codec = decoder::find(codec_id)
                    .ok_or_else(|| WorkerError::open(OpenPhase::DecoderLookup, ffmpeg::Error::DecoderNotFound))?;
                let mut ctx = alloc_decoder_context(codec)?;
                ctx.set_parameters(params)
                    .map_err(|e| WorkerError::open(OpenPhase::ParameterCopy, e))?;
                unsafe {
                    (*ctx.as_mut_ptr()).get_format = Some(get_hw_format);
                    if backend == Backend::Vaapi {
                        (*ctx.as_mut_ptr()).pix_fmt = ffi::AVPixelFormat::AV_PIX_FMT_VAAPI;
                    }
                    hw_device = init_hw_device(backend, ctx.as_mut_ptr())?;
                }
                ctx.decoder()
                    .video()
                    .map_err(|e| WorkerError::open(OpenPhase::CodecOpen, e))?
            }
        };

        let height = decoder.height().max(1);
        let scaled_height = 480u32;
        let scaled_width = ((decoder.width() as f64) * 480.0 / (height as f64)).round() as u32;

        // seek() needs the packet queue untouched, so nothing is read here
        Ok(InputSession {
            decoder,
            input,
            hw_device,
            watchdog,
            stream_index,
            time_base,
            backend,
            scaled_width,
            scaled_height,
            opened_at: Instant::now(),
            last_pts: -1,
            last_emit: Instant::now(),
            packet_count: 0,
            walltime_fallback: false,
        })
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn scaled_width(&self) -> u32 {
        self.scaled_width
    }

    pub fn scaled_height(&self) -> u32 {
        self.scaled_height
    }

    /// Read the next packet from the demuxer. A watchdog cancellation
    /// surfaces as `Interrupted`; end of input as `EndOfStream`.
    pub fn read_packet(&mut self, packet: &mut Packet) -> Result<(), WorkerError> {
        match packet.read(&mut self.input) {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(ffmpeg::Error::Eof) => Err(WorkerError::EndOfStream),
            Err(ffmpeg::Error::Exit) => Err(WorkerError::Interrupted),
            Err(e) => Err(WorkerError::Ffmpeg(e)),
        }
    }

    /// Refresh the watchdog deadline.
    pub fn touch(&self) {
        self.watchdog
            .last_read_ms
            .store(clock::monotonic_ms(), Ordering::Relaxed);
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), WorkerError> {
        self.decoder.send_packet(packet).map_err(WorkerError::Decode)
    }

    pub fn receive_frame(&mut self, frame: &mut frame::Video) -> Result<(), ffmpeg::Error> {
        self.decoder.receive_frame(frame)
    }

    /// Signal end of input to the decoder so it drains its delayed frames.
    pub fn send_eof(&mut self) -> Result<(), WorkerError> {
        self.decoder.send_eof().map_err(WorkerError::Decode)
    }

    /// Timestamp and duration (stream timebase) to stamp on an outgoing
    /// packet. RTP sources restart their clock on reconnect; once a
    /// regression shows up after the warmup, timestamps are derived from the
    /// monotonic clock for the rest of the session.
    pub fn emit_timestamp(&mut self, packet: &Packet) -> (i64, i64) {
        self.packet_count += 1;
        let raw_pts = packet.pts().unwrap_or(0);
        let regression = self.packet_count > PTS_WARMUP_PACKETS && raw_pts <= self.last_pts;

        let stamped = if self.walltime_fallback || regression {
            if !self.walltime_fallback {
                log::warn!(
                    "non-monotonic pts {} after {} packets, switching to walltime timestamps",
                    raw_pts,
                    self.packet_count
                );
                self.walltime_fallback = true;
            }
            let now = Instant::now();
            let pts_us = clock::interval_ms(self.opened_at, now) * 1000;
            let duration_us = clock::interval_ms(self.last_emit, now) * 1000;
            (
                clock::rescale_q(pts_us, clock::MICROSECOND, self.time_base),
                clock::rescale_q(duration_us, clock::MICROSECOND, self.time_base),
            )
        } else {
            (
                clock::rescale_q(raw_pts, RTP_TIMEBASE, self.time_base),
                clock::rescale_q(packet.duration(), clock::MICROSECOND, self.time_base),
            )
        };

        self.last_pts = raw_pts;
        self.last_emit = Instant::now();
        stamped
    }

    /// Seek the video stream so decoding resumes from the I-frame at or
    /// before `stream_ts`, then reset the decoder.
    pub fn seek(&mut self, stream_ts: i64) -> Result<(), WorkerError> {
        let flags = (ffi::AVSEEK_FLAG_BACKWARD | ffi::AVSEEK_FLAG_FRAME) as c_int;
        let err = unsafe {
            ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                self.stream_index as c_int,
                stream_ts,
                flags,
            )
        };
        if err < 0 {
            return Err(WorkerError::Seek(ffmpeg::Error::from(err)));
        }
        self.decoder.flush();
        Ok(())
    }

    pub(crate) fn stream_codecpar(&self) -> *const ffi::AVCodecParameters {
        match self.input.stream(self.stream_index) {
            Some(stream) => unsafe { (*stream.as_ptr()).codecpar },
            None => ptr::null(),
        }
    }

    pub(crate) fn decoder_hw_frames(&self) -> *mut ffi::AVBufferRef {
        unsafe { (*self.decoder.as_ptr()).hw_frames_ctx }
    }

    pub(crate) fn hw_device(&self) -> *mut ffi::AVBufferRef {
        self.hw_device.0
    }
}

fn alloc_decoder_context(codec: Codec) -> Result<codec::context::Context, WorkerError> {
    let ctx_ptr = unsafe { ffi::avcodec_alloc_context3(codec.as_ptr()) };
    if ctx_ptr.is_null() {
        return Err(WorkerError::open(OpenPhase::ContextAlloc, ffmpeg::Error::Unknown));
    }
    Ok(unsafe { codec::context::Context::wrap(ctx_ptr, None) })
}

/// Allocate the format context by hand so the interrupt callback and the
/// RTSP options are in place before the open call can block.
fn open_demuxer(url: &str, watchdog: &Watchdog) -> Result<format::context::Input, WorkerError> {
    let url_c = CString::new(url).unwrap_or_default();

    unsafe {
        let mut fcx = ffi::avformat_alloc_context();
        if fcx.is_null() {
            return Err(WorkerError::open(OpenPhase::DemuxerOpen, ffmpeg::Error::Unknown));
        }
        (*fcx).interrupt_callback.callback = Some(interrupt_cb);
        (*fcx).interrupt_callback.opaque = watchdog as *const Watchdog as *mut c_void;
        (*fcx).max_delay = 500_000;

        let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
        for (key, value) in [
            ("buffer_size", "26214400"),
            ("rtsp_transport", "udp"),
            // default reorder queue is 500, far too small for lossy cameras
            ("reorder_queue_size", "2500"),
        ] {
            let key = CString::new(key).unwrap_or_default();
            let value = CString::new(value).unwrap_or_default();
            ffi::av_dict_set(&mut opts, key.as_ptr(), value.as_ptr(), 0);
        }

        let err = ffi::avformat_open_input(&mut fcx, url_c.as_ptr(), ptr::null(), &mut opts);
        ffi::av_dict_free(&mut opts);
        if err < 0 {
            // a failed open frees the caller-allocated context
            return Err(WorkerError::open(OpenPhase::DemuxerOpen, ffmpeg::Error::from(err)));
        }

        (*fcx).fps_probe_size = 500;
        // probing can take a while on a lossy link; reset the deadline first
        watchdog
            .last_read_ms
            .store(clock::monotonic_ms(), Ordering::Relaxed);
        let err = ffi::avformat_find_stream_info(fcx, ptr::null_mut());
        if err < 0 {
            ffi::avformat_close_input(&mut fcx);
            return Err(WorkerError::open(OpenPhase::StreamProbe, ffmpeg::Error::from(err)));
        }

        Ok(format::context::Input::wrap(fcx))
    }
}

/// Create the hardware device and a 1080p NV12 frames pool, and hand both to
/// the decoder context (original layout from the VAAPI bring-up).
unsafe fn init_hw_device(
    backend: Backend,
    ccx: *mut ffi::AVCodecContext,
) -> Result<HwDeviceRef, WorkerError> {
    let mut device: *mut ffi::AVBufferRef = ptr::null_mut();
    let device_path = match backend {
        Backend::Vaapi => Some(CString::new("/dev/dri/renderD128").unwrap_or_default()),
        _ => None,
    };
    let err = ffi::av_hwdevice_ctx_create(
        &mut device,
        backend.device_type(),
        device_path.as_ref().map_or(ptr::null(), |p| p.as_ptr()),
        ptr::null_mut(),
        0,
    );
    if err < 0 {
        return Err(WorkerError::open(OpenPhase::HardwareInit, ffmpeg::Error::from(err)));
    }
    let device = HwDeviceRef(device);

    let mut frames = ffi::av_hwframe_ctx_alloc(device.0);
    if frames.is_null() {
        return Err(WorkerError::open(OpenPhase::HardwareInit, ffmpeg::Error::Unknown));
    }
    let frames_ctx = (*frames).data as *mut ffi::AVHWFramesContext;
    (*frames_ctx).format = backend.surface_format();
    (*frames_ctx).sw_format = ffi::AVPixelFormat::AV_PIX_FMT_NV12;
    (*frames_ctx).width = 1920;
    (*frames_ctx).height = 1080;
    (*frames_ctx).initial_pool_size = 10;

    let err = ffi::av_hwframe_ctx_init(frames);
    if err < 0 {
        ffi::av_buffer_unref(&mut frames);
        return Err(WorkerError::open(OpenPhase::HardwareInit, ffmpeg::Error::from(err)));
    }

    (*ccx).hw_device_ctx = ffi::av_buffer_ref(device.0);
    (*ccx).hw_frames_ctx = ffi::av_buffer_ref(frames);
    ffi::av_buffer_unref(&mut frames);
    if (*ccx).hw_frames_ctx.is_null() {
        return Err(WorkerError::open(OpenPhase::HardwareInit, ffmpeg::Error::Unknown));
    }

    log::info!("hardware decoder initialized ({:?})", backend);
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_match_the_cli_contract() {
        assert_eq!(Backend::parse("none"), Some(Backend::None));
        assert_eq!(Backend::parse("cuda"), Some(Backend::Cuda));
        assert_eq!(Backend::parse("vaapi"), Some(Backend::Vaapi));
        assert_eq!(Backend::parse("qsv"), Some(Backend::QuickSync));
        assert_eq!(Backend::parse("dxva2"), None);
    }
}
