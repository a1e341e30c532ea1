use ffmpeg_next as ffmpeg;
use thiserror::Error;

/// Phase of input-session setup that failed. The numeric code becomes part of
/// the worker exit diagnostics so the supervisor can tell a dead camera from a
/// missing decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    DemuxerOpen = 1,
    StreamProbe = 2,
    StreamSelect = 3,
    DecoderLookup = 4,
    ContextAlloc = 5,
    ParameterCopy = 6,
    CodecOpen = 7,
    HardwareInit = 8,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("input open failed ({phase:?}): {source}")]
    Open {
        phase: OpenPhase,
        source: ffmpeg::Error,
    },

    #[error("decode failure: {0}")]
    Decode(ffmpeg::Error),

    #[error("jpeg encode failure: {0}")]
    Encode(String),

    #[error("jpeg compression failure: {0}")]
    Jpeg(#[from] turbojpeg::Error),

    #[error("muxer failure: {0}")]
    Muxer(ffmpeg::Error),

    #[error("supervisor channel serialization failure")]
    Serialize,

    #[error("read interrupted by watchdog")]
    Interrupted,

    #[error("end of stream")]
    EndOfStream,

    #[error("seek failure: {0}")]
    Seek(ffmpeg::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),
}

impl WorkerError {
    pub fn open(phase: OpenPhase, source: ffmpeg::Error) -> Self {
        WorkerError::Open { phase, source }
    }

    /// Worker exit status for this error. A watchdog interrupt and a normal
    /// end of stream are clean shutdowns.
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkerError::Interrupted | WorkerError::EndOfStream => 0,
            WorkerError::Open { .. } => 1,
            WorkerError::Serialize => 5,
            _ => 2,
        }
    }
}
