//! Per-phase interval sampling for the capture loop. Telemetry only; the
//! samples never influence pipeline behavior.

use std::time::Instant;

use crate::clock;

pub const SAMPLE_COUNT: usize = 125;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loop = 0,
    Decode = 1,
    JpegFull = 2,
    JpegScaled = 3,
}

const PHASE_COUNT: usize = 4;

const PHASE_LABELS: [&str; PHASE_COUNT] = [
    "loop_time",
    "decode_time",
    "jpeg_encode_time",
    "scaled_jpeg_encode_time",
];

pub struct CaptureMetrics {
    index: usize,
    samples: [[i64; SAMPLE_COUNT]; PHASE_COUNT],
    started: [Instant; PHASE_COUNT],
}

impl CaptureMetrics {
    pub fn new() -> Self {
        CaptureMetrics {
            index: 0,
            samples: [[0; SAMPLE_COUNT]; PHASE_COUNT],
            started: [Instant::now(); PHASE_COUNT],
        }
    }

    pub fn begin(&mut self, phase: Phase) {
        self.started[phase as usize] = Instant::now();
    }

    pub fn end(&mut self, phase: Phase) {
        let p = phase as usize;
        self.samples[p][self.index] = clock::interval_ms(self.started[p], Instant::now());
    }

    /// Advance the ring after a loop iteration. Each time the ring fills, a
    /// summary log line is emitted and sampling starts over.
    pub fn advance(&mut self) {
        self.index += 1;
        if self.index >= SAMPLE_COUNT {
            log::info!("{}", self.summary());
            self.index = 0;
        }
    }

    fn summary(&self) -> String {
        let mut line = String::from("capture timings ms (min/avg/max):");
        for (p, label) in PHASE_LABELS.iter().enumerate() {
            let (min, avg, max) = stats(&self.samples[p]);
            line.push_str(&format!(" {label} {min}/{avg}/{max}"));
        }
        line
    }
}

fn stats(samples: &[i64; SAMPLE_COUNT]) -> (i64, i64, i64) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    let mut sum = 0i64;
    for &s in samples {
        min = min.min(s);
        max = max.max(s);
        sum += s;
    }
    (min, sum / SAMPLE_COUNT as i64, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_after_sample_count_iterations() {
        let mut m = CaptureMetrics::new();
        for _ in 0..SAMPLE_COUNT {
            m.begin(Phase::Loop);
            m.end(Phase::Loop);
            m.advance();
        }
        assert_eq!(m.index, 0);
    }

    #[test]
    fn stats_cover_min_avg_max() {
        let mut samples = [0i64; SAMPLE_COUNT];
        samples[0] = 10;
        samples[1] = 20;
        let (min, avg, max) = stats(&samples);
        assert_eq!(min, 0);
        assert_eq!(max, 20);
        assert_eq!(avg, 30 / SAMPLE_COUNT as i64);
    }
}
