//! Normalization samples reported while the simulation runs.
//!
//! For a closed system the normalization is conserved, so a sample series is
//! a cheap check on the numerical kernel. Samples are program output, one
//! line per sample on stdout, not log records.

use std::io::{self, Write};

use tracing::{debug, warn};

/// Normalization of the field after a given frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormSample {
    /// Frame counter at the time of the sample.
    pub frame: u64,
    /// Sum of `|ψ|²` over the grid divided by the grid area.
    pub norm: f64,
}

impl NormSample {
    /// The output line for this sample, `frame,<TAB>norm`.
    #[must_use]
    pub fn line(&self) -> String {
        format!("{},\t{}", self.frame, self.norm)
    }
}

/// Receives normalization samples.
pub trait DiagnosticSink {
    /// Handles one sample.
    fn record(&mut self, sample: NormSample);
}

/// Writes each sample as a line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn record(&mut self, sample: NormSample) {
        debug!(frame = sample.frame, norm = sample.norm, "normalization");
        let mut out = io::stdout().lock();
        if let Err(err) = writeln!(out, "{}", sample.line()) {
            warn!("failed to write normalization sample: {err}");
        }
    }
}

impl DiagnosticSink for Vec<NormSample> {
    fn record(&mut self, sample: NormSample) {
        self.push(sample);
    }
}

/// Largest relative deviation of any sample from the first one.
///
/// Returns `None` when there are no samples or the first norm is zero.
#[must_use]
pub fn relative_drift(samples: &[NormSample]) -> Option<f64> {
    let reference = samples.first()?.norm;
    if reference == 0.0 {
        return None;
    }
    samples
        .iter()
        .map(|s| ((s.norm - reference) / reference).abs())
        .reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_uses_comma_tab_separator() {
        let sample = NormSample {
            frame: 300,
            norm: 0.25,
        };
        assert_eq!(sample.line(), "300,\t0.25");
    }

    #[test]
    fn drift_is_relative_to_first_sample() {
        let samples: Vec<_> = [2.0, 2.01, 1.98, 2.0]
            .into_iter()
            .enumerate()
            .map(|(i, norm)| NormSample {
                frame: i as u64 * 100,
                norm,
            })
            .collect();
        let drift = relative_drift(&samples).unwrap();
        assert!((drift - 0.01).abs() < 1e-12);
        assert_eq!(relative_drift(&[]), None);
    }

    #[test]
    fn vec_sink_collects_in_order() {
        let mut sink = Vec::new();
        sink.record(NormSample { frame: 0, norm: 1.0 });
        sink.record(NormSample {
            frame: 100,
            norm: 1.0,
        });
        assert_eq!(sink.iter().map(|s| s.frame).collect::<Vec<_>>(), [0, 100]);
    }
}
