//! Fixed-step bucket averaging of raw usage samples.

/// One averaged bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Offset of the bucket's first sample, in scale units.
    pub index: usize,
    /// Mean of the non-null samples in the bucket.
    pub average: f64,
}

/// Splits `samples` into consecutive slices of `step` entries and averages
/// each slice over its non-null values.
///
/// Slices with no values are dropped, never zero-filled. The last slice may be
/// shorter than `step`. A `step` of zero is treated as one.
pub fn resample(samples: &[Option<f64>], step: usize) -> Vec<Bucket> {
    let step = step.max(1);

    samples
        .chunks(step)
        .enumerate()
        .filter_map(|(n, chunk)| {
            let (sum, count) = chunk
                .iter()
                .flatten()
                .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

            (count > 0).then(|| Bucket {
                index: n * step,
                average: sum / count as f64,
            })
        })
        .collect()
}
