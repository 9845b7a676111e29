use crate::state::HistogramBin;

/// Equal-width histogram over `values`.
///
/// Buckets are `[low, high)` except the last, which is closed so the maximum
/// lands in it. When every value is equal a single bucket holds them all.
/// Non-finite values are ignored.
pub fn compute_histogram(values: &[f64], buckets: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || buckets == 0 {
        return Vec::new();
    }

    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if min == max {
        return vec![HistogramBin {
            bucket: 0,
            low: min,
            high: max,
            count: finite.len() as u64,
        }];
    }

    let width = (max - min) / buckets as f64;
    let mut counts = vec![0u64; buckets];
    for v in &finite {
        let idx = (((v - min) / width).floor() as usize).min(buckets - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            bucket: i as u32,
            low: min + width * i as f64,
            high: if i + 1 == buckets {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count,
        })
        .collect()
}
