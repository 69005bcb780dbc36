//! Pulse shape features of a single waveform.
//!
//! The waveform is smoothed with a centered moving average, the most prominent local maximum is
//! taken as the pulse, and the rise is characterized by where the smoothed waveform first crosses
//! fixed fractions of the pulse height above its base.

pub const PEAK_POSITION_NAME: &str = "peak_position";
pub const PEAK_HEIGHT_NAME: &str = "peak_height";
pub const PEAK_BASE_NAME: &str = "peak_base";

/// Column name for a rise-time fraction, e.g. 0.1 -> RT10
pub fn rise_time_name(fraction: f64) -> String {
    format!("RT{:02}", (fraction * 100.0).round() as u32)
}

/// Mirror an out of range index back into 0..len (d c b a | a b c d | d c b a)
fn reflect_index(idx: isize, len: usize) -> usize {
    let len = len as isize;
    let k = idx.rem_euclid(2 * len);
    if k >= len {
        (2 * len - 1 - k) as usize
    } else {
        k as usize
    }
}

/// Centered moving average with reflected edges.
///
/// Sample i averages the window [i - w/2, i + w - w/2 - 1]. Computed as a running sum, so a flat
/// input stays exactly flat.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let len = values.len();
    if len == 0 || window <= 1 {
        return values.to_vec();
    }
    let lead = (window / 2) as isize;
    let trail = (window - window / 2 - 1) as isize;
    let at = |idx: isize| values[reflect_index(idx, len)];

    let mut sum: f64 = (-lead..=trail).map(at).sum();
    let mut smoothed = Vec::with_capacity(len);
    smoothed.push(sum / window as f64);
    for i in 1..len as isize {
        sum += at(i + trail) - at(i - lead - 1);
        smoothed.push(sum / window as f64);
    }
    smoothed
}

/// Indices of all local maxima. A flat-topped maximum reports the middle of its plateau; the
/// first and last samples are never maxima.
pub fn find_local_maxima(values: &[f64]) -> Vec<usize> {
    let mut maxima = Vec::new();
    if values.len() < 3 {
        return maxima;
    }
    let i_max = values.len() - 1;
    let mut i = 1;
    while i < i_max {
        if values[i - 1] < values[i] {
            let mut i_ahead = i + 1;
            while i_ahead < i_max && values[i_ahead] == values[i] {
                i_ahead += 1;
            }
            if values[i_ahead] < values[i] {
                maxima.push((i + i_ahead - 1) / 2);
                i = i_ahead;
            }
        }
        i += 1;
    }
    maxima
}

/// Thin out maxima closer than distance samples, keeping the higher ones first.
/// Returns the surviving indices in ascending order.
pub fn select_by_distance(values: &[f64], maxima: &[usize], distance: usize) -> Vec<usize> {
    if distance <= 1 || maxima.len() < 2 {
        return maxima.to_vec();
    }
    let mut keep = vec![true; maxima.len()];
    let mut by_priority: Vec<usize> = (0..maxima.len()).collect();
    by_priority.sort_by(|a, b| values[maxima[*a]].total_cmp(&values[maxima[*b]]));

    for &j in by_priority.iter().rev() {
        if !keep[j] {
            continue;
        }
        for k in (0..j).rev() {
            if maxima[j] - maxima[k] >= distance {
                break;
            }
            keep[k] = false;
        }
        for k in (j + 1)..maxima.len() {
            if maxima[k] - maxima[j] >= distance {
                break;
            }
            keep[k] = false;
        }
    }
    maxima
        .iter()
        .zip(keep)
        .filter_map(|(idx, kept)| kept.then_some(*idx))
        .collect()
}

/// Height of the peak above the higher of the lowest points reached on either side before the
/// signal climbs above the peak (or the edge of the waveform is hit)
pub fn prominence(values: &[f64], peak: usize) -> f64 {
    let top = values[peak];
    let left_min = values[..=peak]
        .iter()
        .rev()
        .take_while(|v| **v <= top)
        .fold(top, |acc, v| acc.min(*v));
    let right_min = values[peak..]
        .iter()
        .take_while(|v| **v <= top)
        .fold(top, |acc, v| acc.min(*v));
    top - left_min.max(right_min)
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// First index i where the sign of (x - level) differs between i and i + 1
pub fn first_crossing(values: &[f64], level: f64) -> Option<usize> {
    values
        .windows(2)
        .position(|pair| sign(pair[0] - level) != sign(pair[1] - level))
}

/// Features of one waveform. Crossings are sample indices, one per rise-time fraction
#[derive(Debug, Clone, PartialEq)]
pub struct PeakFeatures {
    pub peak_index: usize,
    pub peak_height: f64,
    pub peak_base: f64,
    pub crossings: Vec<Option<usize>>,
    pub found: bool,
}

impl PeakFeatures {
    /// The sentinel for a waveform without any peak: zeros and no crossings
    pub fn not_found(n_fractions: usize) -> Self {
        Self {
            peak_index: 0,
            peak_height: 0.0,
            peak_base: 0.0,
            crossings: vec![None; n_fractions],
            found: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureExtractor {
    fractions: Vec<f64>,
    window: usize,
}

impl FeatureExtractor {
    pub fn new(fractions: &[f64], window: usize) -> Self {
        Self {
            fractions: fractions.to_vec(),
            window,
        }
    }

    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    pub fn rise_time_names(&self) -> Vec<String> {
        self.fractions.iter().map(|f| rise_time_name(*f)).collect()
    }

    /// All feature columns in the order they are appended to a dataset
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec![
            PEAK_POSITION_NAME.to_string(),
            PEAK_HEIGHT_NAME.to_string(),
            PEAK_BASE_NAME.to_string(),
        ];
        names.extend(self.rise_time_names());
        names
    }

    pub fn extract(&self, waveform: &[f64]) -> PeakFeatures {
        let smoothed = moving_average(waveform, self.window);
        let distance = (smoothed.len() / 10).max(1);
        let peaks = select_by_distance(&smoothed, &find_local_maxima(&smoothed), distance);

        // Highest prominence wins, the earliest peak on ties
        let mut best: Option<(usize, f64)> = None;
        for peak in peaks {
            let prom = prominence(&smoothed, peak);
            if best.map_or(true, |(_, best_prom)| prom > best_prom) {
                best = Some((peak, prom));
            }
        }
        let Some((peak_index, peak_height)) = best else {
            return PeakFeatures::not_found(self.fractions.len());
        };
        let peak_base = smoothed[peak_index] - peak_height;

        let crossings = self
            .fractions
            .iter()
            .map(|fraction| first_crossing(&smoothed, peak_base + fraction * peak_height))
            .collect();

        PeakFeatures {
            peak_index,
            peak_height,
            peak_base,
            crossings,
            found: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(len: usize, center: f64, width: f64) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let x = i as f64;
                (-(x - center).powi(2) / (2.0 * width * width)).exp()
            })
            .collect()
    }

    #[test]
    fn test_moving_average_reflects_edges() {
        let smoothed = moving_average(&[1.0, 2.0, 3.0, 4.0], 3);
        let expected = [4.0 / 3.0, 2.0, 3.0, 11.0 / 3.0];
        for (got, want) in smoothed.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
        let flat = moving_average(&[2.5; 100], 50);
        assert!(flat.iter().all(|v| *v == 2.5));
        // Even window: [i - 2, i + 1]
        let even = moving_average(&[0.0, 0.0, 4.0, 0.0, 0.0], 4);
        assert_eq!(even[2], 1.0);
    }

    #[test]
    fn test_local_maxima() {
        assert_eq!(find_local_maxima(&[0.0, 1.0, 2.0, 2.0, 2.0, 1.0, 0.0]), vec![3]);
        assert_eq!(find_local_maxima(&[0.0, 3.0, 1.0, 4.0, 0.0]), vec![1, 3]);
        // Edges and rising-only plateaus are not maxima
        assert!(find_local_maxima(&[5.0, 4.0, 3.0]).is_empty());
        assert!(find_local_maxima(&[0.0, 1.0, 1.0]).is_empty());
    }

    #[test]
    fn test_prominence_and_distance() {
        let values = [0.0, 3.0, 1.0, 4.0, 0.0];
        assert_eq!(prominence(&values, 1), 2.0);
        assert_eq!(prominence(&values, 3), 4.0);
        assert_eq!(select_by_distance(&values, &[1, 3], 3), vec![3]);
        assert_eq!(select_by_distance(&values, &[1, 3], 2), vec![1, 3]);
    }

    #[test]
    fn test_rise_time_names() {
        let names: Vec<String> = [0.05, 0.1, 0.15, 0.5, 0.95]
            .iter()
            .map(|f| rise_time_name(*f))
            .collect();
        assert_eq!(names, vec!["RT05", "RT10", "RT15", "RT50", "RT95"]);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let extractor = FeatureExtractor::new(&[0.1, 0.5, 0.9], 5);
        let waveform: Vec<f64> = pulse(500, 220.0, 15.0)
            .iter()
            .enumerate()
            .map(|(i, v)| v + 0.01 * ((i * 7919 % 13) as f64 - 6.0))
            .collect();
        assert_eq!(extractor.extract(&waveform), extractor.extract(&waveform));
    }

    #[test]
    fn test_extract_without_peak() {
        let extractor = FeatureExtractor::new(&[0.1, 0.5], 50);
        let flat = extractor.extract(&[1.0; 300]);
        assert_eq!(flat, PeakFeatures::not_found(2));
        let falling: Vec<f64> = (0..300).map(|i| -(i as f64)).collect();
        assert!(!extractor.extract(&falling).found);
        assert!(!extractor.extract(&[]).found);
    }

    #[test]
    fn test_crossings_rise_in_order() {
        let fractions: Vec<f64> = (1..20).map(|i| i as f64 * 0.05).collect();
        let extractor = FeatureExtractor::new(&fractions, 50);
        let waveform: Vec<f64> = pulse(2000, 1200.0, 80.0).iter().map(|v| 3.0 * v + 0.2).collect();
        let features = extractor.extract(&waveform);

        assert!(features.found);
        assert!((features.peak_index as i64 - 1200).abs() <= 1);
        assert!((features.peak_base - 0.2).abs() < 1e-3);
        let crossings: Vec<usize> = features.crossings.iter().map(|c| c.unwrap()).collect();
        assert!(crossings.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(*crossings.last().unwrap() < 1200);
    }
}
