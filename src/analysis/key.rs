//! Musical key estimation from a 12-bin chroma vector.
//!
//! The chroma average is L1-normalized and correlated (Pearson) against all
//! twelve rotations of the Krumhansl major and minor key profiles. The best
//! rotation per mode is kept and major wins ties.

/// Pitch class names, index 0 is C.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Krumhansl-Kessler major key profile.
pub const KEY_PROFILE_MAJOR: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Krumhansl-Kessler minor key profile.
pub const KEY_PROFILE_MINOR: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Major or minor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Major,
    Minor,
}

/// An estimated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    /// Tonic pitch class, 0 = C.
    pub tonic: usize,
    pub mode: Mode,
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Major => "major",
            Mode::Minor => "minor",
        };
        write!(f, "{} {}", NOTE_NAMES[self.tonic % 12], mode)
    }
}

/// Estimates the key of an averaged chroma vector.
///
/// Returns `None` when the chroma sums to zero (silence), when it is flat
/// (no pitch class stands out, so every correlation is undefined) or when it
/// does not have exactly twelve finite bins.
pub fn detect_key(chroma: &[f64]) -> Option<Key> {
    if chroma.len() != 12 || chroma.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let sum: f64 = chroma.iter().sum();
    if sum == 0.0 {
        return None;
    }
    let normalized: Vec<f64> = chroma.iter().map(|v| v / sum).collect();

    let (major_tonic, major_score) = best_rotation(&normalized, &KEY_PROFILE_MAJOR)?;
    let (minor_tonic, minor_score) = best_rotation(&normalized, &KEY_PROFILE_MINOR)?;

    if major_score >= minor_score {
        Some(Key {
            tonic: major_tonic,
            mode: Mode::Major,
        })
    } else {
        Some(Key {
            tonic: minor_tonic,
            mode: Mode::Minor,
        })
    }
}

/// Best-correlating rotation of `profile`; the first index wins ties.
fn best_rotation(chroma: &[f64], profile: &[f64; 12]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for shift in 0..12 {
        // Rotating right by `shift` puts the profile's tonic on pitch class `shift`.
        let rotated: Vec<f64> = (0..12).map(|j| profile[(j + 12 - shift) % 12]).collect();
        let score = pearson(chroma, &rotated)?;
        match best {
            Some((_, current)) if current >= score => {}
            _ => best = Some((shift, score)),
        }
    }
    best
}

/// Pearson correlation coefficient, `None` when either side has no variance.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotate(profile: &[f64; 12], shift: usize) -> Vec<f64> {
        (0..12).map(|j| profile[(j + 12 - shift) % 12]).collect()
    }

    #[test]
    fn test_silence_is_undetermined() {
        assert_eq!(detect_key(&[0.0; 12]), None);
    }

    #[test]
    fn test_flat_chroma_is_undetermined() {
        assert_eq!(detect_key(&[0.5; 12]), None);
    }

    #[test]
    fn test_wrong_length_is_undetermined() {
        assert_eq!(detect_key(&[1.0; 11]), None);
        assert_eq!(detect_key(&[]), None);
    }

    #[test]
    fn test_major_profile_detected_as_c_major() {
        let key = detect_key(&KEY_PROFILE_MAJOR).expect("key");
        assert_eq!(key, Key { tonic: 0, mode: Mode::Major });
        assert_eq!(key.to_string(), "C major");
    }

    #[test]
    fn test_rotated_minor_profile() {
        // A minor: tonic on pitch class 9.
        let chroma = rotate(&KEY_PROFILE_MINOR, 9);
        let key = detect_key(&chroma).expect("key");
        assert_eq!(key.to_string(), "A minor");
    }

    #[test]
    fn test_scale_invariance() {
        let chroma: Vec<f64> = rotate(&KEY_PROFILE_MAJOR, 7).iter().map(|v| v * 40.0).collect();
        assert_eq!(detect_key(&chroma).expect("key").to_string(), "G major");
    }

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        let r = pearson(&a, &b).expect("defined");
        assert!((r - 1.0).abs() < 1e-12);
        assert!(pearson(&a, &[1.0, 1.0, 1.0]).is_none());
    }
}
