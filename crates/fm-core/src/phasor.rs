//! Amplitude/phase arithmetic for superposed branches.
//!
//! Similar content sits in phase and reinforces, dissimilar content sits
//! out of phase and cancels: `Δφ = π·(1 − similarity)`, `I = cos Δφ`.

use std::f64::consts::PI;

use crate::constants::{AMPLITUDE_TOLERANCE, EPSILON};

/// `π·(1 − similarity)`, similarity clamped to [0, 1].
pub fn phase_difference(similarity: f64) -> f64 {
    PI * (1.0 - similarity.clamp(0.0, 1.0))
}

/// Pairwise `cos Δφ` from a square similarity matrix. The diagonal is 1.
pub fn interference_matrix(similarity: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = similarity.len();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            out[i][j] = if i == j {
                1.0
            } else {
                phase_difference(similarity[i][j]).cos()
            };
        }
    }
    out
}

/// `c_i = ½ + ½·Σ_{j≠i} a_j I_ij / Σ_{j≠i} a_j`. A lone amplitude, or one
/// whose peers all have zero amplitude, is fully coherent.
pub fn coherence(amplitudes: &[f64], interference: &[Vec<f64>]) -> Vec<f64> {
    let n = amplitudes.len();
    (0..n)
        .map(|i| {
            let mut weighted = 0.0;
            let mut total = 0.0;
            for j in (0..n).filter(|j| *j != i) {
                weighted += amplitudes[j] * interference[i][j];
                total += amplitudes[j];
            }
            if total <= EPSILON {
                1.0
            } else {
                (0.5 + 0.5 * weighted / total).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Scale so that Σa² = 1. All-zero input becomes uniform.
pub fn normalize_amplitudes(amplitudes: &mut [f64]) {
    if amplitudes.is_empty() {
        return;
    }
    let norm = amplitudes.iter().map(|a| a * a).sum::<f64>().sqrt();
    if norm <= EPSILON {
        let uniform = (1.0 / amplitudes.len() as f64).sqrt();
        amplitudes.iter_mut().for_each(|a| *a = uniform);
        return;
    }
    amplitudes.iter_mut().for_each(|a| *a /= norm);
}

pub fn is_normalized(amplitudes: &[f64]) -> bool {
    let total: f64 = amplitudes.iter().map(|a| a * a).sum();
    (total - 1.0).abs() <= AMPLITUDE_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interference_extremes() {
        assert_relative_eq!(phase_difference(1.0).cos(), 1.0);
        assert_relative_eq!(phase_difference(0.0).cos(), -1.0);
        assert!(phase_difference(0.5).cos().abs() < 1e-12);
        // out-of-range similarity is clamped
        assert_relative_eq!(phase_difference(1.5), 0.0);
        assert_relative_eq!(phase_difference(-0.5), PI);
    }

    #[test]
    fn test_matrix_symmetric_unit_diagonal() {
        let sim = vec![vec![1.0, 0.8], vec![0.8, 1.0]];
        let m = interference_matrix(&sim);
        assert_eq!(m[0][0], 1.0);
        assert_relative_eq!(m[0][1], m[1][0]);
        assert!(m[0][1] > 0.0);
    }

    #[test]
    fn test_coherence_single_and_pairs() {
        assert_eq!(coherence(&[1.0], &[vec![1.0]]), vec![1.0]);
        let constructive = coherence(&[0.7, 0.7], &[vec![1.0, 1.0], vec![1.0, 1.0]]);
        assert_relative_eq!(constructive[0], 1.0);
        let destructive = coherence(&[0.7, 0.7], &[vec![1.0, -1.0], vec![-1.0, 1.0]]);
        assert_relative_eq!(destructive[0], 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut a = vec![3.0, 4.0];
        normalize_amplitudes(&mut a);
        assert!(is_normalized(&a));
        let mut z = vec![0.0; 4];
        normalize_amplitudes(&mut z);
        assert_relative_eq!(z[0], 0.5);
        assert!(is_normalized(&z));
    }
}
