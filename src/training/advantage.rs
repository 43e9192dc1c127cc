//! Group-relative advantage estimation.
//!
//!   A_i = (R_i - mean(R)) / sqrt(var(R) + 1e-8)
//!
//! with the population variance of the group.

/// Added to the variance before the square root.
pub const VARIANCE_EPS: f64 = 1e-8;

/// Compute group-relative advantages for a group of rewards.
///
/// # Edge cases
///
/// - If `rewards` is empty, returns an empty vector.
/// - If all rewards are identical, every numerator is zero, so all advantages
///   are exactly 0.0.
pub fn compute_group_advantages(rewards: &[f64]) -> Vec<f64> {
    if rewards.is_empty() {
        return Vec::new();
    }

    let n = rewards.len() as f64;
    let mean = rewards.iter().sum::<f64>() / n;

    // Divide by N: we normalise within the group, not estimate a population.
    let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std = (variance + VARIANCE_EPS).sqrt();

    rewards.iter().map(|r| (r - mean) / std).collect()
}
