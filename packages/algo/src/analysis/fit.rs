//! Learning-curve fits of score against turn.
//!
//! - linear: `y = a + b·t`
//! - exponential approach: `y = a + b·e^(-k·t)`, `k` found by grid search with
//!   `a, b` solved by least squares at each candidate
//! - power law: `y = a·t^b`, fitted in log-log space

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::stats::{linear_regression, r_squared};

const K_GRID_MIN: f64 = 1e-3;
const K_GRID_MAX: f64 = 3.0;
const K_GRID_STEPS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveModel {
    PowerLaw,
    Exponential,
    Linear,
}

impl CurveModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerLaw => "power_law",
            Self::Exponential => "exponential",
            Self::Linear => "linear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveFit {
    pub model: CurveModel,
    pub parameters: BTreeMap<String, f64>,
    pub r_squared: f64,
}

impl CurveFit {
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    pub fn predict(&self, t: f64) -> Option<f64> {
        let a = self.parameter("a")?;
        let b = self.parameter("b")?;
        Some(match self.model {
            CurveModel::Linear => a + b * t,
            CurveModel::Exponential => a + b * (-self.parameter("k")? * t).exp(),
            CurveModel::PowerLaw => a * t.powf(b),
        })
    }
}

fn params(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn fit_linear(t: &[f64], y: &[f64]) -> Option<CurveFit> {
    if t.len() < 3 {
        return None;
    }
    let reg = linear_regression(t, y)?;
    Some(CurveFit {
        model: CurveModel::Linear,
        parameters: params(&[("a", reg.intercept), ("b", reg.slope)]),
        r_squared: reg.r_squared,
    })
}

/// Exponential approach to an asymptote. `k` is the convergence rate per turn.
pub fn fit_exponential(t: &[f64], y: &[f64]) -> Option<CurveFit> {
    let n = t.len().min(y.len());
    if n < 4 {
        return None;
    }
    let (t, y) = (&t[..n], &y[..n]);

    let ratio = (K_GRID_MAX / K_GRID_MIN).ln();
    let mut best: Option<(f64, f64, f64, f64)> = None;
    for step in 0..=K_GRID_STEPS {
        let k = K_GRID_MIN * (ratio * step as f64 / K_GRID_STEPS as f64).exp();
        let basis: Vec<f64> = t.iter().map(|ti| (-k * ti).exp()).collect();
        let Some(reg) = linear_regression(&basis, y) else {
            continue;
        };
        let sse: f64 = basis
            .iter()
            .zip(y)
            .map(|(e, yi)| (yi - (reg.intercept + reg.slope * e)).powi(2))
            .sum();
        if best.map_or(true, |(_, _, _, s)| sse < s) {
            best = Some((reg.intercept, reg.slope, k, sse));
        }
    }

    let (a, b, k, _) = best?;
    let predicted: Vec<f64> = t.iter().map(|ti| a + b * (-k * ti).exp()).collect();
    Some(CurveFit {
        model: CurveModel::Exponential,
        parameters: params(&[("a", a), ("b", b), ("k", k)]),
        r_squared: r_squared(y, &predicted)?,
    })
}

/// Power law; requires strictly positive turns and scores.
pub fn fit_power_law(t: &[f64], y: &[f64]) -> Option<CurveFit> {
    let n = t.len().min(y.len());
    if n < 3 || t[..n].iter().chain(&y[..n]).any(|v| *v <= 0.0) {
        return None;
    }
    let (t, y) = (&t[..n], &y[..n]);
    let log_t: Vec<f64> = t.iter().map(|v| v.ln()).collect();
    let log_y: Vec<f64> = y.iter().map(|v| v.ln()).collect();
    let reg = linear_regression(&log_t, &log_y)?;
    let a = reg.intercept.exp();
    let b = reg.slope;
    let predicted: Vec<f64> = t.iter().map(|ti| a * ti.powf(b)).collect();
    Some(CurveFit {
        model: CurveModel::PowerLaw,
        parameters: params(&[("a", a), ("b", b)]),
        r_squared: r_squared(y, &predicted)?,
    })
}

/// All fits that could be computed, plus the one with the highest R².
pub fn fit_all(t: &[f64], y: &[f64]) -> (Vec<CurveFit>, Option<CurveFit>) {
    let candidates: Vec<CurveFit> = [
        fit_power_law(t, y),
        fit_exponential(t, y),
        fit_linear(t, y),
    ]
    .into_iter()
    .flatten()
    .filter(|f| f.r_squared.is_finite())
    .collect();
    let best = candidates
        .iter()
        .max_by(|a, b| a.r_squared.total_cmp(&b.r_squared))
        .cloned();
    (candidates, best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<f64> {
        (1..=n).map(|t| t as f64).collect()
    }

    #[test]
    fn test_exponential_recovers_rate() {
        let t = turns(25);
        let y: Vec<f64> = t.iter().map(|ti| 80.0 - 30.0 * (-0.25 * ti).exp()).collect();
        let fit = fit_exponential(&t, &y).unwrap();
        let k = fit.parameter("k").unwrap();
        assert!((k - 0.25).abs() < 0.02, "k = {k}");
        assert!((fit.parameter("a").unwrap() - 80.0).abs() < 1.0);
        assert!(fit.r_squared > 0.999);
    }

    #[test]
    fn test_power_law_recovers_exponent() {
        let t = turns(20);
        let y: Vec<f64> = t.iter().map(|ti| 40.0 * ti.powf(0.3)).collect();
        let fit = fit_power_law(&t, &y).unwrap();
        assert!((fit.parameter("b").unwrap() - 0.3).abs() < 1e-9);
        assert!((fit.predict(4.0).unwrap() - 40.0 * 4f64.powf(0.3)).abs() < 1e-6);
    }

    #[test]
    fn test_best_fit_prefers_linear_for_lines() {
        let t = turns(15);
        let y: Vec<f64> = t.iter().map(|ti| 40.0 + 1.5 * ti).collect();
        let (candidates, best) = fit_all(&t, &y);
        assert_eq!(candidates.len(), 3);
        let best = best.unwrap();
        assert!(best.r_squared > 0.9999);
        // near-linear exponential fits can tie, linear must be at least as good as power law
        let linear = candidates.iter().find(|c| c.model == CurveModel::Linear).unwrap();
        assert!((linear.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_too_little_data() {
        assert!(fit_linear(&[1.0, 2.0], &[3.0, 4.0]).is_none());
        assert!(fit_exponential(&turns(3), &[1.0, 2.0, 3.0]).is_none());
        assert!(fit_power_law(&turns(3), &[0.0, 2.0, 3.0]).is_none());
        let (candidates, best) = fit_all(&[], &[]);
        assert!(candidates.is_empty() && best.is_none());
    }
}
