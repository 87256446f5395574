//! Statistical primitives for the analysis stages.
//!
//! Everything here works on plain slices and returns `None` when the input is
//! too small or degenerate for the statistic to mean anything.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::sanitize::EPSILON;

// ==================== Descriptive ====================

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1).
pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|x| (x - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Empirical quantile with linear interpolation, `q` in [0, 1].
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

// ==================== Distributions ====================

fn erf(x: f64) -> f64 {
    // Abramowitz and Stegun 7.1.26
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Inverse standard normal CDF (Acklam's rational approximation).
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p > 1.0 - P_LOW {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}

/// Two-sided z critical value for a confidence level `1 - alpha`.
pub fn z_critical(alpha: f64) -> f64 {
    normal_quantile(1.0 - alpha / 2.0)
}

fn ln_gamma(x: f64) -> f64 {
    // Lanczos, g = 7
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
pub fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return if t > 0.0 { 1.0 } else { 0.0 };
    }
    let x = df / (df + t * t);
    let tail = 0.5 * incomplete_beta(df / 2.0, 0.5, x);
    if t > 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Two-sided p-value of a t statistic.
pub fn t_two_sided_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

/// Inverse Student t CDF by bisection.
pub fn t_quantile(p: f64, df: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let (mut lo, mut hi) = (-1.0e4, 1.0e4);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if student_t_cdf(mid, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Mean with a Student t confidence interval.
pub fn t_interval(values: &[f64], alpha: f64) -> Option<(f64, f64, f64)> {
    let n = values.len();
    let m = mean(values)?;
    let sd = std_dev(values)?;
    let half = t_quantile(1.0 - alpha / 2.0, (n - 1) as f64) * sd / (n as f64).sqrt();
    Some((m, m - half, m + half))
}

// ==================== Proportions & correlation ====================

/// Wilson score interval for `successes / n`.
pub fn wilson_interval(successes: usize, n: usize, z: f64) -> Option<(f64, f64)> {
    if n == 0 {
        return None;
    }
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let centre = (p + z2 / (2.0 * n)) / denom;
    let half = z * ((p * (1.0 - p) / n) + z2 / (4.0 * n * n)).sqrt() / denom;
    Some(((centre - half).max(0.0), (centre + half).min(1.0)))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub r: f64,
    pub n: usize,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: f64,
}

/// Pearson correlation with a Fisher-z interval and a t-test p-value.
pub fn pearson(x: &[f64], y: &[f64], alpha: f64) -> Option<Correlation> {
    let n = x.len().min(y.len());
    if n < 3 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let sxx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    let syy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
    if sxx < EPSILON || syy < EPSILON {
        return None;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);

    let df = (n - 2) as f64;
    let p_value = if 1.0 - r.abs() < EPSILON {
        0.0
    } else {
        t_two_sided_p(r * (df / (1.0 - r * r)).sqrt(), df)
    };

    let (ci_low, ci_high) = if n > 3 && 1.0 - r.abs() > EPSILON {
        let z = r.atanh();
        let se = 1.0 / ((n - 3) as f64).sqrt();
        let crit = z_critical(alpha);
        (Some((z - crit * se).tanh()), Some((z + crit * se).tanh()))
    } else {
        (None, None)
    };

    Some(Correlation {
        r,
        n,
        ci_low,
        ci_high,
        p_value,
    })
}

// ==================== Regression ====================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearRegression {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub slope_se: Option<f64>,
    /// Two-sided test of slope = 0
    pub p_value: Option<f64>,
    pub n: usize,
}

impl LinearRegression {
    pub fn slope_interval(&self, alpha: f64) -> Option<(f64, f64)> {
        let se = self.slope_se?;
        if self.n < 3 {
            return None;
        }
        let half = t_quantile(1.0 - alpha / 2.0, (self.n - 2) as f64) * se;
        Some((self.slope - half, self.slope + half))
    }
}

/// Ordinary least squares of y on x.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearRegression> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    if sxx < EPSILON {
        return None;
    }
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let slope = sxy / sxx;
    let intercept = my - slope * mx;

    let sse: f64 = x
        .iter()
        .zip(y)
        .map(|(a, b)| (b - (intercept + slope * a)).powi(2))
        .sum();
    let sst: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
    let r_squared = if sst < EPSILON { 1.0 } else { 1.0 - sse / sst };

    let (slope_se, p_value) = if n > 2 {
        let se = (sse / (n - 2) as f64 / sxx).sqrt();
        let p = if se < EPSILON {
            if slope.abs() < EPSILON {
                1.0
            } else {
                0.0
            }
        } else {
            t_two_sided_p(slope / se, (n - 2) as f64)
        };
        (Some(se), Some(p))
    } else {
        (None, None)
    };

    Some(LinearRegression {
        slope,
        intercept,
        r_squared,
        slope_se,
        p_value,
        n,
    })
}

/// Coefficient of determination of predictions against observations.
pub fn r_squared(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    let m = mean(observed)?;
    let sst: f64 = observed.iter().map(|y| (y - m).powi(2)).sum();
    let sse: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    if !sse.is_finite() {
        return None;
    }
    if sst < EPSILON {
        return Some(if sse < EPSILON { 1.0 } else { 0.0 });
    }
    Some(1.0 - sse / sst)
}

// ==================== Rank tests & effect sizes ====================

/// Average ranks (1-based) and the tie correction term sum(t^3 - t).
pub fn average_ranks(values: &[f64]) -> (Vec<f64>, f64) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i + 1;
        while j < order.len() && values[order[j]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j + 1) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = rank;
        }
        let t = (j - i) as f64;
        tie_term += t * t * t - t;
        i = j;
    }
    (ranks, tie_term)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MannWhitney {
    /// U statistic of the first sample: pairs where a > b, ties counted half
    pub u: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Two-sided Mann–Whitney U test, normal approximation with tie and continuity correction.
pub fn mann_whitney(a: &[f64], b: &[f64]) -> Option<MannWhitney> {
    let (n1, n2) = (a.len(), b.len());
    if n1 == 0 || n2 == 0 {
        return None;
    }
    let pooled: Vec<f64> = a.iter().chain(b).copied().collect();
    let (ranks, tie_term) = average_ranks(&pooled);
    let r1: f64 = ranks[..n1].iter().sum();

    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let n = n1f + n2f;
    let u = r1 - n1f * (n1f + 1.0) / 2.0;
    let mu = n1f * n2f / 2.0;
    let var = n1f * n2f / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
    if var <= EPSILON {
        return Some(MannWhitney {
            u,
            z: 0.0,
            p_value: 1.0,
        });
    }
    let diff = u - mu;
    let corrected = (diff.abs() - 0.5).max(0.0) * diff.signum();
    let z = corrected / var.sqrt();
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);
    Some(MannWhitney { u, z, p_value })
}

/// Cliff's delta: P(a > b) - P(a < b).
pub fn cliffs_delta(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut dominance = 0i64;
    for x in a {
        for y in b {
            if x > y {
                dominance += 1;
            } else if x < y {
                dominance -= 1;
            }
        }
    }
    Some(dominance as f64 / (a.len() * b.len()) as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HedgesG {
    pub g: f64,
    pub se: f64,
}

/// Bias-corrected standardized mean difference of a over b.
pub fn hedges_g(a: &[f64], b: &[f64]) -> Option<HedgesG> {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    if n1 < 2.0 || n2 < 2.0 {
        return None;
    }
    let pooled = (((n1 - 1.0) * variance(a)? + (n2 - 1.0) * variance(b)?) / (n1 + n2 - 2.0)).sqrt();
    if pooled < EPSILON {
        return None;
    }
    let d = (mean(a)? - mean(b)?) / pooled;
    let correction = 1.0 - 3.0 / (4.0 * (n1 + n2) - 9.0);
    let g = d * correction;
    let se = ((n1 + n2) / (n1 * n2) + g * g / (2.0 * (n1 + n2))).sqrt();
    Some(HedgesG { g, se })
}

// ==================== Multiple comparisons ====================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    #[default]
    None,
    Bonferroni,
    Holm,
}

impl CorrectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bonferroni => "bonferroni",
            Self::Holm => "holm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "bonferroni" => Some(Self::Bonferroni),
            "holm" | "holm-bonferroni" => Some(Self::Holm),
            _ => None,
        }
    }
}

/// Adjusted p-values in the input order.
pub fn adjust_p_values(p_values: &[f64], method: CorrectionMethod) -> Vec<f64> {
    let m = p_values.len() as f64;
    match method {
        CorrectionMethod::None => p_values.to_vec(),
        CorrectionMethod::Bonferroni => p_values.iter().map(|p| (p * m).min(1.0)).collect(),
        CorrectionMethod::Holm => {
            let mut order: Vec<usize> = (0..p_values.len()).collect();
            order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
            let mut adjusted = vec![0.0; p_values.len()];
            let mut running = 0.0_f64;
            for (rank, &idx) in order.iter().enumerate() {
                let value = ((m - rank as f64) * p_values[idx]).min(1.0);
                running = running.max(value);
                adjusted[idx] = running;
            }
            adjusted
        }
    }
}

// ==================== Bootstrap ====================

/// FNV-1a hash, used to derive per-agent bootstrap seeds from ids.
pub fn stable_seed(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Percentile bootstrap interval of a statistic computed from resampled indices
/// `0..n`. Used directly when the statistic needs paired data.
pub fn bootstrap_ci_indexed<F>(
    n: usize,
    statistic: F,
    resamples: usize,
    seed: u64,
    alpha: f64,
) -> Option<(f64, f64)>
where
    F: Fn(&[usize]) -> Option<f64> + Sync,
{
    if n < 2 || resamples < 2 {
        return None;
    }
    let mut estimates: Vec<f64> = (0..resamples)
        .into_par_iter()
        .filter_map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            statistic(&sample).filter(|v| v.is_finite())
        })
        .collect();
    percentile_interval(&mut estimates, alpha)
}

/// Percentile bootstrap interval of a statistic over one sample.
pub fn bootstrap_ci<F>(
    values: &[f64],
    statistic: F,
    resamples: usize,
    seed: u64,
    alpha: f64,
) -> Option<(f64, f64)>
where
    F: Fn(&[f64]) -> Option<f64> + Sync,
{
    bootstrap_ci_indexed(
        values.len(),
        |idx| {
            let sample: Vec<f64> = idx.iter().map(|&i| values[i]).collect();
            statistic(&sample)
        },
        resamples,
        seed,
        alpha,
    )
}

/// Percentile bootstrap interval of a two-sample statistic.
pub fn bootstrap_ci_two_sample<F>(
    a: &[f64],
    b: &[f64],
    statistic: F,
    resamples: usize,
    seed: u64,
    alpha: f64,
) -> Option<(f64, f64)>
where
    F: Fn(&[f64], &[f64]) -> Option<f64> + Sync,
{
    let (n1, n2) = (a.len(), b.len());
    if n1 < 2 || n2 < 2 || resamples < 2 {
        return None;
    }
    let mut estimates: Vec<f64> = (0..resamples)
        .into_par_iter()
        .filter_map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let sa: Vec<f64> = (0..n1).map(|_| a[rng.gen_range(0..n1)]).collect();
            let sb: Vec<f64> = (0..n2).map(|_| b[rng.gen_range(0..n2)]).collect();
            statistic(&sa, &sb).filter(|v| v.is_finite())
        })
        .collect();
    percentile_interval(&mut estimates, alpha)
}

fn percentile_interval(estimates: &mut [f64], alpha: f64) -> Option<(f64, f64)> {
    if estimates.len() < 2 {
        return None;
    }
    estimates.sort_by(|a, b| a.total_cmp(b));
    Some((
        quantile(estimates, alpha / 2.0)?,
        quantile(estimates, 1.0 - alpha / 2.0)?,
    ))
}
