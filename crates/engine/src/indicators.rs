//! Technical indicator library
//!
//! Pure functions over `f64` columns, plus `compute`, which enriches a
//! `Series` with the output columns of a set of `IndicatorSpec`s. `NaN`
//! marks "no value" throughout, matching how the evaluator treats missing
//! data. The input series is never modified.

use crate::types::{Series, CLOSE, HIGH, LOW};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ta::indicators::{ExponentialMovingAverage, Maximum, Minimum, SimpleMovingAverage};
use ta::Next;
use thiserror::Error;

/// Seed for the first K and D values of KDJ
const KDJ_SEED: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("{indicator} needs columns {missing:?}, series has {available:?}")]
    MissingColumns {
        indicator: IndicatorName,
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("{indicator}: invalid parameter {param}={value}")]
    InvalidParam {
        indicator: IndicatorName,
        param: String,
        value: String,
    },
}

// ============================================================================
// Indicator specs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndicatorName {
    Ma,
    Ema,
    Macd,
    Rsi,
    Boll,
    Atr,
    Kdj,
}

impl fmt::Display for IndicatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndicatorName::Ma => "MA",
            IndicatorName::Ema => "EMA",
            IndicatorName::Macd => "MACD",
            IndicatorName::Rsi => "RSI",
            IndicatorName::Boll => "BOLL",
            IndicatorName::Atr => "ATR",
            IndicatorName::Kdj => "KDJ",
        };
        f.write_str(s)
    }
}

/// Smoothing used for RSI's average gain/loss
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiMethod {
    /// Wilder's smoothing, `alpha = 1/n`
    #[default]
    Ema,
    /// Plain rolling mean
    Sma,
    /// Adjusted exponential weights with centre of mass `n - 1`
    China,
}

impl RsiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsiMethod::Ema => "ema",
            RsiMethod::Sma => "sma",
            RsiMethod::China => "china",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// A named indicator with its parameters. Params live in a `BTreeMap` so two
/// specs with the same params in a different order compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: IndicatorName,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl IndicatorSpec {
    fn with(name: IndicatorName, params: &[(&str, ParamValue)]) -> Self {
        Self {
            name,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    pub fn ma(n: usize) -> Self {
        Self::with(IndicatorName::Ma, &[("n", ParamValue::Number(n as f64))])
    }

    pub fn ema(n: usize) -> Self {
        Self::with(IndicatorName::Ema, &[("n", ParamValue::Number(n as f64))])
    }

    pub fn macd(fast: usize, slow: usize, signal: usize) -> Self {
        Self::with(
            IndicatorName::Macd,
            &[
                ("fast", ParamValue::Number(fast as f64)),
                ("slow", ParamValue::Number(slow as f64)),
                ("signal", ParamValue::Number(signal as f64)),
            ],
        )
    }

    pub fn rsi(n: usize, method: RsiMethod) -> Self {
        Self::with(
            IndicatorName::Rsi,
            &[
                ("n", ParamValue::Number(n as f64)),
                ("method", ParamValue::Text(method.as_str().to_string())),
            ],
        )
    }

    pub fn boll(n: usize, k: f64) -> Self {
        Self::with(
            IndicatorName::Boll,
            &[("n", ParamValue::Number(n as f64)), ("k", ParamValue::Number(k))],
        )
    }

    pub fn atr(n: usize) -> Self {
        Self::with(IndicatorName::Atr, &[("n", ParamValue::Number(n as f64))])
    }

    pub fn kdj(n: usize, m1: f64, m2: f64) -> Self {
        Self::with(
            IndicatorName::Kdj,
            &[
                ("n", ParamValue::Number(n as f64)),
                ("m1", ParamValue::Number(m1)),
                ("m2", ParamValue::Number(m2)),
            ],
        )
    }

    /// The spec whose output includes the given technical field
    /// (`ma20` → MA n=20, `dea` → MACD 12/26/9, ...)
    pub fn for_field(field: &str) -> Option<Self> {
        match field {
            "dif" | "dea" | "macd_hist" => return Some(Self::macd(12, 26, 9)),
            "boll_mid" | "boll_upper" | "boll_lower" => return Some(Self::boll(20, 2.0)),
            "kdj_k" | "kdj_d" | "kdj_j" => return Some(Self::kdj(9, 3.0, 3.0)),
            _ => {}
        }

        let split = field.find(|c: char| c.is_ascii_digit())?;
        let (prefix, digits) = field.split_at(split);
        let n: usize = digits.parse().ok().filter(|n| *n > 0)?;
        match prefix {
            "ma" => Some(Self::ma(n)),
            "ema" => Some(Self::ema(n)),
            "rsi" => Some(Self::rsi(n, RsiMethod::Ema)),
            "atr" => Some(Self::atr(n)),
            _ => None,
        }
    }

    /// Columns this spec adds to a series
    pub fn output_columns(&self) -> Result<Vec<String>, IndicatorError> {
        Ok(match self.name {
            IndicatorName::Ma => vec![format!("ma{}", self.period("n", 20)?)],
            IndicatorName::Ema => vec![format!("ema{}", self.period("n", 20)?)],
            IndicatorName::Macd => vec!["dif".into(), "dea".into(), "macd_hist".into()],
            IndicatorName::Rsi => vec![format!("rsi{}", self.period("n", 14)?)],
            IndicatorName::Boll => {
                vec!["boll_mid".into(), "boll_upper".into(), "boll_lower".into()]
            }
            IndicatorName::Atr => vec![format!("atr{}", self.period("n", 14)?)],
            IndicatorName::Kdj => vec!["kdj_k".into(), "kdj_d".into(), "kdj_j".into()],
        })
    }

    /// Input columns this spec reads
    pub fn required_columns(&self) -> &'static [&'static str] {
        match self.name {
            IndicatorName::Atr | IndicatorName::Kdj => &[HIGH, LOW, CLOSE],
            _ => &[CLOSE],
        }
    }

    fn invalid(&self, param: &str, value: impl ToString) -> IndicatorError {
        IndicatorError::InvalidParam {
            indicator: self.name,
            param: param.to_string(),
            value: value.to_string(),
        }
    }

    /// A positive whole-number parameter
    fn period(&self, key: &str, default: usize) -> Result<usize, IndicatorError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(ParamValue::Number(v)) if *v >= 1.0 && v.fract() == 0.0 => Ok(*v as usize),
            Some(other) => Err(self.invalid(key, other)),
        }
    }

    /// A positive finite parameter
    fn factor(&self, key: &str, default: f64) -> Result<f64, IndicatorError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(ParamValue::Number(v)) if v.is_finite() && *v > 0.0 => Ok(*v),
            Some(other) => Err(self.invalid(key, other)),
        }
    }

    fn rsi_method(&self) -> Result<RsiMethod, IndicatorError> {
        match self.params.get("method") {
            None => Ok(RsiMethod::Ema),
            Some(ParamValue::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "ema" => Ok(RsiMethod::Ema),
                "sma" => Ok(RsiMethod::Sma),
                "china" => Ok(RsiMethod::China),
                _ => Err(self.invalid("method", s)),
            },
            Some(other) => Err(self.invalid("method", other)),
        }
    }

    /// Check every parameter without computing anything
    fn check_params(&self) -> Result<(), IndicatorError> {
        match self.name {
            IndicatorName::Ma | IndicatorName::Ema => {
                self.period("n", 20)?;
            }
            IndicatorName::Macd => {
                self.period("fast", 12)?;
                self.period("slow", 26)?;
                self.period("signal", 9)?;
            }
            IndicatorName::Rsi => {
                self.period("n", 14)?;
                self.rsi_method()?;
            }
            IndicatorName::Boll => {
                self.period("n", 20)?;
                self.factor("k", 2.0)?;
            }
            IndicatorName::Atr => {
                self.period("n", 14)?;
            }
            IndicatorName::Kdj => {
                self.period("n", 9)?;
                self.factor("m1", 3.0)?;
                self.factor("m2", 3.0)?;
            }
        }
        Ok(())
    }
}

/// Fields shown on every computed-path row once any technical field is used
pub const DISPLAY_FIELDS: &[&str] = &[
    "ma20",
    "rsi14",
    "kdj_k",
    "kdj_d",
    "kdj_j",
    "dif",
    "dea",
    "macd_hist",
];

pub fn display_specs() -> Vec<IndicatorSpec> {
    DISPLAY_FIELDS
        .iter()
        .filter_map(|f| IndicatorSpec::for_field(f))
        .collect()
}

/// Drop repeated specs, keeping first-seen order
pub fn dedup_specs(specs: &[IndicatorSpec]) -> Vec<IndicatorSpec> {
    let mut out: Vec<IndicatorSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        if !out.contains(spec) {
            out.push(spec.clone());
        }
    }
    out
}

// ============================================================================
// compute
// ============================================================================

/// Return a copy of `series` with the output columns of every spec added.
///
/// Parameters and required columns are checked for all specs before any
/// computation, so an error never leaves a half-enriched result.
pub fn compute(series: &Series, specs: &[IndicatorSpec]) -> Result<Series, IndicatorError> {
    let specs = dedup_specs(specs);

    for spec in &specs {
        spec.check_params()?;
        let missing: Vec<String> = spec
            .required_columns()
            .iter()
            .filter(|c| !series.has_column(c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(IndicatorError::MissingColumns {
                indicator: spec.name,
                missing,
                available: series.column_names(),
            });
        }
    }

    let mut out = series.clone();
    for spec in &specs {
        apply(series, spec, &mut out)?;
    }
    Ok(out)
}

fn apply(input: &Series, spec: &IndicatorSpec, out: &mut Series) -> Result<(), IndicatorError> {
    // required columns were checked by `compute`
    let col = |name: &str| input.column(name).unwrap_or_default();
    let close = col(CLOSE);
    let names = spec.output_columns()?;

    match spec.name {
        IndicatorName::Ma => out.insert(&names[0], ma(close, spec.period("n", 20)?)?),
        IndicatorName::Ema => out.insert(&names[0], ema(close, spec.period("n", 20)?)?),
        IndicatorName::Macd => {
            let (dif, dea, hist) = macd(
                close,
                spec.period("fast", 12)?,
                spec.period("slow", 26)?,
                spec.period("signal", 9)?,
            )?;
            out.insert("dif", dif);
            out.insert("dea", dea);
            out.insert("macd_hist", hist);
        }
        IndicatorName::Rsi => out.insert(
            &names[0],
            rsi(close, spec.period("n", 14)?, spec.rsi_method()?)?,
        ),
        IndicatorName::Boll => {
            let (mid, upper, lower) = boll(close, spec.period("n", 20)?, spec.factor("k", 2.0)?)?;
            out.insert("boll_mid", mid);
            out.insert("boll_upper", upper);
            out.insert("boll_lower", lower);
        }
        IndicatorName::Atr => out.insert(
            &names[0],
            atr(col(HIGH), col(LOW), close, spec.period("n", 14)?)?,
        ),
        IndicatorName::Kdj => {
            let (k, d, j) = kdj(
                col(HIGH),
                col(LOW),
                close,
                spec.period("n", 9)?,
                spec.factor("m1", 3.0)?,
                spec.factor("m2", 3.0)?,
            )?;
            out.insert("kdj_k", k);
            out.insert("kdj_d", d);
            out.insert("kdj_j", j);
        }
    }
    Ok(())
}

// ============================================================================
// Rolling helpers
// ============================================================================

fn invalid_period(indicator: IndicatorName, n: usize) -> IndicatorError {
    IndicatorError::InvalidParam {
        indicator,
        param: "n".into(),
        value: n.to_string(),
    }
}

/// Trailing mean over `n` values on `ta`'s SMA, which averages the partial
/// window while warming up. Emitted once `min_periods` values are in the
/// window; NaN inputs are not fed and yield NaN.
fn rolling_mean(
    values: &[f64],
    n: usize,
    min_periods: usize,
    indicator: IndicatorName,
) -> Result<Vec<f64>, IndicatorError> {
    let mut sma = SimpleMovingAverage::new(n).map_err(|_| invalid_period(indicator, n))?;
    let mut fed = 0usize;
    Ok(values
        .iter()
        .map(|&x| {
            if x.is_nan() {
                return f64::NAN;
            }
            let mean = sma.next(x);
            fed += 1;
            if fed.min(n) >= min_periods.max(1) {
                mean
            } else {
                f64::NAN
            }
        })
        .collect())
}

/// Sample standard deviation (n - 1) of each trailing window; needs 2 values.
/// `ta`'s `StandardDeviation` is the population form, hence the hand-rolled one.
fn rolling_std(values: &[f64], n: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            let window: Vec<f64> = values[(i + 1).saturating_sub(n)..=i]
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .collect();
            if window.len() < 2 {
                return f64::NAN;
            }
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (window.len() - 1) as f64;
            var.sqrt()
        })
        .collect()
}

/// Exponential mean with `alpha`, unadjusted: `y0 = x0`, `y = (1-a)y + a·x`
fn ewm(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut last = f64::NAN;
    values
        .iter()
        .map(|&x| {
            if !x.is_nan() {
                last = if last.is_nan() {
                    x
                } else {
                    (1.0 - alpha) * last + alpha * x
                };
            }
            last
        })
        .collect()
}

/// Exponential mean with `alpha`, adjusted: weights `(1-a)^i` normalised
fn ewm_adjusted(values: &[f64], alpha: f64) -> Vec<f64> {
    let decay = 1.0 - alpha;
    let (mut num, mut den) = (0.0, 0.0);
    values
        .iter()
        .map(|&x| {
            num *= decay;
            den *= decay;
            if !x.is_nan() {
                num += x;
                den += 1.0;
            }
            if den > 0.0 {
                num / den
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// `(x_t / x_{t-1} - 1) * 100`; first value and divisions by zero are NaN
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    out.push(f64::NAN);
    for w in values.windows(2) {
        let change = (w[1] / w[0] - 1.0) * 100.0;
        out.push(if change.is_finite() { change } else { f64::NAN });
    }
    out.truncate(values.len());
    out
}

// ============================================================================
// Indicators
// ============================================================================

/// Simple moving average; partial windows at the start produce a value
pub fn ma(close: &[f64], n: usize) -> Result<Vec<f64>, IndicatorError> {
    rolling_mean(close, n, 1, IndicatorName::Ma)
}

/// Exponential moving average with smoothing `2/(n+1)`, seeded with the
/// first value and no warm-up gating
pub fn ema(values: &[f64], n: usize) -> Result<Vec<f64>, IndicatorError> {
    let mut ind =
        ExponentialMovingAverage::new(n).map_err(|_| invalid_period(IndicatorName::Ema, n))?;

    let mut last = f64::NAN;
    Ok(values
        .iter()
        .map(|&x| {
            if !x.is_nan() {
                last = ind.next(x);
            }
            last
        })
        .collect())
}

/// MACD: `(dif, dea, macd_hist)`
pub fn macd(
    close: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), IndicatorError> {
    let fast_ema = ema(close, fast)?;
    let slow_ema = ema(close, slow)?;
    let dif: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let dea = ema(&dif, signal)?;
    let hist = dif.iter().zip(&dea).map(|(d, e)| d - e).collect();
    Ok((dif, dea, hist))
}

/// Relative strength index. A zero average loss yields NaN at that bar.
pub fn rsi(close: &[f64], n: usize, method: RsiMethod) -> Result<Vec<f64>, IndicatorError> {
    // first bar has no delta: gain and loss are both 0
    let mut gains = Vec::with_capacity(close.len());
    let mut losses = Vec::with_capacity(close.len());
    for i in 0..close.len() {
        let delta = if i == 0 { f64::NAN } else { close[i] - close[i - 1] };
        gains.push(if delta > 0.0 { delta } else { 0.0 });
        losses.push(if delta < 0.0 { -delta } else { 0.0 });
    }

    let alpha = 1.0 / n as f64;
    let (avg_gain, avg_loss) = match method {
        RsiMethod::Ema => (ewm(&gains, alpha), ewm(&losses, alpha)),
        RsiMethod::Sma => (
            rolling_mean(&gains, n, 1, IndicatorName::Rsi)?,
            rolling_mean(&losses, n, 1, IndicatorName::Rsi)?,
        ),
        RsiMethod::China => (ewm_adjusted(&gains, alpha), ewm_adjusted(&losses, alpha)),
    };

    Ok(avg_gain
        .iter()
        .zip(&avg_loss)
        .map(|(&g, &l)| {
            if l == 0.0 || l.is_nan() {
                f64::NAN
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect())
}

/// Bollinger bands: `(mid, upper, lower)`
pub fn boll(
    close: &[f64],
    n: usize,
    k: f64,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), IndicatorError> {
    let mid = rolling_mean(close, n, 1, IndicatorName::Boll)?;
    let std = rolling_std(close, n);
    let upper = mid.iter().zip(&std).map(|(m, s)| m + k * s).collect();
    let lower = mid.iter().zip(&std).map(|(m, s)| m - k * s).collect();
    Ok((mid, upper, lower))
}

/// Per-bar true range; the first bar has no previous close and uses `high - low`
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| {
            let hl = (high[i] - low[i]).abs();
            if i == 0 {
                return hl;
            }
            let pc = close[i - 1];
            [hl, (high[i] - pc).abs(), (low[i] - pc).abs()]
                .into_iter()
                .filter(|v| !v.is_nan())
                .fold(f64::NAN, f64::max)
        })
        .collect()
}

/// Average true range as a plain rolling mean; NaN until a full window of
/// `n` bars exists. `ta`'s `AverageTrueRange` smooths exponentially instead.
pub fn atr(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    n: usize,
) -> Result<Vec<f64>, IndicatorError> {
    rolling_mean(&true_range(high, low, close), n, n, IndicatorName::Atr)
}

/// KDJ stochastic: `(k, d, j)`.
///
/// RSV needs a full `n`-bar high/low window. K and D are a sequential
/// recurrence seeded at 50: `K = (1 - 1/m1)·K' + RSV/m1`,
/// `D = (1 - 1/m2)·D' + K/m2`, `J = 3K - 2D`. Bars without an RSV get NaN
/// and leave the recurrence untouched.
pub fn kdj(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    n: usize,
    m1: f64,
    m2: f64,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), IndicatorError> {
    let bad_period = |_| invalid_period(IndicatorName::Kdj, n);
    let mut highest = Maximum::new(n).map_err(bad_period)?;
    let mut lowest = Minimum::new(n).map_err(bad_period)?;

    let len = close.len();
    let (mut k, mut d, mut j) = (
        Vec::with_capacity(len),
        Vec::with_capacity(len),
        Vec::with_capacity(len),
    );
    let (mut last_k, mut last_d) = (KDJ_SEED, KDJ_SEED);
    let mut last_gap: Option<usize> = None;

    for i in 0..len {
        let hh = highest.next(high[i]);
        let ll = lowest.next(low[i]);
        if high[i].is_nan() || low[i].is_nan() {
            last_gap = Some(i);
        }
        let full_window = i + 1 >= n && last_gap.map_or(true, |g| i - g >= n);

        let rsv = if full_window {
            (close[i] - ll) / (hh - ll) * 100.0
        } else {
            f64::NAN
        };

        if rsv.is_finite() {
            last_k = (1.0 - 1.0 / m1) * last_k + rsv / m1;
            last_d = (1.0 - 1.0 / m2) * last_d + last_k / m2;
            k.push(last_k);
            d.push(last_d);
            j.push(3.0 * last_k - 2.0 * last_d);
        } else {
            k.push(f64::NAN);
            d.push(f64::NAN);
            j.push(f64::NAN);
        }
    }

    Ok((k, d, j))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const EPS: f64 = 1e-9;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            if e.is_nan() {
                assert!(a.is_nan(), "index {i}: expected NaN, got {a}");
            } else {
                assert!((a - e).abs() < 1e-6, "index {i}: expected {e}, got {a}");
            }
        }
    }

    fn make_series(highs: &[f64], lows: &[f64], closes: &[f64]) -> Series {
        let dates = (0..closes.len())
            .map(|i| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(i as u64))
            .collect();
        Series::new(dates)
            .with_column(HIGH, highs.to_vec())
            .with_column(LOW, lows.to_vec())
            .with_column(CLOSE, closes.to_vec())
    }

    #[test]
    fn test_ma_partial_window_warm_up() {
        assert_close(&ma(&[1.0, 2.0, 3.0], 5).unwrap(), &[1.0, 1.5, 2.0]);
        assert_close(&ma(&[1.0, 2.0, 3.0, 4.0], 2).unwrap(), &[1.0, 1.5, 2.5, 3.5]);
        assert_close(&ma(&[1.0, f64::NAN, 3.0], 2).unwrap(), &[1.0, f64::NAN, 2.0]);
        assert!(matches!(
            ma(&[1.0], 0),
            Err(IndicatorError::InvalidParam { indicator: IndicatorName::Ma, .. })
        ));
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        assert_close(&ema(&[1.0, 2.0, 3.0], 3).unwrap(), &[1.0, 1.5, 2.25]);
        assert!(ema(&[1.0], 0).is_err());
    }

    #[test]
    fn test_macd_hist_is_dif_minus_dea() {
        let close: Vec<f64> = (0..60).map(|i| 10.0 + (i as f64 * 0.3).sin() * 2.0).collect();
        let (dif, dea, hist) = macd(&close, 12, 26, 9).unwrap();
        for i in 0..close.len() {
            assert!((hist[i] - (dif[i] - dea[i])).abs() < EPS);
        }
        let (dif, _, hist) = macd(&[5.0; 10], 12, 26, 9).unwrap();
        assert!(dif.iter().chain(&hist).all(|v| v.abs() < EPS));
    }

    #[test]
    fn test_rsi_methods() {
        let close = [1.0, 2.0, 1.0, 2.0];
        assert_close(
            &rsi(&close, 2, RsiMethod::Ema).unwrap(),
            &[f64::NAN, f64::NAN, 100.0 - 100.0 / 1.5, 100.0 - 100.0 / 3.5],
        );
        assert_close(
            &rsi(&close, 2, RsiMethod::Sma).unwrap(),
            &[f64::NAN, f64::NAN, 50.0, 50.0],
        );
        // adjusted weights: gains 0,1,.5,1.25 / 1,1.5,1.75,1.875
        assert_close(
            &rsi(&close, 2, RsiMethod::China).unwrap(),
            &[f64::NAN, f64::NAN, 100.0 - 100.0 / 1.5, 100.0 - 100.0 / 3.5],
        );

        let sma3 = rsi(&[3.0, 1.0, 2.0, 4.0], 3, RsiMethod::Sma).unwrap();
        // gains 0,0,1,2 losses 0,2,0,0 → windows of 3
        assert_close(&sma3[1..], &[0.0, 100.0 - 100.0 / 1.5, 100.0 - 100.0 / 2.5]);
    }

    #[test]
    fn test_rsi_zero_loss_is_nan() {
        let rising: Vec<f64> = (1..=20).map(f64::from).collect();
        for method in [RsiMethod::Ema, RsiMethod::Sma, RsiMethod::China] {
            assert!(rsi(&rising, 14, method).unwrap().iter().all(|v| v.is_nan()));
        }
    }

    #[test]
    fn test_boll_sample_std() {
        let (mid, upper, lower) = boll(&[1.0, 2.0, 3.0], 20, 2.0).unwrap();
        assert_close(&mid, &[1.0, 1.5, 2.0]);
        assert_close(&upper, &[f64::NAN, 1.5 + 2.0 * 0.5f64.sqrt(), 4.0]);
        assert_close(&lower, &[f64::NAN, 1.5 - 2.0 * 0.5f64.sqrt(), 0.0]);
    }

    #[test]
    fn test_atr_needs_full_window() {
        let high = [10.0, 11.0, 12.0, 13.0];
        let low = [8.0, 9.0, 10.0, 11.0];
        let close = [9.0, 10.0, 15.0, 12.0];
        assert_close(&true_range(&high, &low, &close), &[2.0, 2.0, 2.0, 4.0]);
        assert_close(
            &atr(&high, &low, &close, 3).unwrap(),
            &[f64::NAN, f64::NAN, 2.0, 8.0 / 3.0],
        );
    }

    #[test]
    fn test_kdj_seed_and_recursion() {
        let high = [10.0, 11.0, 12.0, 13.0];
        let low = [8.0, 9.0, 10.0, 11.0];
        let close = [9.0, 10.0, 11.0, 12.0];
        let (k, d, j) = kdj(&high, &low, &close, 3, 3.0, 3.0).unwrap();

        let k2 = 2.0 / 3.0 * 50.0 + 75.0 / 3.0;
        let d2 = 2.0 / 3.0 * 50.0 + k2 / 3.0;
        let k3 = 2.0 / 3.0 * k2 + 75.0 / 3.0;
        let d3 = 2.0 / 3.0 * d2 + k3 / 3.0;
        assert_close(&k, &[f64::NAN, f64::NAN, k2, k3]);
        assert_close(&d, &[f64::NAN, f64::NAN, d2, d3]);
        assert_close(&j, &[f64::NAN, f64::NAN, 3.0 * k2 - 2.0 * d2, 3.0 * k3 - 2.0 * d3]);
    }

    #[test]
    fn test_kdj_flat_window_skips_bar() {
        let high = [5.0, 5.0, 5.0, 8.0];
        let low = [5.0, 5.0, 5.0, 4.0];
        let close = [5.0, 5.0, 5.0, 7.0];
        let (k, _, _) = kdj(&high, &low, &close, 2, 3.0, 3.0).unwrap();
        assert!(k[1].is_nan() && k[2].is_nan());
        // hh=8, ll=4 → rsv 75; recursion still seeded at 50
        assert!((k[3] - (2.0 / 3.0 * 50.0 + 25.0)).abs() < EPS);
    }

    #[test]
    fn test_compute_missing_columns_fails_before_computing() {
        let dates = vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()];
        let series = Series::new(dates).with_column(CLOSE, vec![1.0]);
        let err = compute(&series, &[IndicatorSpec::ma(5), IndicatorSpec::atr(14)]).unwrap_err();
        match err {
            IndicatorError::MissingColumns {
                indicator, missing, ..
            } => {
                assert_eq!(indicator, IndicatorName::Atr);
                assert_eq!(missing, vec!["high".to_string(), "low".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_compute_does_not_mutate_input() {
        let series = make_series(&[2.0, 3.0, 4.0], &[1.0, 2.0, 3.0], &[1.5, 2.5, 3.5]);
        let before = series.clone();
        let enriched = compute(
            &series,
            &[
                IndicatorSpec::ma(5),
                IndicatorSpec::macd(12, 26, 9),
                IndicatorSpec::rsi(14, RsiMethod::China),
                IndicatorSpec::boll(20, 2.0),
                IndicatorSpec::atr(2),
                IndicatorSpec::kdj(2, 3.0, 3.0),
            ],
        )
        .unwrap();
        assert_eq!(series, before);
        for col in [
            "ma5", "dif", "dea", "macd_hist", "rsi14", "boll_mid", "boll_upper", "boll_lower",
            "atr2", "kdj_k", "kdj_d", "kdj_j",
        ] {
            assert!(enriched.has_column(col), "missing {col}");
        }
        assert!(!series.has_column("ma5"));
    }

    #[test]
    fn test_dedup_ignores_param_order() {
        let mut a = IndicatorSpec::ma(5);
        a.params.insert("z".into(), ParamValue::Number(1.0));
        let mut b = IndicatorSpec {
            name: IndicatorName::Ma,
            params: BTreeMap::new(),
        };
        b.params.insert("z".into(), ParamValue::Number(1.0));
        b.params.insert("n".into(), ParamValue::Number(5.0));
        assert_eq!(dedup_specs(&[a, b, IndicatorSpec::ma(10)]).len(), 2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let series = make_series(&[1.0], &[1.0], &[1.0]);
        let mut spec = IndicatorSpec::ma(5);
        spec.params.insert("n".into(), ParamValue::Number(2.5));
        assert!(matches!(
            compute(&series, &[spec]),
            Err(IndicatorError::InvalidParam { .. })
        ));
        let mut spec = IndicatorSpec::rsi(14, RsiMethod::Ema);
        spec.params
            .insert("method".into(), ParamValue::Text("wilder2".into()));
        assert!(compute(&series, &[spec]).is_err());
    }

    #[test]
    fn test_for_field_mapping() {
        assert_eq!(IndicatorSpec::for_field("ma20"), Some(IndicatorSpec::ma(20)));
        assert_eq!(IndicatorSpec::for_field("ema12"), Some(IndicatorSpec::ema(12)));
        assert_eq!(
            IndicatorSpec::for_field("rsi6"),
            Some(IndicatorSpec::rsi(6, RsiMethod::Ema))
        );
        assert_eq!(
            IndicatorSpec::for_field("macd_hist"),
            Some(IndicatorSpec::macd(12, 26, 9))
        );
        assert_eq!(IndicatorSpec::for_field("atr14"), Some(IndicatorSpec::atr(14)));
        assert_eq!(IndicatorSpec::for_field("pe"), None);
        assert_eq!(IndicatorSpec::for_field("ma0"), None);
        assert_eq!(display_specs().len(), 4 + 4);
        assert_eq!(dedup_specs(&display_specs()).len(), 4);
    }

    #[test]
    fn test_pct_change() {
        assert_close(
            &pct_change(&[10.0, 11.0, 0.0, 5.0]),
            &[f64::NAN, 10.0, -100.0, f64::NAN],
        );
        assert!(pct_change(&[]).is_empty());
    }
}
