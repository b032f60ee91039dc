//! Restricted one-dimensional numeric engine.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::value::float_value;
use crate::error::{Result, SandboxError};

/// Immutable vector of `f64`.
///
/// Storage is shared between clones; every transform builds a new
/// backing slice, so no array can observe a change to another.
#[derive(Debug, Clone, PartialEq)]
pub struct SafeArray {
    data: Arc<[f64]>,
}

/// Fixed-shape summary produced by `describe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: Option<f64>,
    #[serde(rename = "25%")]
    pub p25: Option<f64>,
    #[serde(rename = "50%")]
    pub p50: Option<f64>,
    #[serde(rename = "75%")]
    pub p75: Option<f64>,
    pub max: Option<f64>,
}

impl Default for SafeArray {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl From<Vec<f64>> for SafeArray {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

impl FromIterator<f64> for SafeArray {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl TryFrom<&SafeArray> for Value {
    type Error = SandboxError;

    fn try_from(array: &SafeArray) -> Result<Value> {
        array
            .iter()
            .map(|x| {
                float_value(x).ok_or_else(|| {
                    SandboxError::validation(format!("{x} cannot be represented in JSON"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    }
}

impl SafeArray {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            data: Arc::from(values),
        }
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            data: Arc::from(values),
        }
    }

    /// Build from a JSON array of numbers.
    pub fn from_json(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| SandboxError::validation("expected a JSON array of numbers"))?;

        items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| SandboxError::validation(format!("element {i} is not a number"))),
                other => Err(SandboxError::validation(format!(
                    "element {i} is not a number: {other}"
                ))),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.data.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.to_vec()
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Arithmetic mean; 0.0 for an empty array.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.len() as f64
    }

    pub fn min(&self) -> Option<f64> {
        self.data.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.data.iter().copied().reduce(f64::max)
    }

    /// Middle value of the sorted data; 0.0 for an empty array.
    pub fn median(&self) -> f64 {
        let sorted = self.sorted_values();
        let n = sorted.len();
        match n {
            0 => 0.0,
            _ if n % 2 == 1 => sorted[n / 2],
            _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
        }
    }

    /// Variance with `ddof` delta degrees of freedom.
    ///
    /// Fewer than two elements yield 0.0. A `ddof` that leaves no degrees
    /// of freedom yields NaN.
    pub fn var(&self, ddof: usize) -> f64 {
        let n = self.len();
        if n < 2 {
            return 0.0;
        }
        if ddof >= n {
            return f64::NAN;
        }
        let mean = self.mean();
        let population = self
            .data
            .iter()
            .map(|x| {
                let d = x - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        population * (n as f64 / (n - ddof) as f64)
    }

    /// Standard deviation; population (`ddof = 0`) unless adjusted.
    pub fn std(&self, ddof: usize) -> f64 {
        self.var(ddof).sqrt()
    }

    /// Linear-interpolation percentile, `p` in `[0, 100]`.
    ///
    /// Returns `None` for empty data or an out-of-range `p`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.is_empty() || !(0.0..=100.0).contains(&p) {
            return None;
        }
        let sorted = self.sorted_values();
        Some(percentile_of_sorted(&sorted, p))
    }

    /// First, second or third quartile.
    pub fn quartile(&self, q: u8) -> Option<f64> {
        match q {
            1 => self.percentile(25.0),
            2 => self.percentile(50.0),
            3 => self.percentile(75.0),
            _ => None,
        }
    }

    pub fn filter(&self, predicate: impl Fn(f64) -> bool) -> Self {
        self.iter().filter(|x| predicate(*x)).collect()
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        self.iter().map(f).collect()
    }

    /// Ascending copy; NaN sorts last.
    pub fn sort(&self) -> Self {
        Self::new(self.sorted_values())
    }

    /// Descending copy; NaN sorts first.
    pub fn sort_desc(&self) -> Self {
        let mut values = self.sorted_values();
        values.reverse();
        Self::new(values)
    }

    pub fn cumsum(&self) -> Self {
        self.iter()
            .scan(0.0, |acc, x| {
                *acc += x;
                Some(*acc)
            })
            .collect()
    }

    pub fn cumprod(&self) -> Self {
        self.iter()
            .scan(1.0, |acc, x| {
                *acc *= x;
                Some(*acc)
            })
            .collect()
    }

    /// Consecutive differences; one element shorter than the input.
    pub fn diff(&self) -> Self {
        self.data.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Relative change between consecutive elements. A zero predecessor
    /// yields NaN.
    pub fn pct_change(&self) -> Self {
        self.data
            .windows(2)
            .map(|w| if w[0] == 0.0 { f64::NAN } else { (w[1] - w[0]) / w[0] })
            .collect()
    }

    pub fn abs(&self) -> Self {
        self.map(f64::abs)
    }

    pub fn clip(&self, lower: f64, upper: f64) -> Self {
        self.map(|x| x.max(lower).min(upper))
    }

    pub fn argmin(&self) -> Option<usize> {
        self.arg_by(|candidate, best| candidate < best)
    }

    pub fn argmax(&self) -> Option<usize> {
        self.arg_by(|candidate, best| candidate > best)
    }

    /// 1.0 where the element is greater than `threshold`, else 0.0.
    pub fn greater_than(&self, threshold: f64) -> Self {
        self.map(|x| indicator(x > threshold))
    }

    pub fn less_than(&self, threshold: f64) -> Self {
        self.map(|x| indicator(x < threshold))
    }

    pub fn equal(&self, value: f64) -> Self {
        self.map(|x| indicator(x == value))
    }

    pub fn describe(&self) -> Summary {
        let sorted = self.sorted_values();
        let pick = |p: f64| (!sorted.is_empty()).then(|| percentile_of_sorted(&sorted, p));
        Summary {
            count: self.len(),
            mean: self.mean(),
            std: self.std(0),
            min: self.min(),
            p25: pick(25.0),
            p50: pick(50.0),
            p75: pick(75.0),
            max: self.max(),
        }
    }

    fn sorted_values(&self) -> Vec<f64> {
        let mut values = self.data.to_vec();
        values.sort_by(nan_last);
        values
    }

    fn arg_by(&self, better: impl Fn(f64, f64) -> bool) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, x) in self.iter().enumerate() {
            match best {
                Some((_, b)) if !better(x, b) => {}
                _ => best = Some((i, x)),
            }
        }
        best.map(|(i, _)| i)
    }
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 100.0 {
        return sorted[n - 1];
    }

    let index = (p / 100.0) * (n - 1) as f64;
    let lo = index.floor() as usize;
    let hi = (index.ceil() as usize).min(n - 1);
    let frac = index - lo as f64;
    if lo == hi || frac == 0.0 {
        return sorted[lo];
    }

    let (a, b) = (sorted[lo], sorted[hi]);
    (a + (b - a) * frac).clamp(a, b)
}

/// Ascending order with every NaN, whatever its sign bit, after the numbers.
fn nan_last(a: &f64, b: &f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    }
}
