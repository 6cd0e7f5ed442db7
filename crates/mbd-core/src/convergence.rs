//! Residual and solution-increment tests.
//!
//! A test reduces a vector to one non-negative scalar in three stages:
//! `test_one` folds each entry into an accumulator, `test_merge` combines
//! accumulators of disjoint entry ranges, `test_post` finishes the value.
//! Merging is commutative and associative, so partial tests computed per
//! thread or per domain combine in any order.

use std::ops::Range;

use serde::{Deserialize, Serialize};

pub trait NonlinearSolverTest: Send + Sync {
    /// Fold entry `index` with value `value` into `acc`.
    fn test_one(&self, acc: f64, value: f64, index: usize) -> f64;

    fn test_merge(&self, left: f64, right: f64) -> f64;

    fn test_post(&self, acc: f64) -> f64 {
        acc
    }

    /// Multiplier applied to entry `index` before it is folded.
    fn scale_coef(&self, _index: usize) -> f64 {
        1.0
    }

    /// Un-posted accumulator over `range` of `values`.
    fn make_test_range(&self, values: &[f64], range: Range<usize>) -> f64 {
        let start = range.start;
        values[range]
            .iter()
            .enumerate()
            .fold(0.0, |acc, (k, &v)| self.test_one(acc, v, start + k))
    }

    fn make_test(&self, values: &[f64]) -> f64 {
        self.test_post(self.make_test_range(values, 0..values.len()))
    }

    fn name(&self) -> &'static str;
}

/// Always zero: the test is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneTest;

impl NonlinearSolverTest for NoneTest {
    fn test_one(&self, _acc: f64, _value: f64, _index: usize) -> f64 {
        0.0
    }

    fn test_merge(&self, _left: f64, _right: f64) -> f64 {
        0.0
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Euclidean norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormTest;

impl NonlinearSolverTest for NormTest {
    fn test_one(&self, acc: f64, value: f64, _index: usize) -> f64 {
        acc + value * value
    }

    fn test_merge(&self, left: f64, right: f64) -> f64 {
        left + right
    }

    fn test_post(&self, acc: f64) -> f64 {
        acc.sqrt()
    }

    fn name(&self) -> &'static str {
        "norm"
    }
}

/// Largest absolute entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMaxTest;

impl NonlinearSolverTest for MinMaxTest {
    fn test_one(&self, acc: f64, value: f64, _index: usize) -> f64 {
        // NaN must survive the fold so divergence is detected
        if value.is_nan() {
            return f64::NAN;
        }
        acc.max(value.abs())
    }

    fn test_merge(&self, left: f64, right: f64) -> f64 {
        if left.is_nan() || right.is_nan() {
            return f64::NAN;
        }
        left.max(right)
    }

    fn name(&self) -> &'static str {
        "minmax"
    }
}

/// Wraps a test, multiplying entry `i` by `scale[i]` first.
#[derive(Debug, Clone)]
pub struct ScaledTest<T> {
    inner: T,
    scale: Vec<f64>,
}

impl<T: NonlinearSolverTest> ScaledTest<T> {
    pub fn new(inner: T, scale: Vec<f64>) -> Self {
        Self { inner, scale }
    }

    pub fn set_scale(&mut self, scale: Vec<f64>) {
        self.scale = scale;
    }
}

impl<T: NonlinearSolverTest> NonlinearSolverTest for ScaledTest<T> {
    fn test_one(&self, acc: f64, value: f64, index: usize) -> f64 {
        self.inner.test_one(acc, value * self.scale_coef(index), index)
    }

    fn test_merge(&self, left: f64, right: f64) -> f64 {
        self.inner.test_merge(left, right)
    }

    fn test_post(&self, acc: f64) -> f64 {
        self.inner.test_post(acc)
    }

    fn scale_coef(&self, index: usize) -> f64 {
        self.scale.get(index).copied().unwrap_or(1.0)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    None,
    #[default]
    Norm,
    MinMax,
}

impl TestKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(TestKind::None),
            "norm" => Some(TestKind::Norm),
            "minmax" => Some(TestKind::MinMax),
            _ => None,
        }
    }
}

/// Build a boxed test, scaled when `scale` is given.
pub fn create_test(kind: TestKind, scale: Option<Vec<f64>>) -> Box<dyn NonlinearSolverTest> {
    match (kind, scale) {
        (TestKind::None, _) => Box::new(NoneTest),
        (TestKind::Norm, None) => Box::new(NormTest),
        (TestKind::Norm, Some(s)) => Box::new(ScaledTest::new(NormTest, s)),
        (TestKind::MinMax, None) => Box::new(MinMaxTest),
        (TestKind::MinMax, Some(s)) => Box::new(ScaledTest::new(MinMaxTest, s)),
    }
}
