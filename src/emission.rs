use crate::error::{Error, Result};
use ndarray::prelude::*;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// The smallest variance that re-estimation will produce unless configured otherwise.
pub const MIN_VARIANCE: f64 = 1e-6;

/// A total responsibility below this means that no observations were assigned to a state.
pub const MIN_RESPONSIBILITY: f64 = 1e-10;

/// A univariate normal distribution $N(μ, σ^2)$, used as the emission distribution of one hidden
/// state.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-1", serde(try_from = "RawGaussian"))]
pub struct Gaussian {
    mean: f64,
    variance: f64,
}

impl Gaussian {
    /// Fails with `InvalidParameter` if the mean isn't finite or the variance isn't a finite
    /// positive number.
    pub fn new(mean: f64, variance: f64) -> Result<Self> {
        if !mean.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "emission mean must be finite, got {}",
                mean
            )));
        }
        if !(variance > 0.0 && variance.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "emission variance must be positive and finite, got {}",
                variance
            )));
        }
        Ok(Self { mean, variance })
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// $\log N(y | μ, σ^2) = -\frac{1}{2}\left(\log 2πσ^2 + \frac{(y-μ)^2}{σ^2}\right)$
    pub fn log_pdf(&self, y: f64) -> f64 {
        -0.5 * ((2.0 * PI * self.variance).ln() + (y - self.mean).powi(2) / self.variance)
    }

    pub fn pdf(&self, y: f64) -> f64 {
        self.log_pdf(y).exp()
    }

    /// The same distribution with its variance raised to at least `variance_floor`
    pub fn floored(self, variance_floor: f64) -> Self {
        Self {
            variance: self.variance.max(variance_floor),
            ..self
        }
    }

    /// Weighted maximum likelihood estimate of $μ$ and $σ^2$, where `weights[t]` is the posterior
    /// responsibility of this state for `ys[t]`:
    ///
    /// $$
    /// μ^* = \frac{\sum_t γ(t) y_t}{\sum_t γ(t)} \qquad
    /// σ^{2*} = \max\left(\frac{\sum_t γ(t) (y_t - μ^*)^2}{\sum_t γ(t)}, σ^2_{min}\right)
    /// $$
    ///
    /// Returns `None` if the weights sum to less than `MIN_RESPONSIBILITY`, in which case the
    /// caller should keep the previous parameters.
    pub fn reestimate(
        ys: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        variance_floor: f64,
    ) -> Option<Self> {
        debug_assert_eq!(ys.len(), weights.len());
        let weights_sum = weights.sum();
        if !(weights_sum >= MIN_RESPONSIBILITY) {
            return None;
        }
        let mean = weights.dot(&ys) / weights_sum;
        let variance = ys
            .iter()
            .zip(weights)
            .map(|(&y, &w)| w * (y - mean).powi(2))
            .sum::<f64>()
            / weights_sum;
        Some(Self {
            mean,
            variance: variance.max(variance_floor),
        })
    }
}

#[cfg(feature = "serde-1")]
#[derive(Deserialize)]
struct RawGaussian {
    mean: f64,
    variance: f64,
}

#[cfg(feature = "serde-1")]
impl std::convert::TryFrom<RawGaussian> for Gaussian {
    type Error = Error;

    fn try_from(raw: RawGaussian) -> Result<Self> {
        Gaussian::new(raw.mean, raw.variance)
    }
}
