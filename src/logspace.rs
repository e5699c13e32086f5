//! Small numeric helpers on top of `ndarray`, mostly for working with log probabilities.
use crate::error::{Error, Result};
use ndarray::prelude::*;
use ndarray::{Data, DataMut, Dimension};
use num_traits::Float;

/// Compute $\log \sum_i e^{x_i}$ without overflow or underflow.
///
/// Returns $-∞$ for an empty input or when every term is $-∞$.
pub fn log_sum_exp<T, I>(xs: I) -> T
where
    T: Float,
    I: IntoIterator<Item = T>,
    I::IntoIter: Clone,
{
    let xs = xs.into_iter();
    let max = xs.clone().fold(T::neg_infinity(), T::max);
    if max.is_infinite() {
        return max;
    }
    let sum = xs.fold(T::zero(), |acc, x| acc + (x - max).exp());
    max + sum.ln()
}

pub trait ArrayFloat<T: Float> {
    /// The Euclidean distance between two arrays of the same shape
    fn l2_distance(&self, rhs: &Self) -> Result<T>;
}

pub trait Array1Float<T: Float> {
    /// Along a 1D array, return the maximum float value and its index
    ///
    /// If there are multiple equal maximum values, the lowest index wins.
    ///
    /// The behavior of this function is unspecified if the array contains NaNs.
    fn maxf(&self) -> Option<(usize, T)>;

    /// `log_sum_exp` over the elements of this array
    fn log_sum_exp(&self) -> T;
}

pub trait Array1FloatMut: Sized {
    /// Scale in place so that the elements sum to 1.
    fn nip(&mut self, label: &'static str) -> Result<()>;

    fn normalize(self, label: &'static str) -> Result<Self>;
}

pub trait Array2FloatMut: Sized {
    fn nip_rows(&mut self, label: &'static str) -> Result<()>;

    fn normalize_rows(self, label: &'static str) -> Result<Self>;
}

impl<D, S> ArrayFloat<f64> for ArrayBase<S, D>
where
    D: Dimension,
    S: Data<Elem = f64>,
{
    fn l2_distance(&self, rhs: &Self) -> Result<f64> {
        if self.shape() != rhs.shape() {
            return Err(Error::InvalidParameter(format!(
                "can't compare shapes {:?} and {:?}",
                self.shape(),
                rhs.shape()
            )));
        }
        Ok(self
            .iter()
            .zip(rhs.iter())
            .map(|(&x, &y)| (y - x).powi(2))
            .sum::<f64>()
            .sqrt())
    }
}

impl<T, S> Array1Float<T> for ArrayBase<S, Ix1>
where
    T: Float,
    S: Data<Elem = T>,
{
    fn maxf(&self) -> Option<(usize, T)> {
        self.iter()
            .enumerate()
            .fold(None, |best, (i, &v)| match best {
                Some((_, b)) if !(v > b) => best,
                _ => Some((i, v)),
            })
    }

    fn log_sum_exp(&self) -> T {
        log_sum_exp(self.iter().cloned())
    }
}

impl<S> Array1FloatMut for ArrayBase<S, Ix1>
where
    S: DataMut<Elem = f64>,
{
    fn nip(&mut self, label: &'static str) -> Result<()> {
        let sum = self.sum();
        if !(sum > 0.0 && sum.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "sum of {} must be positive and finite, got {}",
                label, sum
            )));
        }
        *self /= sum;
        Ok(())
    }

    fn normalize(mut self, label: &'static str) -> Result<Self> {
        self.nip(label)?;
        Ok(self)
    }
}

impl<S> Array2FloatMut for ArrayBase<S, Ix2>
where
    S: DataMut<Elem = f64>,
{
    fn nip_rows(&mut self, label: &'static str) -> Result<()> {
        for mut row in self.rows_mut() {
            row.nip(label)?;
        }
        Ok(())
    }

    fn normalize_rows(mut self, label: &'static str) -> Result<Self> {
        self.nip_rows(label)?;
        Ok(self)
    }
}
