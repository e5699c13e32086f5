use thiserror::Error;

/// Fatal conditions. These are always reported before any EM iteration runs.
///
/// Recoverable conditions such as hitting the iteration cap are not errors; see
/// [`Diagnostic`](crate::Diagnostic).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// A non-finite or out-of-domain value was supplied as a model parameter or setting, e.g.
    /// $σ^2 ≤ 0$ or a probability vector that doesn't sum to 1.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The observation sequence is too short to estimate the requested model.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The observation at time `t` is NaN or infinite.
    #[error("invalid observation at t={t}: {value}")]
    InvalidObservation { t: usize, value: f64 },

    /// The observation sequence has zero probability under the given parameters.
    #[error("observation sequence is impossible under the given parameters")]
    ImpossibleSequence,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check that every observation is finite and that there are at least `min_len` of them.
pub(crate) fn validate_observations(ys: &[f64], min_len: usize) -> Result<()> {
    if ys.len() < min_len {
        return Err(Error::InsufficientData(format!(
            "need at least {} observations, got {}",
            min_len,
            ys.len()
        )));
    }
    match ys.iter().position(|y| !y.is_finite()) {
        Some(t) => Err(Error::InvalidObservation { t, value: ys[t] }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_short() {
        assert!(matches!(
            validate_observations(&[1.0], 2),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn nan_is_reported_with_its_position() {
        match validate_observations(&[0.0, 1.0, f64::NAN], 2) {
            Err(Error::InvalidObservation { t, value }) => {
                assert_eq!(t, 2);
                assert!(value.is_nan());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn infinity_is_rejected() {
        assert!(matches!(
            validate_observations(&[f64::INFINITY, 1.0], 2),
            Err(Error::InvalidObservation { t: 0, .. })
        ));
    }

    #[test]
    fn valid() {
        assert_eq!(validate_observations(&[0.5, -0.5], 2), Ok(()));
    }
}
