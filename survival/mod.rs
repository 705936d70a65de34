//! Time-to-event side of the engine: covariate encoding, the Cox fit, and the
//! baseline conversion curve derived from it.

pub mod baseline;
pub mod encoding;
pub mod hazard;

pub use baseline::{BaselineCurveTable, CurveError, CurveOptions, CurveRow, derive_curve};
pub use encoding::{
    CovariateEncoder, CovariateKind, CovariateSpec, EncodingError, UnseenLevelPolicy,
};
pub use hazard::{CoxOptions, FitError, HazardFit, TieMethod, fit_hazard_model};
