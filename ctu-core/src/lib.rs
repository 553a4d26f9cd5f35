#![forbid(unsafe_code)]

mod error;
mod lower;
mod sema;

pub use error::{LoweringError, LoweringErrorKind, LoweringWarning, UnresolvedNameError};
pub use lower::{Lowered, lower};
pub use sema::{Resolution, Validator};

use ctu_ast::Unit;

/// Every name reference in `unit` that has no reachable declaration.
pub fn validate(unit: &Unit) -> Vec<UnresolvedNameError> {
    Validator::new().check_unit(unit).0
}

/// Like [`validate`], also returning where each resolved reference was found.
pub fn validate_with_resolutions(unit: &Unit) -> (Vec<UnresolvedNameError>, Vec<Resolution>) {
    Validator::new().check_unit(unit)
}
