//! Parse errors for the constraint language.

use thiserror::Error;

/// Result type alias for constraint parsing.
pub type ConstraintResult<T> = Result<T, ConstraintError>;

/// Errors raised while parsing resource or flag strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("malformed resource record {record:?}: expected name<op>value[k|M|G|T]")]
    MalformedRecord { record: String },

    #[error("empty record in resource string {input:?}")]
    EmptyRecord { input: String },

    #[error("offered resource {record:?} must use '='")]
    OfferOperator { record: String },

    #[error("value {value:?} in record {record:?} overflows a 64-bit count")]
    Overflow { record: String, value: String },

    #[error("empty flag in {input:?}")]
    EmptyFlag { input: String },

    #[error("invalid flag {flag:?}")]
    InvalidFlag { flag: String },
}
