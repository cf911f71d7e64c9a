use std::io;
use std::result;

use thiserror::Error;

use crate::descriptor::ElementType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not load member dataset {location:?}: {reason}")]
    Load { location: String, reason: String },

    #[error(
        "type mismatch for variable {variable:?} in member {location:?}: \
         expected {expected}, found {found}"
    )]
    TypeMismatch {
        variable: String,
        location: String,
        expected: ElementType,
        found: ElementType,
    },

    #[error("shape mismatch for variable {variable:?} in member {location:?}: {detail}")]
    ShapeMismatch {
        variable: String,
        location: String,
        detail: String,
    },

    #[error("dimension {name:?} declared with conflicting sizes {existing} and {conflicting}")]
    DimensionConflict {
        name: String,
        existing: u32,
        conflicting: u32,
    },

    #[error("dimension {name:?} already cached for member {location:?}")]
    DuplicateDimension { name: String, location: String },

    #[error("index {index} out of range for extent {extent}: {detail}")]
    OutOfRangeIndex {
        index: usize,
        extent: usize,
        detail: String,
    },

    #[error("dimension {name:?} not present in member {location:?}")]
    MissingDimension { name: String, location: String },

    #[error("aggregation variable {variable:?} is unusable: {reason}")]
    MissingAggregationVariable { variable: String, reason: String },

    #[error("bad constraint: {detail}")]
    BadConstraint { detail: String },

    #[error("aggregation of {variable:?} previously failed: {detail}")]
    Failed { variable: String, detail: String },

    #[error("i/o error: {0}")]
    IO(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;
