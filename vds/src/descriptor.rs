use std::{fmt, sync::Arc};

use ndarray::{concatenate, ArrayD, Axis, SliceInfoElem};
use paste::paste;
use serde::{Deserialize, Serialize};

use crate::{
    array_agg::ArrayAggregation,
    constraint::Hyperslab,
    dimension::Dimension,
    errors::{Error, Result},
};

/// The kind of value stored in one element of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    I32,
    I64,
    F32,
    F64,
    Str,
}

impl ElementType {
    /// Number of bytes per element. Strings are variable width and report
    /// zero.
    pub fn width(&self) -> usize {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
            Self::Str => 0,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Str => "str",
        };
        write!(f, "{name}")
    }
}

/// An in-memory slab of array data.
///
/// Numeric blocks are dynamically-dimensioned ndarrays; string blocks are
/// one dimensional and exist for synthesized coordinate variables.
#[derive(Clone, Debug, PartialEq)]
pub enum DataBlock {
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Str(Vec<String>),
}

macro_rules! numeric_block {
    ($variant:ident, $type:ty) => {
        paste! {
            impl From<ArrayD<$type>> for DataBlock {
                fn from(data: ArrayD<$type>) -> Self {
                    Self::$variant(data)
                }
            }

            impl DataBlock {
                pub fn [<as_ $type>](&self) -> &ArrayD<$type> {
                    match self {
                        Self::$variant(data) => data,
                        _ => panic!("not an {} block", stringify!($type)),
                    }
                }
            }
        }
    };
}

numeric_block!(I32, i32);
numeric_block!(I64, i64);
numeric_block!(F32, f32);
numeric_block!(F64, f64);

impl DataBlock {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
            Self::Str(_) => ElementType::Str,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::I32(data) => data.shape().to_vec(),
            Self::I64(data) => data.shape().to_vec(),
            Self::F32(data) => data.shape().to_vec(),
            Self::F64(data) => data.shape().to_vec(),
            Self::Str(values) => vec![values.len()],
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::I32(data) => data.len(),
            Self::I64(data) => data.len(),
            Self::F32(data) => data.len(),
            Self::F64(data) => data.len(),
            Self::Str(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract the subarray selected by one hyperslab per dimension.
    pub fn slice(&self, slabs: &[Hyperslab]) -> Result<DataBlock> {
        self.check_slabs(slabs)?;
        let info: Vec<SliceInfoElem> = slabs
            .iter()
            .map(|slab| SliceInfoElem::Slice {
                start: slab.start as isize,
                end: Some((slab.stop + 1) as isize),
                step: slab.stride as isize,
            })
            .collect();

        let sliced = match self {
            Self::I32(data) => Self::I32(data.slice(info.as_slice()).to_owned()),
            Self::I64(data) => Self::I64(data.slice(info.as_slice()).to_owned()),
            Self::F32(data) => Self::F32(data.slice(info.as_slice()).to_owned()),
            Self::F64(data) => Self::F64(data.slice(info.as_slice()).to_owned()),
            Self::Str(values) => Self::Str(slabs[0].iter().map(|i| values[i].clone()).collect()),
        };

        Ok(sliced)
    }

    fn check_slabs(&self, slabs: &[Hyperslab]) -> Result<()> {
        let shape = self.shape();
        if slabs.len() != shape.len() {
            return Err(Error::BadConstraint {
                detail: format!(
                    "constraint has {} dimensions, array has {}",
                    slabs.len(),
                    shape.len()
                ),
            });
        }
        for (slab, extent) in slabs.iter().zip(&shape) {
            slab.validate()?;
            if slab.extent != *extent {
                return Err(Error::BadConstraint {
                    detail: format!(
                        "constraint extent {} does not match dimension size {extent}",
                        slab.extent
                    ),
                });
            }
        }

        Ok(())
    }

    /// Join blocks along the leading axis. All blocks must share an element
    /// type and trailing shape; callers validate every block against a
    /// single prototype before joining.
    pub fn concat(blocks: Vec<DataBlock>) -> DataBlock {
        match blocks.into_iter().reduce(|joined, block| match (joined, block) {
            (Self::I32(a), Self::I32(b)) => Self::I32(
                concatenate(Axis(0), &[a.view(), b.view()])
                    .expect("slices validated against prototype"),
            ),
            (Self::I64(a), Self::I64(b)) => Self::I64(
                concatenate(Axis(0), &[a.view(), b.view()])
                    .expect("slices validated against prototype"),
            ),
            (Self::F32(a), Self::F32(b)) => Self::F32(
                concatenate(Axis(0), &[a.view(), b.view()])
                    .expect("slices validated against prototype"),
            ),
            (Self::F64(a), Self::F64(b)) => Self::F64(
                concatenate(Axis(0), &[a.view(), b.view()])
                    .expect("slices validated against prototype"),
            ),
            (Self::Str(mut a), Self::Str(b)) => {
                a.extend(b);
                Self::Str(a)
            }
            _ => panic!("mixed element types in concat"),
        }) {
            Some(block) => block,
            None => panic!("concat of zero blocks"),
        }
    }

    /// Add a new leading axis of length one.
    pub fn insert_lead_axis(self) -> DataBlock {
        match self {
            Self::I32(data) => Self::I32(data.insert_axis(Axis(0))),
            Self::I64(data) => Self::I64(data.insert_axis(Axis(0))),
            Self::F32(data) => Self::F32(data.insert_axis(Axis(0))),
            Self::F64(data) => Self::F64(data.insert_axis(Axis(0))),
            Self::Str(_) => panic!("string blocks are one dimensional"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn new<S: Into<String>>(name: S, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An attribute value. Containers nest; cloning an attribute deep-copies
/// the whole container tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    I64(i64),
    F64(f64),
    Str(String),
    Container(Vec<Attribute>),
}

/// Where an array variable's values come from.
///
/// Aggregations are shared by handle; cloning a variable never duplicates
/// in-flight aggregation state.
#[derive(Clone)]
pub enum ArraySource {
    Resident(DataBlock),
    Aggregated(Arc<ArrayAggregation>),
    Placeholder(ElementType),
}

#[derive(Clone)]
pub struct ArrayVariable {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub source: ArraySource,
}

impl ArrayVariable {
    pub fn resident<S: Into<String>>(
        name: S,
        dimensions: Vec<Dimension>,
        block: DataBlock,
    ) -> Self {
        Self {
            name: name.into(),
            dimensions,
            attributes: vec![],
            source: ArraySource::Resident(block),
        }
    }

    /// A variable declared without a value yet.
    pub fn placeholder<S: Into<String>>(
        name: S,
        dimensions: Vec<Dimension>,
        element: ElementType,
    ) -> Self {
        Self {
            name: name.into(),
            dimensions,
            attributes: vec![],
            source: ArraySource::Placeholder(element),
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn element_type(&self) -> ElementType {
        match &self.source {
            ArraySource::Resident(block) => block.element_type(),
            ArraySource::Aggregated(agg) => agg.element_type(),
            ArraySource::Placeholder(element) => *element,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.size as usize).collect()
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// The whole array: one full-extent hyperslab per dimension.
    pub fn full_constraint(&self) -> Vec<Hyperslab> {
        self.dimensions
            .iter()
            .map(|d| Hyperslab::full(d.size as usize))
            .collect()
    }

    /// A coordinate variable is one dimensional and named after its sole
    /// dimension.
    pub fn is_coordinate(&self) -> bool {
        self.rank() == 1 && self.dimensions[0].name == self.name
    }

    pub fn has_value(&self) -> bool {
        !matches!(self.source, ArraySource::Placeholder(_))
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// An array variable plus one coordinate map vector per dimension.
#[derive(Clone)]
pub struct GridVariable {
    pub array: ArrayVariable,
    pub maps: Vec<ArrayVariable>,
}

impl GridVariable {
    pub fn new(array: ArrayVariable, maps: Vec<ArrayVariable>) -> Self {
        Self { array, maps }
    }

    pub fn name(&self) -> &str {
        &self.array.name
    }

    pub fn map(&self, name: &str) -> Option<&ArrayVariable> {
        self.maps.iter().find(|m| m.name == name)
    }
}

#[derive(Clone)]
pub enum Variable {
    Array(ArrayVariable),
    Grid(GridVariable),
}

impl Variable {
    pub fn name(&self) -> &str {
        match self {
            Self::Array(array) => &array.name,
            Self::Grid(grid) => grid.name(),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayVariable> {
        match self {
            Self::Array(array) => Some(array),
            Self::Grid(_) => None,
        }
    }

    pub fn as_grid(&self) -> Option<&GridVariable> {
        match self {
            Self::Array(_) => None,
            Self::Grid(grid) => Some(grid),
        }
    }

    /// The data array: the variable itself, or a grid's underlying array.
    pub fn data_array(&self) -> &ArrayVariable {
        match self {
            Self::Array(array) => array,
            Self::Grid(grid) => &grid.array,
        }
    }

    pub fn outer_dimension(&self) -> Option<&Dimension> {
        self.data_array().dimensions.first()
    }
}

/// A fully parsed dataset: attributes, dimension table, variables.
#[derive(Clone, Default)]
pub struct DatasetDescriptor {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<Variable>,
}

impl DatasetDescriptor {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name() == name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variable(name).is_some()
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn push_variable(&mut self, variable: Variable) {
        self.variables.push(variable);
    }
}
