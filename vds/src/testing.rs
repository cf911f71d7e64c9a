//! In-memory doubles for the external collaborators, plus small fixture
//! builders. Used by this crate's tests and usable by dependents testing
//! against the same seams.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use num_traits::{cast, NumCast};
use parking_lot::Mutex;

use crate::{
    descriptor::{
        ArrayVariable, DataBlock, DatasetDescriptor, ElementType, GridVariable, Variable,
    },
    dimension::Dimension,
    errors::{Error, Result},
    loader::{CatalogScanner, DatasetLoader, DimensionCache},
    transport::Transport,
};

/// A `DatasetLoader` backed by prebuilt descriptors. Counts loads per
/// location so tests can assert the loaded-at-most-once property.
#[derive(Clone, Default)]
pub struct MemoryLoader {
    descriptors: Arc<Mutex<HashMap<String, DatasetDescriptor>>>,
    loads: Arc<Mutex<HashMap<String, usize>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&self, location: S, descriptor: DatasetDescriptor) {
        self.descriptors.lock().insert(location.into(), descriptor);
    }

    pub fn load_count(&self, location: &str) -> usize {
        self.loads.lock().get(location).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DatasetLoader for MemoryLoader {
    async fn load(&self, location: &str) -> Result<DatasetDescriptor> {
        *self.loads.lock().entry(location.to_string()).or_insert(0) += 1;
        self.descriptors
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| Error::Load {
                location: location.to_string(),
                reason: String::from("no such dataset"),
            })
    }
}

#[derive(Default)]
pub struct MemoryDimensionCache {
    entries: Mutex<HashMap<String, Vec<Dimension>>>,
    saves: Mutex<Vec<String>>,
}

impl MemoryDimensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&self, location: S, dimensions: Vec<Dimension>) {
        self.entries.lock().insert(location.into(), dimensions);
    }

    /// Locations `save` has been called for, in order.
    pub fn saved(&self) -> Vec<String> {
        self.saves.lock().clone()
    }
}

#[async_trait]
impl DimensionCache for MemoryDimensionCache {
    async fn load(&self, location: &str) -> Result<Option<Vec<Dimension>>> {
        Ok(self.entries.lock().get(location).cloned())
    }

    async fn save(&self, location: &str, dimensions: &[Dimension]) -> Result<()> {
        self.saves.lock().push(location.to_string());
        self.entries
            .lock()
            .insert(location.to_string(), dimensions.to_vec());

        Ok(())
    }

    async fn is_cached(&self, location: &str) -> bool {
        self.entries.lock().contains_key(location)
    }
}

#[derive(Default)]
pub struct MemoryScanner {
    directories: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&self, directory: S, locations: Vec<String>) {
        self.directories.lock().insert(directory.into(), locations);
    }
}

#[async_trait]
impl CatalogScanner for MemoryScanner {
    async fn scan(&self, directory: &str, suffix: &str) -> Result<Vec<String>> {
        let mut locations: Vec<String> = self
            .directories
            .lock()
            .get(directory)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|l| l.ends_with(suffix))
            .collect();
        locations.sort();

        Ok(locations)
    }
}

/// Captures the pipelined write protocol for assertions.
#[derive(Default)]
pub struct RecordingTransport {
    pub begun: Vec<(usize, ElementType)>,
    pub slices: Vec<DataBlock>,
    pub ends: usize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All streamed f64 elements, flattened in emission order.
    pub fn flat_f64(&self) -> Vec<f64> {
        self.slices
            .iter()
            .flat_map(|slice| slice.as_f64().iter().cloned().collect::<Vec<f64>>())
            .collect()
    }

    pub fn flat_str(&self) -> Vec<String> {
        self.slices
            .iter()
            .flat_map(|slice| match slice {
                DataBlock::Str(values) => values.clone(),
                _ => panic!("not a str block"),
            })
            .collect()
    }

    pub fn total_elements(&self) -> usize {
        self.slices.iter().map(DataBlock::len).sum()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn begin_vector(&mut self, total_elements: usize, element: ElementType) -> Result<()> {
        self.begun.push((total_elements, element));

        Ok(())
    }

    async fn put_slice(&mut self, slice: &DataBlock) -> Result<()> {
        self.slices.push(slice.clone());

        Ok(())
    }

    async fn end_vector(&mut self) -> Result<()> {
        self.ends += 1;

        Ok(())
    }
}

/// `len` evenly spaced values starting at `offset`.
pub fn ramp<N: NumCast>(len: usize, offset: usize) -> Vec<N> {
    (0..len).map(|i| cast(i + offset).unwrap()).collect()
}

pub fn f64_block(shape: &[usize], values: Vec<f64>) -> DataBlock {
    DataBlock::F64(ArrayD::from_shape_vec(IxDyn(shape), values).unwrap())
}

pub fn f64_array(name: &str, dims: &[(&str, u32)], values: Vec<f64>) -> ArrayVariable {
    let dimensions: Vec<Dimension> = dims.iter().map(|(n, s)| Dimension::new(*n, *s)).collect();
    let shape: Vec<usize> = dims.iter().map(|(_, s)| *s as usize).collect();

    ArrayVariable::resident(name, dimensions, f64_block(&shape, values))
}

/// A grid variable with one ramp coordinate map per dimension. `map_offsets`
/// gives each map's starting value, so members of a concatenation can carry
/// distinct coordinates.
pub fn f64_grid(
    name: &str,
    dims: &[(&str, u32)],
    values: Vec<f64>,
    map_offsets: &[usize],
) -> GridVariable {
    let array = f64_array(name, dims, values);
    let maps = dims
        .iter()
        .zip(map_offsets)
        .map(|((n, s), offset)| f64_array(n, &[(*n, *s)], ramp(*s as usize, *offset)))
        .collect();

    GridVariable::new(array, maps)
}

/// A descriptor whose dimension table is derived from its variables.
pub fn dataset(name: &str, variables: Vec<Variable>) -> DatasetDescriptor {
    let mut descriptor = DatasetDescriptor::new(name);
    for variable in &variables {
        let mut dims: Vec<&Dimension> = variable.data_array().dimensions.iter().collect();
        if let Some(grid) = variable.as_grid() {
            for map in &grid.maps {
                dims.extend(&map.dimensions);
            }
        }
        for dim in dims {
            if descriptor.dimension(&dim.name).is_none() {
                descriptor.dimensions.push(dim.clone());
            }
        }
    }
    descriptor.variables = variables;

    descriptor
}

/// A dataset holding one zero-rank f64 variable.
pub fn scalar_f64_dataset(name: &str, variable: &str, value: f64) -> DatasetDescriptor {
    dataset(
        name,
        vec![Variable::Array(ArrayVariable::resident(
            variable,
            vec![],
            f64_block(&[], vec![value]),
        ))],
    )
}

/// A dataset holding one f64 array variable; values default to a ramp.
pub fn array_f64_dataset(
    name: &str,
    variable: &str,
    dims: &[(&str, u32)],
    values: Option<Vec<f64>>,
) -> DatasetDescriptor {
    let len: usize = dims.iter().map(|(_, s)| *s as usize).product();
    let values = values.unwrap_or_else(|| ramp(len, 0));

    dataset(name, vec![Variable::Array(f64_array(variable, dims, values))])
}
