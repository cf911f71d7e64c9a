use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    algorithms::{find_coordinate, union_attributes, union_variables, InsertionCursor},
    array_agg::{ArrayAggregation, SliceSource},
    descriptor::{
        ArraySource, ArrayVariable, AttrValue, Attribute, DataBlock, DatasetDescriptor, Variable,
    },
    dimension::{merge_dimensions, ConflictPolicy, Dimension},
    errors::{Error, Result},
    grid_agg::{concat_grid, stack_grid},
    loader::{CatalogScanner, DatasetLoader, DimensionCache},
    member::MemberDataset,
};

/// Which composition a group performs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Merge members' attributes, dimensions and variables, first writer
    /// wins.
    Union,
    /// Stack members under a brand-new outer dimension.
    StackNew { dimension: String },
    /// Concatenate members along an existing outer dimension.
    ConcatExisting { dimension: String },
}

/// One member in an aggregation group description.
#[derive(Clone, Serialize, Deserialize)]
pub struct MemberSpec {
    pub location: String,

    /// Coordinate value for this member on a stacked dimension. Numeric if
    /// every member's value parses as a number, string otherwise.
    #[serde(default)]
    pub coordinate: Option<String>,

    /// Cardinality of this member's join dimension, supplied so it can be
    /// aggregated without opening the member.
    #[serde(default)]
    pub count: Option<u32>,

    /// Prebuilt descriptor for virtual members (nested aggregations).
    #[serde(skip)]
    pub descriptor: Option<Arc<DatasetDescriptor>>,
}

impl MemberSpec {
    pub fn located<S: Into<String>>(location: S) -> Self {
        Self {
            location: location.into(),
            coordinate: None,
            count: None,
            descriptor: None,
        }
    }

    pub fn virtual_member<S: Into<String>>(
        location: S,
        descriptor: Arc<DatasetDescriptor>,
    ) -> Self {
        Self {
            descriptor: Some(descriptor),
            ..Self::located(location)
        }
    }

    pub fn with_coordinate<S: Into<String>>(mut self, coordinate: S) -> Self {
        self.coordinate = Some(coordinate.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// A directory-scan element: every catalog entry under `directory` ending
/// in `suffix` joins the member list, in scanner order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryScan {
    pub directory: String,
    pub suffix: String,
}

/// A parsed aggregation description: one unit of orchestration work.
#[derive(Clone, Serialize, Deserialize)]
pub struct AggregationGroup {
    #[serde(default = "default_group_name")]
    pub name: String,
    pub kind: AggregationKind,
    #[serde(default)]
    pub members: Vec<MemberSpec>,
    #[serde(default)]
    pub scan: Option<DirectoryScan>,

    /// Explicit names of the variables to aggregate. Required for stacking;
    /// concatenation auto-discovers by outer dimension when absent.
    #[serde(default)]
    pub variables: Option<Vec<String>>,

    /// Coordinate-axis-type tag attached to a synthesized coordinate
    /// variable.
    #[serde(default)]
    pub coordinate_axis: Option<String>,

    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

fn default_group_name() -> String {
    String::from("aggregation")
}

impl AggregationGroup {
    pub fn new(kind: AggregationKind) -> Self {
        Self {
            name: default_group_name(),
            kind,
            members: vec![],
            scan: None,
            variables: None,
            coordinate_axis: None,
            on_conflict: ConflictPolicy::default(),
        }
    }
}

/// Builds output dataset models from aggregation group descriptions.
///
/// Members are created once per `aggregate` call and shared across every
/// aggregated variable of the group.
pub struct Aggregator {
    loader: Arc<dyn DatasetLoader>,
    dimension_cache: Option<Arc<dyn DimensionCache>>,
    scanner: Option<Arc<dyn CatalogScanner>>,
}

impl Aggregator {
    pub fn new(loader: Arc<dyn DatasetLoader>) -> Self {
        Self {
            loader,
            dimension_cache: None,
            scanner: None,
        }
    }

    pub fn with_dimension_cache(mut self, cache: Arc<dyn DimensionCache>) -> Self {
        self.dimension_cache = Some(cache);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn CatalogScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub async fn aggregate(&self, group: &AggregationGroup) -> Result<DatasetDescriptor> {
        let specs = self.expand_members(group).await?;
        if specs.is_empty() && !matches!(group.kind, AggregationKind::Union) {
            return Err(Error::OutOfRangeIndex {
                index: 0,
                extent: 0,
                detail: format!("aggregation group {:?} has no member datasets", group.name),
            });
        }
        let members = self.build_members(&specs);
        debug!(
            group = %group.name,
            members = members.len(),
            "aggregating",
        );

        match &group.kind {
            AggregationKind::Union => self.union(group, &members).await,
            AggregationKind::StackNew { dimension } => {
                self.stack_new(group, dimension, &specs, &members).await
            }
            AggregationKind::ConcatExisting { dimension } => {
                self.concat_existing(group, dimension, &specs, &members).await
            }
        }
    }

    /// Explicit members in declared order, then scanner results.
    async fn expand_members(&self, group: &AggregationGroup) -> Result<Vec<MemberSpec>> {
        let mut specs = group.members.clone();
        if let Some(scan) = &group.scan {
            let scanner = self.scanner.as_ref().ok_or_else(|| Error::Load {
                location: scan.directory.clone(),
                reason: String::from("no catalog scanner configured"),
            })?;
            for location in scanner.scan(&scan.directory, &scan.suffix).await? {
                specs.push(MemberSpec::located(location));
            }
        }

        Ok(specs)
    }

    fn build_members(&self, specs: &[MemberSpec]) -> Vec<Arc<MemberDataset>> {
        specs
            .iter()
            .map(|spec| match &spec.descriptor {
                Some(descriptor) => Arc::new(MemberDataset::virtual_member(
                    spec.location.clone(),
                    Arc::clone(descriptor),
                )),
                None => Arc::new(MemberDataset::new(
                    spec.location.clone(),
                    Arc::clone(&self.loader),
                )),
            })
            .collect()
    }

    async fn union(
        &self,
        group: &AggregationGroup,
        members: &[Arc<MemberDataset>],
    ) -> Result<DatasetDescriptor> {
        let mut out = DatasetDescriptor::new(group.name.clone());
        let mut cursor = InsertionCursor::new();
        for member in members {
            let descriptor = member.descriptor().await?;
            merge_dimensions(
                &mut out.dimensions,
                &descriptor.dimensions,
                group.on_conflict,
                None,
            )?;
            union_attributes(&mut out.attributes, &descriptor.attributes);
            union_variables(&mut out.variables, &descriptor.variables, false, &mut cursor);
        }

        Ok(out)
    }

    async fn stack_new(
        &self,
        group: &AggregationGroup,
        dimension: &str,
        specs: &[MemberSpec],
        members: &[Arc<MemberDataset>],
    ) -> Result<DatasetDescriptor> {
        let names = group
            .variables
            .clone()
            .ok_or_else(|| Error::MissingAggregationVariable {
                variable: String::from("*"),
                reason: String::from(
                    "stacking requires an explicit list of variables to aggregate",
                ),
            })?;

        let template = members[0].descriptor().await?;
        let new_dim = Dimension::new(dimension, members.len() as u32);

        let mut out = DatasetDescriptor::new(group.name.clone());
        out.dimensions.push(new_dim.clone());
        merge_dimensions(
            &mut out.dimensions,
            &template.dimensions,
            group.on_conflict,
            Some(dimension),
        )?;
        union_attributes(&mut out.attributes, &template.attributes);

        // Coordinate variable for the new dimension: a template variable
        // with an explicit value is validated and reused; a placeholder
        // donates its metadata to the synthesized coordinate and is
        // discarded.
        let mut coordinate =
            synthesize_coordinate(dimension, &new_dim, specs, group.coordinate_axis.as_deref());
        if let Some(existing) = find_coordinate(&template, dimension) {
            if existing.has_value() {
                validate_explicit_coordinate(existing, &new_dim, &template.name)?;
                coordinate = existing.clone();
            } else {
                union_attributes(&mut coordinate.attributes, &existing.attributes);
            }
        }

        let mut cursor = InsertionCursor::new();
        for name in &names {
            let variable =
                template
                    .variable(name)
                    .ok_or_else(|| Error::MissingAggregationVariable {
                        variable: name.clone(),
                        reason: String::from("not present in the first member dataset"),
                    })?;
            let aggregated = match variable {
                Variable::Array(array) => {
                    let aggregation = ArrayAggregation::stack(
                        name.clone(),
                        SliceSource::TopLevelArray(name.clone()),
                        members.to_vec(),
                        new_dim.clone(),
                        array.dimensions.clone(),
                        array.element_type(),
                    )?;
                    Variable::Array(ArrayVariable {
                        name: name.clone(),
                        dimensions: aggregation.dimensions().to_vec(),
                        attributes: array.attributes.clone(),
                        source: ArraySource::Aggregated(Arc::new(aggregation)),
                    })
                }
                Variable::Grid(grid) => Variable::Grid(stack_grid(
                    grid,
                    members.to_vec(),
                    new_dim.clone(),
                    coordinate.clone(),
                )?),
            };
            out.push_variable(aggregated);
        }

        // The coordinate variable leads the declaration order
        union_variables(
            &mut out.variables,
            &[Variable::Array(coordinate)],
            true,
            &mut cursor,
        );

        // Remaining template variables; a reused or discarded coordinate
        // never re-enters from the template
        let remaining: Vec<Variable> = template
            .variables
            .iter()
            .filter(|v| v.name() != dimension)
            .cloned()
            .collect();
        union_variables(&mut out.variables, &remaining, false, &mut cursor);

        Ok(out)
    }

    async fn concat_existing(
        &self,
        group: &AggregationGroup,
        dimension: &str,
        specs: &[MemberSpec],
        members: &[Arc<MemberDataset>],
    ) -> Result<DatasetDescriptor> {
        let sizes = self.resolve_join_sizes(dimension, specs, members).await?;
        let total: u32 = sizes.iter().sum();
        let join_dim = Dimension::varying(dimension, total);
        debug!(
            dimension = %dimension,
            cardinality = total,
            "concatenating along existing dimension",
        );

        let template = members[0].descriptor().await?;
        let mut out = DatasetDescriptor::new(group.name.clone());
        out.dimensions.push(join_dim);
        merge_dimensions(
            &mut out.dimensions,
            &template.dimensions,
            group.on_conflict,
            Some(dimension),
        )?;
        union_attributes(&mut out.attributes, &template.attributes);

        let names = match &group.variables {
            Some(names) => {
                for name in names {
                    validate_concat_variable(&template, name, dimension)?;
                }
                names.clone()
            }
            None => discover_concat_variables(&template, dimension),
        };

        let mut cursor = InsertionCursor::new();
        for name in &names {
            let variable =
                template
                    .variable(name)
                    .ok_or_else(|| Error::MissingAggregationVariable {
                        variable: name.clone(),
                        reason: String::from("not present in the first member dataset"),
                    })?;
            let aggregated = match variable {
                Variable::Array(array) => {
                    let aggregation = ArrayAggregation::concat(
                        name.clone(),
                        SliceSource::TopLevelArray(name.clone()),
                        members.to_vec(),
                        dimension,
                        sizes.clone(),
                        array.dimensions.clone(),
                        array.element_type(),
                    )?;
                    Variable::Array(ArrayVariable {
                        name: name.clone(),
                        dimensions: aggregation.dimensions().to_vec(),
                        attributes: array.attributes.clone(),
                        source: ArraySource::Aggregated(Arc::new(aggregation)),
                    })
                }
                Variable::Grid(grid) => Variable::Grid(concat_grid(
                    grid,
                    members.to_vec(),
                    dimension,
                    sizes.clone(),
                )?),
            };
            out.push_variable(aggregated);
        }

        // The join dimension's coordinate variable concatenates exactly
        // like a data array and leads the declaration order
        if let Some(existing) = find_coordinate(&template, dimension) {
            if existing.is_coordinate() && existing.has_value() {
                let aggregation = ArrayAggregation::concat(
                    existing.name.clone(),
                    SliceSource::TopLevelArray(existing.name.clone()),
                    members.to_vec(),
                    dimension,
                    sizes.clone(),
                    existing.dimensions.clone(),
                    existing.element_type(),
                )?;
                let coordinate = Variable::Array(ArrayVariable {
                    name: existing.name.clone(),
                    dimensions: aggregation.dimensions().to_vec(),
                    attributes: existing.attributes.clone(),
                    source: ArraySource::Aggregated(Arc::new(aggregation)),
                });
                union_variables(&mut out.variables, &[coordinate], true, &mut cursor);
            }
        }

        let remaining: Vec<Variable> = template
            .variables
            .iter()
            .filter(|v| v.name() != dimension)
            .cloned()
            .collect();
        union_variables(&mut out.variables, &remaining, false, &mut cursor);

        Ok(out)
    }

    /// Each member's local cardinality for the join dimension, via, in
    /// priority order: user-supplied counts (all-or-nothing), the persisted
    /// dimension cache, a full descriptor load.
    async fn resolve_join_sizes(
        &self,
        dimension: &str,
        specs: &[MemberSpec],
        members: &[Arc<MemberDataset>],
    ) -> Result<Vec<u32>> {
        let hinted = specs.iter().filter(|s| s.count.is_some()).count();
        if hinted > 0 && hinted < specs.len() {
            return Err(Error::OutOfRangeIndex {
                index: hinted,
                extent: specs.len(),
                detail: format!(
                    "cardinality hints for dimension {dimension:?} must cover every member or none"
                ),
            });
        }
        if hinted == specs.len() {
            let mut sizes = Vec::with_capacity(specs.len());
            for (spec, member) in specs.iter().zip(members) {
                let size = spec.count.unwrap();
                if !member.is_dimension_cached(dimension) {
                    member.set_dimension_cache(&Dimension::varying(dimension, size), false)?;
                }
                sizes.push(size);
            }
            return Ok(sizes);
        }

        let mut sizes = Vec::with_capacity(members.len());
        for member in members {
            if let Some(size) = member.cached_dimension_size(dimension) {
                sizes.push(size);
                continue;
            }
            if let Some(cache) = &self.dimension_cache {
                if cache.is_cached(member.location()).await {
                    if let Some(dimensions) = cache.load(member.location()).await? {
                        for dim in &dimensions {
                            if !member.is_dimension_cached(&dim.name) {
                                member.set_dimension_cache(dim, false)?;
                            }
                        }
                    }
                }
            }
            if !member.is_dimension_cached(dimension) {
                member.fill_dimension_cache_from_descriptor().await?;
                if let Some(cache) = &self.dimension_cache {
                    let descriptor = member.descriptor().await?;
                    cache.save(member.location(), &descriptor.dimensions).await?;
                }
            }
            match member.cached_dimension_size(dimension) {
                Some(size) => sizes.push(size),
                None => {
                    return Err(Error::MissingDimension {
                        name: dimension.to_string(),
                        location: member.location().to_string(),
                    });
                }
            }
        }

        Ok(sizes)
    }
}

/// Coordinate values for a stacked dimension: per-member coordinate hints
/// when every member carries one (numeric if they all parse), otherwise
/// member locations, with generated names standing in for virtual members.
fn synthesize_coordinate(
    dimension: &str,
    new_dim: &Dimension,
    specs: &[MemberSpec],
    coordinate_axis: Option<&str>,
) -> ArrayVariable {
    let hints: Vec<&String> = specs.iter().filter_map(|s| s.coordinate.as_ref()).collect();
    let block = if hints.len() == specs.len() && !specs.is_empty() {
        let numeric: Option<Vec<f64>> = hints
            .iter()
            .map(|hint| hint.trim().parse::<f64>().ok())
            .collect();
        match numeric {
            Some(values) => {
                DataBlock::F64(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values).unwrap())
            }
            None => DataBlock::Str(hints.into_iter().cloned().collect()),
        }
    } else {
        DataBlock::Str(
            specs
                .iter()
                .enumerate()
                .map(|(index, spec)| {
                    if spec.location.is_empty() {
                        format!("member{index}")
                    } else {
                        spec.location.clone()
                    }
                })
                .collect(),
        )
    };

    let mut attributes = vec![];
    if let Some(axis) = coordinate_axis {
        attributes.push(Attribute::new(
            "_CoordinateAxisType",
            AttrValue::Str(axis.to_string()),
        ));
    }

    ArrayVariable {
        name: dimension.to_string(),
        dimensions: vec![new_dim.clone()],
        attributes,
        source: ArraySource::Resident(block),
    }
}

fn validate_explicit_coordinate(
    existing: &ArrayVariable,
    new_dim: &Dimension,
    template_name: &str,
) -> Result<()> {
    if !existing.is_coordinate() || existing.dimensions[0].size != new_dim.size {
        return Err(Error::ShapeMismatch {
            variable: existing.name.clone(),
            location: template_name.to_string(),
            detail: format!(
                "coordinate variable must be one dimensional with length {}",
                new_dim.size
            ),
        });
    }

    Ok(())
}

fn validate_concat_variable(
    template: &DatasetDescriptor,
    name: &str,
    dimension: &str,
) -> Result<()> {
    let variable = template
        .variable(name)
        .ok_or_else(|| Error::MissingAggregationVariable {
            variable: name.to_string(),
            reason: String::from("not present in the first member dataset"),
        })?;
    if !variable.data_array().has_value() {
        return Err(Error::MissingAggregationVariable {
            variable: name.to_string(),
            reason: String::from("not an array-compatible variable"),
        });
    }
    match variable.outer_dimension() {
        Some(outer) if outer.name == dimension => Ok(()),
        _ => Err(Error::MissingAggregationVariable {
            variable: name.to_string(),
            reason: format!("outer dimension must be {dimension:?}"),
        }),
    }
}

/// Every top-level array or grid whose outer dimension is the join
/// dimension. The join coordinate variable itself is handled separately.
fn discover_concat_variables(template: &DatasetDescriptor, dimension: &str) -> Vec<String> {
    template
        .variables
        .iter()
        .filter(|v| match v {
            Variable::Array(array) => !array.is_coordinate(),
            Variable::Grid(_) => true,
        })
        .filter(|v| v.outer_dimension().map_or(false, |d| d.name == dimension))
        .filter(|v| v.data_array().has_value())
        .map(|v| v.name().to_string())
        .collect()
}
