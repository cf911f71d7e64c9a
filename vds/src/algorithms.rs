use tracing::debug;

use crate::{
    array_agg::SliceSource,
    constraint::Hyperslab,
    descriptor::{ArrayVariable, Attribute, DataBlock, DatasetDescriptor, ElementType, Variable},
    dimension::Dimension,
    errors::{Error, Result},
    member::MemberDataset,
};

/// Tracks where the next top-inserted variable lands, so synthesized
/// coordinate variables end up in declaration order instead of appended.
///
/// A fresh cursor is created at the start of every aggregation pass; it is
/// never shared across passes.
#[derive(Debug, Default)]
pub struct InsertionCursor {
    position: usize,
}

impl InsertionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, into: &mut Vec<Variable>, variable: Variable) {
        into.insert(self.position, variable);
        self.position += 1;
    }
}

/// Merge `from` into `into` by attribute name. The first writer wins;
/// containers are deep-copied.
pub fn union_attributes(into: &mut Vec<Attribute>, from: &[Attribute]) {
    for attribute in from {
        if into.iter().any(|a| a.name == attribute.name) {
            continue;
        }
        into.push(attribute.clone());
    }
}

/// Add each variable from `from` whose name is not already present.
/// `at_top` inserts at the cursor position; otherwise variables are
/// appended.
pub fn union_variables(
    into: &mut Vec<Variable>,
    from: &[Variable],
    at_top: bool,
    cursor: &mut InsertionCursor,
) {
    for variable in from {
        if into.iter().any(|v| v.name() == variable.name()) {
            continue;
        }
        if at_top {
            cursor.insert(into, variable.clone());
        } else {
            into.push(variable.clone());
        }
    }
}

pub fn types_match(a: &ArrayVariable, b: &ArrayVariable) -> bool {
    a.element_type() == b.element_type()
}

pub fn shapes_match(a: &[Dimension], b: &[Dimension], check_names: bool) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.size == y.size && (!check_names || x.name == y.name))
}

/// Copy start/stride/stop per dimension, in iteration order, optionally
/// skipping the first dimension on either side. Extents are left alone;
/// they belong to the receiving side's index space.
pub fn transfer_constraint(
    into: &mut [Hyperslab],
    from: &[Hyperslab],
    skip_first_from: bool,
    skip_first_to: bool,
) {
    let from = if skip_first_from && !from.is_empty() {
        &from[1..]
    } else {
        from
    };
    let into = if skip_first_to && !into.is_empty() {
        &mut into[1..]
    } else {
        into
    };
    for (dst, src) in into.iter_mut().zip(from) {
        dst.start = src.start;
        dst.stride = src.stride;
        dst.stop = src.stop;
    }
}

/// The shape every member's instance of an aggregated variable must be
/// interchangeable with. `skip_lead` relaxes the leading dimension, whose
/// cardinality varies per member under concatenation.
pub struct SlicePrototype {
    pub element: ElementType,
    pub dimensions: Vec<Dimension>,
    pub skip_lead: bool,
}

/// Check one member's instance of the aggregated variable against the
/// prototype, from descriptor metadata alone; no data is read. The first
/// call on an unloaded member loads its descriptor, which stays cached for
/// the subsequent read.
pub async fn validate_member_variable(
    member: &MemberDataset,
    source: &SliceSource,
    prototype: &SlicePrototype,
) -> Result<()> {
    let descriptor = member.descriptor().await?;
    let variable = resolve_source(&descriptor, source, member.location())?;

    if variable.element_type() != prototype.element {
        return Err(Error::TypeMismatch {
            variable: variable.name.clone(),
            location: member.location().to_string(),
            expected: prototype.element,
            found: variable.element_type(),
        });
    }
    if variable.rank() != prototype.dimensions.len() {
        return Err(Error::ShapeMismatch {
            variable: variable.name.clone(),
            location: member.location().to_string(),
            detail: format!(
                "rank {} does not match prototype rank {}",
                variable.rank(),
                prototype.dimensions.len()
            ),
        });
    }
    let (expected_dims, member_dims) = if prototype.skip_lead {
        (&prototype.dimensions[1..], &variable.dimensions[1..])
    } else {
        (&prototype.dimensions[..], &variable.dimensions[..])
    };
    if !shapes_match(expected_dims, member_dims, true) {
        return Err(Error::ShapeMismatch {
            variable: variable.name.clone(),
            location: member.location().to_string(),
            detail: format!(
                "shape {:?} does not match prototype shape {:?}",
                variable.shape(),
                prototype
                    .dimensions
                    .iter()
                    .map(|d| d.size as usize)
                    .collect::<Vec<usize>>(),
            ),
        });
    }

    Ok(())
}

/// Resolve a variable in one member, apply a local constraint, and read the
/// selected slice, validating type and shape against the prototype. The
/// member's other state is left untouched.
pub async fn read_member_slice(
    member: &MemberDataset,
    source: &SliceSource,
    local: &[Hyperslab],
    prototype: &SlicePrototype,
) -> Result<DataBlock> {
    validate_member_variable(member, source, prototype).await?;
    let descriptor = member.descriptor().await?;
    let variable = resolve_source(&descriptor, source, member.location())?;

    debug!(
        member = %member.location(),
        variable = %variable.name,
        "reading member slice",
    );
    let block = variable.sliced(local).await?;

    let expected: usize = local.iter().map(Hyperslab::len).product();
    if block.len() != expected {
        return Err(Error::ShapeMismatch {
            variable: variable.name.clone(),
            location: member.location().to_string(),
            detail: format!("read returned {} elements, expected {expected}", block.len()),
        });
    }

    Ok(block)
}

fn resolve_source<'a>(
    descriptor: &'a DatasetDescriptor,
    source: &SliceSource,
    location: &str,
) -> Result<&'a ArrayVariable> {
    match source {
        SliceSource::TopLevelArray(name) => {
            let variable = descriptor.variable(name).ok_or_else(|| {
                Error::MissingAggregationVariable {
                    variable: name.clone(),
                    reason: format!("not present in member {location:?}"),
                }
            })?;
            Ok(variable.data_array())
        }
        SliceSource::GridMap { grid, map } => {
            let variable = descriptor.variable(grid).ok_or_else(|| {
                Error::MissingAggregationVariable {
                    variable: grid.clone(),
                    reason: format!("not present in member {location:?}"),
                }
            })?;
            let grid_variable =
                variable
                    .as_grid()
                    .ok_or_else(|| Error::MissingAggregationVariable {
                        variable: grid.clone(),
                        reason: format!("not a grid in member {location:?}"),
                    })?;
            grid_variable
                .map(map)
                .ok_or_else(|| Error::MissingAggregationVariable {
                    variable: map.clone(),
                    reason: format!("grid {grid:?} has no map {map:?} in member {location:?}"),
                })
        }
    }
}

/// Probe for a template variable named after a dimension. Absence is an
/// ordinary outcome, not an error.
pub fn find_coordinate<'a>(descriptor: &'a DatasetDescriptor, dimension: &str) -> Option<&'a ArrayVariable> {
    descriptor.variable(dimension).and_then(Variable::as_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AttrValue;
    use crate::testing;

    #[test]
    fn test_union_attributes_first_writer_wins() {
        let mut into = vec![Attribute::new("title", AttrValue::Str(String::from("first")))];
        union_attributes(
            &mut into,
            &[
                Attribute::new("title", AttrValue::Str(String::from("second"))),
                Attribute::new("units", AttrValue::Str(String::from("K"))),
            ],
        );

        assert_eq!(into.len(), 2);
        assert_eq!(into[0].value, AttrValue::Str(String::from("first")));
        assert_eq!(into[1].name, "units");
    }

    #[test]
    fn test_union_variables_skips_present_names() {
        let a = testing::f64_array("temp", &[("time", 3)], vec![1.0, 2.0, 3.0]);
        let b = testing::f64_array("temp", &[("time", 3)], vec![9.0, 9.0, 9.0]);
        let c = testing::f64_array("salt", &[("time", 3)], vec![4.0, 5.0, 6.0]);

        let mut cursor = InsertionCursor::new();
        let mut into = vec![Variable::Array(a)];
        union_variables(
            &mut into,
            &[Variable::Array(b), Variable::Array(c)],
            false,
            &mut cursor,
        );

        assert_eq!(into.len(), 2);
        assert_eq!(into[1].name(), "salt");
    }

    #[test]
    fn test_union_variables_at_top_preserves_declaration_order() {
        let data = testing::f64_array("temp", &[("time", 3)], vec![1.0, 2.0, 3.0]);
        let time = testing::f64_array("time", &[("time", 3)], vec![0.0, 1.0, 2.0]);
        let lat = testing::f64_array("lat", &[("lat", 3)], vec![0.0, 1.0, 2.0]);

        let mut cursor = InsertionCursor::new();
        let mut into = vec![Variable::Array(data)];
        union_variables(&mut into, &[Variable::Array(time)], true, &mut cursor);
        union_variables(&mut into, &[Variable::Array(lat)], true, &mut cursor);

        let names: Vec<&str> = into.iter().map(Variable::name).collect();
        assert_eq!(names, vec!["time", "lat", "temp"]);
    }

    #[test]
    fn test_types_match() {
        let a = testing::f64_array("temp", &[("time", 3)], vec![1.0, 2.0, 3.0]);
        let b = testing::f64_array("salt", &[("time", 3)], vec![4.0, 5.0, 6.0]);
        let c = ArrayVariable::placeholder(
            "count",
            vec![Dimension::new("time", 3)],
            crate::descriptor::ElementType::I32,
        );

        assert!(types_match(&a, &b));
        assert!(!types_match(&a, &c));
    }

    #[test]
    fn test_shapes_match() {
        let a = vec![Dimension::new("time", 5), Dimension::new("lat", 3)];
        let b = vec![Dimension::new("time", 5), Dimension::new("lat", 3)];
        let c = vec![Dimension::new("time", 5), Dimension::new("lon", 3)];
        let d = vec![Dimension::new("time", 5), Dimension::new("lat", 4)];

        assert!(shapes_match(&a, &b, true));
        assert!(shapes_match(&a, &c, false));
        assert!(!shapes_match(&a, &c, true));
        assert!(!shapes_match(&a, &d, false));
        assert!(!shapes_match(&a, &b[1..], false));
    }

    #[test]
    fn test_transfer_constraint_skip_from() {
        let global = vec![
            Hyperslab::new(0, 1, 2, 3),
            Hyperslab::new(4, 2, 8, 10),
            Hyperslab::new(1, 1, 5, 6),
        ];
        let mut local = vec![Hyperslab::full(10), Hyperslab::full(6)];
        transfer_constraint(&mut local, &global, true, false);

        assert_eq!(local[0], Hyperslab::new(4, 2, 8, 10));
        assert_eq!(local[1], Hyperslab::new(1, 1, 5, 6));
    }

    #[test]
    fn test_transfer_constraint_round_trip() {
        let global = vec![
            Hyperslab::new(0, 1, 2, 3),
            Hyperslab::new(4, 2, 8, 10),
            Hyperslab::new(1, 1, 5, 6),
        ];
        let mut local = vec![Hyperslab::full(10), Hyperslab::full(6)];
        transfer_constraint(&mut local, &global, true, false);

        let mut back = vec![Hyperslab::new(0, 1, 2, 3), Hyperslab::full(10), Hyperslab::full(6)];
        transfer_constraint(&mut back, &local, false, true);

        assert_eq!(back, global);
    }

    #[test]
    fn test_transfer_constraint_skip_both() {
        let from = vec![Hyperslab::new(0, 1, 4, 5), Hyperslab::new(1, 2, 3, 4)];
        let mut into = vec![Hyperslab::full(2), Hyperslab::full(4)];
        transfer_constraint(&mut into, &from, true, true);

        assert_eq!(into[0], Hyperslab::full(2));
        assert_eq!(into[1], Hyperslab::new(1, 2, 3, 4));
    }
}
