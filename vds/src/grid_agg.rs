use std::sync::Arc;

use crate::{
    array_agg::{ArrayAggregation, SliceSource},
    constraint::Hyperslab,
    descriptor::{ArraySource, ArrayVariable, GridVariable},
    dimension::Dimension,
    errors::{Error, Result},
    member::MemberDataset,
    transport::Transport,
};

/// Build the stacked form of a grid: the data array gains a new leading
/// dimension, and the supplied coordinate variable (synthesized by the
/// orchestrator, since members carry no values for a brand-new dimension)
/// becomes its map. The template's own maps are reused for the remaining
/// dimensions.
pub fn stack_grid(
    template: &GridVariable,
    members: Vec<Arc<MemberDataset>>,
    new_dimension: Dimension,
    coordinate: ArrayVariable,
) -> Result<GridVariable> {
    let proto = &template.array;
    let aggregation = ArrayAggregation::stack(
        proto.name.clone(),
        SliceSource::TopLevelArray(proto.name.clone()),
        members,
        new_dimension,
        proto.dimensions.clone(),
        proto.element_type(),
    )?;
    let array = ArrayVariable {
        name: proto.name.clone(),
        dimensions: aggregation.dimensions().to_vec(),
        attributes: proto.attributes.clone(),
        source: ArraySource::Aggregated(Arc::new(aggregation)),
    };

    let mut maps = vec![coordinate];
    maps.extend(template.maps.iter().cloned());

    Ok(GridVariable::new(array, maps))
}

/// Build the concatenated form of a grid. The join dimension's map is
/// itself a concatenation over each member's map vector, so its cardinality
/// and read semantics exactly mirror the data array's. The template's
/// remaining maps are read once and reused verbatim.
pub fn concat_grid(
    template: &GridVariable,
    members: Vec<Arc<MemberDataset>>,
    dimension: &str,
    sizes: Vec<u32>,
) -> Result<GridVariable> {
    let proto = &template.array;
    let data = ArrayAggregation::concat(
        proto.name.clone(),
        SliceSource::TopLevelArray(proto.name.clone()),
        members.clone(),
        dimension,
        sizes.clone(),
        proto.dimensions.clone(),
        proto.element_type(),
    )?;
    let array = ArrayVariable {
        name: proto.name.clone(),
        dimensions: data.dimensions().to_vec(),
        attributes: proto.attributes.clone(),
        source: ArraySource::Aggregated(Arc::new(data)),
    };

    let proto_map = template
        .map(dimension)
        .ok_or_else(|| Error::MissingAggregationVariable {
            variable: template.name().to_string(),
            reason: format!("grid has no coordinate map for dimension {dimension:?}"),
        })?;
    let map_aggregation = ArrayAggregation::concat(
        proto_map.name.clone(),
        SliceSource::GridMap {
            grid: proto.name.clone(),
            map: proto_map.name.clone(),
        },
        members,
        dimension,
        sizes,
        proto_map.dimensions.clone(),
        proto_map.element_type(),
    )?;
    let join_map = ArrayVariable {
        name: proto_map.name.clone(),
        dimensions: map_aggregation.dimensions().to_vec(),
        attributes: proto_map.attributes.clone(),
        source: ArraySource::Aggregated(Arc::new(map_aggregation)),
    };

    let mut maps = vec![join_map];
    maps.extend(
        template
            .maps
            .iter()
            .filter(|m| m.dimensions[0].name != dimension)
            .cloned(),
    );

    Ok(GridVariable::new(array, maps))
}

impl GridVariable {
    /// Stream the data array under the constraint, then each coordinate map
    /// under its dimension's share of it.
    pub async fn serialize(
        &self,
        constraint: &[Hyperslab],
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if constraint.len() != self.array.rank() {
            return Err(Error::BadConstraint {
                detail: format!(
                    "constraint has {} dimensions, grid {:?} has {}",
                    constraint.len(),
                    self.array.name,
                    self.array.rank()
                ),
            });
        }
        self.array.serialize(constraint, transport).await?;
        for map in &self.maps {
            let position = self
                .array
                .dimensions
                .iter()
                .position(|d| d.name == map.dimensions[0].name)
                .ok_or_else(|| Error::BadConstraint {
                    detail: format!(
                        "map {:?} names no dimension of grid {:?}",
                        map.name, self.array.name
                    ),
                })?;
            map.serialize(&[constraint[position]], transport).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{DataBlock, Variable},
        loader::DatasetLoader,
        testing::{self, MemoryLoader, RecordingTransport},
    };

    fn grid_member(location: &str, time: u32, offset: usize) -> crate::descriptor::DatasetDescriptor {
        let len = (time * 2) as usize;
        testing::dataset(
            location,
            vec![Variable::Grid(testing::f64_grid(
                "temp",
                &[("time", time), ("lat", 2)],
                testing::ramp(len, offset * 10),
                &[offset, 0],
            ))],
        )
    }

    fn members(loader: &MemoryLoader) -> Vec<Arc<MemberDataset>> {
        loader.insert("a.nc", grid_member("a.nc", 2, 0));
        loader.insert("b.nc", grid_member("b.nc", 3, 100));
        let loader: Arc<dyn DatasetLoader> = Arc::new(loader.clone());
        vec![
            Arc::new(MemberDataset::new("a.nc", Arc::clone(&loader))),
            Arc::new(MemberDataset::new("b.nc", loader)),
        ]
    }

    fn template() -> GridVariable {
        testing::f64_grid("temp", &[("time", 2), ("lat", 2)], testing::ramp(4, 0), &[0, 0])
    }

    #[tokio::test]
    async fn test_concat_grid_join_map_mirrors_data_array() -> Result<()> {
        let loader = MemoryLoader::new();
        let grid = concat_grid(&template(), members(&loader), "time", vec![2, 3])?;

        assert_eq!(grid.array.shape(), vec![5, 2]);
        let time = grid.map("time").unwrap();
        assert_eq!(time.shape(), vec![5]);

        // Member maps concatenate exactly like the data array
        let values = time.sliced(&[Hyperslab::full(5)]).await?;
        assert_eq!(
            values,
            testing::f64_block(&[5], vec![0.0, 1.0, 100.0, 101.0, 102.0]),
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_concat_grid_keeps_template_inner_maps() -> Result<()> {
        let loader = MemoryLoader::new();
        let grid = concat_grid(&template(), members(&loader), "time", vec![2, 3])?;

        let lat = grid.map("lat").unwrap();
        assert!(matches!(lat.source, ArraySource::Resident(_)));
        assert_eq!(
            lat.sliced(&[Hyperslab::full(2)]).await?,
            testing::f64_block(&[2], vec![0.0, 1.0]),
        );
        // Reading the inner map touches no member
        assert_eq!(loader.load_count("a.nc"), 0);
        assert_eq!(loader.load_count("b.nc"), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_concat_grid_serialize_streams_array_then_maps() -> Result<()> {
        let loader = MemoryLoader::new();
        let grid = concat_grid(&template(), members(&loader), "time", vec![2, 3])?;

        let mut transport = RecordingTransport::new();
        let constraint = vec![Hyperslab::new(1, 1, 3, 5), Hyperslab::full(2)];
        grid.serialize(&constraint, &mut transport).await?;

        // One vector for the array, one per map
        assert_eq!(transport.begun.len(), 3);
        assert_eq!(transport.begun[0].0, 6);
        assert_eq!(transport.begun[1].0, 3);
        assert_eq!(transport.begun[2].0, 2);
        assert_eq!(transport.ends, 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_concat_grid_requires_join_map() {
        let template = GridVariable::new(
            testing::f64_array("temp", &[("time", 2), ("lat", 2)], testing::ramp(4, 0)),
            vec![testing::f64_array("lat", &[("lat", 2)], testing::ramp(2, 0))],
        );
        let loader = MemoryLoader::new();
        let result = concat_grid(&template, members(&loader), "time", vec![2, 3]);

        assert!(matches!(
            result,
            Err(Error::MissingAggregationVariable { .. })
        ));
    }

    #[tokio::test]
    async fn test_stack_grid_prepends_coordinate_map() -> Result<()> {
        let loader = MemoryLoader::new();
        loader.insert(
            "a.nc",
            testing::dataset(
                "a.nc",
                vec![Variable::Grid(testing::f64_grid(
                    "temp",
                    &[("lat", 2)],
                    vec![1.0, 2.0],
                    &[0],
                ))],
            ),
        );
        loader.insert(
            "b.nc",
            testing::dataset(
                "b.nc",
                vec![Variable::Grid(testing::f64_grid(
                    "temp",
                    &[("lat", 2)],
                    vec![3.0, 4.0],
                    &[0],
                ))],
            ),
        );
        let shared: Arc<dyn DatasetLoader> = Arc::new(loader.clone());
        let members = vec![
            Arc::new(MemberDataset::new("a.nc", Arc::clone(&shared))),
            Arc::new(MemberDataset::new("b.nc", shared)),
        ];
        let template = testing::f64_grid("temp", &[("lat", 2)], vec![1.0, 2.0], &[0]);
        let coordinate = ArrayVariable::resident(
            "run",
            vec![Dimension::new("run", 2)],
            DataBlock::Str(vec![String::from("a.nc"), String::from("b.nc")]),
        );

        let grid = stack_grid(&template, members, Dimension::new("run", 2), coordinate)?;

        assert_eq!(grid.array.shape(), vec![2, 2]);
        assert_eq!(grid.maps[0].name, "run");
        assert_eq!(grid.maps[1].name, "lat");
        assert_eq!(
            grid.array.sliced(&grid.array.full_constraint()).await?,
            testing::f64_block(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        );

        Ok(())
    }
}
