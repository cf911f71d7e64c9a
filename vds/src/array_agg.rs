use std::{cmp, sync::Arc};

use async_recursion::async_recursion;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    algorithms::{read_member_slice, transfer_constraint, validate_member_variable, SlicePrototype},
    constraint::Hyperslab,
    descriptor::{ArraySource, ArrayVariable, DataBlock, ElementType},
    dimension::Dimension,
    errors::{Error, Result},
    member::MemberDataset,
    transport::{serialize_resident, Transport},
};

/// How to resolve the aggregated variable inside one member's descriptor.
#[derive(Clone, Debug)]
pub enum SliceSource {
    /// A top-level array variable, or the data array of a top-level grid.
    TopLevelArray(String),
    /// One coordinate map vector of a top-level grid.
    GridMap { grid: String, map: String },
}

/// The two composition algorithms over the join dimension.
#[derive(Clone, Debug)]
pub enum JoinStrategy {
    /// A brand-new leading dimension of cardinality = member count; global
    /// index `i` along it owns `members[i]` whole.
    StackOuterDimension,
    /// Members logically concatenated along their existing leading
    /// dimension; `sizes` holds each member's cardinality for it.
    ConcatExistingDimension { sizes: Vec<u32> },
}

/// One member selected by a leading-dimension constraint, in increasing
/// member order. `lead` is the member-local leading-dimension hyperslab;
/// stacked members have no local leading dimension and carry `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TouchedMember {
    pub member: usize,
    pub lead: Option<Hyperslab>,
}

impl JoinStrategy {
    pub fn aggregated_size(&self, member_count: usize) -> usize {
        match self {
            Self::StackOuterDimension => member_count,
            Self::ConcatExistingDimension { sizes } => {
                sizes.iter().map(|s| *s as usize).sum()
            }
        }
    }

    /// Map a global index on the join dimension to (member, local index).
    /// Stacked members are whole, so their local index is always zero.
    pub fn map_index(&self, global: usize, member_count: usize) -> Result<(usize, usize)> {
        match self {
            Self::StackOuterDimension => {
                if global >= member_count {
                    return Err(Error::OutOfRangeIndex {
                        index: global,
                        extent: member_count,
                        detail: String::from("stacked dimension index beyond member count"),
                    });
                }
                Ok((global, 0))
            }
            Self::ConcatExistingDimension { sizes } => {
                let mut head = 0;
                for (member, size) in sizes.iter().enumerate() {
                    let size = *size as usize;
                    if global - head < size {
                        return Ok((member, global - head));
                    }
                    head += size;
                }
                Err(Error::OutOfRangeIndex {
                    index: global,
                    extent: head,
                    detail: String::from("global index beyond the sum of member sizes"),
                })
            }
        }
    }

    /// Walk a leading-dimension constraint, yielding each touched member
    /// exactly once, in increasing index order.
    ///
    /// For concatenation, the local stop is clamped to the member's last
    /// index and the stride to the member's size, matching the constraint
    /// validity rule of a single dataset.
    pub fn walk(&self, lead: &Hyperslab) -> Result<Vec<TouchedMember>> {
        match self {
            Self::StackOuterDimension => Ok(lead
                .iter()
                .map(|member| TouchedMember { member, lead: None })
                .collect()),
            Self::ConcatExistingDimension { sizes } => {
                let mut touched = vec![];
                let mut head = 0;
                let mut member = 0;
                let mut global = lead.start;
                while global <= lead.stop {
                    while member < sizes.len() && global - head >= sizes[member] as usize {
                        head += sizes[member] as usize;
                        member += 1;
                    }
                    if member == sizes.len() {
                        return Err(Error::OutOfRangeIndex {
                            index: global,
                            extent: head,
                            detail: String::from("global index beyond the sum of member sizes"),
                        });
                    }
                    let size = sizes[member] as usize;
                    let local = Hyperslab::new(
                        global - head,
                        cmp::min(lead.stride, size),
                        cmp::min(lead.stop - head, size - 1),
                        size,
                    );
                    touched.push(TouchedMember {
                        member,
                        lead: Some(local),
                    });

                    // Jump past this member's last index on the requested
                    // stride grid
                    let steps_inside = (head + size - 1 - global) / lead.stride;
                    global += (steps_inside + 1) * lead.stride;
                }

                Ok(touched)
            }
        }
    }
}

enum AggState {
    Unread,
    Reading,
    Ready(Arc<DataBlock>),
    Failed(String),
}

/// One aggregated array variable: a join strategy bound to an ordered list
/// of shared member handles.
///
/// State machine: `Unread → Reading → Ready` (via `read`) or
/// `Unread → Failed` (terminal). The pipelined `serialize` path returns to
/// `Unread` on success so no member slice outlives its put.
pub struct ArrayAggregation {
    name: String,
    source: SliceSource,
    strategy: JoinStrategy,
    members: Vec<Arc<MemberDataset>>,
    dimensions: Vec<Dimension>,
    prototype: SlicePrototype,
    state: Mutex<AggState>,
}

impl ArrayAggregation {
    /// Stack members under a brand-new leading dimension.
    /// `prototype_dimensions` is each member's full local shape, taken from
    /// the first member.
    pub fn stack<S: Into<String>>(
        name: S,
        source: SliceSource,
        members: Vec<Arc<MemberDataset>>,
        new_dimension: Dimension,
        prototype_dimensions: Vec<Dimension>,
        element: ElementType,
    ) -> Result<Self> {
        if new_dimension.size as usize != members.len() {
            return Err(Error::OutOfRangeIndex {
                index: new_dimension.size as usize,
                extent: members.len(),
                detail: String::from("stacked dimension cardinality must equal member count"),
            });
        }
        let mut dimensions = vec![new_dimension];
        dimensions.extend(prototype_dimensions.iter().cloned());

        Ok(Self {
            name: name.into(),
            source,
            strategy: JoinStrategy::StackOuterDimension,
            members,
            dimensions,
            prototype: SlicePrototype {
                element,
                dimensions: prototype_dimensions,
                skip_lead: false,
            },
            state: Mutex::new(AggState::Unread),
        })
    }

    /// Concatenate members along their existing leading dimension. `sizes`
    /// holds each member's cardinality for it; `prototype_dimensions` is
    /// the first member's full local shape, whose leading dimension must be
    /// the join dimension.
    pub fn concat<S: Into<String>>(
        name: S,
        source: SliceSource,
        members: Vec<Arc<MemberDataset>>,
        dimension: &str,
        sizes: Vec<u32>,
        prototype_dimensions: Vec<Dimension>,
        element: ElementType,
    ) -> Result<Self> {
        let name = name.into();
        if sizes.len() != members.len() {
            return Err(Error::OutOfRangeIndex {
                index: sizes.len(),
                extent: members.len(),
                detail: String::from("one size per member is required for concatenation"),
            });
        }
        match prototype_dimensions.first() {
            Some(outer) if outer.name == dimension => {}
            _ => {
                return Err(Error::MissingAggregationVariable {
                    variable: name,
                    reason: format!("outer dimension must be {dimension:?}"),
                });
            }
        }
        let total: u32 = sizes.iter().sum();
        let mut dimensions = vec![Dimension::varying(dimension, total)];
        dimensions.extend(prototype_dimensions[1..].iter().cloned());

        Ok(Self {
            name,
            source,
            strategy: JoinStrategy::ConcatExistingDimension { sizes },
            members,
            dimensions,
            prototype: SlicePrototype {
                element,
                dimensions: prototype_dimensions,
                skip_lead: true,
            },
            state: Mutex::new(AggState::Unread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.prototype.element
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.size as usize).collect()
    }

    pub fn strategy(&self) -> &JoinStrategy {
        &self.strategy
    }

    pub fn full_constraint(&self) -> Vec<Hyperslab> {
        self.dimensions
            .iter()
            .map(|d| Hyperslab::full(d.size as usize))
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), AggState::Ready(_))
    }

    /// Stream the selected hyperslab to the transport, one member slice at
    /// a time, in increasing global-index order.
    ///
    /// If the aggregation is already resident this delegates to the default
    /// serialization path. A failure mid-stream is terminal; output already
    /// pipelined is not retracted.
    pub async fn serialize(
        &self,
        constraint: &[Hyperslab],
        transport: &mut dyn Transport,
    ) -> Result<()> {
        self.check_constraint(constraint)?;
        if let Some(block) = self.begin_access()? {
            return serialize_resident(&block, constraint, transport).await;
        }

        let result = self.stream(constraint, transport).await;
        let mut state = self.state.lock();
        *state = match &result {
            Ok(()) => AggState::Unread,
            Err(err) => AggState::Failed(err.to_string()),
        };

        result
    }

    /// Materialize the whole aggregated array into one resident block.
    /// Used when the aggregation itself participates as a member of another
    /// aggregation.
    #[async_recursion]
    pub async fn read(&self) -> Result<Arc<DataBlock>> {
        if let Some(block) = self.begin_access()? {
            return Ok(block);
        }

        match self.read_all().await {
            Ok(block) => {
                let block = Arc::new(block);
                *self.state.lock() = AggState::Ready(Arc::clone(&block));
                Ok(block)
            }
            Err(err) => {
                *self.state.lock() = AggState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Ready state short-circuits; Unread transitions to Reading.
    fn begin_access(&self) -> Result<Option<Arc<DataBlock>>> {
        let mut state = self.state.lock();
        match &*state {
            AggState::Ready(block) => Ok(Some(Arc::clone(block))),
            AggState::Failed(detail) => Err(Error::Failed {
                variable: self.name.clone(),
                detail: detail.clone(),
            }),
            AggState::Reading => Err(Error::Failed {
                variable: self.name.clone(),
                detail: String::from("aggregation is already being read"),
            }),
            AggState::Unread => {
                *state = AggState::Reading;
                Ok(None)
            }
        }
    }

    async fn stream(&self, constraint: &[Hyperslab], transport: &mut dyn Transport) -> Result<()> {
        let touched = self.strategy.walk(&constraint[0])?;

        // Validate every touched member against the prototype up front,
        // from descriptor metadata alone, so a mismatch fails the request
        // before anything reaches the transport.
        for t in &touched {
            validate_member_variable(&self.members[t.member], &self.source, &self.prototype)
                .await?;
        }

        let inner: usize = constraint[1..].iter().map(Hyperslab::len).product();
        let total: usize = touched
            .iter()
            .map(|t| t.lead.as_ref().map_or(1, Hyperslab::len))
            .sum::<usize>()
            * inner;
        debug!(
            variable = %self.name,
            members = touched.len(),
            elements = total,
            "streaming aggregated hyperslab",
        );

        transport.begin_vector(total, self.element_type()).await?;
        for t in &touched {
            let local = self.local_constraint(constraint, t);
            let slice = read_member_slice(
                &self.members[t.member],
                &self.source,
                &local,
                &self.prototype,
            )
            .await?;
            transport.put_slice(&slice).await?;
        }
        transport.end_vector().await
    }

    async fn read_all(&self) -> Result<DataBlock> {
        let constraint = self.full_constraint();
        let touched = self.strategy.walk(&constraint[0])?;
        let mut blocks = Vec::with_capacity(touched.len());
        for t in &touched {
            let local = self.local_constraint(&constraint, t);
            let slice = read_member_slice(
                &self.members[t.member],
                &self.source,
                &local,
                &self.prototype,
            )
            .await?;
            blocks.push(match t.lead {
                None => slice.insert_lead_axis(),
                Some(_) => slice,
            });
        }

        Ok(DataBlock::concat(blocks))
    }

    /// The member-local constraint for one touched member: the transferred
    /// inner dimensions, plus the member's own leading-dimension hyperslab
    /// under concatenation.
    fn local_constraint(&self, global: &[Hyperslab], touched: &TouchedMember) -> Vec<Hyperslab> {
        match &touched.lead {
            None => {
                let mut local: Vec<Hyperslab> = self
                    .prototype
                    .dimensions
                    .iter()
                    .map(|d| Hyperslab::full(d.size as usize))
                    .collect();
                transfer_constraint(&mut local, global, true, false);
                local
            }
            Some(lead) => {
                let mut local = vec![*lead];
                local.extend(
                    self.prototype.dimensions[1..]
                        .iter()
                        .map(|d| Hyperslab::full(d.size as usize)),
                );
                transfer_constraint(&mut local, global, true, true);
                local
            }
        }
    }

    fn check_constraint(&self, constraint: &[Hyperslab]) -> Result<()> {
        if constraint.len() != self.dimensions.len() {
            return Err(Error::BadConstraint {
                detail: format!(
                    "constraint has {} dimensions, aggregated variable {:?} has {}",
                    constraint.len(),
                    self.name,
                    self.dimensions.len()
                ),
            });
        }
        for (slab, dimension) in constraint.iter().zip(&self.dimensions) {
            slab.validate()?;
            if slab.extent != dimension.size as usize {
                return Err(Error::BadConstraint {
                    detail: format!(
                        "constraint extent {} does not match dimension {:?} of size {}",
                        slab.extent, dimension.name, dimension.size
                    ),
                });
            }
        }

        Ok(())
    }
}

impl ArrayVariable {
    /// Read the selected subrange, materializing aggregated content as
    /// needed.
    pub async fn sliced(&self, constraint: &[Hyperslab]) -> Result<DataBlock> {
        match &self.source {
            ArraySource::Resident(block) => block.slice(constraint),
            ArraySource::Aggregated(aggregation) => aggregation.read().await?.slice(constraint),
            ArraySource::Placeholder(_) => Err(Error::MissingAggregationVariable {
                variable: self.name.clone(),
                reason: String::from("placeholder variable has no value"),
            }),
        }
    }

    pub async fn serialize(
        &self,
        constraint: &[Hyperslab],
        transport: &mut dyn Transport,
    ) -> Result<()> {
        match &self.source {
            ArraySource::Resident(block) => {
                serialize_resident(block, constraint, transport).await
            }
            ArraySource::Aggregated(aggregation) => {
                aggregation.serialize(constraint, transport).await
            }
            ArraySource::Placeholder(_) => Err(Error::MissingAggregationVariable {
                variable: self.name.clone(),
                reason: String::from("placeholder variable has no value"),
            }),
        }
    }
}
