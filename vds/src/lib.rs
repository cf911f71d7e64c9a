mod algorithms;
mod array_agg;
mod constraint;
mod descriptor;
mod dimension;
mod errors;
mod grid_agg;
mod loader;
mod member;
mod orchestrator;
pub mod testing;
mod transport;

pub use algorithms::find_coordinate;
pub use algorithms::read_member_slice;
pub use algorithms::shapes_match;
pub use algorithms::transfer_constraint;
pub use algorithms::types_match;
pub use algorithms::union_attributes;
pub use algorithms::union_variables;
pub use algorithms::validate_member_variable;
pub use algorithms::InsertionCursor;
pub use algorithms::SlicePrototype;
pub use array_agg::ArrayAggregation;
pub use array_agg::JoinStrategy;
pub use array_agg::SliceSource;
pub use array_agg::TouchedMember;
pub use constraint::Hyperslab;
pub use descriptor::ArraySource;
pub use descriptor::ArrayVariable;
pub use descriptor::AttrValue;
pub use descriptor::Attribute;
pub use descriptor::DataBlock;
pub use descriptor::DatasetDescriptor;
pub use descriptor::ElementType;
pub use descriptor::GridVariable;
pub use descriptor::Variable;
pub use dimension::merge_dimensions;
pub use dimension::ConflictPolicy;
pub use dimension::Dimension;
pub use errors::Error;
pub use errors::Result;
pub use grid_agg::concat_grid;
pub use grid_agg::stack_grid;
pub use loader::CatalogScanner;
pub use loader::DatasetLoader;
pub use loader::DimensionCache;
pub use member::MemberDataset;
pub use orchestrator::AggregationGroup;
pub use orchestrator::AggregationKind;
pub use orchestrator::Aggregator;
pub use orchestrator::DirectoryScan;
pub use orchestrator::MemberSpec;
pub use transport::Transport;
