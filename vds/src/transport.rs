use async_trait::async_trait;

use crate::{
    constraint::Hyperslab,
    descriptor::{DataBlock, ElementType},
    errors::Result,
};

/// Pipelined vector-write protocol to the output side of a request.
///
/// One `begin_vector` announces the total element count, any number of
/// `put_slice` calls stream contiguous runs of elements in order, and one
/// `end_vector` closes the vector. Implementations frame and encode; this
/// crate never buffers more than one slice between calls.
#[async_trait]
pub trait Transport: Send {
    async fn begin_vector(&mut self, total_elements: usize, element: ElementType) -> Result<()>;

    async fn put_slice(&mut self, slice: &DataBlock) -> Result<()>;

    async fn end_vector(&mut self) -> Result<()>;
}

/// Default serialization path for data that is already resident: slice,
/// then emit as a single put.
pub(crate) async fn serialize_resident(
    block: &DataBlock,
    constraint: &[Hyperslab],
    transport: &mut dyn Transport,
) -> Result<()> {
    let sliced = block.slice(constraint)?;
    transport
        .begin_vector(sliced.len(), sliced.element_type())
        .await?;
    transport.put_slice(&sliced).await?;
    transport.end_vector().await
}
