use crate::domain::{AccessionId, BatchStrategy, WorkUnit};
use crate::error::AlignError;

pub fn validate_strategy(strategy: BatchStrategy) -> Result<(), AlignError> {
    match strategy {
        BatchStrategy::Batch(0) => Err(AlignError::InvalidBatchSize(0)),
        _ => Ok(()),
    }
}

pub fn strategy_from_size(size: Option<i64>) -> Result<BatchStrategy, AlignError> {
    match size {
        None => Ok(BatchStrategy::Single),
        Some(size) if size < 1 => Err(AlignError::InvalidBatchSize(size)),
        Some(size) => Ok(BatchStrategy::Batch(size as usize)),
    }
}

pub fn partition(
    accessions: &[AccessionId],
    strategy: BatchStrategy,
) -> Result<Vec<WorkUnit>, AlignError> {
    validate_strategy(strategy)?;
    let size = match strategy {
        BatchStrategy::Single => 1,
        BatchStrategy::Batch(size) => size,
    };
    Ok(accessions
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| WorkUnit::new(index + 1, chunk.to_vec()))
        .collect())
}
