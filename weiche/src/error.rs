use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The caller handed `store` a value that is neither an executable,
    /// an alias record, nor absent.
    #[error("method slot value is not an executable, an alias, or absent")]
    NotExecutable,

    /// Mapping the foreign call stack failed.
    #[error("failed to map {size} bytes of foreign stack memory")]
    StackAllocation { size: usize },
}
