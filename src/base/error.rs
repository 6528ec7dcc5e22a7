/// Errors surfaced by the read admission semaphore.
///
/// All variants are cheap to clone: a single failure may have to complete a
/// shared memory future, which hands a copy of the error to every caller
/// waiting on it.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum WeirError {
    #[display("semaphore {_0} timed out")]
    SemaphoreTimedOut(#[error(not(source))] String),

    #[display("{_0}: {_1} queue overload")]
    QueueOverloaded(#[error(not(source))] String, #[error(not(source))] &'static str),

    #[display("{_0} was stopped")]
    SemaphoreStopped(#[error(not(source))] String),

    #[display("broken semaphore")]
    BrokenSemaphore,

    #[display("{_0}: kill limit reached, failing read to reclaim memory")]
    OutOfMemory(#[error(not(source))] String),
}

pub type WeirResult<T> = Result<T, WeirError>;
