use thiserror::Error;

/// Unrecoverable engine errors.
///
/// Everything a guest program can legitimately trigger is routed to the
/// interpreter or converted into a guest exception; an error here means a
/// broken contract between decoder, backend and cache, or an OS-level
/// failure that leaves the code arena in an unusable state.
#[derive(Debug, Error)]
pub enum DrcError {
    #[error("code arena: {0}")]
    Arena(#[from] std::io::Error),

    #[error("block descriptor pool exhausted")]
    NoFreeBlock,

    #[error("no evictable code page (translating page is the only candidate)")]
    NoEvictablePage,

    #[error("generated block returned unknown code {0:#x}")]
    BadReturnCode(u32),
}
