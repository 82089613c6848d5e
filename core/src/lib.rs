pub mod config;
pub mod error;
pub mod flags;
pub mod helpers;
pub mod ops;
pub mod ret;
pub mod state;

pub use config::CoreConfig;
pub use error::DrcError;
pub use flags::{fill_flags, FlagKind};
pub use ret::BlockReturn;
pub use state::{CpuState, WriteCheckFn, EXCEPTION_NONE, SMC_CURRENT_BLOCK};
