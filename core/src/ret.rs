/// Typed return codes produced by executing a translated block.
///
/// Every generated block ends by placing one of these values in the
/// return register and running the epilogue; the run loop dispatches on
/// them. Any other value coming back is a decoder/backend contract
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockReturn {
    /// Block ran to completion, continue at the new CS:EIP.
    Normal = 0,
    /// Cycle budget exhausted, give control back to the scheduler.
    Cycles = 1,
    /// Fall-through successor unknown, link slot 0 wants resolving.
    Link1 = 2,
    /// Branch-taken successor unknown, link slot 1 wants resolving.
    Link2 = 3,
    /// Instruction the translator does not model; the interpreter must
    /// execute exactly one instruction at the current EIP.
    Opcode = 4,
    /// Debug variant of `Opcode` carrying full decode state.
    OpcodeFull = 5,
    /// An IRET executed; the trap flag may have been restored.
    Iret = 6,
    /// A callback trap; the identifier is in the CPU state block.
    CallBack = 7,
    /// The running block modified its own code bytes.
    SMCBlock = 8,
}

impl BlockReturn {
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Normal,
            1 => Self::Cycles,
            2 => Self::Link1,
            3 => Self::Link2,
            4 => Self::Opcode,
            5 => Self::OpcodeFull,
            6 => Self::Iret,
            7 => Self::CallBack,
            8 => Self::SMCBlock,
            _ => return None,
        })
    }
}
