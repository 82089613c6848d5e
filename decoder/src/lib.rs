//! Guest x86 to host code translator.
//!
//! `create_block` decodes straight-line guest code starting at the
//! current instruction pointer and emits an equivalent host code block
//! into the cache: register traffic as direct loads and stores against
//! the CPU state, arithmetic as calls into the operator library (with
//! dead flag computation rewritten away afterwards), and memory access
//! through the checked helpers. A block ends at any control transfer,
//! at the instruction budget, or at anything the dispatch table does
//! not cover, which is simply deferred to the interpreter.

use tracing::trace;

use drc_backend::{CodeGen, Reg};
use drc_cache::{BlockCache, BlockHandle};
use drc_core::{CpuState, DrcError};

mod ctx;
mod emit;
mod flagopt;
mod insn;
mod modrm;

use ctx::{Prefix, SaveKind, SaveRec, Step, Stop, TransContext};
use flagopt::FlagOpt;

/// Translate the block starting at the current instruction pointer.
///
/// The block is registered on its code page before translation begins,
/// so a fault partway through still leaves a well-formed (shorter)
/// block behind. Fatal cache exhaustion is reported after the arena is
/// sealed again; the caller is expected to reset the cache and retry.
pub fn create_block(
    env: &mut CpuState,
    cache: &mut BlockCache,
    gen: &mut dyn CodeGen,
) -> Result<BlockHandle, DrcError> {
    let start = env.ip_point();
    let page_size = cache.config().page_size as usize;
    let hot = cache.config().smc_hot_threshold;
    let mut left = cache.config().max_block_insns;
    let start_off = (start & cache.config().page_mask()) as u16;

    let page = cache.acquire_page(start >> cache.config().page_shift(), None)?;
    let block = cache.open_block()?;
    cache.add_to_page(block, page, start_off);

    let mut ctx = TransContext {
        env,
        cache,
        gen,
        block,
        active_block: block,
        page,
        page_index: start_off as usize,
        code: start,
        code_start: start,
        op_start: start,
        cycles: 0,
        prefix: Prefix::empty(),
        seg_prefix: None,
        saves: Vec::new(),
        flagopt: FlagOpt::default(),
    };

    // Entry check: bail out before running anything when the cycle
    // budget is already spent.
    let cyc = ctx.env.addr_of_cycles();
    let patch = {
        let (g, a) = ctx.ga();
        g.mov_word_to_reg(a, Reg::RetOp, cyc, true);
        g.branch_long_leqzero(a, Reg::RetOp)
    };
    ctx.saves.push(SaveRec {
        patch,
        kind: SaveKind::CycleCheck,
    });

    let fatal = loop {
        ctx.prefix = Prefix::empty();
        ctx.seg_prefix = None;
        ctx.op_start = ctx.code;

        // A hot byte here means this instruction is being rewritten at
        // run time; leave it to the interpreter instead of thrashing.
        if ctx.page_index < page_size
            && ctx.cache.page(ctx.page).invalidation_count(ctx.page_index) >= hot
        {
            ctx.close_opcode();
            break None;
        }

        ctx.cycles += 1;
        let step = loop {
            match ctx.dispatch() {
                Ok(Step::Restart) => continue,
                other => break other,
            }
        };
        match step {
            Ok(Step::Continue) => {
                left -= 1;
                if left == 0 {
                    let delta = ctx.code.wrapping_sub(ctx.code_start);
                    ctx.close_link(0, delta);
                    break None;
                }
            }
            Ok(Step::Closed) => break None,
            Ok(Step::Restart) => unreachable!(),
            Err(Stop::PageFault) => {
                // The faulting fetch never ran; the interpreter raises
                // the fault when it re-executes the instruction.
                ctx.cycles -= 1;
                ctx.close_opcode();
                break None;
            }
            Err(Stop::Fatal(e)) => break Some(e),
        }
    };

    ctx.fill_saves();

    // Final decode extent on the last page touched.
    let end = (ctx.page_index.saturating_sub(1)) as u16;
    let active = ctx.active_block;
    let len = ctx.code.wrapping_sub(ctx.code_start);
    let blk = ctx.cache.block_mut(active);
    blk.page_end = end.max(blk.page_start);

    drop(ctx);
    cache.close_block(gen)?;
    if let Some(e) = fatal {
        return Err(e);
    }
    trace!(start = format_args!("{start:#x}"), len, "translated block");
    Ok(block)
}
