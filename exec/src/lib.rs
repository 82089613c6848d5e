//! The recompiling execution core.
//!
//! `DynCore` owns the CPU state block, the block cache and a backend
//! code generator, and runs guest code block by block: look up (or
//! translate) the block at CS:EIP, jump into it through the entry
//! thunk, then dispatch on its return code. Unresolved block exits are
//! linked to their successor as they are discovered, so hot paths stop
//! coming back to this loop at all.
//!
//! Everything the translator cannot or will not handle is delegated to
//! a [`FallbackCore`], the embedder's interpreter.

use std::ffi::c_void;

use tracing::warn;

use drc_backend::CodeGen;
use drc_cache::BlockCache;
use drc_core::state::FLAG_TF;
use drc_core::{BlockReturn, CoreConfig, CpuState, DrcError, EXCEPTION_NONE};

mod mem;

pub use mem::GuestMem;

/// Interpreter the recompiler falls back to.
pub trait FallbackCore {
    /// Execute exactly one instruction at CS:EIP, charging its cycles.
    fn step_one(&mut self, env: &mut CpuState);
    /// Deliver a pending guest exception.
    fn exception(&mut self, env: &mut CpuState, vector: i32, error: u32);
    /// The trap flag fired after an instruction.
    fn debug_break(&mut self, env: &mut CpuState);
}

/// Why `run` returned control to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    /// The cycle budget is spent.
    CyclesDone,
    /// Generated code hit a callback trap; the identifier tells the
    /// embedder which one.
    Callback(u32),
}

/// Checked guest store routed through the block cache so writes into
/// translated code invalidate the affected blocks.
extern "C" fn cache_write(env: *mut CpuState, addr: u32, val: u32, width: u32) -> u32 {
    // SAFETY: installed by `run`, which keeps the state block and the
    // cache alive and unborrowed while generated code executes.
    let env = unsafe { &mut *env };
    let cache = unsafe { &mut *(env.cache_ctl as *mut BlockCache) };
    cache.guest_write(env, addr, val, width)
}

pub struct DynCore<G: CodeGen> {
    env: Box<CpuState>,
    cache: BlockCache,
    gen: G,
    mem: GuestMem,
    paged_warned: bool,
}

impl<G: CodeGen> DynCore<G> {
    pub fn new(cfg: CoreConfig, mut gen: G, mut mem: GuestMem) -> Result<Self, DrcError> {
        let cache = BlockCache::new(cfg, &mut gen)?;
        let env = Box::new(CpuState::new(mem.base(), mem.size()));
        Ok(Self {
            env,
            cache,
            gen,
            mem,
            paged_warned: false,
        })
    }

    pub fn env(&self) -> &CpuState {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut CpuState {
        &mut self.env
    }

    pub fn mem(&mut self) -> &mut GuestMem {
        &mut self.mem
    }

    pub fn cache(&mut self) -> &mut BlockCache {
        &mut self.cache
    }

    /// Run until the cycle budget is spent or a callback trap fires.
    pub fn run(&mut self, fallback: &mut dyn FallbackCore) -> Result<CoreExit, DrcError> {
        if self.env.paging != 0 && !self.cache.config().allow_paged_core {
            if !self.paged_warned {
                warn!("guest paging enabled, running on the interpreter");
                self.paged_warned = true;
            }
            while self.env.cycles > 0 {
                fallback.step_one(&mut self.env);
            }
            return Ok(CoreExit::CyclesDone);
        }

        // The owner may have moved us since the last slice.
        self.env.cache_ctl = &mut self.cache as *mut BlockCache as *mut c_void;
        self.env.mem_write = cache_write;

        // SAFETY: the cache emitted the entry thunk with this signature
        // at startup and the arena never moves.
        let thunk: extern "C" fn(*mut CpuState, u64) -> u32 =
            unsafe { std::mem::transmute(self.cache.run_thunk_addr() as usize) };

        'outer: loop {
            if self.env.cycles <= 0 {
                return Ok(CoreExit::CyclesDone);
            }
            if self.env.flag(FLAG_TF) {
                fallback.step_one(&mut self.env);
                fallback.debug_break(&mut self.env);
                continue;
            }

            let mut block = match self.cache.lookup(self.env.ip_point()) {
                Some(b) => b,
                None => match self.translate(fallback)? {
                    Some(b) => b,
                    None => continue,
                },
            };

            loop {
                let entry = self.cache.block_entry(block);
                let raw = thunk(&mut *self.env, entry);
                let ret = BlockReturn::from_raw(raw).ok_or(DrcError::BadReturnCode(raw))?;
                match ret {
                    BlockReturn::Normal => {
                        self.dispatch_exception(fallback);
                        continue 'outer;
                    }
                    BlockReturn::Cycles => return Ok(CoreExit::CyclesDone),
                    BlockReturn::Link1 | BlockReturn::Link2 => {
                        if self.env.cycles <= 0 {
                            return Ok(CoreExit::CyclesDone);
                        }
                        let slot = (ret == BlockReturn::Link2) as usize;
                        let target = match self.cache.lookup(self.env.ip_point()) {
                            Some(b) => b,
                            None => match self.translate(fallback)? {
                                Some(b) => b,
                                None => continue 'outer,
                            },
                        };
                        self.cache.link_block(block, slot, target);
                        block = target;
                    }
                    BlockReturn::Opcode | BlockReturn::OpcodeFull => {
                        fallback.step_one(&mut self.env);
                        continue 'outer;
                    }
                    BlockReturn::SMCBlock => {
                        // The faulting store never completed and its
                        // block is gone; re-run it interpreted.
                        fallback.step_one(&mut self.env);
                        continue 'outer;
                    }
                    BlockReturn::Iret => {
                        // TF restored by IRET is picked up at the top of
                        // the outer loop, which single-steps and then
                        // fires the break.
                        self.dispatch_exception(fallback);
                        continue 'outer;
                    }
                    BlockReturn::CallBack => {
                        return Ok(CoreExit::Callback(self.env.callback));
                    }
                }
            }
        }
    }

    /// Translate the block at CS:EIP. Cache exhaustion resets the cache
    /// and reports `None` so the caller retries from a clean slate.
    fn translate(
        &mut self,
        _fallback: &mut dyn FallbackCore,
    ) -> Result<Option<drc_cache::BlockHandle>, DrcError> {
        match drc_decoder::create_block(&mut self.env, &mut self.cache, &mut self.gen) {
            Ok(b) => Ok(Some(b)),
            Err(e @ (DrcError::NoFreeBlock | DrcError::NoEvictablePage)) => {
                warn!(error = %e, "code cache exhausted, resetting");
                self.cache.reset()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch_exception(&mut self, fallback: &mut dyn FallbackCore) {
        if self.env.exception != EXCEPTION_NONE {
            let vector = self.env.exception;
            let error = self.env.exception_error;
            self.env.exception = EXCEPTION_NONE;
            fallback.exception(&mut self.env, vector, error);
        }
    }
}
