//! Dead-flags elimination.
//!
//! Every flag-producing operator call is queued together with its
//! flags-free twin. When a later operation redefines all arithmetic
//! flags before anything observed them, the queued call sites are
//! rewritten in place to the twin (or to an inline host sequence the
//! backend knows for the operation). When something observes the flags,
//! the queue is simply dropped and the calls stay on their
//! flag-producing path.

use std::collections::VecDeque;

use drc_backend::{CodeArena, CodeGen};
use drc_core::FlagKind;

/// Bound on call sites tracked at once; the oldest entry falls off
/// (staying full, which is always correct) when it fills up.
const QUEUE_MAX: usize = 64;

struct Pending {
    site: usize,
    simple: u64,
    kind: FlagKind,
}

#[derive(Default)]
pub(crate) struct FlagOpt {
    queue: VecDeque<Pending>,
}

impl FlagOpt {
    /// Upcoming code observes the flags; everything queued must keep
    /// producing them.
    pub fn acquire(&mut self) {
        self.queue.clear();
    }

    /// The next operation redefines every arithmetic flag, so no queued
    /// result can be observed anymore: rewrite them all.
    pub fn invalidate_all(&mut self, gen: &mut dyn CodeGen, a: &mut CodeArena) {
        while let Some(p) = self.queue.pop_front() {
            gen.fill_function_ptr(a, p.site, p.simple, p.kind);
        }
    }

    /// Track a call site whose flag result may turn out dead.
    pub fn push(&mut self, site: usize, simple: u64, kind: FlagKind) {
        if self.queue.len() == QUEUE_MAX {
            self.queue.pop_front();
        }
        self.queue.push_back(Pending { site, simple, kind });
    }
}
