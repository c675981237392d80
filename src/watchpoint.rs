//! Watchpoints: one-shot notification when an assumption breaks
//!
//! A [`WatchpointSet`] guards one invariant (a structure not transitioning,
//! a prototype not changing). Code that relies on the invariant adds a
//! [`Watchpoint`]; when the invariant is broken the set fires every
//! watchpoint exactly once and stays fired. Watchpoints added after that are
//! fired on the spot.

use crate::error::{Error, Result};
use crate::executable::{jump_destination, repatch_jump, CodePatcher, ExecutableRegion};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// An observer of a [`WatchpointSet`]
pub trait Watchpoint {
    /// The watched invariant no longer holds
    fn fire(&self);

    /// Whether this watchpoint still has anything to do
    ///
    /// Dead watchpoints are dropped from sets instead of being fired.
    fn is_live(&self) -> bool {
        true
    }
}

// ==================== WatchpointSet ====================

/// Set of pending watchpoints guarding one invariant
#[derive(Default)]
pub struct WatchpointSet {
    watchpoints: Vec<Rc<dyn Watchpoint>>,
    is_watched: bool,
    has_fired: bool,
}

impl WatchpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a write will be treated as an invalidation
    pub fn is_watched(&self) -> bool {
        self.is_watched
    }

    /// Whether the set has fired; never reverts once true
    pub fn has_fired(&self) -> bool {
        self.has_fired
    }

    /// Whether the guarded invariant may still be relied upon
    pub fn is_still_valid(&self) -> bool {
        !self.has_fired
    }

    /// Number of watchpoints waiting to fire
    pub fn len(&self) -> usize {
        self.watchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchpoints.is_empty()
    }

    /// Add `watchpoint`; fires it immediately if the set already fired
    pub fn add(&mut self, watchpoint: Rc<dyn Watchpoint>) {
        if self.has_fired {
            watchpoint.fire();
            return;
        }
        self.prune();
        self.watchpoints.push(watchpoint);
        self.is_watched = true;
    }

    /// Treat the next write as an invalidation even with no watchpoints
    pub fn start_watching(&mut self) {
        if !self.has_fired {
            self.is_watched = true;
        }
    }

    /// Record a write to the guarded state, firing all watchpoints
    ///
    /// Returns the number of watchpoints fired. Writes to an unwatched set
    /// are not invalidations.
    pub fn notify_write(&mut self) -> usize {
        let pending = self.take_for_firing();
        fire_all(pending)
    }

    /// Same as [`notify_write`](Self::notify_write) for a set behind a
    /// `RefCell`, releasing the borrow before any watchpoint runs
    pub fn notify_write_shared(set: &RefCell<WatchpointSet>) -> usize {
        let pending = set.borrow_mut().take_for_firing();
        fire_all(pending)
    }

    fn take_for_firing(&mut self) -> Option<Vec<Rc<dyn Watchpoint>>> {
        if !self.is_watched {
            return None;
        }
        self.is_watched = false;
        self.has_fired = true;
        Some(std::mem::take(&mut self.watchpoints))
    }

    /// Drop watchpoints whose owners are gone
    pub fn prune(&mut self) {
        self.watchpoints.retain(|w| w.is_live());
    }
}

fn fire_all(pending: Option<Vec<Rc<dyn Watchpoint>>>) -> usize {
    let Some(pending) = pending else {
        return 0;
    };
    let mut fired = 0;
    for watchpoint in pending {
        if watchpoint.is_live() {
            watchpoint.fire();
            fired += 1;
        }
    }
    if fired > 0 {
        tracing::debug!(fired, "watchpoint set fired");
    }
    fired
}

impl fmt::Debug for WatchpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchpointSet")
            .field("pending", &self.watchpoints.len())
            .field("is_watched", &self.is_watched)
            .field("has_fired", &self.has_fired)
            .finish()
    }
}

// ==================== Jump replacement ====================

/// Retargets a jump in finalized code when fired
///
/// Both addresses are resolved at link time against `region`, the code
/// that holds `source`. The watchpoint holds the region weakly and dies with
/// it; patches are tagged with the region id so a reused address range is
/// never written.
pub struct JumpReplacementWatchpoint {
    patcher: Arc<dyn CodePatcher>,
    region: Weak<ExecutableRegion>,
    region_id: u64,
    source: usize,
    destination: usize,
    previous: Cell<Option<usize>>,
}

impl JumpReplacementWatchpoint {
    pub fn new(
        patcher: Arc<dyn CodePatcher>,
        region: &Arc<ExecutableRegion>,
        source: usize,
        destination: usize,
    ) -> Self {
        Self {
            patcher,
            region: Arc::downgrade(region),
            region_id: region.id(),
            source,
            destination,
            previous: Cell::new(None),
        }
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Whether the jump is currently replaced
    pub fn is_replaced(&self) -> bool {
        self.previous.get().is_some()
    }

    fn replace(&self) -> Result<()> {
        if self.previous.get().is_some() {
            return Ok(());
        }
        if self.region.strong_count() == 0 {
            return Err(Error::PatchOutOfBounds { address: self.source, len: 1 });
        }
        let previous = jump_destination(self.patcher.as_ref(), self.source)?;
        repatch_jump(self.patcher.as_ref(), self.region_id, self.source, self.destination)?;
        self.previous.set(Some(previous));
        Ok(())
    }

    /// Put the original jump target back
    pub fn reverse(&self) -> Result<()> {
        match self.previous.take() {
            Some(previous) => repatch_jump(self.patcher.as_ref(), self.region_id, self.source, previous),
            None => Ok(()),
        }
    }
}

impl Watchpoint for JumpReplacementWatchpoint {
    fn fire(&self) {
        match self.replace() {
            Ok(()) => tracing::debug!(
                source = format_args!("{:#x}", self.source),
                destination = format_args!("{:#x}", self.destination),
                "jump replaced"
            ),
            Err(err) => tracing::warn!(error = %err, "jump replacement skipped"),
        }
    }

    fn is_live(&self) -> bool {
        self.region.strong_count() > 0
    }
}

impl fmt::Debug for JumpReplacementWatchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JumpReplacementWatchpoint")
            .field("source", &format_args!("{:#x}", self.source))
            .field("destination", &format_args!("{:#x}", self.destination))
            .field("replaced", &self.is_replaced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{CodeBuffer, Condition, Instruction, JitCompilationEffort, Linker};
    use crate::config::ExecutableBackend;
    use crate::executable::{CodeOwner, ExecutablePool};

    #[derive(Default)]
    struct Counting {
        fired: Cell<u32>,
    }

    impl Watchpoint for Counting {
        fn fire(&self) {
            self.fired.set(self.fired.get() + 1);
        }
    }

    struct Dead;

    impl Watchpoint for Dead {
        fn fire(&self) {
            panic!("dead watchpoints must not fire");
        }

        fn is_live(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_fire_drains_and_latches() {
        let mut set = WatchpointSet::new();
        let a = Rc::new(Counting::default());
        let b = Rc::new(Counting::default());
        set.add(a.clone());
        set.add(b.clone());
        assert!(set.is_watched());
        assert_eq!(set.notify_write(), 2);
        assert!(set.has_fired());
        assert!(!set.is_watched());
        assert!(set.is_empty());
        assert_eq!(set.notify_write(), 0);
        assert_eq!(a.fired.get(), 1);
        assert_eq!(b.fired.get(), 1);
    }

    #[test]
    fn test_add_after_fire_fires_immediately() {
        let mut set = WatchpointSet::new();
        set.start_watching();
        set.notify_write();
        let late = Rc::new(Counting::default());
        set.add(late.clone());
        assert_eq!(late.fired.get(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_unwatched_write_is_not_invalidation() {
        let mut set = WatchpointSet::new();
        assert_eq!(set.notify_write(), 0);
        assert!(!set.has_fired());
        set.start_watching();
        set.notify_write();
        assert!(set.has_fired());
        set.start_watching();
        assert!(!set.is_watched());
    }

    #[test]
    fn test_dead_watchpoints_are_skipped() {
        let mut set = WatchpointSet::new();
        set.add(Rc::new(Dead));
        let live = Rc::new(Counting::default());
        set.add(live.clone());
        assert_eq!(set.len(), 1);
        assert_eq!(set.notify_write(), 1);
    }

    #[test]
    fn test_shared_set_can_be_reentered_from_fire() {
        struct Reenter {
            set: Rc<RefCell<WatchpointSet>>,
            saw_fired: Cell<bool>,
        }
        impl Watchpoint for Reenter {
            fn fire(&self) {
                self.saw_fired.set(self.set.borrow().has_fired());
            }
        }

        let set = Rc::new(RefCell::new(WatchpointSet::new()));
        let w = Rc::new(Reenter { set: set.clone(), saw_fired: Cell::new(false) });
        set.borrow_mut().add(w.clone());
        assert_eq!(WatchpointSet::notify_write_shared(&set), 1);
        assert!(w.saw_fired.get());
    }

    #[test]
    fn test_jump_replacement_and_reverse() {
        let pool = ExecutablePool::with_budget(4096, ExecutableBackend::Simulated, 64.0);
        let mut buf = CodeBuffer::new();
        let fast = buf.new_label();
        let slow = buf.new_label();
        let site = buf.patchable_branch(Condition::Always, fast).unwrap();
        buf.bind(fast);
        buf.emit(Instruction::Return);
        buf.bind(slow);
        buf.emit(Instruction::Trap);
        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();

        let source = code.address_of(site).unwrap();
        let patcher: Arc<dyn CodePatcher> = Arc::new(pool.clone());
        let w = Rc::new(JumpReplacementWatchpoint::new(
            patcher,
            code.region(),
            source,
            code.address_of(slow).unwrap(),
        ));
        let mut set = WatchpointSet::new();
        set.add(w.clone());
        set.notify_write();

        assert!(w.is_replaced());
        assert_eq!(jump_destination(&pool, source).unwrap(), code.address_of(slow).unwrap());
        w.reverse().unwrap();
        assert_eq!(jump_destination(&pool, source).unwrap(), code.address_of(fast).unwrap());
        assert!(code.region().is_executable());
    }

    #[test]
    fn test_jump_replacement_dies_with_region() {
        let pool = ExecutablePool::with_budget(4096, ExecutableBackend::Simulated, 64.0);
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        let site = buf.patchable_branch(Condition::Always, target).unwrap();
        buf.bind(target);
        buf.emit(Instruction::Return);
        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        let patcher: Arc<dyn CodePatcher> = Arc::new(pool.clone());
        let source = code.address_of(site).unwrap();
        let w = JumpReplacementWatchpoint::new(patcher, code.region(), source, source);
        assert!(w.is_live());
        drop(code);
        assert!(!w.is_live());
        assert!(w.replace().is_err());
    }

    #[test]
    fn test_jump_replacement_never_writes_into_reused_range() {
        let pool = ExecutablePool::with_budget(4096, ExecutableBackend::Simulated, 64.0);
        let patcher: Arc<dyn CodePatcher> = Arc::new(pool.clone());
        let link = |pool: &ExecutablePool| {
            let mut buf = CodeBuffer::new();
            let target = buf.new_label();
            let site = buf.patchable_branch(Condition::Always, target).unwrap();
            buf.bind(target);
            buf.emit(Instruction::Return);
            let code = Linker::new(pool)
                .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
                .unwrap()
                .unwrap();
            let source = code.address_of(site).unwrap();
            (code, source)
        };

        // Resolved against one region, fired after another took its place
        let (stale, _) = link(&pool);
        let (live, source) = link(&pool);
        let before = jump_destination(&pool, source).unwrap();
        let w = Rc::new(JumpReplacementWatchpoint::new(patcher, stale.region(), source, 0x40));
        let mut set = WatchpointSet::new();
        set.add(w.clone());
        drop(stale);

        assert_eq!(set.notify_write(), 0);
        w.fire();
        assert!(!w.is_replaced());
        assert_eq!(jump_destination(&pool, source).unwrap(), before);
        assert!(live.region().is_executable());
    }
}
