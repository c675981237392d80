//! Executable memory
//!
//! Finalized machine code lives in [`ExecutableRegion`]s handed out by a
//! process-wide [`ExecutablePool`]. The pool owns the memory budget, tracks
//! every live region by address so later patches can be validated, and feeds
//! the memory-pressure multiplier used by tiering decisions.
//!
//! All mutation of already-finalized code goes through the [`CodePatcher`]
//! trait, which enforces the make-writable / write / flush / make-executable
//! discipline. Nothing outside this module touches code memory directly.

pub mod native;

use crate::config::{ExecutableBackend, JitOptions};
use crate::error::{Error, Result};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    /// Page protection of a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

impl Protection {
    /// Read + write, used while code is being copied in or patched
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    /// Read + execute, the only state in which code may run
    pub const RX: Protection = Protection::READ.union(Protection::EXEC);
}

/// Who requested a region (for diagnostics and stats)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeOwner {
    CodeBlock(u64),
    Stub { code_block: u64, site: u32 },
    Thunk,
}

impl fmt::Display for CodeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeOwner::CodeBlock(id) => write!(f, "code block #{}", id),
            CodeOwner::Stub { code_block, site } => write!(f, "stub #{}/{}", code_block, site),
            CodeOwner::Thunk => write!(f, "thunk"),
        }
    }
}

// ==================== Backing memory ====================

/// Raw backing store for one region
pub trait ExecutableMemory: Send + Sync {
    /// Address of the first byte
    fn base(&self) -> usize;
    /// Bytes usable by the region
    fn capacity(&self) -> usize;
    /// Change protection of `range` (offsets relative to base)
    fn protect(&self, range: Range<usize>, protection: Protection) -> Result<()>;
    /// Current protection of the page containing `offset`
    fn protection(&self, offset: usize) -> Protection;
    /// Copy bytes in; the range must currently be writable
    fn write(&self, offset: usize, bytes: &[u8]) -> Result<()>;
    /// Copy bytes out
    fn read(&self, offset: usize, len: usize) -> Vec<u8>;
    /// Make instruction fetch observe writes to `range`
    fn flush_icache(&self, range: Range<usize>);
}

#[derive(Debug)]
struct SimulatedState {
    bytes: Box<[u8]>,
    protection: Protection,
    icache_flushes: usize,
}

/// Heap-backed memory that tracks protection so the patching discipline can
/// be checked without real page tables
#[derive(Debug)]
pub struct SimulatedMemory {
    base: usize,
    capacity: usize,
    state: Mutex<SimulatedState>,
}

impl SimulatedMemory {
    pub fn new(capacity: usize) -> Self {
        let bytes = vec![0u8; capacity.max(1)].into_boxed_slice();
        Self {
            base: bytes.as_ptr() as usize,
            capacity,
            state: Mutex::new(SimulatedState {
                bytes,
                protection: Protection::RW,
                icache_flushes: 0,
            }),
        }
    }

    /// Number of instruction-cache flushes performed so far
    pub fn icache_flushes(&self) -> usize {
        self.state.lock().map(|s| s.icache_flushes).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimulatedState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("simulated code memory lock poisoned"))
    }
}

impl ExecutableMemory for SimulatedMemory {
    fn base(&self) -> usize {
        self.base
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn protect(&self, _range: Range<usize>, protection: Protection) -> Result<()> {
        self.lock()?.protection = protection;
        Ok(())
    }

    fn protection(&self, _offset: usize) -> Protection {
        self.state.lock().map(|s| s.protection).unwrap_or(Protection::empty())
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        if !state.protection.contains(Protection::WRITE) {
            return Err(Error::MemoryProtection(format!(
                "write of {} bytes at +{:#x} while code is not writable",
                bytes.len(),
                offset
            )));
        }
        let end = offset + bytes.len();
        if end > self.capacity {
            return Err(Error::PatchOutOfBounds { address: self.base + offset, len: bytes.len() });
        }
        state.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        match self.state.lock() {
            Ok(state) => {
                let end = (offset + len).min(self.capacity);
                state.bytes[offset.min(end)..end].to_vec()
            }
            Err(_) => Vec::new(),
        }
    }

    fn flush_icache(&self, _range: Range<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.icache_flushes += 1;
        }
    }
}

// ==================== Regions ====================

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// A block of finalized machine code
///
/// Regions are reference counted: the owning code block holds one handle and
/// anything that still calls into the code (stubs, call links) may hold more.
/// The memory returns to the pool when the last handle drops.
pub struct ExecutableRegion {
    id: u64,
    owner: CodeOwner,
    memory: Box<dyn ExecutableMemory>,
    size: AtomicUsize,
    pool: Arc<PoolShared>,
}

impl ExecutableRegion {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> CodeOwner {
        self.owner
    }

    /// Address of the first instruction
    pub fn base(&self) -> usize {
        self.memory.base()
    }

    /// Final size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Address range covered by the code
    pub fn range(&self) -> Range<usize> {
        self.base()..self.base() + self.size()
    }

    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base() && address + len <= self.base() + self.size()
    }

    /// Whether the region is currently executable and not writable
    pub fn is_executable(&self) -> bool {
        self.memory.protection(0) == Protection::RX
    }

    /// Snapshot of the code bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.memory.read(0, self.size())
    }

    /// Read `len` bytes at an absolute address inside the region
    pub fn read_at(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        if !self.contains(address, len) {
            return Err(Error::PatchOutOfBounds { address, len });
        }
        Ok(self.memory.read(address - self.base(), len))
    }

    /// Copy the linked image in; only valid before `seal`
    pub(crate) fn fill(&self, image: &[u8]) -> Result<()> {
        if image.len() > self.memory.capacity() {
            return Err(Error::PatchOutOfBounds { address: self.base(), len: image.len() });
        }
        self.memory.write(0, image)
    }

    /// Give back the unused tail of the allocation
    pub(crate) fn shrink(&self, new_size: usize) {
        let old = self.size.swap(new_size, Ordering::AcqRel);
        debug_assert!(new_size <= old, "regions only shrink");
        if let Ok(mut state) = self.pool.state.lock() {
            state.bytes_allocated = state.bytes_allocated.saturating_sub(old - new_size);
            if let Some(entry) = state.regions.get_mut(&self.base()) {
                entry.len = new_size;
            }
        }
    }

    /// Mark read+execute and flush the instruction cache for the whole region
    pub(crate) fn seal(&self) -> Result<()> {
        let range = 0..self.size();
        self.memory.flush_icache(range.clone());
        self.memory.protect(range, Protection::RX)
    }
}

impl fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        if let Ok(mut state) = self.pool.state.lock() {
            state.bytes_allocated = state.bytes_allocated.saturating_sub(self.size());
            state.regions.remove(&self.memory.base());
            state.stats.regions_freed += 1;
        }
        tracing::trace!(region = self.id, owner = %self.owner, "executable region freed");
    }
}

// ==================== Pool ====================

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub regions_allocated: u64,
    pub regions_freed: u64,
    pub failed_allocations: u64,
    pub patches: u64,
}

struct RegionEntry {
    len: usize,
    region: Weak<ExecutableRegion>,
}

struct PoolState {
    bytes_allocated: usize,
    regions: BTreeMap<usize, RegionEntry>,
    stats: PoolStats,
}

struct PoolShared {
    budget: usize,
    backend: ExecutableBackend,
    max_multiplier: f64,
    state: Mutex<PoolState>,
}

/// Process-wide executable memory allocator
#[derive(Clone)]
pub struct ExecutablePool {
    shared: Arc<PoolShared>,
}

impl ExecutablePool {
    /// Create a pool with the budget and backend from `options`
    pub fn new(options: &JitOptions) -> Self {
        Self::with_budget(
            options.executable_memory_budget,
            options.executable_backend,
            options.maximum_memory_pressure_multiplier,
        )
    }

    pub fn with_budget(budget: usize, backend: ExecutableBackend, max_multiplier: f64) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                budget,
                backend,
                max_multiplier,
                state: Mutex::new(PoolState {
                    bytes_allocated: 0,
                    regions: BTreeMap::new(),
                    stats: PoolStats::default(),
                }),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn bytes_allocated(&self) -> usize {
        self.shared.state.lock().map(|s| s.bytes_allocated).unwrap_or(0)
    }

    pub fn live_regions(&self) -> usize {
        self.shared.state.lock().map(|s| s.regions.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared
            .state
            .lock()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Allocate a writable region of `size` bytes
    ///
    /// Returns `None` when the budget or the OS refuses; callers treat this as
    /// "no code" and keep running the tier they are on.
    pub fn allocate(&self, size: usize, owner: CodeOwner) -> Option<Arc<ExecutableRegion>> {
        let mut state = self.shared.state.lock().ok()?;
        if state.bytes_allocated + size > self.shared.budget {
            state.stats.failed_allocations += 1;
            tracing::warn!(
                requested = size,
                allocated = state.bytes_allocated,
                budget = self.shared.budget,
                %owner,
                "executable memory budget exhausted"
            );
            return None;
        }

        let memory: Box<dyn ExecutableMemory> = match self.shared.backend {
            ExecutableBackend::Simulated => Box::new(SimulatedMemory::new(size)),
            ExecutableBackend::Native => match native::NativeMemory::map(size) {
                Ok(memory) => Box::new(memory),
                Err(err) => {
                    state.stats.failed_allocations += 1;
                    tracing::warn!(error = %err, requested = size, "mmap for executable region failed");
                    return None;
                }
            },
        };

        let region = Arc::new(ExecutableRegion {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            memory,
            size: AtomicUsize::new(size),
            pool: Arc::clone(&self.shared),
        });
        state.bytes_allocated += size;
        state.stats.regions_allocated += 1;
        state.regions.insert(
            region.base(),
            RegionEntry { len: size, region: Arc::downgrade(&region) },
        );
        Some(region)
    }

    /// How much to scale tiering thresholds given current code memory use
    ///
    /// `added` is the predicted size of the code about to be generated. The
    /// multiplier is `budget / (budget - used)`, clamped to
    /// `[1, maximum_memory_pressure_multiplier]`.
    pub fn memory_pressure_multiplier(&self, added: usize) -> f64 {
        let budget = self.shared.budget;
        let used = (self.bytes_allocated() + added).min(budget);
        let free = budget - used;
        let result = if free == 0 {
            self.shared.max_multiplier
        } else {
            budget as f64 / free as f64
        };
        result.clamp(1.0, self.shared.max_multiplier)
    }

    fn region_containing(&self, address: usize, len: usize) -> Result<Arc<ExecutableRegion>> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| Error::internal("executable pool lock poisoned"))?;
        let (base, entry) = state
            .regions
            .range(..=address)
            .next_back()
            .ok_or(Error::PatchOutOfBounds { address, len })?;
        if address + len > base + entry.len {
            return Err(Error::PatchOutOfBounds { address, len });
        }
        entry
            .region
            .upgrade()
            .ok_or(Error::PatchOutOfBounds { address, len })
    }
}

impl fmt::Debug for ExecutablePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutablePool")
            .field("budget", &self.shared.budget)
            .field("backend", &self.shared.backend)
            .field("allocated", &self.bytes_allocated())
            .finish()
    }
}

// ==================== Patching ====================

/// In-place mutation of finalized code
///
/// Addresses are absolute. Implementations must refuse any range that is not
/// inside one live region.
pub trait CodePatcher: Send + Sync {
    /// Id of the live region holding `address..address + len`
    fn region_at(&self, address: usize, len: usize) -> Result<u64>;
    fn make_writable(&self, range: Range<usize>) -> Result<()>;
    fn write(&self, address: usize, bytes: &[u8]) -> Result<()>;
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>>;
    fn flush_icache(&self, range: Range<usize>);
    fn make_executable(&self, range: Range<usize>) -> Result<()>;
}

impl CodePatcher for ExecutablePool {
    fn region_at(&self, address: usize, len: usize) -> Result<u64> {
        Ok(self.region_containing(address, len)?.id())
    }

    fn make_writable(&self, range: Range<usize>) -> Result<()> {
        let region = self.region_containing(range.start, range.len())?;
        let base = region.base();
        region.memory.protect(range.start - base..range.end - base, Protection::RW)
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let region = self.region_containing(address, bytes.len())?;
        region.memory.write(address - region.base(), bytes)?;
        if let Ok(mut state) = self.shared.state.lock() {
            state.stats.patches += 1;
        }
        Ok(())
    }

    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        self.region_containing(address, len)?.read_at(address, len)
    }

    fn flush_icache(&self, range: Range<usize>) {
        if let Ok(region) = self.region_containing(range.start, range.len()) {
            let base = region.base();
            region.memory.flush_icache(range.start - base..range.end - base);
        }
    }

    fn make_executable(&self, range: Range<usize>) -> Result<()> {
        let region = self.region_containing(range.start, range.len())?;
        let base = region.base();
        region.memory.protect(range.start - base..range.end - base, Protection::RX)
    }
}

/// Overwrite `bytes` at `address` using the full patching discipline
///
/// `region` is the id of the region the address was resolved in. If that
/// region was freed and another one now covers the address, the patch is
/// refused.
pub fn repatch(patcher: &dyn CodePatcher, region: u64, address: usize, bytes: &[u8]) -> Result<()> {
    let found = patcher.region_at(address, bytes.len())?;
    if found != region {
        return Err(Error::StalePatch { address, expected: region, found });
    }
    let range = address..address + bytes.len();
    patcher.make_writable(range.clone())?;
    let written = patcher.write(address, bytes);
    patcher.flush_icache(range.clone());
    patcher.make_executable(range)?;
    written
}

/// Retarget the absolute branch at `site` in `region` to `target`, keeping
/// its condition
pub fn repatch_jump(patcher: &dyn CodePatcher, region: u64, site: usize, target: usize) -> Result<()> {
    use crate::assembler::isa::{decode_branch, encode_absolute_branch, BranchWidth, ABSOLUTE_BRANCH_SIZE};

    let found = patcher.region_at(site, ABSOLUTE_BRANCH_SIZE)?;
    if found != region {
        return Err(Error::StalePatch { address: site, expected: region, found });
    }
    let current = patcher.read(site, ABSOLUTE_BRANCH_SIZE)?;
    let branch = decode_branch(&current)
        .filter(|b| b.width == BranchWidth::Absolute)
        .ok_or_else(|| Error::internal(format!("no patchable jump at {:#x}", site)))?;
    let mut bytes = [0u8; ABSOLUTE_BRANCH_SIZE];
    encode_absolute_branch(branch.cond, target as u64, &mut bytes);
    tracing::trace!(site = format_args!("{:#x}", site), target = format_args!("{:#x}", target), "repatch jump");
    repatch(patcher, region, site, &bytes)
}

/// Where the absolute branch at `site` currently goes
pub fn jump_destination(patcher: &dyn CodePatcher, site: usize) -> Result<usize> {
    use crate::assembler::isa::{decode_branch, ABSOLUTE_BRANCH_SIZE};

    let bytes = patcher.read(site, ABSOLUTE_BRANCH_SIZE)?;
    decode_branch(&bytes)
        .map(|b| b.resolve(site as u64) as usize)
        .ok_or_else(|| Error::internal(format!("no branch at {:#x}", site)))
}
