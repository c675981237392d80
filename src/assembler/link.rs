//! Linker: turns a [`CodeBuffer`] into finalized executable code
//!
//! Linking happens in three steps:
//!
//! 1. Layout. Branch records are walked in increasing source offset. Each
//!    relative branch gets the narrowest encoding that reaches its target and
//!    everything after it slides left by the bytes saved. The cumulative shift
//!    is recorded as `(first original offset it applies to, shift)` so any
//!    original offset can be mapped to its final position.
//! 2. Fixups. With the final layout and the region base known, branches,
//!    pool loads and jump-table entries are written.
//! 3. Publication. The image is copied in, the region shrinks to the final
//!    size, becomes read+execute and the instruction cache is flushed.
//!
//! Backward targets are mapped exactly. Forward targets are estimated with
//! the shift accumulated so far; later shrinking can only bring the target
//! closer, so the chosen encoding always still fits.

use super::buffer::{BranchKind, BranchRecord, BufferParts, CodeBuffer, Label};
use super::isa::{
    encode_absolute_branch, encode_relative_branch, minimal_width_for, BranchWidth, Instruction,
};
use crate::error::{CompactionFault, Error, Result};
use crate::executable::{CodeOwner, ExecutablePool, ExecutableRegion};
use std::sync::Arc;

/// What to do when executable memory runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitCompilationEffort {
    /// Return no code; the caller keeps running its current tier
    CanFail,
    /// Report an error; used for thunks that have no fallback
    MustSucceed,
}

/// A branch after layout
#[derive(Debug, Clone, Copy)]
struct PlacedBranch {
    record: BranchRecord,
    width: BranchWidth,
    final_from: usize,
}

/// Final layout of a buffer before addresses are known
struct Layout {
    image: Vec<u8>,
    branches: Vec<PlacedBranch>,
    shifts: Vec<(usize, usize)>,
}

impl Layout {
    fn map(&self, offset: usize) -> usize {
        map_offset(&self.shifts, offset)
    }
}

/// Map an original offset through the recorded cumulative shifts
fn map_offset(shifts: &[(usize, usize)], offset: usize) -> usize {
    let idx = shifts.partition_point(|&(threshold, _)| threshold <= offset);
    if idx == 0 {
        offset
    } else {
        offset - shifts[idx - 1].1
    }
}

fn resolve(labels: &[Option<usize>], label: Label) -> Result<usize> {
    labels
        .get(label.0 as usize)
        .copied()
        .flatten()
        .ok_or(Error::InvalidLabel(label.0))
}

/// Finalized code plus the final position of every label
#[derive(Debug, Clone)]
pub struct LinkedCode {
    region: Arc<ExecutableRegion>,
    labels: Vec<Option<usize>>,
    unlinked_size: usize,
}

impl LinkedCode {
    pub fn region(&self) -> &Arc<ExecutableRegion> {
        &self.region
    }

    pub fn into_region(self) -> Arc<ExecutableRegion> {
        self.region
    }

    /// Address of the first instruction
    pub fn entry(&self) -> usize {
        self.region.base()
    }

    /// Final offset of `label` from the region base
    pub fn offset_of(&self, label: Label) -> Result<usize> {
        resolve(&self.labels, label)
    }

    /// Final absolute address of `label`
    pub fn address_of(&self, label: Label) -> Result<usize> {
        Ok(self.region.base() + self.offset_of(label)?)
    }

    /// Size of the buffer before compaction
    pub fn unlinked_size(&self) -> usize {
        self.unlinked_size
    }

    /// Size of the finalized code
    pub fn size(&self) -> usize {
        self.region.size()
    }
}

/// Links code buffers into regions of one pool
#[derive(Debug, Clone, Copy)]
pub struct Linker<'a> {
    pool: &'a ExecutablePool,
    compaction: bool,
}

impl<'a> Linker<'a> {
    pub fn new(pool: &'a ExecutablePool) -> Self {
        Self { pool, compaction: true }
    }

    /// Enable or disable branch compaction
    pub fn with_compaction(mut self, enabled: bool) -> Self {
        self.compaction = enabled;
        self
    }

    /// Finalize `buffer` into executable memory owned by `owner`
    ///
    /// Returns `Ok(None)` when memory is exhausted and `effort` is
    /// [`JitCompilationEffort::CanFail`].
    pub fn finalize(
        &self,
        mut buffer: CodeBuffer,
        owner: CodeOwner,
        effort: JitCompilationEffort,
    ) -> Result<Option<LinkedCode>> {
        buffer.flush_constant_pool(false)?;
        let parts = buffer.into_parts();
        check_labels(&parts)?;

        let unlinked_size = parts.bytes.len();
        let region = match self.pool.allocate(unlinked_size, owner) {
            Some(region) => region,
            None => match effort {
                JitCompilationEffort::CanFail => {
                    tracing::debug!(%owner, size = unlinked_size, "finalize skipped, no executable memory");
                    return Ok(None);
                }
                JitCompilationEffort::MustSucceed => {
                    return Err(Error::ExecutableMemoryExhausted {
                        requested: unlinked_size,
                        available: self.pool.budget().saturating_sub(self.pool.bytes_allocated()),
                    })
                }
            },
        };

        let layout = if self.compaction {
            compact(&parts)?
        } else {
            uncompacted(&parts)?
        };
        let image = apply_fixups(&parts, layout, region.base())?;
        let labels: Vec<Option<usize>> = parts
            .labels
            .iter()
            .map(|offset| offset.map(|o| map_offset(&image.1, o)))
            .collect();
        let image = image.0;

        region.fill(&image)?;
        region.shrink(image.len());
        region.seal()?;

        tracing::debug!(
            %owner,
            base = format_args!("{:#x}", region.base()),
            before = unlinked_size,
            after = image.len(),
            branches = parts.branches.len(),
            "finalized code"
        );

        Ok(Some(LinkedCode { region, labels, unlinked_size }))
    }
}

fn check_labels(parts: &BufferParts) -> Result<()> {
    for branch in &parts.branches {
        resolve(&parts.labels, branch.target)?;
    }
    for load in &parts.constant_loads {
        resolve(&parts.labels, load.entry)?;
    }
    for table in &parts.jump_tables {
        resolve(&parts.labels, table.start)?;
        for &label in &table.targets {
            resolve(&parts.labels, label)?;
        }
    }
    Ok(())
}

/// Order branch records by source offset
fn sorted_branches(parts: &BufferParts) -> Vec<BranchRecord> {
    let mut branches = parts.branches.clone();
    branches.sort_by_key(|b| b.from);
    branches
}

fn compact(parts: &BufferParts) -> Result<Layout> {
    let bytes = &parts.bytes;
    let mut image = Vec::with_capacity(bytes.len());
    let mut placed = Vec::with_capacity(parts.branches.len());
    let mut shifts: Vec<(usize, usize)> = Vec::new();
    let mut delta = 0usize;
    let mut read = 0usize;

    for record in sorted_branches(parts) {
        if record.from < read {
            return Err(Error::compaction(CompactionFault::UnorderedBranches, record.from));
        }
        image.extend_from_slice(&bytes[read..record.from]);
        let final_from = record.from - delta;
        debug_assert_eq!(final_from, image.len());

        let width = match record.kind {
            BranchKind::Patchable => BranchWidth::Absolute,
            BranchKind::Relative => {
                let target = resolve(&parts.labels, record.target)?;
                let final_target = if target <= record.from {
                    map_offset(&shifts, target)
                } else {
                    target - delta
                };
                let distance = final_target as i64 - final_from as i64;
                minimal_width_for(distance)
                    .ok_or(Error::BranchOutOfRange { from: record.from, to: target })?
            }
        };

        image.resize(image.len() + width.size(), 0xFF);
        read = record.from + record.reserved();
        let saved = record.reserved() - width.size();
        if saved > 0 {
            delta += saved;
            if delta > read {
                return Err(Error::compaction(CompactionFault::NegativeShift, record.from));
            }
            shifts.push((read, delta));
        }
        placed.push(PlacedBranch { record, width, final_from });
    }
    image.extend_from_slice(&bytes[read..]);

    Ok(Layout { image, branches: placed, shifts })
}

fn uncompacted(parts: &BufferParts) -> Result<Layout> {
    let branches = sorted_branches(parts)
        .into_iter()
        .map(|record| PlacedBranch {
            width: match record.kind {
                BranchKind::Relative => BranchWidth::Far,
                BranchKind::Patchable => BranchWidth::Absolute,
            },
            final_from: record.from,
            record,
        })
        .collect();
    Ok(Layout { image: parts.bytes.clone(), branches, shifts: Vec::new() })
}

/// Write every address-dependent field; returns the image and the shift table
fn apply_fixups(parts: &BufferParts, mut layout: Layout, base: usize) -> Result<(Vec<u8>, Vec<(usize, usize)>)> {
    let mut image = std::mem::take(&mut layout.image);

    for placed in &layout.branches {
        let record = placed.record;
        let target = layout.map(resolve(&parts.labels, record.target)?);
        let slot = &mut image[placed.final_from..placed.final_from + placed.width.size()];
        match record.kind {
            BranchKind::Relative => {
                let distance = target as i64 - placed.final_from as i64;
                if !placed.width.fits(distance) {
                    if placed.width == BranchWidth::Far {
                        return Err(Error::BranchOutOfRange { from: record.from, to: target });
                    }
                    return Err(Error::compaction(CompactionFault::WidthTooSmall, record.from));
                }
                encode_relative_branch(placed.width, record.cond, distance, slot);
            }
            BranchKind::Patchable => {
                encode_absolute_branch(record.cond, (base + target) as u64, slot);
            }
        }
    }

    for load in &parts.constant_loads {
        let at = layout.map(load.at);
        let entry = layout.map(resolve(&parts.labels, load.entry)?);
        let disp = (entry as i64 - at as i64) as i32;
        let field = at + Instruction::CONSTANT_DISP_OFFSET;
        image[field..field + 4].copy_from_slice(&disp.to_le_bytes());
    }

    for table in &parts.jump_tables {
        let start = layout.map(resolve(&parts.labels, table.start)?);
        for (i, &label) in table.targets.iter().enumerate() {
            let address = (base + layout.map(resolve(&parts.labels, label)?)) as u64;
            let at = start + i * 8;
            image[at..at + 8].copy_from_slice(&address.to_le_bytes());
        }
    }

    Ok((image, layout.shifts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::isa::{decode_branch, Condition, Reg};
    use crate::config::ExecutableBackend;
    use crate::executable::CodePatcher;

    fn pool() -> ExecutablePool {
        ExecutablePool::with_budget(1 << 20, ExecutableBackend::Simulated, 64.0)
    }

    fn nops(buf: &mut CodeBuffer, n: usize) {
        for _ in 0..n {
            buf.emit(Instruction::Nop);
        }
    }

    fn branch_target(code: &LinkedCode, offset: usize) -> usize {
        let bytes = code.region().bytes();
        let decoded = decode_branch(&bytes[offset..]).unwrap();
        decoded.resolve((code.entry() + offset) as u64) as usize
    }

    #[test]
    fn test_short_branches_are_compacted() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let top = buf.here();
        nops(&mut buf, 4);
        let end = buf.new_label();
        let fwd_site = buf.here();
        buf.branch(Condition::Equal, end).unwrap();
        let back_site = buf.here();
        buf.branch(Condition::Always, top).unwrap();
        nops(&mut buf, 3);
        buf.bind(end);
        buf.emit(Instruction::Return);

        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        assert_eq!(code.unlinked_size(), 4 + 5 + 5 + 3 + 1);
        assert_eq!(code.size(), 4 + 2 + 2 + 3 + 1);
        assert!(code.region().is_executable());

        let fwd = code.offset_of(fwd_site).unwrap();
        let back = code.offset_of(back_site).unwrap();
        assert_eq!(branch_target(&code, fwd), code.address_of(end).unwrap());
        assert_eq!(branch_target(&code, back), code.address_of(top).unwrap());
    }

    #[test]
    fn test_long_branch_keeps_wider_encoding() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();
        let site = buf.here();
        buf.branch(Condition::NotEqual, end).unwrap();
        nops(&mut buf, 300);
        buf.bind(end);
        buf.emit(Instruction::Return);

        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        let bytes = code.region().bytes();
        let decoded = decode_branch(&bytes[code.offset_of(site).unwrap()..]).unwrap();
        assert_eq!(decoded.width, BranchWidth::Near);
        assert_eq!(branch_target(&code, 0), code.address_of(end).unwrap());
    }

    #[test]
    fn test_constant_load_displacement_fixed_up() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();
        buf.branch(Condition::Always, end).unwrap();
        let load_site = buf.here();
        buf.load_constant(Reg::R1, 0x1122_3344_5566_7788);
        buf.bind(end);
        buf.emit(Instruction::Return);

        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        let bytes = code.region().bytes();
        let at = code.offset_of(load_site).unwrap();
        let field = at + Instruction::CONSTANT_DISP_OFFSET;
        let disp = i32::from_le_bytes(bytes[field..field + 4].try_into().unwrap());
        let entry = (at as i64 + disp as i64) as usize;
        assert_eq!(&bytes[entry..entry + 8], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_patchable_branch_is_absolute_and_repatchable() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let slow = buf.new_label();
        let site = buf.patchable_branch(Condition::Always, slow).unwrap();
        buf.emit(Instruction::Return);
        buf.bind(slow);
        buf.emit(Instruction::Trap);

        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        let address = code.address_of(site).unwrap();
        assert_eq!(
            crate::executable::jump_destination(&pool, address).unwrap(),
            code.address_of(slow).unwrap()
        );
        crate::executable::repatch_jump(&pool, code.region().id(), address, 0x4000).unwrap();
        assert_eq!(crate::executable::jump_destination(&pool, address).unwrap(), 0x4000);
        assert!(pool.read(address, 1).is_ok());
    }

    #[test]
    fn test_jump_table_entries_resolved() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let a = buf.new_label();
        let b = buf.new_label();
        let skip = buf.new_label();
        buf.branch(Condition::Always, skip).unwrap();
        let (_, table) = buf.emit_jump_table(vec![a, b]);
        buf.bind(skip);
        buf.bind(a);
        buf.emit(Instruction::Nop);
        buf.bind(b);
        buf.emit(Instruction::Return);

        let code = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        let bytes = code.region().bytes();
        let start = code.offset_of(table).unwrap();
        let first = u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap());
        let second = u64::from_le_bytes(bytes[start + 8..start + 16].try_into().unwrap());
        assert_eq!(first as usize, code.address_of(a).unwrap());
        assert_eq!(second as usize, code.address_of(b).unwrap());
    }

    #[test]
    fn test_unbound_label_rejected() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let nowhere = buf.new_label();
        buf.jump(nowhere).unwrap();
        let err = Linker::new(&pool)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLabel(_)));
    }

    #[test]
    fn test_exhaustion_respects_effort() {
        let pool = ExecutablePool::with_budget(4, ExecutableBackend::Simulated, 64.0);
        let build = || {
            let mut buf = CodeBuffer::new();
            nops(&mut buf, 16);
            buf
        };
        let linker = Linker::new(&pool);
        assert!(linker
            .finalize(build(), CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .is_none());
        assert!(matches!(
            linker.finalize(build(), CodeOwner::Thunk, JitCompilationEffort::MustSucceed),
            Err(Error::ExecutableMemoryExhausted { requested: 16, .. })
        ));
    }

    #[test]
    fn test_compaction_disabled_keeps_far_branches() {
        let pool = pool();
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();
        buf.jump(end).unwrap();
        buf.bind(end);
        buf.emit(Instruction::Return);
        let code = Linker::new(&pool)
            .with_compaction(false)
            .finalize(buf, CodeOwner::Thunk, JitCompilationEffort::CanFail)
            .unwrap()
            .unwrap();
        assert_eq!(code.size(), 6);
        assert_eq!(branch_target(&code, 0), code.address_of(end).unwrap());
    }

    #[test]
    fn test_map_offset() {
        let shifts = vec![(5, 3), (12, 6)];
        assert_eq!(map_offset(&shifts, 0), 0);
        assert_eq!(map_offset(&shifts, 4), 4);
        assert_eq!(map_offset(&shifts, 5), 2);
        assert_eq!(map_offset(&shifts, 12), 6);
        assert_eq!(map_offset(&shifts, 20), 14);
    }
}
