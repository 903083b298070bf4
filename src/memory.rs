//! The virtual memory context: a page-indexed, arena-backed 32-bit address
//! space with allocate/free/resize and a name/address symbol table.
//!
//! This is the RAM of the emulated machine. It does not expose raw host
//! pointers; every accessor returns a byte slice scoped to the call, or a
//! scalar value, per the "no exposed host pointers" guidance for this port.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::MemoryError;

/// Stable handle to an arena. Never reused while an arena with the same
/// address range could still be referenced, since arenas are only looked up
/// through [`MemoryContext`]'s own indexes, never cached by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ArenaId(usize);

/// A contiguous, host-backed region of the address space with its own
/// allocation bookkeeping.
struct Arena {
    addr: u32,
    buffer: Vec<u8>,
    allocated_bytes: u64,
    free_bytes: u64,
    /// addr -> size, for allocated blocks.
    allocated_blocks: BTreeMap<u32, u32>,
    /// addr -> size, for free blocks.
    free_blocks_by_addr: BTreeMap<u32, u32>,
    /// size -> set of addrs, emulating a `multimap<size, addr>`.
    free_blocks_by_size: BTreeMap<u32, BTreeSet<u32>>,
}

impl Arena {
    fn new(addr: u32, size: u32) -> Self {
        let mut free_blocks_by_addr = BTreeMap::new();
        let mut free_blocks_by_size = BTreeMap::new();
        free_blocks_by_addr.insert(addr, size);
        free_blocks_by_size.entry(size).or_insert_with(BTreeSet::new).insert(addr);

        Arena {
            addr,
            buffer: vec![0u8; size as usize],
            allocated_bytes: 0,
            free_bytes: size as u64,
            allocated_blocks: BTreeMap::new(),
            free_blocks_by_addr,
            free_blocks_by_size,
        }
    }

    fn size(&self) -> u32 {
        self.buffer.len() as u32
    }

    fn delete_free_block(&mut self, addr: u32, size: u32) {
        self.free_blocks_by_addr.remove(&addr);
        if let Some(set) = self.free_blocks_by_size.get_mut(&size) {
            set.remove(&addr);
            if set.is_empty() {
                self.free_blocks_by_size.remove(&size);
            }
        }
    }

    fn insert_free_block(&mut self, addr: u32, size: u32) {
        self.free_blocks_by_addr.insert(addr, size);
        self.free_blocks_by_size.entry(size).or_insert_with(BTreeSet::new).insert(addr);
    }

    /// Finds the smallest free block (by size, then by addr) that is at
    /// least `n` bytes, mirroring `multimap<size, addr>::lower_bound(n)`.
    fn smallest_fitting_free_block(&self, n: u32) -> Option<(u32, u32)> {
        self.free_blocks_by_size
            .range(n..)
            .next()
            .and_then(|(size, addrs)| addrs.iter().next().map(|addr| (*addr, *size)))
    }

    /// Splits `[free_block_addr, free_block_addr + free_block_size)` to
    /// carve out `[allocate_addr, allocate_addr + allocate_size)`, leaving
    /// behind a leading and/or trailing free block for whatever remains.
    fn split_free_block(
        &mut self,
        free_block_addr: u32,
        free_block_size: u32,
        allocate_addr: u32,
        allocate_size: u32,
    ) -> Result<(), MemoryError> {
        let before = allocate_addr
            .checked_sub(free_block_addr)
            .ok_or_else(|| MemoryError::LogicError {
                reason: "split_free_block: allocate_addr before free_block_addr".into(),
            })?;
        let free_end = free_block_addr as u64 + free_block_size as u64;
        let allocate_end = allocate_addr as u64 + allocate_size as u64;
        if allocate_end > free_end {
            return Err(MemoryError::LogicError {
                reason: "split_free_block: allocation exceeds free block".into(),
            });
        }
        let after = (free_end - allocate_end) as u32;

        self.delete_free_block(free_block_addr, free_block_size);
        self.allocated_blocks.insert(allocate_addr, allocate_size);
        if before > 0 {
            self.insert_free_block(free_block_addr, before);
        }
        if after > 0 {
            self.insert_free_block(allocate_addr + allocate_size, after);
        }

        self.free_bytes -= allocate_size as u64;
        self.allocated_bytes += allocate_size as u64;
        Ok(())
    }

    fn is_within_allocated_block(&self, addr: u32, size: u32) -> bool {
        let Some((&block_addr, &block_size)) = self.allocated_blocks.range(..=addr).next_back() else {
            return false;
        };
        let block_end = block_addr as u64 + block_size as u64;
        let end = addr as u64 + size as u64;
        addr as u64 >= block_addr as u64 && end <= block_end
    }

    fn verify(&self) -> Result<(), MemoryError> {
        let size = self.size() as u64;
        if self.allocated_bytes > size || self.free_bytes > size || self.allocated_bytes + self.free_bytes != size {
            return Err(MemoryError::LogicError {
                reason: "arena byte accounting does not add up".into(),
            });
        }

        let mut by_size_count = 0usize;
        for (size, addrs) in &self.free_blocks_by_size {
            for addr in addrs {
                by_size_count += 1;
                if self.free_blocks_by_addr.get(addr) != Some(size) {
                    return Err(MemoryError::LogicError {
                        reason: "free block present in size index but not addr index".into(),
                    });
                }
            }
        }
        if by_size_count != self.free_blocks_by_addr.len() {
            return Err(MemoryError::LogicError {
                reason: "free block addr/size index cardinality mismatch".into(),
            });
        }

        let mut cursor = self.addr;
        let mut all_blocks: Vec<(u32, u32)> = self
            .allocated_blocks
            .iter()
            .chain(self.free_blocks_by_addr.iter())
            .map(|(a, s)| (*a, *s))
            .collect();
        all_blocks.sort_unstable_by_key(|(a, _)| *a);
        for (addr, size) in all_blocks {
            if addr < cursor {
                return Err(MemoryError::LogicError {
                    reason: "multiply-represented space in arena".into(),
                });
            }
            if addr > cursor {
                return Err(MemoryError::LogicError {
                    reason: "unrepresented space in arena".into(),
                });
            }
            cursor = addr + size;
        }
        if cursor != self.addr + self.size() {
            return Err(MemoryError::LogicError {
                reason: "arena blocks do not cover the full arena".into(),
            });
        }

        Ok(())
    }
}

/// Federation of arenas indexed by page number, owning the symbol table.
///
/// Arenas are held in a single owning `Vec` with stable [`ArenaId`] handles
/// rather than mirrored across several shared-ownership collections; nothing
/// here hands out a raw host pointer either.
pub struct MemoryContext {
    page_bits: u32,
    page_size: u32,
    total_pages: u32,

    size: u64,
    allocated_bytes: u64,
    free_bytes: u64,

    strict: bool,

    arenas: Vec<Option<Arena>>,
    arenas_by_addr: BTreeMap<u32, ArenaId>,
    page_index: Vec<Option<ArenaId>>,

    symbol_addrs: HashMap<String, u32>,
    addr_symbols: HashMap<u32, String>,
}

impl MemoryContext {
    /// Creates an empty memory context with the given page size, which must
    /// be a power of two.
    pub fn new(page_size: u32) -> Result<Self, MemoryError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(MemoryError::InvalidArgument {
                reason: "page size must be a nonzero power of two",
            });
        }
        let page_bits = page_size.trailing_zeros();
        let total_pages = (0x1_0000_0000u64 >> page_bits) as u32 - 1;

        Ok(MemoryContext {
            page_bits,
            page_size,
            total_pages,
            size: 0,
            allocated_bytes: 0,
            free_bytes: 0,
            strict: false,
            arenas: Vec::new(),
            arenas_by_addr: BTreeMap::new(),
            page_index: vec![None; total_pages as usize],
            symbol_addrs: HashMap::new(),
            addr_symbols: HashMap::new(),
        })
    }

    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    fn page_base_for_addr(&self, addr: u32) -> u32 {
        addr & !(self.page_size - 1)
    }

    fn page_number_for_addr(&self, addr: u32) -> u32 {
        self.page_base_for_addr(addr) >> self.page_bits
    }

    fn addr_for_page_number(&self, page_num: u32) -> u32 {
        page_num << self.page_bits
    }

    fn page_size_for_size(&self, size: u32) -> u32 {
        (size + (self.page_size - 1)) & !(self.page_size - 1)
    }

    fn page_count_for_size(&self, size: u32) -> u32 {
        self.page_size_for_size(size) >> self.page_bits
    }

    fn arena(&self, id: ArenaId) -> &Arena {
        self.arenas[id.0].as_ref().expect("dangling ArenaId")
    }

    fn arena_mut(&mut self, id: ArenaId) -> &mut Arena {
        self.arenas[id.0].as_mut().expect("dangling ArenaId")
    }

    /// Finds the arena covering every byte of `[addr, addr+size)`, or
    /// `OutOfRange` if the span is not entirely within one arena.
    fn find_arena_covering(&self, addr: u32, size: u32) -> Result<ArenaId, MemoryError> {
        let start_page = self.page_number_for_addr(addr);
        let end_page = self.page_number_for_addr(addr.wrapping_add(size).wrapping_sub(1));
        let id = self.page_index[start_page as usize].ok_or(MemoryError::OutOfRange {
            addr,
            len: size,
            reason: "address not within any arena",
        })?;
        for page in start_page + 1..=end_page {
            if self.page_index[page as usize] != Some(id) {
                return Err(MemoryError::OutOfRange {
                    addr,
                    len: size,
                    reason: "data not entirely contained within one arena",
                });
            }
        }
        Ok(id)
    }

    fn check_strict(&self, id: ArenaId, addr: u32, size: u32, skip_strict: bool) -> Result<(), MemoryError> {
        if self.strict && !skip_strict && !self.arena(id).is_within_allocated_block(addr, size) {
            return Err(MemoryError::OutOfRange {
                addr,
                len: size,
                reason: "data is not within an allocated block",
            });
        }
        Ok(())
    }

    /// Returns a byte slice of `len` bytes at `addr`, honoring strict mode.
    pub fn slice(&self, addr: u32, len: u32) -> Result<&[u8], MemoryError> {
        self.slice_skip_strict(addr, len, false)
    }

    fn slice_skip_strict(&self, addr: u32, len: u32, skip_strict: bool) -> Result<&[u8], MemoryError> {
        let id = self.find_arena_covering(addr, len)?;
        self.check_strict(id, addr, len, skip_strict)?;
        let arena = self.arena(id);
        let start = (addr - arena.addr) as usize;
        Ok(&arena.buffer[start..start + len as usize])
    }

    /// Returns a mutable byte slice of `len` bytes at `addr`, honoring
    /// strict mode.
    pub fn slice_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], MemoryError> {
        let id = self.find_arena_covering(addr, len)?;
        self.check_strict(id, addr, len, false)?;
        let arena = self.arena_mut(id);
        let start = (addr - arena.addr) as usize;
        Ok(&mut arena.buffer[start..start + len as usize])
    }

    // --- scalar reads/writes ---

    pub fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        Ok(self.slice(addr, 1)?[0])
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.slice_mut(addr, 1)?[0] = value;
        Ok(())
    }

    pub fn read_s8(&self, addr: u32) -> Result<i8, MemoryError> {
        Ok(self.read_u8(addr)? as i8)
    }

    pub fn write_s8(&mut self, addr: u32, value: i8) -> Result<(), MemoryError> {
        self.write_u8(addr, value as u8)
    }

    pub fn read_u16b(&self, addr: u32) -> Result<u16, MemoryError> {
        let s = self.slice(addr, 2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn write_u16b(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.slice_mut(addr, 2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn read_u16l(&self, addr: u32) -> Result<u16, MemoryError> {
        let s = self.slice(addr, 2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn write_u16l(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.slice_mut(addr, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_s16b(&self, addr: u32) -> Result<i16, MemoryError> {
        Ok(self.read_u16b(addr)? as i16)
    }

    pub fn write_s16b(&mut self, addr: u32, value: i16) -> Result<(), MemoryError> {
        self.write_u16b(addr, value as u16)
    }

    pub fn read_u32b(&self, addr: u32) -> Result<u32, MemoryError> {
        let s = self.slice(addr, 4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn write_u32b(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.slice_mut(addr, 4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn read_u32l(&self, addr: u32) -> Result<u32, MemoryError> {
        let s = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn write_u32l(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.slice_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_s32b(&self, addr: u32) -> Result<i32, MemoryError> {
        Ok(self.read_u32b(addr)? as i32)
    }

    pub fn write_s32b(&mut self, addr: u32, value: i32) -> Result<(), MemoryError> {
        self.write_u32b(addr, value as u32)
    }

    pub fn read(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        Ok(self.slice(addr, len)?.to_vec())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.slice_mut(addr, data.len() as u32)?.copy_from_slice(data);
        Ok(())
    }

    pub fn memcpy_mem_to_mem(&mut self, dst: u32, src: u32, n: u32) -> Result<(), MemoryError> {
        let data = self.read(src, n)?;
        self.write(dst, &data)
    }

    pub fn memcpy_host_to_mem(&mut self, dst: u32, src: &[u8]) -> Result<(), MemoryError> {
        self.write(dst, src)
    }

    pub fn memcpy_mem_to_host(&self, dst: &mut [u8], src: u32) -> Result<(), MemoryError> {
        dst.copy_from_slice(self.slice(src, dst.len() as u32)?);
        Ok(())
    }

    pub fn memset(&mut self, addr: u32, value: u8, n: u32) -> Result<(), MemoryError> {
        self.slice_mut(addr, n)?.fill(value);
        Ok(())
    }

    pub fn read_cstring(&self, addr: u32) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::new();
        let mut a = addr;
        loop {
            let b = self.read_u8(a)?;
            if b == 0 {
                break;
            }
            out.push(b);
            a = a.wrapping_add(1);
        }
        Ok(out)
    }

    pub fn write_cstring(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let mut buf = data.to_vec();
        buf.push(0);
        self.write(addr, &buf)
    }

    pub fn read_pstring(&self, addr: u32) -> Result<Vec<u8>, MemoryError> {
        let len = self.read_u8(addr)? as u32;
        self.read(addr + 1, len)
    }

    pub fn write_pstring(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() > 0xFF {
            return Err(MemoryError::InvalidArgument {
                reason: "string too long for pstring buffer",
            });
        }
        self.write_u8(addr, data.len() as u8)?;
        self.write(addr + 1, data)
    }

    // --- allocation ---

    pub fn allocate(&mut self, size: u32) -> Result<u32, MemoryError> {
        self.allocate_within(self.page_size, 0xFFFF_FFFF, size)
    }

    pub fn allocate_within(&mut self, lo: u32, hi: u32, size: u32) -> Result<u32, MemoryError> {
        let n = (size + 3) & !3;

        let mut best: Option<(ArenaId, u32, u32)> = None; // (arena, addr, size)
        for (&arena_addr, &id) in self.arenas_by_addr.range(lo..) {
            let arena_size = self.arena(id).size();
            if arena_addr as u64 + arena_size as u64 >= hi as u64 {
                continue;
            }
            if let Some((addr, block_size)) = self.arena(id).smallest_fitting_free_block(n) {
                let better = match best {
                    None => true,
                    Some((_, _, best_size)) => block_size < best_size,
                };
                if better {
                    best = Some((id, addr, block_size));
                }
            }
        }

        let (id, block_addr, block_size) = match best {
            Some(t) => t,
            None => {
                let addr = self.find_unallocated_arena_space(lo, hi, n)?;
                let id = self.create_arena(addr, n)?;
                (id, addr, self.arena(id).size())
            }
        };

        self.arena_mut(id).split_free_block(block_addr, block_size, block_addr, n)?;
        self.free_bytes -= n as u64;
        self.allocated_bytes += n as u64;
        log::trace!("allocate: {n} bytes at {block_addr:#010X}");
        Ok(block_addr)
    }

    pub fn allocate_at(&mut self, addr: u32, size: u32) -> Result<(), MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::InvalidArgument {
                reason: "allocate_at address must be 4-byte aligned",
            });
        }
        let n = (size + 3) & !3;

        let id = match self.find_arena_covering(addr, n) {
            Ok(id) => id,
            Err(_) => {
                let arena_base = self.page_base_for_addr(addr);
                self.create_arena(arena_base, n + (addr - arena_base))?
            }
        };

        let (block_addr, block_size) = self
            .arena(id)
            .free_blocks_by_addr
            .range(..=addr)
            .next_back()
            .map(|(a, s)| (*a, *s))
            .ok_or(MemoryError::InvalidArgument {
                reason: "no free block covers the requested range",
            })?;
        if block_addr > addr || block_addr as u64 + block_size as u64 < addr as u64 + n as u64 {
            return Err(MemoryError::InvalidArgument {
                reason: "requested range is not entirely free",
            });
        }

        self.arena_mut(id).split_free_block(block_addr, block_size, addr, n)?;
        self.free_bytes -= n as u64;
        self.allocated_bytes += n as u64;
        Ok(())
    }

    pub fn preallocate_arena(&mut self, addr: u32, size: u32) -> Result<(), MemoryError> {
        if self.exists(addr, size, true) {
            return Ok(());
        }
        let arena_base = self.page_base_for_addr(addr);
        self.create_arena(arena_base, size + (addr - arena_base))?;
        Ok(())
    }

    fn find_unallocated_arena_space(&self, lo: u32, hi: u32, size: u32) -> Result<u32, MemoryError> {
        let page_count = self.page_count_for_size(size);
        let lo_page = self.page_number_for_addr(lo);
        let hi_page = self.page_number_for_addr(hi.saturating_sub(1)).min(self.total_pages.saturating_sub(1));

        let mut run_start: Option<u32> = None;
        let mut run_len = 0u32;
        for page in lo_page..=hi_page {
            if self.page_index[page as usize].is_none() {
                if run_start.is_none() {
                    run_start = Some(page);
                }
                run_len += 1;
                if run_len >= page_count {
                    return Ok(self.addr_for_page_number(run_start.unwrap()));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        Err(MemoryError::OutOfRange {
            addr: lo,
            len: size,
            reason: "no unallocated space found in range",
        })
    }

    fn create_arena(&mut self, addr: u32, min_size: u32) -> Result<ArenaId, MemoryError> {
        let size = self.page_size_for_size(min_size);
        let start_page = self.page_number_for_addr(addr);
        let end_page = self.page_number_for_addr(addr + size - 1);
        for page in start_page..=end_page {
            if self.page_index[page as usize].is_some() {
                return Err(MemoryError::LogicError {
                    reason: "create_arena: page already mapped".into(),
                });
            }
        }

        let arena = Arena::new(addr, size);
        let slot = self.arenas.len();
        self.arenas.push(Some(arena));
        let id = ArenaId(slot);
        self.arenas_by_addr.insert(addr, id);
        for page in start_page..=end_page {
            self.page_index[page as usize] = Some(id);
        }

        self.size += size as u64;
        self.free_bytes += size as u64;
        log::debug!("create_arena: [{addr:#010X}, {:#010X})", addr as u64 + size as u64);
        Ok(id)
    }

    fn delete_arena(&mut self, id: ArenaId) -> Result<(), MemoryError> {
        let (addr, size, allocated_bytes, free_bytes) = {
            let arena = self.arena(id);
            (arena.addr, arena.size(), arena.allocated_bytes, arena.free_bytes)
        };
        self.arenas_by_addr.remove(&addr).ok_or_else(|| MemoryError::LogicError {
            reason: "delete_arena: missing from addr index".into(),
        })?;
        let start_page = self.page_number_for_addr(addr);
        let end_page = self.page_number_for_addr(addr + size - 1);
        for page in start_page..=end_page {
            if self.page_index[page as usize] != Some(id) {
                return Err(MemoryError::LogicError {
                    reason: "delete_arena: page index mismatch".into(),
                });
            }
            self.page_index[page as usize] = None;
        }
        self.arenas[id.0] = None;

        self.size -= size as u64;
        self.allocated_bytes -= allocated_bytes;
        self.free_bytes -= free_bytes;
        log::debug!("delete_arena: [{addr:#010X}, {:#010X})", addr as u64 + size as u64);
        Ok(())
    }

    pub fn free(&mut self, addr: u32) -> Result<(), MemoryError> {
        let id = self.find_arena_covering(addr, 1)?;
        let size = *self.arena(id).allocated_blocks.get(&addr).ok_or(MemoryError::InvalidArgument {
            reason: "no allocated block at this address",
        })?;

        {
            let arena = self.arena_mut(id);
            arena.allocated_blocks.remove(&addr);
        }

        if self.arena(id).allocated_blocks.is_empty() {
            self.delete_arena(id)?;
            return Ok(());
        }

        let arena = self.arena_mut(id);
        let mut merged_addr = addr;
        let mut merged_size = size;

        if let Some((&before_addr, &before_size)) = arena.free_blocks_by_addr.range(..addr).next_back() {
            if before_addr + before_size == addr {
                arena.delete_free_block(before_addr, before_size);
                merged_addr = before_addr;
                merged_size += before_size;
            }
        }
        if let Some(&after_size) = arena.free_blocks_by_addr.get(&(merged_addr + merged_size)) {
            arena.delete_free_block(merged_addr + merged_size, after_size);
            merged_size += after_size;
        }
        arena.insert_free_block(merged_addr, merged_size);

        arena.allocated_bytes -= size as u64;
        arena.free_bytes += size as u64;
        self.allocated_bytes -= size as u64;
        self.free_bytes += size as u64;
        Ok(())
    }

    pub fn resize(&mut self, addr: u32, new_size: u32) -> Result<bool, MemoryError> {
        let new_size = (new_size + 3) & !3;
        let id = self.find_arena_covering(addr, 1)?;
        let existing_size = *self.arena(id).allocated_blocks.get(&addr).ok_or(MemoryError::InvalidArgument {
            reason: "no allocated block at this address",
        })?;
        if new_size == existing_size {
            return Ok(true);
        }

        let arena = self.arena_mut(id);
        let following_free_addr = addr + existing_size;
        let following_free_size = arena.free_blocks_by_addr.get(&following_free_addr).copied().unwrap_or(0);

        if new_size > existing_size {
            let growth = new_size - existing_size;
            if growth > following_free_size {
                return Ok(false);
            }
            if following_free_size > 0 {
                arena.delete_free_block(following_free_addr, following_free_size);
            }
            let remaining = following_free_size - growth;
            if remaining > 0 {
                arena.insert_free_block(addr + new_size, remaining);
            }
            arena.allocated_blocks.insert(addr, new_size);
            arena.allocated_bytes += growth as u64;
            arena.free_bytes -= growth as u64;
            self.allocated_bytes += growth as u64;
            self.free_bytes -= growth as u64;
        } else {
            let shrink = existing_size - new_size;
            if following_free_size > 0 {
                arena.delete_free_block(following_free_addr, following_free_size);
            }
            arena.insert_free_block(addr + new_size, following_free_size + shrink);
            arena.allocated_blocks.insert(addr, new_size);
            arena.allocated_bytes -= shrink as u64;
            arena.free_bytes += shrink as u64;
            self.allocated_bytes -= shrink as u64;
            self.free_bytes += shrink as u64;
        }
        Ok(true)
    }

    pub fn get_block_size(&self, addr: u32) -> u32 {
        self.find_arena_covering(addr, 1)
            .ok()
            .and_then(|id| self.arena(id).allocated_blocks.get(&addr).copied())
            .unwrap_or(0)
    }

    pub fn exists(&self, addr: u32, size: u32, skip_strict: bool) -> bool {
        if size == 0 {
            return false;
        }
        self.slice_skip_strict(addr, size, skip_strict).is_ok()
    }

    pub fn allocated_blocks(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for id in self.arenas_by_addr.values() {
            out.extend(self.arena(*id).allocated_blocks.iter().map(|(a, s)| (*a, *s)));
        }
        out
    }

    // --- symbols ---

    pub fn set_symbol_addr(&mut self, name: &str, addr: u32) -> Result<(), MemoryError> {
        if self.symbol_addrs.contains_key(name) {
            return Err(MemoryError::InvalidArgument {
                reason: "symbol name already bound",
            });
        }
        if self.addr_symbols.contains_key(&addr) {
            return Err(MemoryError::LogicError {
                reason: "address already has a symbol".into(),
            });
        }
        self.symbol_addrs.insert(name.to_string(), addr);
        self.addr_symbols.insert(addr, name.to_string());
        Ok(())
    }

    pub fn delete_symbol_by_name(&mut self, name: &str) {
        if let Some(addr) = self.symbol_addrs.remove(name) {
            self.addr_symbols.remove(&addr);
        }
    }

    pub fn delete_symbol_by_addr(&mut self, addr: u32) {
        if let Some(name) = self.addr_symbols.remove(&addr) {
            self.symbol_addrs.remove(&name);
        }
    }

    pub fn get_symbol_addr(&self, name: &str) -> Option<u32> {
        self.symbol_addrs.get(name).copied()
    }

    pub fn get_symbol_at_addr(&self, addr: u32) -> Option<&str> {
        self.addr_symbols.get(&addr).map(String::as_str)
    }

    pub fn all_symbols(&self) -> &HashMap<String, u32> {
        &self.symbol_addrs
    }

    // --- persistence ---

    /// Serializes all allocated regions and the symbol table.
    pub fn export_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1u8); // version

        let mut regions: BTreeMap<u32, u32> = BTreeMap::new();
        for id in self.arenas_by_addr.values() {
            regions.extend(self.arena(*id).allocated_blocks.iter().map(|(a, s)| (*a, *s)));
        }

        out.extend_from_slice(&(regions.len() as u64).to_le_bytes());
        for (&addr, &size) in &regions {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(self.slice(addr, size).expect("allocated region must be readable"));
        }

        out.extend_from_slice(&(self.symbol_addrs.len() as u64).to_le_bytes());
        for (name, &addr) in &self.symbol_addrs {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&(name.len() as u64).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }

        out
    }

    /// Replaces all state with the contents of a buffer produced by
    /// [`Self::export_state`].
    pub fn import_state(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        let addrs: Vec<u32> = self.arenas_by_addr.keys().copied().collect();
        for addr in addrs {
            if let Some(id) = self.arenas_by_addr.get(&addr).copied() {
                self.delete_arena(id)?;
            }
        }
        self.symbol_addrs.clear();
        self.addr_symbols.clear();

        let mut cursor = 0usize;
        let mut take = |n: usize| -> Result<&[u8], MemoryError> {
            let end = cursor + n;
            let slice = data.get(cursor..end).ok_or(MemoryError::InvalidArgument {
                reason: "truncated memory image",
            })?;
            cursor = end;
            Ok(slice)
        };

        let version = *take(1)?.first().unwrap();
        if version > 1 {
            return Err(MemoryError::InvalidArgument {
                reason: "unsupported memory image version",
            });
        }

        let region_count = u64::from_le_bytes(take(8)?.try_into().unwrap());
        for _ in 0..region_count {
            let addr = u32::from_le_bytes(take(4)?.try_into().unwrap());
            let size = u32::from_le_bytes(take(4)?.try_into().unwrap());
            self.allocate_at(addr, size)?;
            let bytes = take(size as usize)?.to_vec();
            self.write(addr, &bytes)?;
        }

        if version >= 1 {
            let symbol_count = u64::from_le_bytes(take(8)?.try_into().unwrap());
            for _ in 0..symbol_count {
                let addr = u32::from_le_bytes(take(4)?.try_into().unwrap());
                let name_length = u64::from_le_bytes(take(8)?.try_into().unwrap());
                let name = String::from_utf8(take(name_length as usize)?.to_vec()).map_err(|_| {
                    MemoryError::InvalidArgument {
                        reason: "symbol name is not valid UTF-8",
                    }
                })?;
                self.symbol_addrs.insert(name.clone(), addr);
                self.addr_symbols.insert(addr, name);
            }
        }

        Ok(())
    }

    /// Cross-checks every bookkeeping invariant: allocated/free byte totals
    /// against arena size, the addr-indexed and size-indexed free maps
    /// against each other, and block adjacency (no two free blocks should
    /// ever be left touching uncoalesced).
    pub fn verify(&self) -> Result<(), MemoryError> {
        if self.allocated_bytes > self.size
            || self.free_bytes > self.size
            || self.allocated_bytes + self.free_bytes != self.size
        {
            return Err(MemoryError::LogicError {
                reason: "context byte accounting does not add up".into(),
            });
        }

        for (&addr, &id) in &self.arenas_by_addr {
            let arena = self.arena(id);
            if arena.addr != addr {
                return Err(MemoryError::LogicError {
                    reason: "arena addr index key mismatch".into(),
                });
            }
            let start_page = self.page_number_for_addr(arena.addr);
            let end_page = self.page_number_for_addr(arena.addr + arena.size() - 1);
            for page in start_page..=end_page {
                if self.page_index[page as usize] != Some(id) {
                    return Err(MemoryError::LogicError {
                        reason: "page index does not point back to its arena".into(),
                    });
                }
            }
            arena.verify()?;
        }

        Ok(())
    }

    /// A human-readable dump for `log::trace!`/test diagnostics.
    pub fn debug_dump(&self) -> String {
        let mut out = format!(
            "MemoryContext {{ size: {}, allocated: {}, free: {}, arenas: {} }}\n",
            self.size,
            self.allocated_bytes,
            self.free_bytes,
            self.arenas_by_addr.len()
        );
        for (&addr, &id) in &self.arenas_by_addr {
            let arena = self.arena(id);
            out += &format!(
                "  arena [{:#010X}, {:#010X}) allocated={} free={}\n",
                addr,
                addr as u64 + arena.size() as u64,
                arena.allocated_bytes,
                arena.free_bytes
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_empty() {
        let ctx = MemoryContext::new(4096).unwrap();
        assert_eq!(ctx.size(), 0);
        assert_eq!(ctx.allocated_bytes(), 0);
        assert_eq!(ctx.free_bytes(), 0);
    }

    #[test]
    fn two_allocations_are_distinct_and_aligned() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        let a = ctx.allocate(100).unwrap();
        let b = ctx.allocate(100).unwrap();
        assert_ne!(a, b);
        assert!(a >= 4096);
        assert!(b >= 4096);
        assert_eq!(a % 4, 0);
        assert_eq!(b % 4, 0);
        assert!(a.abs_diff(b) >= 100);
        ctx.verify().unwrap();
    }

    #[test]
    fn allocate_at_then_free_deletes_arena() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        ctx.allocate_at(0x10000, 0x200).unwrap();
        assert!(ctx.size() > 0);
        ctx.free(0x10000).unwrap();
        assert_eq!(ctx.size(), 0);
    }

    #[test]
    fn freeing_adjacent_blocks_merges_free_map() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        ctx.preallocate_arena(0x10000, 0x10000).unwrap();
        ctx.allocate_at(0x10000, 100).unwrap();
        ctx.allocate_at(0x10200, 100).unwrap();
        ctx.free(0x10000).unwrap();
        ctx.free(0x10200).unwrap();
        ctx.verify().unwrap();
        assert_eq!(ctx.allocated_bytes(), 0);
    }

    #[test]
    fn export_import_round_trip_preserves_contents_and_symbols() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        let addr = ctx.allocate(16).unwrap();
        ctx.write(addr, b"hello world12345").unwrap();
        ctx.set_symbol_addr("thing", addr).unwrap();

        let blob = ctx.export_state();

        let mut ctx2 = MemoryContext::new(4096).unwrap();
        ctx2.import_state(&blob).unwrap();

        assert_eq!(ctx2.allocated_blocks(), ctx.allocated_blocks());
        assert_eq!(ctx2.get_symbol_addr("thing"), Some(addr));
        assert_eq!(ctx2.read(addr, 16).unwrap(), b"hello world12345");
    }

    #[test]
    fn delete_symbol_is_idempotent() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        let addr = ctx.allocate(4).unwrap();
        ctx.set_symbol_addr("x", addr).unwrap();
        ctx.delete_symbol_by_name("x");
        ctx.delete_symbol_by_name("x");
        assert_eq!(ctx.get_symbol_addr("x"), None);
    }

    #[test]
    fn exists_matches_at_outside_strict_mode() {
        let mut ctx = MemoryContext::new(4096).unwrap();
        let addr = ctx.allocate(8).unwrap();
        assert!(ctx.exists(addr, 8, false));
        assert!(!ctx.exists(0xFFFF_0000, 8, false));
    }
}
