//! End-to-end scenarios exercising the memory context, interpreter, and
//! disassembler together through the public API.

use std::collections::BTreeMap;

use m68k_arena_emu::disassembler::disassemble_one;
use m68k_arena_emu::memory::MemoryContext;
use m68k_arena_emu::Emulator;

#[test]
fn two_allocations_are_distinct_aligned_and_non_overlapping() {
    let mut mem = MemoryContext::new(4096).unwrap();
    let a = mem.allocate(100).unwrap();
    let b = mem.allocate(100).unwrap();

    assert_ne!(a, b);
    assert!(a >= 4096);
    assert!(b >= 4096);
    assert_eq!(a % 4, 0);
    assert_eq!(b % 4, 0);
    assert!(a.abs_diff(b) >= 100);
}

#[test]
fn freeing_the_only_block_in_an_arena_deletes_the_arena() {
    let mut mem = MemoryContext::new(4096).unwrap();
    mem.allocate_at(0x10000, 0x200).unwrap();
    mem.free(0x10000).unwrap();
    assert_eq!(mem.size(), 0);
}

#[test]
fn freeing_adjacent_blocks_coalesces_into_one_free_range() {
    let mut mem = MemoryContext::new(4096).unwrap();
    mem.allocate_at(0x10000, 0x10000).unwrap();
    let a = mem.allocate_within(0x10000, 0x20000, 100).unwrap();
    let b = mem.allocate_within(0x10000, 0x20000, 100).unwrap();
    mem.free(a).unwrap();
    mem.free(b).unwrap();
    assert!(mem.verify().is_ok());
    assert_eq!(mem.allocated_bytes(), 0);
}

#[test]
fn moveq_loads_a_register_and_clears_flags() {
    let mut mem = MemoryContext::new(4096).unwrap();
    let addr = mem.allocate(16).unwrap();
    mem.write_u16b(addr, 0x702A).unwrap(); // moveq #42, D0

    let mut emu = Emulator::new(mem);
    emu.registers.pc = addr;
    emu.step().unwrap();

    assert_eq!(emu.registers.d[0], 0x0000_002A);
    assert!(!emu.registers.get_n());
    assert!(!emu.registers.get_z());
    assert!(!emu.registers.get_v());
    assert!(!emu.registers.get_c());
    assert_eq!(emu.registers.pc, addr + 2);
}

#[test]
fn add_word_sets_carry_extend_and_negative_on_overflow() {
    let mut mem = MemoryContext::new(4096).unwrap();
    let addr = mem.allocate(16).unwrap();
    mem.write_u16b(addr, 0xD040).unwrap(); // add.w D0, D0

    let mut emu = Emulator::new(mem);
    emu.registers.pc = addr;
    emu.registers.d[0] = 0x0000_FFFF;
    emu.step().unwrap();

    assert_eq!(emu.registers.d[0], 0x0000_FFFE);
    assert!(emu.registers.get_n());
    assert!(!emu.registers.get_z());
    assert!(!emu.registers.get_v());
    assert!(emu.registers.get_c());
    assert!(emu.registers.get_x());
}

#[test]
fn bsr_then_rts_returns_to_the_instruction_after_the_call() {
    let mut mem = MemoryContext::new(4096).unwrap();
    let addr = mem.allocate(16).unwrap();
    mem.write_u16b(addr, 0x6102).unwrap(); // bsr.b +2 (relative to pc+2, lands on the second rts)
    mem.write_u16b(addr + 2, 0x4E75).unwrap(); // rts (skipped)
    mem.write_u16b(addr + 4, 0x4E75).unwrap(); // rts (the call target)

    let mut emu = Emulator::new(mem);
    emu.registers.pc = addr;
    emu.registers.a[7] = 0x1000;

    emu.step().unwrap(); // bsr
    emu.step().unwrap(); // rts at target

    assert_eq!(emu.registers.pc, addr + 2);
    assert_eq!(emu.registers.a[7], 0x1000);
}

#[test]
fn disassemble_one_renders_moveq_with_pc_and_operands() {
    let line = disassemble_one(&[0x70, 0x2A], 0x0000_1000);
    assert!(line.starts_with("00001000"));
    assert!(line.contains("moveq.l"));
    assert!(line.contains("D0, 0x2A"));
}

#[test]
fn reflow_labels_a_branch_target_skipped_by_the_linear_scan() {
    let code = [0x60, 0x02, 0x00, 0x00, 0x70, 0x2A]; // bra.b +4; (skipped word); moveq #42, D0
    let labels = BTreeMap::new();
    let text = m68k_arena_emu::disassembler::disassemble(&code, 0, &labels, None, None);
    assert!(text.contains("label00000004") || text.contains("fn00000004"));
}
