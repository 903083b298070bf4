//! Effective address resolution: decodes the 6-bit mode/register field
//! shared by almost every 68000 instruction into a [`ResolvedAddress`],
//! consuming any extension words from the instruction stream as it goes.

use crate::error::EmulatorError;
use crate::memory::MemoryContext;
use crate::registers::Registers;
use crate::utils::{sign_extend, Size};

/// Where an effective address actually points, after decoding. Kept as a
/// tagged enum rather than a bare `u32` so that `Dn`/`An`/`CCR` destinations
/// are handled without aliasing them onto fake memory addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedAddress {
    DataReg(u8),
    AddrReg(u8),
    /// The condition code register, addressed directly (`move ccr, <ea>` and
    /// friends).
    Status,
    Memory(u32),
}

/// Fetches the word at `regs.pc` and advances `pc` past it. Also used by the
/// interpreter to fetch immediates and extension words outside of EA
/// resolution proper.
pub(crate) fn fetch_word(regs: &mut Registers, mem: &MemoryContext) -> Result<u16, EmulatorError> {
    let w = mem.read_u16b(regs.pc)?;
    regs.pc = regs.pc.wrapping_add(2);
    Ok(w)
}

/// Fetches the longword at `regs.pc` and advances `pc` past it.
pub(crate) fn fetch_long(regs: &mut Registers, mem: &MemoryContext) -> Result<u32, EmulatorError> {
    let v = mem.read_u32b(regs.pc)?;
    regs.pc = regs.pc.wrapping_add(4);
    Ok(v)
}

/// Register-direct increment amount for `(An)+`/`-(An)`. `A7` steps by 2
/// even at byte size, to keep the stack pointer word-aligned.
fn step_for(reg: u8, size: Size) -> u32 {
    if reg == 7 && matches!(size, Size::Byte) {
        2
    } else {
        size.bytes()
    }
}

/// Decodes a brief extension word for `d8(An,Xn)` / `d8(PC,Xn)` indexed
/// modes. `base` is the address the displacement and index are added to:
/// the address register's value, or (per this port's PC-relative rule) the
/// address of the extension word itself, captured before it is consumed.
fn resolve_indexed(regs: &mut Registers, mem: &MemoryContext, base: u32) -> Result<u32, EmulatorError> {
    let ext = fetch_word(regs, mem)?;
    if ext & 0x0100 != 0 {
        return Err(EmulatorError::Unimplemented {
            opcode: ext,
            reason: "full (68020) extension word indexed addressing is not executed",
        });
    }

    let xn = ((ext >> 12) & 0x7) as usize;
    let is_addr_reg = ext & 0x8000 != 0;
    let use_long = ext & 0x0800 != 0;
    let index_raw = if is_addr_reg { regs.a[xn] } else { regs.d[xn] };
    let index = if use_long { index_raw } else { sign_extend(index_raw, Size::Word) as u32 };
    let disp = (ext as i8) as i32 as u32;

    Ok(base.wrapping_add(disp).wrapping_add(index))
}

/// Resolves any addressing mode, including register-direct, immediate, and
/// the auto-increment/decrement memory modes. `mode`/`reg` are the 3-bit
/// fields from the low 6 bits of the opcode (mode in bits 5-3, register in
/// bits 2-0).
pub fn resolve_address(
    regs: &mut Registers,
    mem: &MemoryContext,
    mode: u8,
    reg: u8,
    size: Size,
) -> Result<ResolvedAddress, EmulatorError> {
    match mode {
        0 => Ok(ResolvedAddress::DataReg(reg)),
        1 => Ok(ResolvedAddress::AddrReg(reg)),
        2 => Ok(ResolvedAddress::Memory(regs.a[reg as usize])),
        3 => {
            let addr = regs.a[reg as usize];
            regs.a[reg as usize] = addr.wrapping_add(step_for(reg, size));
            Ok(ResolvedAddress::Memory(addr))
        }
        4 => {
            let addr = regs.a[reg as usize].wrapping_sub(step_for(reg, size));
            regs.a[reg as usize] = addr;
            Ok(ResolvedAddress::Memory(addr))
        }
        5 => {
            let disp = sign_extend(fetch_word(regs, mem)? as u32, Size::Word) as u32;
            Ok(ResolvedAddress::Memory(regs.a[reg as usize].wrapping_add(disp)))
        }
        6 => {
            let base = regs.a[reg as usize];
            Ok(ResolvedAddress::Memory(resolve_indexed(regs, mem, base)?))
        }
        7 => match reg {
            0 => {
                let addr = sign_extend(fetch_word(regs, mem)? as u32, Size::Word) as u32;
                Ok(ResolvedAddress::Memory(addr))
            }
            1 => Ok(ResolvedAddress::Memory(fetch_long(regs, mem)?)),
            2 => {
                let ext_addr = regs.pc;
                let disp = sign_extend(fetch_word(regs, mem)? as u32, Size::Word) as u32;
                Ok(ResolvedAddress::Memory(ext_addr.wrapping_add(disp)))
            }
            3 => {
                let ext_addr = regs.pc;
                Ok(ResolvedAddress::Memory(resolve_indexed(regs, mem, ext_addr)?))
            }
            4 => {
                let addr = regs.pc;
                // Byte-sized immediates still occupy a full word, low byte.
                let step = if matches!(size, Size::Long) { 4 } else { 2 };
                regs.pc = regs.pc.wrapping_add(step);
                let addr = if matches!(size, Size::Byte) { addr + 1 } else { addr };
                Ok(ResolvedAddress::Memory(addr))
            }
            _ => Err(EmulatorError::InvalidArgument {
                reason: "reserved addressing mode 111/10x",
            }),
        },
        _ => unreachable!("mode is a 3-bit field"),
    }
}

/// Resolves a "control" addressing mode: memory-only, no register-direct,
/// no auto-increment/decrement, and no immediate. Used by `jmp`, `jsr`,
/// `lea`, `pea` and the control forms of `movem`.
pub fn resolve_address_control(
    regs: &mut Registers,
    mem: &MemoryContext,
    mode: u8,
    reg: u8,
) -> Result<u32, EmulatorError> {
    match mode {
        0 | 1 | 3 | 4 => Err(EmulatorError::InvalidArgument {
            reason: "addressing mode is not a valid control address",
        }),
        7 if reg == 4 => Err(EmulatorError::InvalidArgument {
            reason: "immediate is not a valid control address",
        }),
        _ => match resolve_address(regs, mem, mode, reg, Size::Long)? {
            ResolvedAddress::Memory(addr) => Ok(addr),
            _ => unreachable!("control modes only resolve to memory"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MemoryContext {
        let mut mem = MemoryContext::new(4096).unwrap();
        mem.allocate_at(0, 0x10000).unwrap();
        mem
    }

    #[test]
    fn data_register_direct() {
        let mut regs = Registers::new();
        let mem = ctx();
        let ea = resolve_address(&mut regs, &mem, 0, 3, Size::Long).unwrap();
        assert_eq!(ea, ResolvedAddress::DataReg(3));
    }

    #[test]
    fn postincrement_advances_by_size() {
        let mut regs = Registers::new();
        regs.a[0] = 0x1000;
        let mem = ctx();
        let ea = resolve_address(&mut regs, &mem, 3, 0, Size::Word).unwrap();
        assert_eq!(ea, ResolvedAddress::Memory(0x1000));
        assert_eq!(regs.a[0], 0x1002);
    }

    #[test]
    fn predecrement_a7_byte_steps_by_two() {
        let mut regs = Registers::new();
        regs.a[7] = 0x1000;
        let mem = ctx();
        let ea = resolve_address(&mut regs, &mem, 4, 7, Size::Byte).unwrap();
        assert_eq!(ea, ResolvedAddress::Memory(0x0FFE));
        assert_eq!(regs.a[7], 0x0FFE);
    }

    #[test]
    fn pc_relative_uses_extension_word_address() {
        let mut regs = Registers::new();
        regs.pc = 0x2000;
        let mut mem = ctx();
        mem.write_u16b(0x2000, 0x0010).unwrap(); // displacement +16
        let ea = resolve_address(&mut regs, &mem, 7, 2, Size::Word).unwrap();
        assert_eq!(ea, ResolvedAddress::Memory(0x2010));
        assert_eq!(regs.pc, 0x2002);
    }

    #[test]
    fn immediate_consumes_a_full_word_for_byte_size() {
        let mut regs = Registers::new();
        regs.pc = 0x3000;
        let mem = ctx();
        let ea = resolve_address(&mut regs, &mem, 7, 4, Size::Byte).unwrap();
        assert_eq!(ea, ResolvedAddress::Memory(0x3000));
        assert_eq!(regs.pc, 0x3002);
    }

    #[test]
    fn control_rejects_register_direct_and_immediate() {
        let mut regs = Registers::new();
        let mem = ctx();
        assert!(resolve_address_control(&mut regs, &mem, 0, 0).is_err());
        assert!(resolve_address_control(&mut regs, &mem, 7, 4).is_err());
    }
}
