//! Disassembles 68000/68020 user-mode code into human-readable text.
//!
//! [`disassemble_one`] decodes a single instruction with no branch-target
//! bookkeeping; [`disassemble`] drives the full reflow algorithm: a linear
//! pass collects branch targets, any word-aligned target the linear pass
//! missed is re-disassembled in a "backup branch",
//! backup branches can themselves discover further back-edges (iterated to a
//! fixed point), and the final text interleaves user labels, auto-generated
//! branch labels, and bracketed alternate-branch regions in PC order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::utils::{bits, sign_extend, Size};

/// Looks up a name for a low-memory global (address `< 0x00010000`); the
/// table's contents are owned by the embedder, this crate defines only the
/// seam.
pub trait LowMemoryGlobals {
    fn name_for(&self, addr: u32) -> Option<&str>;
}

/// Looks up a mnemonic name for a Line-A/Line-F trap opcode; the table's
/// contents are owned by the embedder.
pub trait TrapNames {
    fn name_for(&self, opcode: u16) -> Option<&str>;
}

/// A byte cursor over the code being disassembled, tracking the virtual
/// address each byte corresponds to.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    base_addr: u32,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], base_addr: u32) -> Self {
        Cursor { data, pos: 0, base_addr }
    }

    fn pc(&self) -> u32 {
        self.base_addr.wrapping_add(self.pos as u32)
    }

    fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let hi = *self.data.get(self.pos)? as u16;
        let lo = *self.data.get(self.pos + 1)? as u16;
        self.pos += 2;
        Some((hi << 8) | lo)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Some((hi << 16) | lo)
    }

    fn peek_byte_at(&self, addr: u32) -> Option<u8> {
        let offset = addr.wrapping_sub(self.base_addr) as usize;
        self.data.get(offset).copied()
    }

    fn peek_slice_at(&self, addr: u32, len: usize) -> Option<&'a [u8]> {
        let offset = addr.wrapping_sub(self.base_addr) as usize;
        self.data.get(offset..offset + len)
    }
}

// ---------------------------------------------------------------------
// Formatting helpers.
// ---------------------------------------------------------------------

/// Prints an immediate as `0xH...`, with a trailing `/* "..." */` gloss when
/// every byte of the value (at its size) is printable ASCII or whitespace.
fn format_immediate(value: u32, size: Size) -> String {
    let bytes: Vec<u8> = match size {
        Size::Byte => vec![value as u8],
        Size::Word => vec![(value >> 8) as u8, value as u8],
        Size::Long => vec![(value >> 24) as u8, (value >> 16) as u8, (value >> 8) as u8, value as u8],
    };
    let base = format!("{:#X}", value);
    if bytes.iter().all(|&b| (0x20..=0x7E).contains(&b) || b == b'\t' || b == b'\r' || b == b'\n') {
        let gloss: String = bytes
            .iter()
            .map(|&b| match b {
                b'\r' => "\\r".to_string(),
                b'\n' => "\\n".to_string(),
                b'\t' => "\\t".to_string(),
                b'\'' => "\\'".to_string(),
                b'"' => "\\\"".to_string(),
                c => (c as char).to_string(),
            })
            .collect();
        format!("{base} /* \"{gloss}\" */")
    } else {
        base
    }
}

/// Best-effort guess at whether `addr` holds a Pascal string: the length
/// byte is plausible and every following byte is printable.
fn estimate_pstring(cur: &Cursor, addr: u32) -> Option<String> {
    let len = cur.peek_byte_at(addr)?;
    if len < 2 {
        return None;
    }
    let data = cur.peek_slice_at(addr.wrapping_add(1), len as usize)?;
    let mut out = String::from("\"");
    for &ch in data {
        match ch {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\'' => out.push_str("\\'"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7E => out.push(ch as char),
            _ => return None,
        }
    }
    out.push('"');
    Some(out)
}

/// Prints a `movem` register mask. `reverse` selects the `-(An)` bit
/// convention (bit 15 = D0 .. bit 8 = D7, bit 7 = A7 .. bit 0 = A0); the
/// normal convention is bit 15 = A7 .. bit 8 = A0, bit 7 = D7 .. bit 0 = D0.
fn reg_mask_text(mask: u16, reverse: bool) -> String {
    if mask == 0 {
        return "<none>".to_string();
    }
    let mut parts = Vec::new();
    if reverse {
        for x in (8..16).rev() {
            if mask & (1 << x) != 0 {
                parts.push(format!("D{}", 15 - x));
            }
        }
        for x in (0..8).rev() {
            if mask & (1 << x) != 0 {
                parts.push(format!("A{}", 7 - x));
            }
        }
    } else {
        for x in (8..16).rev() {
            if mask & (1 << x) != 0 {
                parts.push(format!("A{}", x - 8));
            }
        }
        for x in (0..8).rev() {
            if mask & (1 << x) != 0 {
                parts.push(format!("D{}", x));
            }
        }
    }
    parts.join(",")
}

/// Mutable state threaded through one linear disassembly pass: the
/// branch-target map (`addr -> is_function_call`) accumulated for reflow.
type BranchTargets = BTreeMap<u32, bool>;

fn record_branch_target(targets: &mut BranchTargets, addr: u32, is_call: bool) {
    if addr & 1 != 0 {
        return;
    }
    if is_call {
        targets.insert(addr, true);
    } else {
        targets.entry(addr).or_insert(false);
    }
}

/// Decodes the brief or full (68020) extension word used by mode 6 and mode
/// 7/3 (`[An/PC + Xn]`). `an` is `None` for PC-relative, `Some(reg)`
/// otherwise. The full extension word is rendered best-effort; this crate's
/// interpreter never executes it.
fn dasm_address_extension(cur: &mut Cursor, ext: u16, an: Option<u8>) -> String {
    let index_is_a_reg = ext & 0x8000 != 0;
    let index_reg = (ext >> 12) & 7;
    let index_is_word = ext & 0x0800 == 0;
    let scale = 1u32 << ((ext >> 9) & 3);
    let base_name = an.map(|r| format!("A{r}")).unwrap_or_else(|| "PC".to_string());

    if ext & 0x0100 == 0 {
        // Brief extension word.
        let index = format!("{}{}{}", if index_is_a_reg { "A" } else { "D" }, index_reg, if index_is_word { ".w" } else { "" });
        let mut s = if scale != 1 {
            format!("[{base_name} + {index} * {scale}")
        } else {
            format!("[{base_name} + {index}")
        };
        let offset = ext as i8;
        if offset > 0 {
            s += &format!(" + {:#X}]", offset);
        } else if offset < 0 {
            s += &format!(" - {:#X}]", -(offset as i32));
        } else {
            s += "]";
        }
        return s;
    }

    // Full extension word; page 43 of the programmer's reference manual.
    let include_base = ext & 0x0080 == 0;
    let include_index = ext & 0x0040 == 0;
    let base_disp_size = (ext >> 4) & 3;
    let iis = ext & 7;

    if iis == 4 {
        return "<<invalid full ext with I/IS == 4>>".to_string();
    }

    let base_disp: i32 = match base_disp_size {
        2 => cur.read_u16().map(|v| v as i16 as i32).unwrap_or(0),
        3 => cur.read_u32().map(|v| v as i32).unwrap_or(0),
        _ => 0,
    };

    if iis == 0 {
        let mut s = "[".to_string();
        if include_base {
            s += &base_name;
        }
        if base_disp > 0 {
            s += &format!("{}{:#X}", if include_base { " + " } else { "" }, base_disp);
        } else if base_disp < 0 {
            s += &format!("{}{:#X}", if include_base { " - " } else { "-" }, -base_disp);
        }
        if include_index {
            let scale_str = if scale != 1 { format!(" * {scale}") } else { String::new() };
            s += &format!(" + {}{}{}", if index_is_a_reg { "A" } else { "D" }, index_reg, scale_str);
        }
        s + "]"
    } else {
        let mut s = "[[".to_string();
        if include_base {
            s += &base_name;
        }
        if base_disp > 0 {
            s += &format!("{}{:#X}", if include_base { " + " } else { "" }, base_disp);
        } else if base_disp < 0 {
            s += &format!("{}{:#X}", if include_base { " - " } else { "-" }, -base_disp);
        }
        let index_before = iis < 4;
        if include_index {
            let scale_str = if scale != 1 { format!(" * {scale}") } else { String::new() };
            if index_before {
                s += &format!(" + {}{}{}]", if index_is_a_reg { "A" } else { "D" }, index_reg, scale_str);
            } else {
                s += &format!("] + {}{}{}", if index_is_a_reg { "A" } else { "D" }, index_reg, scale_str);
            }
        } else {
            s += "]";
        }
        let outer_mode = iis & 3;
        let outer_disp: i32 = match outer_mode {
            2 => cur.read_u16().map(|v| v as i16 as i32).unwrap_or(0),
            3 => cur.read_u32().map(|v| v as i32).unwrap_or(0),
            _ => 0,
        };
        if outer_disp > 0 {
            s += &format!(" + {:#X}", outer_disp);
        } else if outer_disp < 0 {
            s += &format!(" - {:#X}", -outer_disp);
        }
        s + "]"
    }
}

/// Renders one effective address operand, consuming any extension words it
/// needs and recording PC-relative branch targets along the way.
fn dasm_ea(
    cur: &mut Cursor,
    opcode_pc: u32,
    mode: u8,
    reg: u8,
    size: Size,
    targets: &mut BranchTargets,
    is_call: bool,
    lowmem: Option<&dyn LowMemoryGlobals>,
) -> String {
    match mode {
        0 => format!("D{reg}"),
        1 => format!("A{reg}"),
        2 => format!("[A{reg}]"),
        3 => format!("[A{reg}]+"),
        4 => format!("-[A{reg}]"),
        5 => match cur.read_u16() {
            Some(disp) => {
                let disp = disp as i16;
                if disp < 0 {
                    format!("[A{reg} - {:#X}]", -(disp as i32))
                } else {
                    format!("[A{reg} + {:#X}]", disp)
                }
            }
            None => "[A?, <<truncated>>]".to_string(),
        },
        6 => match cur.read_u16() {
            Some(ext) => dasm_address_extension(cur, ext, Some(reg)),
            None => "<<truncated>>".to_string(),
        },
        7 => match reg {
            0 => match cur.read_u16() {
                Some(raw) => {
                    let addr = sign_extend(raw as u32, Size::Word) as u32;
                    match lowmem.and_then(|t| t.name_for(addr)) {
                        Some(name) => format!("[{:#010X} /* {name} */]", addr),
                        None => format!("[{:#010X}]", addr),
                    }
                }
                None => "<<truncated>>".to_string(),
            },
            1 => match cur.read_u32() {
                Some(addr) => match lowmem.and_then(|t| t.name_for(addr)) {
                    Some(name) => format!("[{:#010X} /* {name} */]", addr),
                    None => format!("[{:#010X}]", addr),
                },
                None => "<<truncated>>".to_string(),
            },
            2 => match cur.read_u16() {
                Some(raw) => {
                    let disp = raw as i16;
                    let target = opcode_pc.wrapping_add(2).wrapping_add(disp as i32 as u32);
                    record_branch_target(targets, target, is_call);
                    if disp == 0 {
                        format!("[PC] /* {:08X} */", target)
                    } else {
                        let off = if disp > 0 { format!("+ {:#X}", disp) } else { format!("- {:#X}", -(disp as i32)) };
                        match estimate_pstring(cur, target) {
                            Some(p) => format!("[PC {off} /* {:08X}, pstring {p} */]", target),
                            None => format!("[PC {off} /* {:08X} */]", target),
                        }
                    }
                }
                None => "<<truncated>>".to_string(),
            },
            3 => match cur.read_u16() {
                Some(ext) => dasm_address_extension(cur, ext, None),
                None => "<<truncated>>".to_string(),
            },
            4 => {
                let imm = match size {
                    Size::Byte | Size::Word => cur.read_u16().map(|v| v as u32),
                    Size::Long => cur.read_u32(),
                };
                match imm {
                    Some(v) => format!("#{}", format_immediate(v, size)),
                    None => "<<truncated>>".to_string(),
                }
            }
            _ => "<<invalid special address>>".to_string(),
        },
        _ => "<<invalid address>>".to_string(),
    }
}

const CONDITIONS: [&str; 16] =
    ["t", "f", "hi", "ls", "cc", "cs", "ne", "eq", "vc", "vs", "pl", "mi", "ge", "lt", "gt", "le"];

fn size_char(size: Size) -> char {
    match size {
        Size::Byte => 'b',
        Size::Word => 'w',
        Size::Long => 'l',
    }
}

/// Pads `mnemonic` to a ten-character mnemonic column, matching the rest of
/// a reflowed listing.
fn mnem(mnemonic: &str, operands: &str) -> String {
    if operands.is_empty() {
        mnemonic.to_string()
    } else if mnemonic.len() >= 10 {
        format!("{mnemonic} {operands}")
    } else {
        format!("{:<10}{operands}", mnemonic)
    }
}

struct DecodeCtx<'a> {
    lowmem: Option<&'a dyn LowMemoryGlobals>,
    traps: Option<&'a dyn TrapNames>,
}

/// Decodes exactly one instruction's mnemonic and operand text, consuming
/// its opcode word and any extension words. Falls back to `.invalid` /
/// `.incomplete` rather than ever returning an error: bad input always
/// produces a line of text, never a panic or a `Result`.
fn decode_one(cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc = cur.pc();
    let opcode = match cur.read_u16() {
        Some(op) => op,
        None => {
            cur.read_u8();
            return ".incomplete".to_string();
        }
    };

    match opcode >> 12 {
        0 => decode_group0(opcode, opcode_pc, cur, targets, ctx),
        1..=3 => decode_move(opcode, cur, targets, ctx),
        4 => decode_group4(opcode, opcode_pc, cur, targets, ctx),
        5 => decode_group5(opcode, opcode_pc, cur, targets, ctx),
        6 => decode_group6(opcode, opcode_pc, cur, targets),
        7 => decode_moveq(opcode),
        8 => decode_group8(opcode, cur, targets, ctx),
        9 | 0xD => decode_group9d(opcode, cur, targets, ctx),
        0xA | 0xF => decode_trap(opcode, ctx),
        0xB => decode_groupb(opcode, cur, targets, ctx),
        0xC => decode_groupc(opcode, cur, targets, ctx),
        0xE => decode_groupe(opcode),
        _ => unreachable!("opcode >> 12 is a 4-bit field"),
    }
}

fn decode_move(opcode: u16, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc_src = cur.pc();
    let size = match Size::from_move_encoding(opcode >> 12) {
        Some(s) => s,
        None => return format!(".invalid // bad move size {opcode:04X}"),
    };
    let src_mode = bits(opcode, 3, 5) as u8;
    let src_reg = bits(opcode, 0, 2) as u8;
    let dst_mode = bits(opcode, 6, 8) as u8;
    let dst_reg = bits(opcode, 9, 11) as u8;

    let src = dasm_ea(cur, opcode_pc_src, src_mode, src_reg, size, targets, false, ctx.lowmem);
    if dst_mode == 1 {
        mnem(&format!("movea.{}", size_char(size)), &format!("{src}, A{dst_reg}"))
    } else {
        let opcode_pc_dst = cur.pc();
        let dst = dasm_ea(cur, opcode_pc_dst, dst_mode, dst_reg, size, targets, false, ctx.lowmem);
        mnem(&format!("move.{}", size_char(size)), &format!("{src}, {dst}"))
    }
}

const BIT_OP_NAMES: [&str; 4] = ["btst", "bchg", "bclr", "bset"];

fn decode_group0(opcode: u16, opcode_pc: u32, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let hi = bits(opcode, 9, 11);

    if bits(opcode, 8, 8) != 0 {
        // Dynamic (register-sourced bit number). An-direct is movep, not
        // executed by this interpreter and rendered best-effort here.
        if mode == 1 {
            return format!(".invalid // movep not decoded {opcode:04X}");
        }
        let op = bits(opcode, 6, 7) as usize;
        let dreg = bits(opcode, 9, 11);
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Byte, targets, false, ctx.lowmem);
        return mnem(BIT_OP_NAMES[op], &format!("D{dreg}, {ea}"));
    }

    if hi == 4 {
        // Static bit ops: bit number is an extension word.
        let op = bits(opcode, 6, 7) as usize;
        let bitno = cur.read_u16().unwrap_or(0) & 0xFF;
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Byte, targets, false, ctx.lowmem);
        return mnem(BIT_OP_NAMES[op], &format!("#{bitno}, {ea}"));
    }

    let name = match hi {
        0 => "ori",
        1 => "andi",
        2 => "subi",
        3 => "addi",
        5 => "eori",
        6 => "cmpi",
        _ => return format!(".invalid // unknown group-0 opcode {opcode:04X}"),
    };

    let size_field = bits(opcode, 6, 7);
    if matches!(hi, 0 | 1 | 5) && mode == 7 && reg == 4 && size_field != 3 {
        let size = match Size::from_00_01_10(size_field) {
            Some(s) => s,
            None => return format!(".invalid // bad CCR/SR size {opcode:04X}"),
        };
        let imm = cur.read_u16().unwrap_or(0);
        let dest = if matches!(size, Size::Byte) { "CCR" } else { "SR" };
        return mnem(name, &format!("{}, {dest}", format_immediate(imm as u32, size)));
    }

    let size = match Size::from_00_01_10(size_field) {
        Some(s) => s,
        None => return format!(".invalid // bad group-0 size {opcode:04X}"),
    };
    let imm = match size {
        Size::Byte | Size::Word => cur.read_u16().unwrap_or(0) as u32,
        Size::Long => cur.read_u32().unwrap_or(0),
    };
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    mnem(&format!("{name}.{}", size_char(size)), &format!("{}, {ea}", format_immediate(imm, size)))
}

fn decode_group4(opcode: u16, opcode_pc: u32, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;

    if opcode == 0x4E70 {
        return "reset".to_string();
    }
    if opcode == 0x4E71 {
        return "nop".to_string();
    }
    if opcode == 0x4E75 {
        return "rts".to_string();
    }
    if opcode == 0x4E77 {
        return "rtr".to_string();
    }
    if opcode == 0x4E76 {
        return "trapv".to_string();
    }
    if (opcode & 0xFFF8) == 0x4E50 {
        let disp = cur.read_u16().unwrap_or(0) as i16;
        return mnem("link", &format!("A{reg}, {disp:#X}"));
    }
    if (opcode & 0xFFF8) == 0x4E58 {
        return mnem("unlk", &format!("A{reg}"));
    }
    if (opcode & 0xFFC0) == 0x4E80 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, true, ctx.lowmem);
        return mnem("jsr", &ea);
    }
    if (opcode & 0xFFC0) == 0x4EC0 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, false, ctx.lowmem);
        return mnem("jmp", &ea);
    }
    if (opcode & 0xFFF8) == 0x4840 {
        return mnem("swap", &format!("D{reg}"));
    }
    if (opcode & 0xFFC0) == 0x4840 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, false, ctx.lowmem);
        return mnem("pea", &ea);
    }
    if (opcode & 0xF1C0) == 0x41C0 {
        let areg = bits(opcode, 9, 11);
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, false, ctx.lowmem);
        return mnem("lea", &format!("{ea}, A{areg}"));
    }
    if (opcode & 0xFFC0) == 0x4800 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Byte, targets, false, ctx.lowmem);
        return mnem("nbcd", &ea);
    }
    if (opcode & 0xFFB8) == 0x4880 {
        let long = opcode & 0x40 != 0;
        return mnem(if long { "ext.l" } else { "ext.w" }, &format!("D{reg}"));
    }
    if (opcode & 0xFF00) == 0x4A00 {
        let size = Size::from_00_01_10(bits(opcode, 6, 7));
        if let Some(size) = size {
            let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
            return mnem(&format!("tst.{}", size_char(size)), &ea);
        }
    }
    if (opcode & 0xFFC0) == 0x4AC0 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Byte, targets, false, ctx.lowmem);
        return mnem("tas", &ea);
    }
    for (hi, name) in [(0x4000u16, "negx"), (0x4200, "clr"), (0x4400, "neg"), (0x4600, "not")] {
        if (opcode & 0xFF00) == hi {
            if let Some(size) = Size::from_00_01_10(bits(opcode, 6, 7)) {
                let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
                return mnem(&format!("{name}.{}", size_char(size)), &ea);
            }
        }
    }
    if (opcode & 0xFFC0) == 0x44C0 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("move", &format!("{ea}, CCR"));
    }
    if (opcode & 0xFFC0) == 0x46C0 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("move", &format!("{ea}, SR"));
    }
    if (opcode & 0xFFC0) == 0x40C0 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("move", &format!("SR, {ea}"));
    }
    if (opcode & 0xFB80) == 0x4880 {
        let long = opcode & 0x40 != 0;
        let mask = cur.read_u16().unwrap_or(0);
        let to_mem = opcode & 0x0400 == 0;
        let reverse = mode == 4;
        let masktext = reg_mask_text(mask, reverse);
        let sz = if long { 'l' } else { 'w' };
        return if to_mem {
            let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, false, ctx.lowmem);
            mnem(&format!("movem.{sz}"), &format!("{masktext}, {ea}"))
        } else {
            let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Long, targets, false, ctx.lowmem);
            mnem(&format!("movem.{sz}"), &format!("{ea}, {masktext}"))
        };
    }
    if (opcode & 0xF1C0) == 0x4180 {
        let dreg = bits(opcode, 9, 11);
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("chk.w", &format!("{ea}, D{dreg}"));
    }
    if (opcode & 0xFFF0) == 0x4E60 {
        let to_usp = opcode & 8 != 0;
        return if to_usp {
            mnem("move", &format!("A{reg}, USP"))
        } else {
            mnem("move", &format!("USP, A{reg}"))
        };
    }
    if (opcode & 0xFFF0) == 0x4E40 {
        let v = bits(opcode, 0, 3);
        return mnem("trap", &format!("#{v}"));
    }

    format!(".invalid // unknown opcode 4 {opcode:04X}")
}

fn decode_group5(opcode: u16, opcode_pc: u32, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let s = bits(opcode, 6, 7);

    if s == 3 {
        let k = bits(opcode, 8, 11) as u8;
        let cond = CONDITIONS[k as usize];
        if mode == 1 {
            let pc_base = cur.pc().wrapping_add(2);
            let disp = cur.read_u16().unwrap_or(0) as i16;
            let target = pc_base.wrapping_add(disp as i32 as u32);
            record_branch_target(targets, target, false);
            return mnem(&format!("db{cond}"), &format!("D{reg}, {:+#X} /* {target:08X} */", disp));
        }
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Byte, targets, false, ctx.lowmem);
        return mnem(&format!("s{cond}"), &ea);
    }

    let size = match Size::from_00_01_10(s) {
        Some(size) => size,
        None => return format!(".invalid // bad addq/subq size {opcode:04X}"),
    };
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    let mut value = bits(opcode, 9, 11);
    if value == 0 {
        value = 8;
    }
    let name = if opcode & 0x0100 != 0 { "subq" } else { "addq" };
    mnem(&format!("{name}.{}", size_char(size)), &format!("#{value}, {ea}"))
}

fn decode_group6(opcode: u16, opcode_pc: u32, cur: &mut Cursor, targets: &mut BranchTargets) -> String {
    let pc_base = opcode_pc.wrapping_add(2);
    let y = opcode as i8;
    let (disp, size_note): (i64, &str) = if y == 0 {
        (cur.read_u16().unwrap_or(0) as i16 as i64, ".w")
    } else if y == -1 {
        (cur.read_u32().unwrap_or(0) as i32 as i64, ".l")
    } else {
        (y as i64, ".b")
    };
    let target = (pc_base as i64 + disp) as u32;
    let k = bits(opcode, 8, 11) as u8;
    let is_call = k == 1; // bsr
    record_branch_target(targets, target, is_call);
    let name = match k {
        0 => "bra".to_string(),
        1 => "bsr".to_string(),
        c => format!("b{}", CONDITIONS[c as usize]),
    };
    mnem(&format!("{name}{size_note}"), &format!("{target:#010X}"))
}

fn decode_moveq(opcode: u16) -> String {
    let reg = bits(opcode, 9, 11);
    let imm = opcode as i8;
    mnem("moveq.l", &format!("D{reg}, {:#X}", imm as i32))
}

fn decode_group8(opcode: u16, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc = cur.pc().wrapping_sub(2);
    let dreg = bits(opcode, 9, 11);
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let opmode = bits(opcode, 6, 8);

    if opmode == 3 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("divu.w", &format!("{ea}, D{dreg}"));
    }
    if opmode == 7 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("divs.w", &format!("{ea}, D{dreg}"));
    }
    if opmode == 4 && mode == 0 {
        return mnem("sbcd", &format!("D{reg}, D{dreg}"));
    }
    if opmode == 4 && mode == 1 {
        return mnem("sbcd", &format!("-[A{reg}], -[A{dreg}]"));
    }
    let size = match Size::from_00_01_10(opmode & 3) {
        Some(s) => s,
        None => return format!(".invalid // bad or size {opcode:04X}"),
    };
    let dst_is_ea = opmode & 4 != 0;
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    if dst_is_ea {
        mnem(&format!("or.{}", size_char(size)), &format!("D{dreg}, {ea}"))
    } else {
        mnem(&format!("or.{}", size_char(size)), &format!("{ea}, D{dreg}"))
    }
}

fn decode_group9d(opcode: u16, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc = cur.pc().wrapping_sub(2);
    let is_add = opcode >> 12 == 0xD;
    let name_root = if is_add { "add" } else { "sub" };
    let dreg = bits(opcode, 9, 11);
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let opmode = bits(opcode, 6, 8);

    if opmode == 3 || opmode == 7 {
        let size = if opmode == 3 { Size::Word } else { Size::Long };
        let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
        return mnem(&format!("{name_root}a.{}", size_char(size)), &format!("{ea}, A{dreg}"));
    }
    if matches!(opmode, 4 | 5 | 6) && matches!(mode, 0 | 1) {
        let size = match Size::from_00_01_10(opmode - 4) {
            Some(s) => s,
            None => return format!(".invalid // bad {name_root}x size {opcode:04X}"),
        };
        let name = format!("{name_root}x.{}", size_char(size));
        return if mode == 1 {
            mnem(&name, &format!("-[A{reg}], -[A{dreg}]"))
        } else {
            mnem(&name, &format!("D{reg}, D{dreg}"))
        };
    }
    let size = match Size::from_00_01_10(opmode % 4) {
        Some(s) => s,
        None => return format!(".invalid // bad {name_root} size {opcode:04X}"),
    };
    let dst_is_ea = opmode >= 4;
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    if dst_is_ea {
        mnem(&format!("{name_root}.{}", size_char(size)), &format!("D{dreg}, {ea}"))
    } else {
        mnem(&format!("{name_root}.{}", size_char(size)), &format!("{ea}, D{dreg}"))
    }
}

fn decode_trap(opcode: u16, ctx: &DecodeCtx) -> String {
    let line = if opcode & 0xF000 == 0xA000 { 'a' } else { 'f' };
    match ctx.traps.and_then(|t| t.name_for(opcode)) {
        Some(name) => mnem(&format!("line{line}"), &format!("{:#06X} /* {name} */", opcode)),
        None => mnem(&format!("line{line}"), &format!("{:#06X}", opcode)),
    }
}

fn decode_groupb(opcode: u16, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc = cur.pc().wrapping_sub(2);
    let dreg = bits(opcode, 9, 11);
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let opmode = bits(opcode, 6, 8);

    if opmode == 3 || opmode == 7 {
        let size = if opmode == 3 { Size::Word } else { Size::Long };
        let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
        return mnem(&format!("cmpa.{}", size_char(size)), &format!("{ea}, A{dreg}"));
    }
    let size = match Size::from_00_01_10(opmode & 3) {
        Some(s) => s,
        None => return format!(".invalid // bad group-B size {opcode:04X}"),
    };
    if opmode & 4 != 0 {
        if mode == 1 {
            return mnem(&format!("cmpm.{}", size_char(size)), &format!("[A{reg}]+, [A{dreg}]+"));
        }
        let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
        return mnem(&format!("eor.{}", size_char(size)), &format!("D{dreg}, {ea}"));
    }
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    mnem(&format!("cmp.{}", size_char(size)), &format!("{ea}, D{dreg}"))
}

fn decode_groupc(opcode: u16, cur: &mut Cursor, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let opcode_pc = cur.pc().wrapping_sub(2);
    let dreg = bits(opcode, 9, 11);
    let mode = bits(opcode, 3, 5) as u8;
    let reg = bits(opcode, 0, 2) as u8;
    let opmode = bits(opcode, 6, 8);

    if opmode == 3 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("mulu.w", &format!("{ea}, D{dreg}"));
    }
    if opmode == 7 {
        let ea = dasm_ea(cur, opcode_pc, mode, reg, Size::Word, targets, false, ctx.lowmem);
        return mnem("muls.w", &format!("{ea}, D{dreg}"));
    }
    if opmode == 4 && mode == 0 {
        return mnem("abcd", &format!("D{reg}, D{dreg}"));
    }
    if opmode == 4 && mode == 1 {
        return mnem("abcd", &format!("-[A{reg}], -[A{dreg}]"));
    }
    if bits(opcode, 3, 8) == 0o50 /* 0x28 */ {
        return mnem("exg", &format!("D{dreg}, D{reg}"));
    }
    if bits(opcode, 3, 8) == 0o51 /* 0x29 */ {
        return mnem("exg", &format!("A{dreg}, A{reg}"));
    }
    if bits(opcode, 3, 8) == 0o61 /* 0x31 */ {
        return mnem("exg", &format!("D{dreg}, A{reg}"));
    }
    let size = match Size::from_00_01_10(opmode & 3) {
        Some(s) => s,
        None => return format!(".invalid // bad and size {opcode:04X}"),
    };
    let dst_is_ea = opmode & 4 != 0;
    let ea = dasm_ea(cur, opcode_pc, mode, reg, size, targets, false, ctx.lowmem);
    if dst_is_ea {
        mnem(&format!("and.{}", size_char(size)), &format!("D{dreg}, {ea}"))
    } else {
        mnem(&format!("and.{}", size_char(size)), &format!("{ea}, D{dreg}"))
    }
}

fn decode_groupe(opcode: u16) -> String {
    let reg = bits(opcode, 0, 2);
    let dreg = bits(opcode, 9, 11);
    let dir = if opcode & 0x0100 != 0 { "l" } else { "r" };
    let kind = bits(opcode, 3, 4);
    let kind_name = match kind {
        0 => "as",
        1 => "ls",
        2 => "rox",
        3 => "ro",
        _ => unreachable!(),
    };

    if bits(opcode, 6, 7) == 3 {
        // memory shift, single bit, one word only
        let mode = bits(opcode, 3, 5) as u8;
        let _ = mode;
        return format!(".invalid // bit-field/memory-shift opcode {opcode:04X} not decoded");
    }

    let size = match Size::from_00_01_10(bits(opcode, 6, 7)) {
        Some(s) => s,
        None => return format!(".invalid // bad shift size {opcode:04X}"),
    };
    let from_reg = opcode & 0x0020 != 0;
    if from_reg {
        mnem(&format!("{kind_name}{dir}.{}", size_char(size)), &format!("D{dreg}, D{reg}"))
    } else {
        let mut count = dreg;
        if count == 0 {
            count = 8;
        }
        mnem(&format!("{kind_name}{dir}.{}", size_char(size)), &format!("#{count}, D{reg}"))
    }
}

/// Decodes exactly one instruction and formats it as
/// `PC  words  mnemonic  operands`. Never fails; truncated or unrecognized
/// opcodes still consume at least one byte.
pub fn disassemble_one(code: &[u8], base_addr: u32) -> String {
    let mut cur = Cursor::new(code, base_addr);
    let mut targets = BranchTargets::new();
    let ctx = DecodeCtx { lowmem: None, traps: None };
    format_line(&mut cur, base_addr, &mut targets, &ctx)
}

fn format_line(cur: &mut Cursor, pc: u32, targets: &mut BranchTargets, ctx: &DecodeCtx) -> String {
    let start = cur.pos;
    let text = decode_one(cur, targets, ctx);
    let end = cur.pos;

    let mut hex = String::new();
    let mut p = start;
    while p + 1 < end {
        hex.push_str(&format!(" {:02X}{:02X}", cur.data[p], cur.data[p + 1]));
        p += 2;
    }
    if p < end {
        hex.push_str(&format!(" {:02X}  ", cur.data[p]));
    }
    while hex.len() < 25 {
        hex.push(' ');
    }

    format!("{:08X} {hex} {text}", pc)
}

/// Full reflow disassembly over `code`, based at `base_addr`. `labels` maps
/// an address to one or more user-supplied names, interleaved with
/// auto-generated branch labels (`labelXXXXXXXX` / `fnXXXXXXXX`).
pub fn disassemble(
    code: &[u8],
    base_addr: u32,
    labels: &BTreeMap<u32, Vec<String>>,
    lowmem: Option<&dyn LowMemoryGlobals>,
    traps: Option<&dyn TrapNames>,
) -> String {
    let ctx = DecodeCtx { lowmem, traps };
    let end_addr = base_addr.wrapping_add(code.len() as u32);

    // Phase 1: linear scan, collecting lines and branch targets.
    let mut targets = BranchTargets::new();
    let mut lines: BTreeMap<u32, (String, u32)> = BTreeMap::new();
    {
        let mut cur = Cursor::new(code, base_addr);
        while !cur.eof() {
            let pc = cur.pc();
            let line = format_line(&mut cur, pc, &mut targets, &ctx);
            let next_pc = cur.pc();
            lines.insert(pc, (line, next_pc));
        }
    }

    // Phase 2: re-disassemble missed, word-aligned branch targets to a
    // fixed point, recording the ranges produced as "backup branches".
    let mut pending: VecDeque<u32> = targets
        .keys()
        .copied()
        .filter(|&t| t & 1 == 0 && t >= base_addr && t < end_addr && !lines.contains_key(&t))
        .collect();
    let mut seen_pending: BTreeSet<u32> = pending.iter().copied().collect();
    let mut backup_branches: BTreeSet<(u32, u32)> = BTreeSet::new();

    while let Some(branch_start) = pending.pop_front() {
        seen_pending.remove(&branch_start);
        let mut pc = branch_start;
        let mut cur = Cursor::new(code, base_addr);
        cur.pos = (branch_start - base_addr) as usize;

        while !lines.contains_key(&pc) && !cur.eof() {
            let mut local_targets = BranchTargets::new();
            let line = format_line(&mut cur, pc, &mut local_targets, &ctx);
            let next_pc = cur.pc();
            lines.insert(pc, (line, next_pc));
            pc = next_pc;

            for (addr, is_call) in local_targets {
                record_branch_target(&mut targets, addr, is_call);
                if addr & 1 == 0 && seen_pending.insert(addr) {
                    pending.push_back(addr);
                }
            }
        }

        if pc != branch_start {
            backup_branches.insert((branch_start, pc));
        }
    }

    // Phase 3/4: assemble output in PC order, interleaving labels and
    // bracketing backup-branch ranges.
    let mut out = String::new();
    let mut branch_target_it = targets.iter().peekable();
    let mut label_it = labels.iter().peekable();
    let mut backup_it = backup_branches.iter().peekable();

    fn emit_labels_and_targets<'a>(
        out: &mut String,
        pc: u32,
        label_it: &mut std::iter::Peekable<std::collections::btree_map::Iter<'a, u32, Vec<String>>>,
        branch_target_it: &mut std::iter::Peekable<std::collections::btree_map::Iter<'a, u32, bool>>,
    ) {
        while let Some((&addr, names)) = label_it.peek() {
            if addr > pc {
                break;
            }
            for name in names.iter() {
                if addr != pc {
                    out.push_str(&format!("{name}: // at {addr:08X} (misaligned)\n"));
                } else {
                    out.push_str(&format!("{name}:\n"));
                }
            }
            label_it.next();
        }
        while let Some((&addr, &is_call)) = branch_target_it.peek() {
            if addr > pc {
                break;
            }
            let kind = if is_call { "fn" } else { "label" };
            if addr != pc {
                out.push_str(&format!("{kind}{addr:08X}: // (misaligned)\n"));
            } else {
                out.push_str(&format!("{kind}{addr:08X}:\n"));
            }
            branch_target_it.next();
        }
    }

    let mut cursor_pc = lines.keys().next().copied();
    while let Some(pc) = cursor_pc {
        while let Some(&&(start_pc, end_pc)) = backup_it.peek() {
            if start_pc > pc {
                break;
            }
            backup_it.next();
            out.push_str(&format!("// begin alternate branch {start_pc:08X}-{end_pc:08X}\n"));
            let mut bpc = Some(start_pc);
            while let Some(p) = bpc {
                if p == end_pc {
                    break;
                }
                match lines.get(&p) {
                    Some((line, next)) => {
                        emit_labels_and_targets(&mut out, p, &mut label_it, &mut branch_target_it);
                        out.push_str(line);
                        out.push('\n');
                        bpc = Some(*next);
                    }
                    None => break,
                }
            }
            out.push_str(&format!("// end alternate branch {start_pc:08X}-{end_pc:08X}\n"));
        }

        emit_labels_and_targets(&mut out, pc, &mut label_it, &mut branch_target_it);
        let (line, next) = &lines[&pc];
        out.push_str(line);
        out.push('\n');
        cursor_pc = lines.contains_key(next).then_some(*next);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moveq_disassembles_with_pc_and_mnemonic() {
        let line = disassemble_one(&[0x70, 0x2A], 0x0000_1000);
        assert!(line.starts_with("00001000"));
        assert!(line.contains("moveq.l"));
        assert!(line.contains("D0, 0x2A"));
    }

    #[test]
    fn disassembly_always_advances() {
        for b in 0u8..=255 {
            let code = [b, b];
            let line = disassemble_one(&code, 0);
            assert!(!line.is_empty());
        }
    }

    #[test]
    fn truncated_stream_emits_incomplete() {
        let line = disassemble_one(&[0x70], 0);
        assert!(line.contains(".incomplete"));
    }

    #[test]
    fn reflow_emits_label_for_forward_branch_target() {
        // bra.w +4 (skips the "rts" at +4, landing past it); moveq at +4.
        let code = [0x60, 0x00, 0x00, 0x02, 0x70, 0x2A];
        let labels = BTreeMap::new();
        let text = disassemble(&code, 0, &labels, None, None);
        assert!(text.contains("label00000004") || text.contains("fn00000004"));
    }

    #[test]
    fn reg_mask_normal_order_is_a7_down_to_d0() {
        // bit15 (A7) and bit0 (D0) set.
        let text = reg_mask_text(0x8001, false);
        assert_eq!(text, "A7,D0");
    }

    #[test]
    fn reg_mask_reverse_order_for_predecrement() {
        // bit15 (D0) and bit0 (A0) set.
        let text = reg_mask_text(0x8001, true);
        assert_eq!(text, "D0,A0");
    }

    #[test]
    fn immediate_with_printable_bytes_gets_ascii_gloss() {
        let text = format_immediate(0x4142, Size::Word);
        assert!(text.contains("\"AB\""));
    }

    #[test]
    fn immediate_with_non_printable_bytes_has_no_gloss() {
        let text = format_immediate(0xFF00, Size::Word);
        assert!(!text.contains('"'));
    }
}
