//! A 68000/68020 user-mode instruction interpreter and disassembler, backed
//! by a page-indexed, arena-allocated virtual memory context.
//!
//! # How to use
//!
//! Create a [`memory::MemoryContext`], wrap it together with a
//! [`registers::Registers`] file in an [`Emulator`], load your code into an
//! arena, point the program counter at it, and call [`Emulator::execute`].
//! The memory-management side (arenas, pages, symbols) is owned outright by
//! the crate; the only things you must supply are the collaborator seams
//! described in [`collaborators`] if you need syscalls, single-step
//! debugging, or interrupts.
//!
//! ## Basic usage
//!
//! ```
//! use m68k_arena_emu::{memory::MemoryContext, Emulator};
//!
//! let mut mem = MemoryContext::new(4096).unwrap();
//! let code_addr = mem.allocate(64).unwrap();
//! mem.write_u16b(code_addr, 0x4E70).unwrap(); // reset: stops the run loop
//!
//! let mut emu = Emulator::new(mem);
//! emu.registers.pc = code_addr;
//! emu.execute().unwrap();
//! ```
//!
//! # TODO:
//! - Supervisor mode and exception vectors; this crate is user-mode only.
//! - 68020 addressing modes beyond what the disassembler already renders.

pub mod address;
pub mod collaborators;
pub mod disassembler;
pub mod error;
pub mod interpreter;
pub mod memory;
pub mod registers;
pub mod utils;

use collaborators::{DebugHook, InterruptManager, NullSyscallHandler, SyscallHandler};
use error::EmulatorError;
use interpreter::Flow;
use memory::MemoryContext;
use registers::Registers;

/// Owns the machine state and drives the run loop: a thin loop over the
/// memory context, register file, and the three collaborator seams (syscall
/// handler, debug hook, interrupt manager).
pub struct Emulator {
    pub memory: MemoryContext,
    pub registers: Registers,
    syscall: Option<Box<dyn SyscallHandler>>,
    debug_hook: Option<Box<dyn DebugHook>>,
    interrupts: Option<Box<dyn InterruptManager>>,
}

impl Emulator {
    /// Creates an emulator over an already-populated memory context, with a
    /// fresh register file and no collaborators installed.
    pub fn new(memory: MemoryContext) -> Self {
        Emulator {
            memory,
            registers: Registers::new(),
            syscall: None,
            debug_hook: None,
            interrupts: None,
        }
    }

    pub fn set_syscall_handler(&mut self, handler: impl SyscallHandler + 'static) {
        self.syscall = Some(Box::new(handler));
    }

    pub fn set_debug_hook(&mut self, hook: impl DebugHook + 'static) {
        self.debug_hook = Some(Box::new(hook));
    }

    pub fn set_interrupt_manager(&mut self, manager: impl InterruptManager + 'static) {
        self.interrupts = Some(Box::new(manager));
    }

    /// Fetches and executes exactly one instruction at the current PC,
    /// without the run loop's debug hook or interrupt tick.
    pub fn step(&mut self) -> Result<Flow, EmulatorError> {
        let mut fallback = NullSyscallHandler;
        let syscall: &mut dyn SyscallHandler = match &mut self.syscall {
            Some(h) => h.as_mut(),
            None => &mut fallback,
        };
        interpreter::step(&mut self.registers, &mut self.memory, syscall)
    }

    /// Runs instructions in a loop until a debug hook, interrupt tick,
    /// syscall handler, or the instruction stream itself (`reset`) requests
    /// a stop. Lazily installs a [`collaborators::NullInterruptManager`] on
    /// first call if none was ever set.
    pub fn execute(&mut self) -> Result<(), EmulatorError> {
        if self.interrupts.is_none() {
            self.interrupts = Some(Box::new(collaborators::NullInterruptManager));
        }

        loop {
            if let Some(hook) = &mut self.debug_hook {
                if !hook.on_step(&self.registers, &self.memory) {
                    log::trace!("execute: stopped by debug hook at PC {:#010X}", self.registers.pc);
                    break;
                }
            }
            if let Some(manager) = &mut self.interrupts {
                if !manager.tick() {
                    log::trace!("execute: stopped by interrupt manager at PC {:#010X}", self.registers.pc);
                    break;
                }
            }

            match self.step()? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collaborators::{InterruptManager, SyscallHandler};

    #[test]
    fn execute_stops_on_reset_opcode() {
        let mut mem = MemoryContext::new(4096).unwrap();
        let addr = mem.allocate(16).unwrap();
        mem.write_u16b(addr, 0x4E70).unwrap(); // reset
        let mut emu = Emulator::new(mem);
        emu.registers.pc = addr;
        emu.execute().unwrap();
        assert_eq!(emu.registers.pc, addr + 2);
    }

    #[test]
    fn execute_aborts_on_syscall_with_no_handler_installed() {
        let mut mem = MemoryContext::new(4096).unwrap();
        let addr = mem.allocate(16).unwrap();
        mem.write_u16b(addr, 0xA000).unwrap(); // line-A trap, no handler
        let mut emu = Emulator::new(mem);
        emu.registers.pc = addr;
        emu.execute().unwrap();
        assert_eq!(emu.registers.pc, addr + 2);
    }

    struct CountingSyscall {
        calls: u32,
    }

    impl SyscallHandler for CountingSyscall {
        fn handle(&mut self, regs: &mut Registers, _mem: &mut MemoryContext, _opcode: u16) -> bool {
            self.calls += 1;
            regs.d[0] = self.calls;
            self.calls < 3
        }
    }

    #[test]
    fn execute_loops_through_installed_syscall_handler() {
        let mut mem = MemoryContext::new(4096).unwrap();
        let addr = mem.allocate(16).unwrap();
        mem.write_u16b(addr, 0xA000).unwrap();
        let mut emu = Emulator::new(mem);
        emu.registers.pc = addr;
        emu.set_syscall_handler(CountingSyscall { calls: 0 });
        emu.execute().unwrap();
        assert_eq!(emu.registers.d[0], 3);
    }

    struct CountingInterrupts {
        ticks: u32,
        limit: u32,
    }

    impl InterruptManager for CountingInterrupts {
        fn tick(&mut self) -> bool {
            self.ticks += 1;
            self.ticks <= self.limit
        }
    }

    #[test]
    fn execute_stops_when_interrupt_manager_requests_it() {
        let mut mem = MemoryContext::new(4096).unwrap();
        let addr = mem.allocate(16).unwrap();
        mem.write_u16b(addr, 0x4E71).unwrap(); // nop, loops forever otherwise
        let mut emu = Emulator::new(mem);
        emu.registers.pc = addr;
        emu.set_interrupt_manager(CountingInterrupts { ticks: 0, limit: 2 });
        emu.execute().unwrap();
        assert_eq!(emu.registers.pc, addr + 4);
    }
}
