//! Interpreter (spec.md §4.4): fetch, dispatch, execute, cache-tick,
//! libc trampoline dispatch, and weighted cycle accounting.
//!
//! Grounded on `original_source/src/interpreter/interpreter.cpp`,
//! restructured the way the teacher splits `Hart::step`/execute
//! (`riscvemu/src/hart.rs`): a fetch step in `run`, and an `execute`
//! step returning `Result<(), RavelError>` per instruction, over the
//! already-decoded `Instr` enum (no re-decoding — these instructions
//! were never bit-encoded).

use std::collections::VecDeque;
use std::io::{Read, Write};

use itertools::Itertools;

use crate::cache::Cache;
use crate::config::{Config, Counters, InstructionWeights};
use crate::error::{RavelError, Result};
use crate::instr::{ArithRegImmOp, ArithRegRegOp, BranchOp, ImmOp, Instr, MArithOp, MemOp};
use crate::libc::{self, HeapState};
use crate::link::{self, Image};

const CALLER_SAVED: [usize; 15] = [1, 5, 6, 7, 11, 12, 13, 14, 15, 16, 17, 28, 29, 30, 31];
const SCRAMBLE: u32 = 0x1234;
const DEBUG_RING_LEN: usize = 8;

/// Picks the live register storage: external if the caller supplied
/// one, owned otherwise. Kept as a free function over explicit field
/// references (rather than a `&mut self` method) so callers can borrow
/// other `Interpreter` fields at the same time — see design notes §9,
/// which rejects a pointer-discriminated union here in favor of plain
/// `Option<&mut _>` borrows.
fn regs_of<'b>(owned: &'b mut Option<[u32; 32]>, external: &'b mut Option<&mut [u32; 32]>) -> &'b mut [u32; 32] {
    match external.as_deref_mut() {
        Some(r) => r,
        None => owned.as_mut().expect("interpreter has neither owned nor external registers"),
    }
}

fn arena_of<'b>(owned: &'b mut Option<Vec<u8>>, external: &'b mut Option<&mut Vec<u8>>) -> &'b mut [u8] {
    match external.as_deref_mut() {
        Some(v) => v.as_mut_slice(),
        None => owned.as_mut().expect("interpreter has neither owned nor external arena").as_mut_slice(),
    }
}

/// The interpreter's live execution state (spec.md §4.4).
pub struct Interpreter<'a> {
    pc: i32,
    owned_regs: Option<[u32; 32]>,
    external_regs: Option<&'a mut [u32; 32]>,
    owned_arena: Option<Vec<u8>>,
    external_arena: Option<&'a mut Vec<u8>>,
    cache: Cache,
    heap: HeapState,
    counters: Counters,
    pool: Vec<Instr>,
    weights: InstructionWeights,
    timeout: u64,
    total_insts: u64,
    keep_debug_info: bool,
    print_insts: bool,
    input: &'a mut dyn Read,
    output: &'a mut dyn Write,
    debug_ring: VecDeque<(i32, String)>,
}

impl<'a> Interpreter<'a> {
    /// Boot a fresh interpreter over `image`: copy its storage into the
    /// arena, set the heap pointer just past it, PC = 0, sp = arena
    /// size (spec.md §4.4, "Boot").
    pub fn new(image: &Image, config: Config<'a>) -> Self {
        let Config {
            sources: _,
            input,
            output,
            cache_enabled,
            timeout,
            max_storage,
            keep_debug_info,
            print_insts,
            instruction_weights,
            external_regs,
            external_arena,
        } = config;

        let mut external_arena = external_arena;
        let owned_arena = if let Some(ext) = external_arena.as_deref_mut() {
            ext.clear();
            ext.resize(max_storage, 0);
            ext[..image.storage.len()].copy_from_slice(&image.storage);
            None
        } else {
            let mut v = vec![0u8; max_storage];
            v[..image.storage.len()].copy_from_slice(&image.storage);
            Some(v)
        };

        let mut external_regs = external_regs;
        let owned_regs = if let Some(r) = external_regs.as_deref_mut() {
            *r = [0u32; 32];
            None
        } else {
            Some([0u32; 32])
        };

        let mut cache = Cache::new();
        if !cache_enabled {
            cache.disable();
        }

        let mut interp = Interpreter {
            pc: 0,
            owned_regs,
            external_regs,
            owned_arena,
            external_arena,
            cache,
            heap: HeapState { heap_ptr: image.storage.len() as u32, ..Default::default() },
            counters: Counters::default(),
            pool: image.pool.clone(),
            weights: instruction_weights,
            timeout,
            total_insts: 0,
            keep_debug_info,
            print_insts,
            input,
            output,
            debug_ring: VecDeque::with_capacity(DEBUG_RING_LEN),
        };
        regs_of(&mut interp.owned_regs, &mut interp.external_regs)[2] = max_storage as u32;
        interp
    }

    fn arena_len(&self) -> usize {
        self.external_arena.as_ref().map(|v| v.len()).unwrap_or_else(|| self.owned_arena.as_ref().unwrap().len())
    }

    fn push_debug(&mut self, pc: i32, text: String) {
        if !self.keep_debug_info {
            return;
        }
        if self.debug_ring.len() == DEBUG_RING_LEN {
            self.debug_ring.pop_front();
        }
        self.debug_ring.push_back((pc, text));
    }

    fn dump_debug(&self) {
        if !self.keep_debug_info {
            return;
        }
        let regs = self.external_regs.as_deref().copied().unwrap_or_else(|| *self.owned_regs.as_ref().unwrap());
        tracing::error!(pc = self.pc, ?regs, "interpreter fault");
        let ring = self.debug_ring.iter().map(|(pc, text)| format!("{pc:#x}: {text}")).join(" | ");
        tracing::error!(%ring, "last {} fetched instructions", self.debug_ring.len());
    }

    /// Run to completion (PC == 8) or error. Returns the weighted cycle
    /// count (spec.md §3, "Instruction counters").
    pub fn run(&mut self) -> Result<u64> {
        loop {
            if self.pc == 8 {
                break;
            }
            if self.pc < 0 || self.pc as usize >= self.arena_len() {
                self.dump_debug();
                return Err(RavelError::InvalidAddress { addr: self.pc as u32, reason: "pc outside arena".into() });
            }
            self.total_insts += 1;
            if self.total_insts > self.timeout {
                self.dump_debug();
                return Err(RavelError::Timeout { budget: self.timeout });
            }
            self.cache.tick();

            let pcu = self.pc as u32;
            if (12..48).contains(&pcu) {
                let name = link::libc_func_name_at(pcu)
                    .ok_or_else(|| RavelError::NotSupported(format!("no libc function at pc {pcu}")))?;
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let arena = arena_of(&mut self.owned_arena, &mut self.external_arena);
                libc::dispatch(
                    name,
                    regs,
                    arena,
                    &mut self.heap,
                    &mut *self.input,
                    &mut *self.output,
                    &mut self.counters,
                )?;
                self.pc = regs_of(&mut self.owned_regs, &mut self.external_regs)[1] as i32;
                self.caller_saved_scramble();
                continue;
            }

            let arena = arena_of(&mut self.owned_arena, &mut self.external_arena);
            let idx = u32::from_le_bytes(arena[self.pc as usize..self.pc as usize + 4].try_into().unwrap()) as usize;
            let inst = self
                .pool
                .get(idx)
                .cloned()
                .ok_or_else(|| RavelError::NotSupported(format!("pool index {idx} out of range")))?;

            if self.print_insts {
                tracing::debug!(pc = self.pc, ?inst, "fetch");
            }
            self.push_debug(self.pc, format!("{inst:?}"));

            if let Err(e) = self.execute(&inst) {
                self.dump_debug();
                return Err(e);
            }
            regs_of(&mut self.owned_regs, &mut self.external_regs)[0] = 0;
            self.pc += 4;
        }
        Ok(self.counters.weighted_sum(&self.weights))
    }

    fn caller_saved_scramble(&mut self) {
        let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
        for &i in &CALLER_SAVED {
            regs[i] = regs[i].wrapping_add(SCRAMBLE);
        }
    }

    fn check_address(&self, addr: u32, width: u32) -> Result<()> {
        let arena_len = self.arena_len() as u64;
        if addr as u64 + width as u64 > arena_len {
            return Err(RavelError::InvalidAddress { addr, reason: "access outside arena".into() });
        }
        if self.keep_debug_info && (addr == 0 || self.heap.invalid.contains(&addr)) {
            return Err(RavelError::InvalidAddress { addr, reason: "access to guarded or null address".into() });
        }
        Ok(())
    }

    /// Cache-tick a memory access: the fetch address is 4-byte aligned,
    /// clamped for sub-word accesses that straddle the top of a 4-byte
    /// slot (original_source's `interpreter.cpp` `fetchFrom -= 2` rule).
    fn tick_cache_for_access(&mut self, addr: u32) -> bool {
        let mut fetch_from = addr;
        if addr % 4 == 3 {
            fetch_from = fetch_from.wrapping_sub(2);
        }
        self.cache.fetch_word(fetch_from & !3u32)
    }

    fn execute(&mut self, inst: &Instr) -> Result<()> {
        match inst {
            Instr::ImmConstruction { op, dest, imm20 } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let value = match op {
                    ImmOp::Lui => (*imm20 as u32) << 12,
                    ImmOp::Auipc => (self.pc as u32).wrapping_add((*imm20 as u32) << 12),
                };
                regs[*dest as usize] = value;
                self.counters.simple += 1;
            }
            Instr::ArithRegReg { op, dest, src1, src2 } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let a = regs[*src1 as usize];
                let b = regs[*src2 as usize];
                let value = match op {
                    ArithRegRegOp::Add => a.wrapping_add(b),
                    ArithRegRegOp::Sub => a.wrapping_sub(b),
                    ArithRegRegOp::Sll => a << (b & 0x1f),
                    ArithRegRegOp::Slt => ((a as i32) < (b as i32)) as u32,
                    ArithRegRegOp::Sltu => (a < b) as u32,
                    ArithRegRegOp::Xor => a ^ b,
                    ArithRegRegOp::Srl => a >> (b & 0x1f),
                    ArithRegRegOp::Sra => ((a as i32) >> (b & 0x1f)) as u32,
                    ArithRegRegOp::Or => a | b,
                    ArithRegRegOp::And => a & b,
                };
                regs[*dest as usize] = value;
                self.counters.simple += 1;
            }
            Instr::ArithRegImm { op, dest, src, imm12 } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let a = regs[*src as usize];
                let imm = *imm12 as u32;
                let value = match op {
                    ArithRegImmOp::Addi => a.wrapping_add(imm),
                    ArithRegImmOp::Slti => ((a as i32) < *imm12) as u32,
                    ArithRegImmOp::Sltiu => (a < imm) as u32,
                    ArithRegImmOp::Xori => a ^ imm,
                    ArithRegImmOp::Ori => a | imm,
                    ArithRegImmOp::Andi => a & imm,
                    ArithRegImmOp::Slli => a << (imm & 0x1f),
                    ArithRegImmOp::Srli => a >> (imm & 0x1f),
                    ArithRegImmOp::Srai => ((a as i32) >> (imm & 0x1f)) as u32,
                };
                regs[*dest as usize] = value;
                self.counters.simple += 1;
            }
            Instr::MemAccess { op, reg, base, offset } => {
                let regs_snapshot = *regs_of(&mut self.owned_regs, &mut self.external_regs);
                let addr = regs_snapshot[*base as usize].wrapping_add(*offset as u32);
                self.check_address(addr, op.width())?;
                let hit = self.tick_cache_for_access(addr);
                if hit {
                    self.counters.cache_hit += 1;
                } else {
                    self.counters.mem_miss += 1;
                }
                let arena = arena_of(&mut self.owned_arena, &mut self.external_arena);
                if op.is_store() {
                    let value = regs_snapshot[*reg as usize];
                    let a = addr as usize;
                    match op {
                        MemOp::Sb => arena[a] = value as u8,
                        MemOp::Sh => arena[a..a + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                        MemOp::Sw => arena[a..a + 4].copy_from_slice(&value.to_le_bytes()),
                        _ => unreachable!(),
                    }
                } else {
                    let a = addr as usize;
                    let value: u32 = match op {
                        MemOp::Lb => arena[a] as i8 as i32 as u32,
                        MemOp::Lbu => arena[a] as u32,
                        MemOp::Lh => i16::from_le_bytes(arena[a..a + 2].try_into().unwrap()) as i32 as u32,
                        MemOp::Lhu => u16::from_le_bytes(arena[a..a + 2].try_into().unwrap()) as u32,
                        MemOp::Lw => u32::from_le_bytes(arena[a..a + 4].try_into().unwrap()),
                        _ => unreachable!(),
                    };
                    regs_of(&mut self.owned_regs, &mut self.external_regs)[*reg as usize] = value;
                }
            }
            Instr::JumpLink { dest, offset } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                regs[*dest as usize] = (self.pc as u32).wrapping_add(4);
                self.pc = self.pc.wrapping_add(offset.wrapping_mul(2)).wrapping_sub(4);
                self.counters.simple += 1;
            }
            Instr::JumpLinkReg { dest, base, offset } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let target = regs[*base as usize].wrapping_add(*offset as u32) & !1u32;
                regs[*dest as usize] = (self.pc as u32).wrapping_add(4);
                self.pc = (target as i32).wrapping_sub(4);
                self.counters.simple += 1;
            }
            Instr::Branch { op, src1, src2, offset } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let a = regs[*src1 as usize];
                let b = regs[*src2 as usize];
                let taken = match op {
                    BranchOp::Beq => a == b,
                    BranchOp::Bne => a != b,
                    BranchOp::Blt => (a as i32) < (b as i32),
                    BranchOp::Bge => (a as i32) >= (b as i32),
                    BranchOp::Bltu => a < b,
                    BranchOp::Bgeu => a >= b,
                };
                if taken {
                    self.pc = self.pc.wrapping_add(*offset).wrapping_sub(4);
                }
                self.counters.branch += 1;
            }
            Instr::MArith { op, dest, src1, src2 } => {
                let regs = regs_of(&mut self.owned_regs, &mut self.external_regs);
                let a = regs[*src1 as usize];
                let b = regs[*src2 as usize];
                let value = match op {
                    MArithOp::Mul => a.wrapping_mul(b),
                    MArithOp::Mulh => {
                        (((a as i32) as i64).wrapping_mul((b as i32) as i64) >> 32) as u32
                    }
                    MArithOp::Mulhu => (((a as u64).wrapping_mul(b as u64)) >> 32) as u32,
                    MArithOp::Mulhsu => (((a as i32) as i64).wrapping_mul(b as i64) >> 32) as u32,
                    MArithOp::Div => {
                        let (ai, bi) = (a as i32, b as i32);
                        if bi == 0 {
                            u32::MAX
                        } else if ai == i32::MIN && bi == -1 {
                            i32::MIN as u32
                        } else {
                            ai.wrapping_div(bi) as u32
                        }
                    }
                    MArithOp::Divu => if b == 0 { u32::MAX } else { a / b },
                    MArithOp::Rem => {
                        let (ai, bi) = (a as i32, b as i32);
                        if bi == 0 {
                            a
                        } else if ai == i32::MIN && bi == -1 {
                            0
                        } else {
                            ai.wrapping_rem(bi) as u32
                        }
                    }
                    MArithOp::Remu => if b == 0 { a } else { a % b },
                };
                regs[*dest as usize] = value;
                match op {
                    MArithOp::Div | MArithOp::Divu | MArithOp::Rem | MArithOp::Remu => self.counters.div += 1,
                    _ => self.counters.mul += 1,
                }
            }
        }
        Ok(())
    }
}

/// One-shot driver (spec.md §6): assemble every source, link them, and
/// run the image to completion.
pub fn simulate(config: Config<'_>) -> Result<u64> {
    let units: Vec<_> = config
        .sources
        .iter()
        .map(|src| crate::assemble::assemble(src))
        .collect::<Result<_>>()?;
    let image = crate::link::link(&units)?;
    let mut interp = Interpreter::new(&image, config);
    interp.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::assemble;
    use crate::link::link;

    fn run_program(src: &str) -> (u64, [u32; 32]) {
        let unit = assemble(src).unwrap();
        let image = link(&[unit]).unwrap();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let config = Config::new(vec![], &mut input, &mut output);
        let mut interp = Interpreter::new(&image, config);
        let cycles = interp.run().unwrap();
        let regs = *regs_of(&mut interp.owned_regs, &mut interp.external_regs);
        (cycles, regs)
    }

    #[test]
    fn s1_return_value_in_a0() {
        let (_, regs) = run_program(".text\n.globl main\nmain:\nli a0,42\nret\n");
        assert_eq!(regs[10], 42);
    }

    #[test]
    fn s3_function_call_increments() {
        let (_, regs) = run_program(
            ".text\n.globl main\nmain:\nli a0,5\njal x1,f\nret\nf:\naddi a0,a0,1\nret\n",
        );
        assert_eq!(regs[10], 6);
    }

    #[test]
    fn x0_invariant_after_every_step() {
        let (_, regs) = run_program(".text\n.globl main\nmain:\naddi x0,x0,99\nli a0,1\nret\n");
        assert_eq!(regs[0], 0);
    }

    #[test]
    fn s5_puts_prints_hi() {
        let unit = assemble(
            ".data\nmsg: .string \"Hi\"\n.text\n.globl main\nmain:\nla a0,msg\ncall puts\nli a0,0\nret\n",
        )
        .unwrap();
        let image = link(&[unit]).unwrap();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let config = Config::new(vec![], &mut input, &mut output);
        let mut interp = Interpreter::new(&image, config);
        interp.run().unwrap();
        assert_eq!(output, b"Hi\n");
    }

    #[test]
    fn cache_accounting_matches_mem_accesses() {
        // invariant 5 (spec.md §8): hit + miss == total memory accesses executed
        let unit = assemble(
            ".data\nn: .word 7\n.text\n.globl main\nmain:\nla a0,n\nlw a1,0(a0)\nlw a1,0(a0)\nli a0,0\nret\n",
        )
        .unwrap();
        let image = link(&[unit]).unwrap();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let config = Config::new(vec![], &mut input, &mut output);
        let mut interp = Interpreter::new(&image, config);
        interp.run().unwrap();
        assert_eq!(interp.counters.total_mem_accesses(), 2);
    }

    #[test]
    fn division_by_zero_follows_risc_v_convention() {
        let (_, regs) = run_program(
            ".text\n.globl main\nmain:\nli a1,5\nli a2,0\ndiv a0,a1,a2\nret\n",
        );
        assert_eq!(regs[10], u32::MAX);
    }
}
