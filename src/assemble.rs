//! Two-pass assembler (spec.md §4.2) producing an `ObjectUnit`.
//!
//! Grounded on `original_source/src/assembler/assembler.cpp`'s
//! `AssemblerPass1`/`AssemblerPass2` split: pass 1 walks the
//! preprocessed lines to lay out sections and discover symbols; pass 2
//! re-walks the same lines to emit instruction records and patch the
//! image's 4-byte pool-index slots. Kept as two separate functions
//! (not merged) so the invariant that layout is fully known before any
//! instruction is parsed stays visible in the code, not just the spec.

use std::collections::{HashMap, HashSet};

use crate::error::{RavelError, Result};
use crate::instr::{ArithRegImmOp, ArithRegRegOp, BranchOp, ImmOp, Instr, MArithOp, MemOp, RelocKind, Relocation};
use crate::parse::{self, ImmOperand, Section};
use crate::preprocess::preprocess;

/// The assembler's output for one source string (spec.md §3).
#[derive(Debug, Default, Clone)]
pub struct ObjectUnit {
    pub storage: Vec<u8>,
    pub insts: Vec<Instr>,
    /// Byte offset (within `storage`) of `insts[i]`'s 4-byte pool slot.
    pub inst_pos: Vec<usize>,
    pub sym_table: HashMap<String, usize>,
    pub globals: HashSet<String>,
    pub external_refs: HashMap<usize, String>,
    pub relocations: HashMap<usize, Relocation>,
    pub deferred_words: Vec<(String, usize)>,
}

fn round_up_16(n: usize) -> usize {
    (n + 15) & !15
}

fn round_up_pow2(n: usize, k: u32) -> usize {
    let align = 1usize << k;
    (n + align - 1) & !(align - 1)
}

#[derive(Default)]
struct Sections {
    text: Vec<u8>,
    data: Vec<u8>,
    rodata: Vec<u8>,
    bss: Vec<u8>,
}

impl Sections {
    fn get_mut(&mut self, s: Section) -> &mut Vec<u8> {
        match s {
            Section::Text => &mut self.text,
            Section::Data => &mut self.data,
            Section::Rodata => &mut self.rodata,
            Section::Bss => &mut self.bss,
        }
    }
}

/// A symbol's position before sections have been concatenated: which
/// section it lives in, plus its offset within that section.
struct RawSym {
    section: Section,
    offset: usize,
}

struct Layout {
    sections: Sections,
    syms: HashMap<String, RawSym>,
    globals: HashSet<String>,
    /// (symbol, section, offset-within-section) for `.word sym`.
    raw_deferred: Vec<(String, Section, usize)>,
}

fn pass1(lines: &[String]) -> Result<Layout> {
    let mut sections = Sections::default();
    let mut current: Option<Section> = None;
    let mut syms = HashMap::new();
    let mut globals = HashSet::new();
    let mut raw_deferred = Vec::new();

    for line in lines {
        if let Some(sec) = parse::parse_section_directive(line) {
            current = Some(sec);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".globl ") {
            globals.insert(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix(".align ").or_else(|| line.strip_prefix(".p2align ")) {
            let k: u32 = rest
                .trim()
                .parse()
                .map_err(|_| RavelError::NotSupported(format!("bad alignment `{line}`")))?;
            let sec = current.ok_or_else(|| RavelError::NotSupported(".align outside a section".into()))?;
            let buf = sections.get_mut(sec);
            let target = round_up_pow2(buf.len(), k);
            buf.resize(target, 0);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".comm ") {
            let parts: Vec<&str> = rest.split(',').map(|s| s.trim()).collect();
            if parts.len() != 3 {
                return Err(RavelError::NotSupported(format!(".comm needs 3 args: `{line}`")));
            }
            let size: usize = parts[1]
                .parse()
                .map_err(|_| RavelError::NotSupported(format!("bad .comm size: `{line}`")))?;
            let align: u32 = parts[2]
                .parse()
                .map_err(|_| RavelError::NotSupported(format!("bad .comm align: `{line}`")))?;
            let buf = sections.get_mut(Section::Bss);
            let target = (buf.len() + align as usize - 1) & !(align as usize - 1);
            buf.resize(target, 0);
            let offset = buf.len();
            if syms.insert(parts[0].to_string(), RawSym { section: Section::Bss, offset }).is_some() {
                return Err(RavelError::DuplicatedSymbol(parts[0].to_string()));
            }
            buf.resize(offset + size, 0);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".zero ") {
            let n: usize = rest
                .trim()
                .parse()
                .map_err(|_| RavelError::NotSupported(format!("bad .zero count: `{line}`")))?;
            let sec = current.ok_or_else(|| RavelError::NotSupported(".zero outside a section".into()))?;
            sections.get_mut(sec).resize(sections.get_mut(sec).len() + n, 0);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".string ").or_else(|| line.strip_prefix(".asciz ")) {
            let bytes = parse::decode_string_literal(rest.trim())?;
            let sec = current.ok_or_else(|| RavelError::NotSupported(".string outside a section".into()))?;
            let buf = sections.get_mut(sec);
            buf.extend_from_slice(&bytes);
            buf.push(0);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".word ") {
            let sec = current.ok_or_else(|| RavelError::NotSupported(".word outside a section".into()))?;
            let offset = sections.get_mut(sec).len();
            let rest = rest.trim();
            if let Ok(v) = parse::parse_immediate(rest) {
                sections.get_mut(sec).extend_from_slice(&v.to_le_bytes());
            } else {
                sections.get_mut(sec).extend_from_slice(&0i32.to_le_bytes());
                raw_deferred.push((rest.to_string(), sec, offset));
            }
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            let sec = current.ok_or_else(|| RavelError::NotSupported(format!("label `{label}` outside a section")))?;
            let offset = sections.get_mut(sec).len();
            if syms.insert(label.to_string(), RawSym { section: sec, offset }).is_some() {
                return Err(RavelError::DuplicatedSymbol(label.to_string()));
            }
            continue;
        }
        if line.starts_with('.') {
            return Err(RavelError::NotSupported(format!("unsupported directive `{line}`")));
        }
        // A concrete instruction: reserve 4 bytes in the current (text) section.
        let sec = current.ok_or_else(|| RavelError::NotSupported(format!("instruction `{line}` outside a section")))?;
        sections.get_mut(sec).extend_from_slice(&[0u8; 4]);
    }

    Ok(Layout { sections, syms, globals, raw_deferred })
}

/// Where a label/section layout ended up after the four sections were
/// padded to 16 bytes and concatenated `[text | data | rodata | bss]`.
struct FlatLayout {
    base: HashMap<Section, usize>,
    storage: Vec<u8>,
    sym_table: HashMap<String, usize>,
    deferred_words: Vec<(String, usize)>,
}

fn flatten(layout: Layout) -> FlatLayout {
    let text_padded = round_up_16(layout.sections.text.len());
    let data_padded = round_up_16(layout.sections.data.len());
    let rodata_padded = round_up_16(layout.sections.rodata.len());

    let mut base = HashMap::new();
    base.insert(Section::Text, 0);
    base.insert(Section::Data, text_padded);
    base.insert(Section::Rodata, text_padded + data_padded);
    base.insert(Section::Bss, text_padded + data_padded + rodata_padded);

    let mut storage = Vec::new();
    storage.extend_from_slice(&layout.sections.text);
    storage.resize(text_padded, 0);
    storage.extend_from_slice(&layout.sections.data);
    storage.resize(text_padded + data_padded, 0);
    storage.extend_from_slice(&layout.sections.rodata);
    storage.resize(text_padded + data_padded + rodata_padded, 0);
    storage.extend_from_slice(&layout.sections.bss);

    let sym_table = layout
        .syms
        .into_iter()
        .map(|(name, raw)| (name, base[&raw.section] + raw.offset))
        .collect();
    let deferred_words = layout
        .raw_deferred
        .into_iter()
        .map(|(sym, sec, off)| (sym, base[&sec] + off))
        .collect();

    FlatLayout {
        base,
        storage,
        sym_table,
        deferred_words,
    }
}

enum Target {
    Baked(i32),
    External(String),
}

fn resolve_target(target: &str, pos: usize, sym_table: &HashMap<String, usize>) -> Target {
    match sym_table.get(target) {
        Some(&addr) => Target::Baked(addr as i32 - pos as i32),
        None => Target::External(target.to_string()),
    }
}

fn split_operands(rest: &str) -> Vec<&str> {
    rest.split(',').map(|s| s.trim()).collect()
}

struct Emitted {
    instr: Instr,
    reloc: Option<Relocation>,
    external: Option<String>,
}

fn imm_operand_to_field(
    operand: ImmOperand,
    relocs: &mut Option<Relocation>,
) -> i32 {
    match operand {
        ImmOperand::Number(n) => n,
        ImmOperand::Reloc(kind, symbol, addend) => {
            *relocs = Some(Relocation { kind, symbol, addend });
            0
        }
    }
}

fn parse_instruction(mnemonic: &str, rest: &str, pos: usize, sym_table: &HashMap<String, usize>) -> Result<Emitted> {
    let ops = split_operands(rest);
    let reg = |s: &str| parse::reg_name_to_number(s);

    macro_rules! arith_rr {
        ($op:expr) => {{
            Ok(Emitted {
                instr: Instr::ArithRegReg { op: $op, dest: reg(ops[0])?, src1: reg(ops[1])?, src2: reg(ops[2])? },
                reloc: None,
                external: None,
            })
        }};
    }
    macro_rules! arith_ri {
        ($op:expr) => {{
            let mut reloc = None;
            let imm = imm_operand_to_field(parse::parse_imm_operand(ops[2])?, &mut reloc);
            Ok(Emitted {
                instr: Instr::ArithRegImm { op: $op, dest: reg(ops[0])?, src: reg(ops[1])?, imm12: imm },
                reloc,
                external: None,
            })
        }};
    }
    macro_rules! marith {
        ($op:expr) => {{
            Ok(Emitted {
                instr: Instr::MArith { op: $op, dest: reg(ops[0])?, src1: reg(ops[1])?, src2: reg(ops[2])? },
                reloc: None,
                external: None,
            })
        }};
    }

    match mnemonic {
        "lui" | "auipc" => {
            let op = if mnemonic == "lui" { ImmOp::Lui } else { ImmOp::Auipc };
            let mut reloc = None;
            let imm = imm_operand_to_field(parse::parse_imm_operand(ops[1])?, &mut reloc);
            Ok(Emitted {
                instr: Instr::ImmConstruction { op, dest: reg(ops[0])?, imm20: imm },
                reloc,
                external: None,
            })
        }
        "add" => arith_rr!(ArithRegRegOp::Add),
        "sub" => arith_rr!(ArithRegRegOp::Sub),
        "sll" => arith_rr!(ArithRegRegOp::Sll),
        "slt" => arith_rr!(ArithRegRegOp::Slt),
        "sltu" => arith_rr!(ArithRegRegOp::Sltu),
        "xor" => arith_rr!(ArithRegRegOp::Xor),
        "srl" => arith_rr!(ArithRegRegOp::Srl),
        "sra" => arith_rr!(ArithRegRegOp::Sra),
        "or" => arith_rr!(ArithRegRegOp::Or),
        "and" => arith_rr!(ArithRegRegOp::And),
        "addi" => arith_ri!(ArithRegImmOp::Addi),
        "slti" => arith_ri!(ArithRegImmOp::Slti),
        "sltiu" => arith_ri!(ArithRegImmOp::Sltiu),
        "xori" => arith_ri!(ArithRegImmOp::Xori),
        "ori" => arith_ri!(ArithRegImmOp::Ori),
        "andi" => arith_ri!(ArithRegImmOp::Andi),
        "slli" => arith_ri!(ArithRegImmOp::Slli),
        "srli" => arith_ri!(ArithRegImmOp::Srli),
        "srai" => arith_ri!(ArithRegImmOp::Srai),
        "mul" => marith!(MArithOp::Mul),
        "mulh" => marith!(MArithOp::Mulh),
        "mulhsu" => marith!(MArithOp::Mulhsu),
        "mulhu" => marith!(MArithOp::Mulhu),
        "div" => marith!(MArithOp::Div),
        "divu" => marith!(MArithOp::Divu),
        "rem" => marith!(MArithOp::Rem),
        "remu" => marith!(MArithOp::Remu),
        "lb" | "lh" | "lw" | "lbu" | "lhu" => {
            let op = match mnemonic {
                "lb" => MemOp::Lb,
                "lh" => MemOp::Lh,
                "lw" => MemOp::Lw,
                "lbu" => MemOp::Lbu,
                _ => MemOp::Lhu,
            };
            let (imm, base) = parse::parse_base_offset(ops[1])?;
            let mut reloc = None;
            let offset = imm_operand_to_field(imm, &mut reloc);
            Ok(Emitted {
                instr: Instr::MemAccess { op, reg: reg(ops[0])?, base, offset },
                reloc,
                external: None,
            })
        }
        "sb" | "sh" | "sw" => {
            let op = match mnemonic {
                "sb" => MemOp::Sb,
                "sh" => MemOp::Sh,
                _ => MemOp::Sw,
            };
            let (imm, base) = parse::parse_base_offset(ops[1])?;
            let mut reloc = None;
            let offset = imm_operand_to_field(imm, &mut reloc);
            Ok(Emitted {
                instr: Instr::MemAccess { op, reg: reg(ops[0])?, base, offset },
                reloc,
                external: None,
            })
        }
        "jalr" => {
            let (imm, base) = parse::parse_base_offset(ops[1])?;
            let mut reloc = None;
            let offset = imm_operand_to_field(imm, &mut reloc);
            Ok(Emitted {
                instr: Instr::JumpLinkReg { dest: reg(ops[0])?, base, offset },
                reloc,
                external: None,
            })
        }
        "jal" => {
            let dest = reg(ops[0])?;
            match resolve_target(ops[1], pos, sym_table) {
                Target::Baked(byte_off) => Ok(Emitted {
                    instr: Instr::JumpLink { dest, offset: byte_off / 2 },
                    reloc: None,
                    external: None,
                }),
                Target::External(sym) => Ok(Emitted {
                    instr: Instr::JumpLink { dest, offset: 0 },
                    reloc: None,
                    external: Some(sym),
                }),
            }
        }
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => {
            let op = match mnemonic {
                "beq" => BranchOp::Beq,
                "bne" => BranchOp::Bne,
                "blt" => BranchOp::Blt,
                "bge" => BranchOp::Bge,
                "bltu" => BranchOp::Bltu,
                _ => BranchOp::Bgeu,
            };
            let src1 = reg(ops[0])?;
            let src2 = reg(ops[1])?;
            match resolve_target(ops[2], pos, sym_table) {
                Target::Baked(byte_off) => Ok(Emitted {
                    instr: Instr::Branch { op, src1, src2, offset: byte_off },
                    reloc: None,
                    external: None,
                }),
                Target::External(sym) => Ok(Emitted {
                    instr: Instr::Branch { op, src1, src2, offset: 0 },
                    reloc: None,
                    external: Some(sym),
                }),
            }
        }
        _ => Err(RavelError::NotSupported(format!("unknown opcode `{mnemonic}`"))),
    }
}

fn split_mnemonic(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

fn pass2(lines: &[String], flat: FlatLayout) -> Result<ObjectUnit> {
    let mut current: Option<Section> = None;
    let mut pos = 0usize;
    let mut insts = Vec::new();
    let mut inst_pos = Vec::new();
    let mut external_refs = HashMap::new();
    let mut relocations = HashMap::new();

    for line in lines {
        if let Some(sec) = parse::parse_section_directive(line) {
            current = Some(sec);
            pos = flat.base[&sec];
            continue;
        }
        if line.starts_with(".globl ") {
            continue;
        }
        if let Some(rest) = line.strip_prefix(".align ").or_else(|| line.strip_prefix(".p2align ")) {
            if current == Some(Section::Text) {
                let k: u32 = rest.trim().parse().unwrap_or(0);
                pos = round_up_pow2(pos, k);
            }
            continue;
        }
        if line.strip_suffix(':').is_some() {
            continue;
        }
        if line.starts_with(".comm ") || line.starts_with(".zero ") || line.starts_with(".word ")
            || line.starts_with(".string ") || line.starts_with(".asciz ")
        {
            continue;
        }
        if current != Some(Section::Text) {
            continue;
        }
        let (mnemonic, rest) = split_mnemonic(line);
        let emitted = parse_instruction(mnemonic, rest, pos, &flat.sym_table)?;
        let idx = insts.len();
        insts.push(emitted.instr);
        inst_pos.push(pos);
        if let Some(reloc) = emitted.reloc {
            relocations.insert(idx, reloc);
        }
        if let Some(sym) = emitted.external {
            external_refs.insert(idx, sym);
        }
        pos += 4;
    }

    Ok(ObjectUnit {
        storage: flat.storage,
        insts,
        inst_pos,
        sym_table: flat.sym_table,
        globals: HashSet::new(),
        external_refs,
        relocations,
        deferred_words: flat.deferred_words,
    })
}

/// Assemble a single source string into an `ObjectUnit`.
pub fn assemble(source: &str) -> Result<ObjectUnit> {
    let lines = preprocess(source)?;
    let layout = pass1(&lines)?;
    let globals = layout.globals.clone();
    let flat = flatten(layout);
    let mut unit = pass2(&lines, flat)?;
    unit.globals = globals;
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_minimal_function() {
        let unit = assemble(".text\n.globl main\nmain:\nli a0, 42\nret\n").unwrap();
        assert!(unit.globals.contains("main"));
        assert_eq!(*unit.sym_table.get("main").unwrap(), 0);
        assert_eq!(unit.insts.len(), 2);
    }

    #[test]
    fn inst_pos_tracks_one_reserved_slot_per_instruction() {
        // `inst_pos` is the per-unit half of invariant 2 (spec.md §8): the
        // linker fills each of these 4-byte slots with the instruction's
        // final pool index once units are merged (see link::link).
        let unit = assemble(".text\n.globl main\nmain:\naddi a0,a0,1\naddi a0,a0,1\nret\n").unwrap();
        assert_eq!(unit.inst_pos.len(), unit.insts.len());
        for w in unit.inst_pos.windows(2) {
            assert_eq!(w[1] - w[0], 4);
        }
        for &p in &unit.inst_pos {
            assert_eq!(u32::from_le_bytes(unit.storage[p..p + 4].try_into().unwrap()), 0);
        }
    }

    #[test]
    fn duplicate_symbol_is_fatal() {
        let err = assemble(".text\nfoo:\naddi x0,x0,0\nfoo:\naddi x0,x0,0\n").unwrap_err();
        assert!(matches!(err, RavelError::DuplicatedSymbol(_)));
    }

    #[test]
    fn data_section_string_and_word() {
        let unit = assemble(".data\nmsg: .string \"hi\"\nn: .word 7\n").unwrap();
        let msg_off = *unit.sym_table.get("msg").unwrap();
        assert_eq!(&unit.storage[msg_off..msg_off + 3], b"hi\0");
    }

    #[test]
    fn local_branch_target_is_baked_in() {
        let unit = assemble(".text\nloop:\naddi a0,a0,-1\nbne a0,x0,loop\n").unwrap();
        assert!(unit.external_refs.is_empty());
        match unit.insts[1] {
            Instr::Branch { offset, .. } => assert_eq!(offset, -4),
            _ => panic!("expected branch"),
        }
    }

    #[test]
    fn unresolved_call_target_is_external() {
        let unit = assemble(".text\ncall missing\n").unwrap();
        assert_eq!(unit.external_refs.len(), 0.max(0));
        // the `call` pseudo-op uses %pcrel_hi/%pcrel_lo relocations, not
        // a bare external ref, so external_refs stays empty and the
        // auipc carries a PcrelHi relocation instead.
        assert!(unit.relocations.values().any(|r| r.kind == RelocKind::PcrelHi && r.symbol == "missing"));
    }
}
