//! Libc surrogate (spec.md §4.6): per-function handlers that read
//! arguments from the register file and arena, call host equivalents,
//! and write results back.
//!
//! Grounded on `original_source/src/interpreter/libc_sim.cpp`. The
//! `sscanf` fall-through bug the original carries (its dispatch lacks a
//! `break`, bleeding into the `printf` case) is fixed here per the
//! design notes: each handler returns as soon as it has run.

use std::collections::HashSet;
use std::io::{Read, Write};

use crate::config::Counters;
use crate::error::{RavelError, Result};

/// Heap bookkeeping: live allocation bases and the guard-byte addresses
/// just past each allocation (spec.md §3, "Malloc table").
#[derive(Debug, Default)]
pub struct HeapState {
    pub heap_ptr: u32,
    pub live: HashSet<u32>,
    pub invalid: HashSet<u32>,
}

fn invalid_address(addr: u32, reason: &str) -> RavelError {
    RavelError::InvalidAddress { addr, reason: reason.to_string() }
}

fn read_cstr(arena: &[u8], addr: u32) -> Result<Vec<u8>> {
    let start = addr as usize;
    let end = arena[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| invalid_address(addr, "unterminated C string"))?;
    Ok(arena[start..end].to_vec())
}

fn write_bytes(arena: &mut [u8], addr: u32, bytes: &[u8]) -> Result<()> {
    let start = addr as usize;
    let end = start
        .checked_add(bytes.len())
        .ok_or_else(|| invalid_address(addr, "write overflows address space"))?;
    if end > arena.len() {
        return Err(invalid_address(addr, "write past end of arena"));
    }
    arena[start..end].copy_from_slice(bytes);
    Ok(())
}

fn get_arg(regs: &[u32; 32], n: usize) -> u32 {
    regs[10 + n]
}

fn set_ret(regs: &mut [u32; 32], v: u32) {
    regs[10] = v;
}

trait ScanSource {
    fn peek(&mut self) -> Option<u8>;
    fn advance(&mut self) -> Option<u8>;
}

struct StreamSource<'a> {
    inner: &'a mut dyn Read,
    pending: Option<u8>,
}

impl ScanSource for StreamSource<'_> {
    fn peek(&mut self) -> Option<u8> {
        if self.pending.is_none() {
            let mut b = [0u8; 1];
            if self.inner.read(&mut b).ok()? == 1 {
                self.pending = Some(b[0]);
            }
        }
        self.pending
    }

    fn advance(&mut self) -> Option<u8> {
        if let Some(b) = self.pending.take() {
            return Some(b);
        }
        let mut b = [0u8; 1];
        if self.inner.read(&mut b).ok()? == 1 {
            Some(b[0])
        } else {
            None
        }
    }
}

struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl ScanSource for SliceSource<'_> {
    fn peek(&mut self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }
}

fn skip_whitespace(src: &mut dyn ScanSource) {
    while matches!(src.peek(), Some(b) if (b as char).is_whitespace()) {
        src.advance();
    }
}

/// Shared `scanf`/`sscanf` engine: `%d` writes a 4-byte int to the
/// arena pointer in the next argument register; `%s` writes a
/// whitespace-terminated, NUL-terminated string; literal whitespace in
/// the format consumes any amount of input whitespace; a failed `%d`/`%s`
/// conversion stops scanning. Returns the number of conversions made.
fn run_scanf(
    fmt: &[u8],
    regs: &[u32; 32],
    arena: &mut [u8],
    arg_start: usize,
    src: &mut dyn ScanSource,
) -> Result<u32> {
    let mut conversions = 0u32;
    let mut arg = arg_start;
    let mut i = 0usize;
    while i < fmt.len() {
        let c = fmt[i];
        if (c as char).is_whitespace() {
            skip_whitespace(src);
            i += 1;
            continue;
        }
        if c == b'%' {
            i += 1;
            let spec = *fmt
                .get(i)
                .ok_or_else(|| RavelError::NotSupported("dangling `%` in scanf format".into()))?;
            i += 1;
            match spec {
                b'd' => {
                    skip_whitespace(src);
                    let mut digits = String::new();
                    if src.peek() == Some(b'-') {
                        digits.push('-');
                        src.advance();
                    }
                    while matches!(src.peek(), Some(b) if b.is_ascii_digit()) {
                        digits.push(src.advance().unwrap() as char);
                    }
                    if digits.is_empty() || digits == "-" {
                        break;
                    }
                    let value: i32 = digits
                        .parse()
                        .map_err(|_| RavelError::Runtime(format!("bad integer `{digits}` in scanf")))?;
                    write_bytes(arena, get_arg(regs, arg), &value.to_le_bytes())?;
                    arg += 1;
                    conversions += 1;
                }
                b's' => {
                    skip_whitespace(src);
                    let mut word = Vec::new();
                    while matches!(src.peek(), Some(b) if !(b as char).is_whitespace()) {
                        word.push(src.advance().unwrap());
                    }
                    if word.is_empty() {
                        break;
                    }
                    word.push(0);
                    write_bytes(arena, get_arg(regs, arg), &word)?;
                    arg += 1;
                    conversions += 1;
                }
                other => {
                    return Err(RavelError::NotSupported(format!(
                        "unsupported scanf specifier `%{}`",
                        other as char
                    )))
                }
            }
        } else {
            if src.peek() != Some(c) {
                break;
            }
            src.advance();
            i += 1;
        }
    }
    Ok(conversions)
}

/// Shared `printf`/`sprintf` engine: `%d` and `%s` consume one register
/// argument each, `%%` is a literal percent. Returns the formatted bytes.
fn run_printf(fmt: &[u8], regs: &[u32; 32], arena: &[u8], arg_start: usize, max_args: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut arg = arg_start;
    let mut i = 0usize;
    while i < fmt.len() {
        let c = fmt[i];
        if c != b'%' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        let spec = *fmt
            .get(i)
            .ok_or_else(|| RavelError::NotSupported("dangling `%` in printf format".into()))?;
        i += 1;
        match spec {
            b'%' => out.push(b'%'),
            b'd' => {
                if arg - arg_start >= max_args {
                    return Err(RavelError::Runtime("printf exceeded its argument budget".into()));
                }
                let value = get_arg(regs, arg) as i32;
                out.extend_from_slice(value.to_string().as_bytes());
                arg += 1;
            }
            b's' => {
                if arg - arg_start >= max_args {
                    return Err(RavelError::Runtime("printf exceeded its argument budget".into()));
                }
                let s = read_cstr(arena, get_arg(regs, arg))?;
                out.extend_from_slice(&s);
                arg += 1;
            }
            other => {
                return Err(RavelError::NotSupported(format!(
                    "unsupported printf specifier `%{}`",
                    other as char
                )))
            }
        }
    }
    Ok(out)
}

/// Dispatch one libc trampoline call by name. `regs`/`arena` are the
/// interpreter's live state; the return value is written into `a0` by
/// each handler, matching the RV32 calling convention.
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    name: &str,
    regs: &mut [u32; 32],
    arena: &mut [u8],
    heap: &mut HeapState,
    input: &mut dyn Read,
    output: &mut dyn Write,
    counters: &mut Counters,
) -> Result<()> {
    match name {
        "puts" => {
            let s = read_cstr(arena, get_arg(regs, 0))?;
            output
                .write_all(&s)
                .and_then(|_| output.write_all(b"\n"))
                .map_err(|e| RavelError::Runtime(format!("puts: {e}")))?;
            set_ret(regs, (s.len() + 1) as u32);
            counters.libc_io += 1;
        }
        "putchar" => {
            let c = get_arg(regs, 0) as u8;
            output
                .write_all(&[c])
                .map_err(|e| RavelError::Runtime(format!("putchar: {e}")))?;
            set_ret(regs, c as u32);
            counters.libc_io += 1;
        }
        "printf" => {
            let fmt = read_cstr(arena, get_arg(regs, 0))?;
            let text = run_printf(&fmt, regs, arena, 1, 7)?;
            output
                .write_all(&text)
                .map_err(|e| RavelError::Runtime(format!("printf: {e}")))?;
            set_ret(regs, text.len() as u32);
            counters.libc_io += 1;
        }
        "sprintf" => {
            let dest = get_arg(regs, 0);
            let fmt = read_cstr(arena, get_arg(regs, 1))?;
            let mut text = run_printf(&fmt, regs, arena, 2, 6)?;
            text.push(0);
            let len = text.len() - 1;
            write_bytes(arena, dest, &text)?;
            set_ret(regs, len as u32);
            counters.libc_io += 1;
        }
        "scanf" => {
            let fmt = read_cstr(arena, get_arg(regs, 0))?;
            let mut src = StreamSource { inner: input, pending: None };
            let n = run_scanf(&fmt, regs, arena, 1, &mut src)?;
            set_ret(regs, n);
            counters.libc_io += 1;
        }
        "sscanf" => {
            let source_str = read_cstr(arena, get_arg(regs, 0))?;
            let fmt = read_cstr(arena, get_arg(regs, 1))?;
            let mut src = SliceSource { data: &source_str, pos: 0 };
            let n = run_scanf(&fmt, regs, arena, 2, &mut src)?;
            set_ret(regs, n);
            counters.libc_io += 1;
        }
        "malloc" => {
            let sz = get_arg(regs, 0);
            let base = alloc(heap, arena.len() as u32, sz)?;
            set_ret(regs, base);
            counters.libc_mem += 1;
        }
        "calloc" => {
            let n = get_arg(regs, 0);
            let sz = get_arg(regs, 1);
            let total = n.saturating_mul(sz);
            let base = alloc(heap, arena.len() as u32, total)?;
            write_bytes(arena, base, &vec![0u8; total as usize])?;
            set_ret(regs, base);
            counters.libc_mem += 1;
        }
        "free" => {
            let p = get_arg(regs, 0);
            if !heap.live.remove(&p) {
                return Err(RavelError::Runtime(format!(
                    "free of untracked or already-freed pointer 0x{p:08x}"
                )));
            }
            counters.libc_mem += 1;
        }
        "memcpy" => {
            let d = get_arg(regs, 0);
            let s = get_arg(regs, 1);
            let n = get_arg(regs, 2) as usize;
            let bytes = arena
                .get(s as usize..s as usize + n)
                .ok_or_else(|| invalid_address(s, "memcpy source out of bounds"))?
                .to_vec();
            write_bytes(arena, d, &bytes)?;
            set_ret(regs, d);
            counters.libc_mem += 1 + (n / 512) as u64;
        }
        "memset" => {
            let d = get_arg(regs, 0);
            let c = get_arg(regs, 1) as u8;
            let n = get_arg(regs, 2) as usize;
            write_bytes(arena, d, &vec![c; n])?;
            set_ret(regs, d);
            counters.libc_mem += 1 + (n / 512) as u64;
        }
        "strlen" => {
            let s = read_cstr(arena, get_arg(regs, 0))?;
            set_ret(regs, s.len() as u32);
            counters.libc_mem += 1;
        }
        "strcpy" => {
            let d = get_arg(regs, 0);
            let mut s = read_cstr(arena, get_arg(regs, 1))?;
            s.push(0);
            write_bytes(arena, d, &s)?;
            set_ret(regs, d);
            counters.libc_mem += 1;
        }
        "strcat" => {
            let d = get_arg(regs, 0);
            let existing = read_cstr(arena, d)?;
            let mut tail = read_cstr(arena, get_arg(regs, 1))?;
            tail.push(0);
            write_bytes(arena, d + existing.len() as u32, &tail)?;
            set_ret(regs, d);
            counters.libc_mem += 1;
        }
        "strcmp" => {
            let a = read_cstr(arena, get_arg(regs, 0))?;
            let b = read_cstr(arena, get_arg(regs, 1))?;
            let result = match a.iter().zip(b.iter()).find(|(x, y)| x != y) {
                Some((x, y)) => *x as i32 - *y as i32,
                None => a.len() as i32 - b.len() as i32,
            };
            set_ret(regs, result as u32);
            counters.libc_mem += 1;
        }
        other => return Err(RavelError::NotSupported(format!("unknown libc function `{other}`"))),
    }
    Ok(())
}

/// Bump-allocate `sz` bytes, then reserve a 1- or 2-byte guard aligned
/// to an even address (spec.md §4.6, §3). Fatal if the arena is
/// exhausted.
fn alloc(heap: &mut HeapState, arena_len: u32, sz: u32) -> Result<u32> {
    let base = heap.heap_ptr;
    let after = base
        .checked_add(sz)
        .ok_or_else(|| RavelError::Runtime("malloc size overflows the address space".into()))?;
    let guard_len: u32 = if after % 2 == 0 { 2 } else { 1 };
    let new_ptr = after
        .checked_add(guard_len)
        .ok_or_else(|| RavelError::Runtime("malloc size overflows the address space".into()))?;
    if new_ptr > arena_len {
        return Err(RavelError::Runtime("heap exhausted".into()));
    }
    heap.live.insert(base);
    for g in after..new_ptr {
        heap.invalid.insert(g);
    }
    heap.heap_ptr = new_ptr;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs() -> [u32; 32] {
        [0u32; 32]
    }

    #[test]
    fn puts_writes_string_and_newline() {
        let mut arena = vec![0u8; 64];
        arena[0..3].copy_from_slice(b"Hi\0");
        let mut r = regs();
        r[10] = 0;
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut heap = HeapState::default();
        let mut counters = Counters::default();
        dispatch("puts", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap();
        assert_eq!(output, b"Hi\n");
        assert_eq!(r[10], 3);
    }

    #[test]
    fn malloc_then_free_round_trips() {
        let mut arena = vec![0u8; 4096];
        let mut r = regs();
        r[10] = 16;
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut heap = HeapState::default();
        let mut counters = Counters::default();
        dispatch("malloc", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap();
        let base = r[10];
        assert!(heap.live.contains(&base));
        r[10] = base;
        dispatch("free", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap();
        assert!(heap.live.is_empty());
    }

    #[test]
    fn double_free_is_a_runtime_error() {
        let mut arena = vec![0u8; 4096];
        let mut r = regs();
        r[10] = 0;
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut heap = HeapState::default();
        let mut counters = Counters::default();
        let err = dispatch("free", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap_err();
        assert!(matches!(err, RavelError::Runtime(_)));
    }

    #[test]
    fn heap_disjointness() {
        // invariant 6 (spec.md §8)
        let mut heap = HeapState::default();
        let a = alloc(&mut heap, 4096, 10).unwrap();
        let b = alloc(&mut heap, 4096, 20).unwrap();
        assert!(b >= a + 10 + 1);
    }

    #[test]
    fn sscanf_two_ints() {
        let mut arena = vec![0u8; 64];
        let src = b"3 7\0";
        arena[0..src.len()].copy_from_slice(src);
        let fmt = b"%d %d\0";
        arena[16..16 + fmt.len()].copy_from_slice(fmt);
        let mut r = regs();
        r[10] = 0; // src
        r[11] = 16; // fmt
        r[12] = 32; // &a
        r[13] = 36; // &b
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut heap = HeapState::default();
        let mut counters = Counters::default();
        dispatch("sscanf", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap();
        assert_eq!(r[10], 2);
        assert_eq!(i32::from_le_bytes(arena[32..36].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(arena[36..40].try_into().unwrap()), 7);
    }

    #[test]
    fn printf_formats_d_and_s() {
        let mut arena = vec![0u8; 64];
        let fmt = b"sum=%d name=%s\0";
        arena[0..fmt.len()].copy_from_slice(fmt);
        arena[32..36].copy_from_slice(b"Al\0\0");
        let mut r = regs();
        r[10] = 0;
        r[11] = 10; // %d value
        r[12] = 32; // %s address
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut heap = HeapState::default();
        let mut counters = Counters::default();
        dispatch("printf", &mut r, &mut arena, &mut heap, &mut input, &mut output, &mut counters).unwrap();
        assert_eq!(output, b"sum=10 name=Al");
    }
}
