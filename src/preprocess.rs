//! Lexer / preprocessor (spec.md §4.1).
//!
//! Grounded on `original_source/src/assembler/preprocessor.cpp`: strip
//! comments honoring string literals, hoist labels to their own line,
//! expand pseudo-instructions, and synthesize unique local labels for
//! the multi-instruction expansions. The teacher's own parsing code
//! (`utils.rs`, `fields.rs`) scans plain `char`s rather than reaching for
//! `regex`, so this module does too; `rand` is added (the teacher does
//! not depend on it) purely to stand in for the original's
//! `std::mt19937_64`-seeded synthesized label prefix.

use crate::error::{RavelError, Result};
use rand::Rng;

/// Strip a `#` comment, honoring `"`-delimited string literals and `\`
/// escapes within them.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == b'#' {
            return &line[..i];
        }
    }
    line
}

fn is_label_char(c: char) -> bool {
    c == '.' || c == '_' || c.is_ascii_alphanumeric()
}

/// If `line` begins with a `label:`, split it into the label's own line
/// and the (possibly empty) remainder.
fn split_label(line: &str) -> (Option<&str>, &str) {
    let mut end = 0;
    let bytes = line.as_bytes();
    while end < bytes.len() && is_label_char(bytes[end] as char) {
        end += 1;
    }
    if end > 0 && bytes.get(end) == Some(&b':') {
        (Some(&line[..end + 1]), line[end + 1..].trim())
    } else {
        (None, line)
    }
}

/// Split a source string into trimmed, comment-free, non-empty lines,
/// with labels hoisted onto their own line. This step alone (without
/// pseudo-op expansion) is what the "idempotent preprocessing" property
/// (spec.md §8, invariant 1) is checked against.
fn normalize_lines(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw in source.split('\n') {
        let stripped = strip_comment(raw).trim();
        if stripped.is_empty() {
            continue;
        }
        let (label, rest) = split_label(stripped);
        if let Some(label) = label {
            out.push(label.to_string());
            if !rest.is_empty() {
                out.push(rest.to_string());
            }
        } else {
            out.push(stripped.to_string());
        }
    }
    out
}

fn split_operands(rest: &str) -> Vec<&str> {
    rest.split(',').map(|s| s.trim()).collect()
}

/// Expand a single-instruction pseudo-op (no synthesized labels
/// required). Returns `None` if `mnemonic` is not one of these forms.
fn translate_single(mnemonic: &str, rest: &str) -> Option<Vec<String>> {
    let ops = split_operands(rest);
    let line = |s: String| vec![s];
    match mnemonic {
        "nop" => Some(line("addi x0,x0,0".into())),
        "mv" if ops.len() == 2 => Some(line(format!("addi {},{},0", ops[0], ops[1]))),
        "not" if ops.len() == 2 => Some(line(format!("xori {},{},-1", ops[0], ops[1]))),
        "neg" if ops.len() == 2 => Some(line(format!("sub {},x0,{}", ops[0], ops[1]))),
        "seqz" if ops.len() == 2 => Some(line(format!("sltiu {},{},1", ops[0], ops[1]))),
        "snez" if ops.len() == 2 => Some(line(format!("sltu {},x0,{}", ops[0], ops[1]))),
        "sltz" if ops.len() == 2 => Some(line(format!("slt {},{},x0", ops[0], ops[1]))),
        "sgtz" if ops.len() == 2 => Some(line(format!("slt {},x0,{}", ops[0], ops[1]))),
        "sgt" if ops.len() == 3 => Some(line(format!("slt {},{},{}", ops[0], ops[2], ops[1]))),
        "bgt" if ops.len() == 3 => Some(line(format!("blt {},{},{}", ops[1], ops[0], ops[2]))),
        "ble" if ops.len() == 3 => Some(line(format!("bge {},{},{}", ops[1], ops[0], ops[2]))),
        "bgtu" if ops.len() == 3 => Some(line(format!("bltu {},{},{}", ops[1], ops[0], ops[2]))),
        "bleu" if ops.len() == 3 => Some(line(format!("bgeu {},{},{}", ops[1], ops[0], ops[2]))),
        "beqz" if ops.len() == 2 => Some(line(format!("beq {},x0,{}", ops[0], ops[1]))),
        "bnez" if ops.len() == 2 => Some(line(format!("bne {},x0,{}", ops[0], ops[1]))),
        "bltz" if ops.len() == 2 => Some(line(format!("blt {},x0,{}", ops[0], ops[1]))),
        "bgez" if ops.len() == 2 => Some(line(format!("bge {},x0,{}", ops[0], ops[1]))),
        "bltuz" if ops.len() == 2 => Some(line(format!("bltu {},x0,{}", ops[0], ops[1]))),
        "bgeuz" if ops.len() == 2 => Some(line(format!("bgeu {},x0,{}", ops[0], ops[1]))),
        "bgtz" if ops.len() == 2 => Some(line(format!("blt x0,{},{}", ops[0], ops[1]))),
        "blez" if ops.len() == 2 => Some(line(format!("bge x0,{},{}", ops[0], ops[1]))),
        "j" if ops.len() == 1 => Some(line(format!("jal x0,{}", ops[0]))),
        "jal" if ops.len() == 1 => Some(line(format!("jal x1,{}", ops[0]))),
        "jr" if ops.len() == 1 => Some(line(format!("jalr x0,0({})", ops[0]))),
        "jalr" if ops.len() == 1 => Some(line(format!("jalr x1,0({})", ops[0]))),
        "ret" => Some(line("jalr x0,0(x1)".into())),
        _ => None,
    }
}

/// Expand a multi-instruction pseudo-op, synthesizing a fresh unique
/// local label for each call via `labeler`.
fn translate_multi(mnemonic: &str, rest: &str, labeler: &mut impl FnMut() -> String) -> Option<Vec<String>> {
    let ops = split_operands(rest);
    match mnemonic {
        "li" if ops.len() == 2 => {
            let rd = ops[0];
            let imm = crate::parse::parse_immediate(ops[1]).ok()?;
            if (imm >> 12) != 0 {
                let hi = imm >> 12;
                let lo = imm & 0xfff;
                Some(vec![
                    format!("lui {rd},{hi}"),
                    format!("ori {rd},{rd},{lo}"),
                ])
            } else {
                Some(vec![format!("addi {rd},zero,{imm}")])
            }
        }
        "la" if ops.len() == 2 => {
            let (rd, sym) = (ops[0], ops[1]);
            let lk = labeler();
            Some(vec![
                format!("{lk}:"),
                format!("auipc {rd},%pcrel_hi({sym})"),
                format!("addi {rd},{rd},%pcrel_lo({lk})"),
            ])
        }
        // Non-pseudo loads are of the form: lw rd, offset(reg) -- only
        // treat the second operand as a symbol when it isn't one of those.
        "lb" | "lh" | "lw" if ops.len() == 2 && !ops[1].ends_with(')') => {
            let (rd, sym) = (ops[0], ops[1]);
            let lk = labeler();
            Some(vec![
                format!("{lk}:"),
                format!("auipc {rd},%pcrel_hi({sym})"),
                format!("{mnemonic} {rd},%pcrel_lo({lk})({rd})"),
            ])
        }
        "sb" | "sh" | "sw" if ops.len() == 3 => {
            let (rd, sym, rt) = (ops[0], ops[1], ops[2]);
            let lk = labeler();
            Some(vec![
                format!("{lk}:"),
                format!("auipc {rt},%pcrel_hi({sym})"),
                format!("{mnemonic} {rd},%pcrel_lo({lk})({rt})"),
            ])
        }
        "call" if ops.len() == 1 => {
            let f = ops[0];
            let lk = labeler();
            Some(vec![
                format!("{lk}:"),
                format!("auipc x6,%pcrel_hi({f})"),
                format!("jalr x1,%pcrel_lo({lk})(x6)"),
            ])
        }
        "tail" if ops.len() == 1 => {
            let f = ops[0];
            let lk = labeler();
            Some(vec![
                format!("{lk}:"),
                format!("auipc x6,%pcrel_hi({f})"),
                format!("jalr x0,%pcrel_lo({lk})(x6)"),
            ])
        }
        _ => None,
    }
}

fn split_mnemonic(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

fn looks_like_directive_or_label(line: &str) -> bool {
    line.starts_with('.') || line.ends_with(':')
}

/// Run the full preprocessing pipeline: normalize, then expand
/// pseudo-instructions until a fixed point (an expansion may itself
/// read like `li`, which this pass handles directly, so one pass over
/// the mnemonic table suffices; expanded output contains only concrete
/// mnemonics or directives).
pub fn preprocess(source: &str) -> Result<Vec<String>> {
    let normalized = normalize_lines(source);
    let mut rng = rand::thread_rng();
    let prefix: String = (0..8)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect();
    let mut counter = 0usize;
    let mut labeler = move || {
        counter += 1;
        format!(".L{prefix}{counter}")
    };

    let mut out = Vec::with_capacity(normalized.len());
    for line in normalized {
        if looks_like_directive_or_label(&line) {
            out.push(line);
            continue;
        }
        let (mnemonic, rest) = split_mnemonic(&line);
        if let Some(expanded) = translate_single(mnemonic, rest) {
            out.extend(expanded);
        } else if let Some(expanded) = translate_multi(mnemonic, rest, &mut labeler) {
            out.extend(expanded);
        } else {
            out.push(line);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_honoring_strings() {
        assert_eq!(strip_comment("li a0, 1 # load one"), "li a0, 1 ");
        assert_eq!(strip_comment(".string \"a#b\" # tail"), ".string \"a#b\" ");
    }

    #[test]
    fn hoists_label_with_trailing_code() {
        let lines = normalize_lines("main: li a0, 1\n");
        assert_eq!(lines, vec!["main:".to_string(), "li a0, 1".to_string()]);
    }

    #[test]
    fn expands_nop_and_mv() {
        let out = preprocess("nop\nmv a0,a1\n").unwrap();
        assert_eq!(out, vec!["addi x0,x0,0", "addi a0,a1,0"]);
    }

    #[test]
    fn expands_ret_and_branch_swap() {
        let out = preprocess("ret\nbgt a0,a1,foo\n").unwrap();
        assert_eq!(out, vec!["jalr x0,0(x1)", "blt a1,a0,foo"]);
    }

    #[test]
    fn expands_call_with_unique_label() {
        let out = preprocess("call main\ncall main\n").unwrap();
        assert_eq!(out.len(), 6);
        assert_ne!(out[0], out[3]);
    }

    #[test]
    fn li_small_immediate_is_single_addi() {
        let out = preprocess("li a0,5\n").unwrap();
        assert_eq!(out, vec!["addi a0,zero,5"]);
    }

    #[test]
    fn li_large_immediate_splits_lui_ori() {
        let out = preprocess("li a0,0x12345\n").unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].starts_with("lui a0,"));
        assert!(out[1].starts_with("ori a0,a0,"));
    }

    #[test]
    fn preprocessing_is_idempotent_on_concrete_lines() {
        let once = preprocess("addi a0,a0,1\nret\n").unwrap();
        let joined = once.join("\n");
        let twice = preprocess(&joined).unwrap();
        assert_eq!(once, twice);
    }
}
