//! Shared error type for the whole pipeline.
//!
//! The original C++ implementation throws a small hierarchy of
//! exception types (`Exception`, `LinkError`, `UnresolvableSymbol`,
//! `DuplicatedSymbols`, `NotSupportedError`). Here the same taxonomy is
//! one closed `thiserror` enum, since every stage (preprocess, assemble,
//! link, interpret) shares a single `Result` alias.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RavelError {
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("symbol `{0}` is defined more than once")]
    DuplicatedSymbol(String),

    #[error("symbol `{0}` could not be resolved")]
    UnresolvableSymbol(String),

    #[error("invalid memory address 0x{addr:08x}: {reason}")]
    InvalidAddress { addr: u32, reason: String },

    #[error("instruction budget of {budget} exceeded")]
    Timeout { budget: u64 },

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, RavelError>;
