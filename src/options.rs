//! Runtime configuration, parsed once from the environment.
//!
//! The master switch and the output directory ride on the standard
//! `ASAN_OPTIONS` variable (`coverage=1`, `coverage_dir=...`) so that the
//! instrumentation is enabled exactly the way regular SanitizerCoverage
//! output is. Two dedicated variables, `TRACE_NONCONST_CMP` and
//! `TRACE_MEMORY_CMP`, refine what gets traced.

use std::{env, path::PathBuf};

use thiserror::Error;

/// Immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Master switch (`ASAN_OPTIONS=coverage=1`). Nothing is recorded and no
    /// exit hook is registered unless this is set.
    pub enabled: bool,
    /// Trace comparisons where neither operand is a compile-time constant
    /// (`TRACE_NONCONST_CMP=1`).
    pub trace_nonconst_cmp: bool,
    /// Trace the `memcmp`/`strcmp` family of functions (`TRACE_MEMORY_CMP=0`
    /// to turn off).
    pub trace_memory_cmp: bool,
    /// Directory receiving the `.sancov` files
    /// (`ASAN_OPTIONS=coverage_dir=...`).
    pub coverage_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: false,
            trace_nonconst_cmp: false,
            trace_memory_cmp: true,
            coverage_dir: PathBuf::from("."),
        }
    }
}

/// Errors produced while parsing `ASAN_OPTIONS`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// A quoted value was opened but never closed.
    #[error("unterminated {0:?}-quoted value")]
    UnterminatedQuote(char),
}

impl Options {
    /// Reads `ASAN_OPTIONS`, `TRACE_NONCONST_CMP` and `TRACE_MEMORY_CMP`
    /// from the process environment.
    pub fn from_env() -> Result<Self, OptionsError> {
        Self::parse(
            env::var("ASAN_OPTIONS").ok().as_deref(),
            env::var("TRACE_NONCONST_CMP").ok().as_deref(),
            env::var("TRACE_MEMORY_CMP").ok().as_deref(),
        )
    }

    /// Pure parsing backend of [`Options::from_env`].
    pub fn parse(
        asan_options: Option<&str>,
        trace_nonconst_cmp: Option<&str>,
        trace_memory_cmp: Option<&str>,
    ) -> Result<Self, OptionsError> {
        let mut options = Self::default();

        if let Some(asan_options) = asan_options {
            for (key, value) in tokenize(asan_options)? {
                match key.as_str() {
                    "coverage" => options.enabled = atoi(&value) != 0,
                    "coverage_dir" => options.coverage_dir = PathBuf::from(value),
                    // Everything else in ASAN_OPTIONS belongs to ASan itself.
                    _ => (),
                }
            }
        }

        if let Some(value) = trace_nonconst_cmp {
            options.trace_nonconst_cmp = atoi(value) != 0;
        }
        if let Some(value) = trace_memory_cmp {
            options.trace_memory_cmp = atoi(value) != 0;
        }

        Ok(options)
    }
}

/// Splits an `ASAN_OPTIONS`-style string into `(key, value)` pairs.
///
/// Pairs are separated by `,`, key and value by the first `=` in the pair.
/// Values may be wrapped in single or double quotes, which allows a `,`
/// inside; an opened quote that never closes is an error. No whitespace is
/// trimmed anywhere. Empty pairs are skipped and a pair without `=` is a key
/// with an empty value.
pub fn tokenize(input: &str) -> Result<Vec<(String, String)>, OptionsError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;

        loop {
            match chars.next() {
                None | Some(',') => break,
                Some('=') if !in_value => in_value = true,
                Some(quote @ ('"' | '\'')) if in_value && value.is_empty() => {
                    loop {
                        match chars.next() {
                            None => return Err(OptionsError::UnterminatedQuote(quote)),
                            Some(c) if c == quote => break,
                            Some(c) => value.push(c),
                        }
                    }
                }
                Some(c) if in_value => value.push(c),
                Some(c) => key.push(c),
            }
        }

        if !key.is_empty() || !value.is_empty() {
            tokens.push((key, value));
        }
    }

    Ok(tokens)
}

/// C `atoi` semantics: optional leading whitespace and sign, then the longest
/// run of digits; anything unparsable is 0.
fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut result: i64 = 0;
    for c in digits.chars() {
        let Some(d) = c.to_digit(10) else { break };
        result = result.wrapping_mul(10).wrapping_add(i64::from(d));
    }
    if negative {
        -result
    } else {
        result
    }
}
