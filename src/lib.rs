//! `cmpcov` is a [SanitizerCoverage trace-cmp](https://clang.llvm.org/docs/SanitizerCoverage.html#tracing-data-flow)
//! runtime.
//!
//! The library implements the callbacks emitted for every comparison in a
//! target compiled with `-fsanitize-coverage=trace-pc-guard,trace-cmp`. For
//! each integer or memory comparison it computes how many low-order bytes of
//! the two operands agree and records one deduplicated entry per matching
//! prefix length, keyed by the calling instruction. At process exit the
//! records are flushed to one `cmp.<module>.<pid>.sancov` file per loaded
//! module, giving fuzzers byte-granular progress feedback through multi-byte
//! magic constants and string comparisons.
//!
//! ## How to use
//! Compile the fuzzing target with
//!
//! ```text
//! -fsanitize=address -fsanitize-coverage=trace-pc-guard,trace-cmp
//! ```
//!
//! and link the static library produced by this crate into it. The target
//! itself carries the instrumentation; this crate must *not* be instrumented
//! (the callbacks would recurse into themselves), so build it as a separate
//! object and keep sanitizers off for it.
//!
//! ## Runtime configuration
//! The instrumentation is switched on the same way regular SanitizerCoverage
//! output is, through the standard environment:
//!
//! ```text
//! ASAN_OPTIONS=coverage=1,coverage_dir=/path/to/dir
//! ```
//!
//! Two additional variables refine what gets traced:
//! * `TRACE_NONCONST_CMP=1` also traces comparisons where neither operand is
//!   a compile-time constant.
//! * `TRACE_MEMORY_CMP=0` disables the `memcmp`/`strcmp`-family hooks
//!   (they are on by default).
//!
//! All state is created lazily on the first callback and deliberately never
//! torn down: late-exit code paths may still run instrumented comparisons on
//! other threads.

// The caller PC of the trace callbacks is the return address, obtained
// through the `llvm.returnaddress` intrinsic; requires nightly.
#![feature(link_llvm_intrinsics)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]
#![cfg_attr(
    not(test),
    warn(
        missing_debug_implementations,
        missing_docs,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications
    )
)]

use std::sync::Mutex;

pub mod dump;
pub mod maps;
pub mod options;
pub mod sancov_cmp;
pub mod traces;

use options::Options;
use traces::Traces;

/// Magic header of a `.sancov` file holding 8-byte records.
pub const MAGIC64: u64 = 0xC0BF_FFFF_FFFF_FF64;
/// Magic header of a `.sancov` file holding 4-byte (hashed) records.
pub const MAGIC32: u64 = 0xC0BF_FFFF_FFFF_FF32;

/// `tag1` value marking a record produced by a memory-comparison hook.
pub const MEMCMP_TAG1: u8 = 0xF0;

/// Upper bound on the number of bytes inspected by the `memcmp`/`strcmp`
/// family of hooks. Longer comparisons are unlikely to be input-derived and
/// are dropped wholesale.
pub const MAX_DATA_CMP_LENGTH: usize = 64;

/// The PC offset occupies the low 48 bits of an encoded record.
pub const PC_OFFSET_MASK: u64 = (1 << 48) - 1;

/// Everything the callbacks share, guarded by [`CMPCOV`].
#[derive(Debug)]
pub(crate) struct CmpCov {
    pub(crate) options: Options,
    pub(crate) traces: Traces,
}

/// The process-wide instrumentation state.
///
/// `None` until the first callback fires; the callbacks cannot rely on any
/// ordered startup, so everything is initialized on first use under the lock.
static CMPCOV: Mutex<Option<CmpCov>> = Mutex::new(None);

fn init_state(state: &mut Option<CmpCov>) {
    if state.is_some() {
        return;
    }

    let options = match Options::from_env() {
        Ok(options) => options,
        Err(err) => die(&format!(
            "Unable to parse the ASAN_OPTIONS environment variable: {err}."
        )),
    };

    // Output is only ever produced when the instrumentation was enabled at
    // initialization time.
    if options.enabled {
        unsafe {
            libc::atexit(dump_at_exit);
        }
    }

    *state = Some(CmpCov {
        options,
        traces: Traces::new(),
    });
}

/// Runs `f` on the global state, blocking on the lock.
///
/// Used by the integer-compare and switch callbacks, which never call back
/// into instrumented string routines and therefore cannot self-deadlock.
pub(crate) fn with_state(f: impl FnOnce(&mut CmpCov)) {
    if let Ok(mut guard) = CMPCOV.lock() {
        init_state(&mut guard);
        if let Some(state) = guard.as_mut() {
            f(state);
        }
    }
}

/// Runs `f` on the global state if the lock can be taken right now.
///
/// The memory-comparison hooks must use this: the library compares bytes of
/// its own, and on some platforms those byte loops lower back into the very
/// functions the hooks intercept. A failed acquisition is a reentry (or a
/// race) and the event is silently dropped.
pub(crate) fn try_with_state(f: impl FnOnce(&mut CmpCov)) {
    if let Ok(mut guard) = CMPCOV.try_lock() {
        init_state(&mut guard);
        if let Some(state) = guard.as_mut() {
            f(state);
        }
    }
}

/// [`libc::atexit`] handler driving the dumper.
extern "C" fn dump_at_exit() {
    if let Ok(guard) = CMPCOV.lock() {
        if let Some(state) = guard.as_ref() {
            dump::dump_all(&state.options, &state.traces);
        }
    }
}

/// Prints a diagnostic and aborts the process.
///
/// Partial or misparsed output would mislead the consumers of the coverage
/// files, so configuration and dump-time I/O errors are not recoverable.
/// `abort` is used rather than `exit` so no atexit handler runs while the
/// coverage lock may still be held.
pub(crate) fn die(msg: &str) -> ! {
    eprintln!("CmpSanitizerCoverage: {msg}");
    std::process::abort();
}
