//! SanitizerCoverage comparison callbacks.
//!
//! These are the `C`-ABI entry points the compiler wires into every
//! comparison, switch and `memcmp`-family call of the instrumented target.
//! Each one follows the same skeleton: cheap pre-filter, take the global
//! lock (blocking for integer/switch callbacks, try-lock for the memory
//! hooks, which may re-enter through the library's own byte loops), lazily
//! initialize on first entry, check the feature flags, then turn the
//! matching-prefix length of the operands into one record per prefix byte.

use core::ffi::{c_char, c_int, c_void};
use core::{ptr, slice};

use crate::traces::Traces;
use crate::{try_with_state, with_state, MAX_DATA_CMP_LENGTH, MEMCMP_TAG1};

extern "C" {
    #[link_name = "llvm.returnaddress"]
    fn return_address(level: i32) -> *const u8;
}

/// The address of the comparison site: the return address into the callback's
/// immediate caller.
macro_rules! caller_address {
    () => {
        unsafe { return_address(0) as usize }
    };
}

/// Number of matching low-order bytes of `x` and `y`, looking at the first
/// `count` bytes (byte 0 is the least significant).
fn matching_bytes(count: usize, x: u64, y: u64) -> usize {
    let mut i = 0;
    while i < count {
        if ((x >> (i * 8)) & 0xff) != ((y >> (i * 8)) & 0xff) {
            break;
        }
        i += 1;
    }
    i
}

/// Byte span of a 32-bit constant, rounded up to whole bytes.
///
/// Callers guarantee `x >= 0x100`, so the result is in `2..=4`.
fn const_width32(x: u32) -> usize {
    ((32 - (x.leading_zeros() & !7)) / 8) as usize
}

/// Byte span of a 64-bit constant, rounded up to whole bytes.
///
/// Callers guarantee `x >= 0x100`, so the result is in `2..=8`.
fn const_width64(x: u64) -> usize {
    ((64 - (x.leading_zeros() & !7)) / 8) as usize
}

/// Emits one record per matching prefix length of an integer comparison.
fn handle_cmp(
    traces: &mut Traces,
    pc: usize,
    arg1: u64,
    arg2: u64,
    arg_length: usize,
    switch_case: u8,
) {
    let matching = matching_bytes(arg_length, arg1, arg2);
    for prefix in 1..=matching {
        traces.try_save(pc, prefix as u8, switch_case);
    }
}

/// Emits one record per matching prefix length of a byte-sequence
/// comparison.
///
/// # Safety
/// `s1` and `s2` must be readable for `length` bytes.
unsafe fn handle_memcmp(
    traces: &mut Traces,
    pc: usize,
    s1: *const u8,
    s2: *const u8,
    length: usize,
) {
    let mut matching = 0;
    while matching < length {
        if ptr::read(s1.add(matching)) != ptr::read(s2.add(matching)) {
            break;
        }
        matching += 1;
    }

    for prefix in 1..=matching {
        traces.try_save(pc, MEMCMP_TAG1, prefix as u8);
    }
}

/// Dispatches a switch statement: one const-compare emission per case
/// constant wider than a byte, with the 1-based case index as `tag2`.
///
/// When no case constant exceeds 255, the case count is overwritten with 0 so
/// the site short-circuits on every future visit. The compiler places the
/// case array in writable memory on the supported targets.
///
/// # Safety
/// `cases` must point to `cases[0] + 2` readable (and writable) `u64`s.
unsafe fn handle_switch(traces: &mut Traces, pc: usize, val: u64, cases: *mut u64) {
    // cases[0] is the case count, cases[1] the operand width in bits,
    // cases[2..] the case constants.
    let count = ptr::read(cases) as usize;
    let case_values = slice::from_raw_parts(cases.add(2), count);

    let mut wide_value_found = false;
    for (i, &case) in case_values.iter().enumerate() {
        // As with regular comparisons, single-byte constants carry no signal.
        if case < 0x100 {
            continue;
        }
        wide_value_found = true;
        handle_cmp(traces, pc, val, case, const_width64(case), (i + 1) as u8);
    }

    if !wide_value_found {
        ptr::write(cases, 0);
    }
}

/// `strnlen(s, max_length)` over a raw pointer.
///
/// # Safety
/// `s` must be readable up to its NUL terminator or `max_length` bytes.
unsafe fn strnlen(s: *const c_char, max_length: usize) -> usize {
    let mut len = 0;
    while len < max_length && ptr::read(s.add(len)) != 0 {
        len += 1;
    }
    len
}

/// `min(strlen(s1), strlen(s2))`, scanning both strings in parallel and
/// giving up past `max_length` bytes.
///
/// # Safety
/// `s1` and `s2` must be readable up to their NUL terminators or
/// `max_length` bytes.
unsafe fn strnlen2(s1: *const c_char, s2: *const c_char, max_length: usize) -> usize {
    let mut len = 0;
    while len < max_length && ptr::read(s1.add(len)) != 0 && ptr::read(s2.add(len)) != 0 {
        len += 1;
    }
    len
}

/// Single-byte comparisons are not instrumented: fuzzers operate at byte
/// granularity and guess single bytes on their own, while recording them
/// would bloat the output.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp1(_arg1: u8, _arg2: u8) {}

/// Trace a 16 bit `cmp` between two non-constant operands.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp2(arg1: u16, arg2: u16) {
    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled || !state.options.trace_nonconst_cmp {
            return;
        }
        handle_cmp(&mut state.traces, pc, u64::from(arg1), u64::from(arg2), 2, 0);
    });
}

/// Trace a 32 bit `cmp` between two non-constant operands.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp4(arg1: u32, arg2: u32) {
    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled || !state.options.trace_nonconst_cmp {
            return;
        }
        handle_cmp(&mut state.traces, pc, u64::from(arg1), u64::from(arg2), 4, 0);
    });
}

/// Trace a 64 bit `cmp` between two non-constant operands.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp8(arg1: u64, arg2: u64) {
    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled || !state.options.trace_nonconst_cmp {
            return;
        }
        handle_cmp(&mut state.traces, pc, arg1, arg2, 8, 0);
    });
}

/// Single-byte comparisons are not instrumented, constant or not; see
/// [`__sanitizer_cov_trace_cmp1`].
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp1(_arg1: u8, _arg2: u8) {}

/// Trace a 16 bit `cmp` whose first operand is a compile-time constant.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp2(arg1: u16, arg2: u16) {
    // A constant narrower than two bytes discriminates no better than a
    // 1-byte comparison; skip before even taking the lock.
    if arg1 < 0x100 {
        return;
    }

    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled {
            return;
        }
        handle_cmp(&mut state.traces, pc, u64::from(arg1), u64::from(arg2), 2, 0);
    });
}

/// Trace a 32 bit `cmp` whose first operand is a compile-time constant.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp4(arg1: u32, arg2: u32) {
    if arg1 < 0x100 {
        return;
    }

    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled {
            return;
        }
        handle_cmp(
            &mut state.traces,
            pc,
            u64::from(arg1),
            u64::from(arg2),
            const_width32(arg1),
            0,
        );
    });
}

/// Trace a 64 bit `cmp` whose first operand is a compile-time constant.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp8(arg1: u64, arg2: u64) {
    if arg1 < 0x100 {
        return;
    }

    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled {
            return;
        }
        handle_cmp(&mut state.traces, pc, arg1, arg2, const_width64(arg1), 0);
    });
}

/// Trace a switch statement.
///
/// `val` is the switch operand; `cases[0]` is the number of case constants,
/// `cases[1]` the operand width in bits, `cases[2..]` the case constants.
///
/// # Safety
/// `cases` must point to a writable array in the layout above; the compiler
/// emits exactly that.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_switch(val: u64, cases: *mut u64) {
    // Zero cases, possibly because an earlier visit memoized the site as
    // uninteresting; nothing to do, and no lock taken.
    if ptr::read(cases) == 0 {
        return;
    }

    let pc = caller_address!();
    with_state(|state| {
        if !state.options.enabled {
            return;
        }
        unsafe {
            handle_switch(&mut state.traces, pc, val, cases);
        }
    });
}

/// Division operands are accepted but not recorded; they carry little
/// input-derived signal.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_div4(_val: u32) {}

/// See [`__sanitizer_cov_trace_div4`].
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_div8(_val: u64) {}

/// Pointer-index computations are accepted but not recorded.
#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_gep(_idx: usize) {}

/// Weak hook invoked after every `memcmp` in the target.
///
/// # Safety
/// `s1` and `s2` must be readable for `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_memcmp(
    caller_pc: *const c_void,
    s1: *const c_void,
    s2: *const c_void,
    n: usize,
    _result: c_int,
) {
    // Comparisons longer than this are almost never input-derived.
    if n > MAX_DATA_CMP_LENGTH {
        return;
    }

    let pc = caller_pc as usize;
    try_with_state(|state| {
        if !state.options.enabled || !state.options.trace_memory_cmp {
            return;
        }
        unsafe {
            handle_memcmp(&mut state.traces, pc, s1.cast::<u8>(), s2.cast::<u8>(), n);
        }
    });
}

/// Weak hook invoked after every `strncmp` in the target.
///
/// # Safety
/// `s1` and `s2` must be readable up to their NUL terminators or `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strncmp(
    caller_pc: *const c_void,
    s1: *const c_char,
    s2: *const c_char,
    n: usize,
    _result: c_int,
) {
    if n > MAX_DATA_CMP_LENGTH {
        return;
    }

    let pc = caller_pc as usize;
    try_with_state(|state| {
        if !state.options.enabled || !state.options.trace_memory_cmp {
            return;
        }
        unsafe {
            // Effectively n = min(n, strlen(s1), strlen(s2)).
            let n = strnlen(s1, n);
            let n = strnlen(s2, n);
            handle_memcmp(&mut state.traces, pc, s1.cast::<u8>(), s2.cast::<u8>(), n);
        }
    });
}

/// Weak hook invoked after every `strcmp` in the target.
///
/// # Safety
/// `s1` and `s2` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strcmp(
    caller_pc: *const c_void,
    s1: *const c_char,
    s2: *const c_char,
    _result: c_int,
) {
    let pc = caller_pc as usize;
    try_with_state(|state| {
        if !state.options.enabled || !state.options.trace_memory_cmp {
            return;
        }
        unsafe {
            // min(strlen(s1), strlen(s2)); when both strings run past the
            // cap the comparison is not one we are interested in.
            let n = strnlen2(s1, s2, MAX_DATA_CMP_LENGTH + 1);
            if n > MAX_DATA_CMP_LENGTH {
                return;
            }
            handle_memcmp(&mut state.traces, pc, s1.cast::<u8>(), s2.cast::<u8>(), n);
        }
    });
}

/// Weak hook invoked after every `strncasecmp` in the target. Shares the
/// `strncmp` path; the prefix scan stays byte-exact, which consumers
/// tolerate for case-insensitive call sites.
///
/// # Safety
/// See [`__sanitizer_weak_hook_strncmp`].
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strncasecmp(
    caller_pc: *const c_void,
    s1: *const c_char,
    s2: *const c_char,
    n: usize,
    result: c_int,
) {
    __sanitizer_weak_hook_strncmp(caller_pc, s1, s2, n, result);
}

/// Weak hook invoked after every `strcasecmp` in the target. Shares the
/// `strcmp` path.
///
/// # Safety
/// See [`__sanitizer_weak_hook_strcmp`].
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strcasecmp(
    caller_pc: *const c_void,
    s1: *const c_char,
    s2: *const c_char,
    result: c_int,
) {
    __sanitizer_weak_hook_strcmp(caller_pc, s1, s2, result);
}
