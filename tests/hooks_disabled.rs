//! The exported callbacks must be safe to fire before any configuration and
//! must stay inert while the instrumentation is disabled (the default when
//! `ASAN_OPTIONS` carries no `coverage=1`).

#[cfg(test)]
mod tests {
    use core::ffi::{c_char, c_void};
    use std::ptr::null;

    use cmpcov::sancov_cmp::{
        __sanitizer_cov_trace_cmp1, __sanitizer_cov_trace_cmp2, __sanitizer_cov_trace_cmp8,
        __sanitizer_cov_trace_const_cmp1, __sanitizer_cov_trace_const_cmp2,
        __sanitizer_cov_trace_const_cmp4, __sanitizer_cov_trace_div4, __sanitizer_cov_trace_div8,
        __sanitizer_cov_trace_gep, __sanitizer_cov_trace_switch, __sanitizer_weak_hook_memcmp,
        __sanitizer_weak_hook_strcasecmp, __sanitizer_weak_hook_strcmp,
        __sanitizer_weak_hook_strncmp,
    };

    #[test]
    fn test_noop_callbacks() {
        __sanitizer_cov_trace_cmp1(1, 2);
        __sanitizer_cov_trace_const_cmp1(1, 2);
        __sanitizer_cov_trace_div4(7);
        __sanitizer_cov_trace_div8(7);
        __sanitizer_cov_trace_gep(0xdead);
    }

    #[test]
    fn test_integer_callbacks_disabled() {
        __sanitizer_cov_trace_cmp2(0x1234, 0x1234);
        __sanitizer_cov_trace_cmp8(u64::MAX, u64::MAX);
        __sanitizer_cov_trace_const_cmp2(0x1234, 0x1234);
        // Narrow constant: filtered before the state is even consulted.
        __sanitizer_cov_trace_const_cmp4(0x42, 0x42);
    }

    #[test]
    fn test_switch_disabled_leaves_cases_alone() {
        let mut cases = [2u64, 16, 1, 2];
        unsafe {
            __sanitizer_cov_trace_switch(1, cases.as_mut_ptr());
        }
        // Disabled instrumentation must not memoize the (all-narrow) site.
        assert_eq!(cases, [2, 16, 1, 2]);

        let mut empty = [0u64, 16];
        unsafe {
            __sanitizer_cov_trace_switch(1, empty.as_mut_ptr());
        }
        assert_eq!(empty[0], 0);
    }

    #[test]
    fn test_memory_hooks_disabled() {
        let s1 = b"magic header\0";
        let s2 = b"magic footer\0";
        unsafe {
            __sanitizer_weak_hook_memcmp(
                null::<c_void>(),
                s1.as_ptr().cast::<c_void>(),
                s2.as_ptr().cast::<c_void>(),
                12,
                1,
            );
            __sanitizer_weak_hook_strncmp(
                null::<c_void>(),
                s1.as_ptr().cast::<c_char>(),
                s2.as_ptr().cast::<c_char>(),
                12,
                1,
            );
            __sanitizer_weak_hook_strcmp(
                null::<c_void>(),
                s1.as_ptr().cast::<c_char>(),
                s2.as_ptr().cast::<c_char>(),
                1,
            );
            __sanitizer_weak_hook_strcasecmp(
                null::<c_void>(),
                s1.as_ptr().cast::<c_char>(),
                s2.as_ptr().cast::<c_char>(),
                1,
            );
        }
    }

    #[test]
    fn test_oversized_memcmp_dropped_before_lock() {
        let big = [0u8; 1024];
        unsafe {
            __sanitizer_weak_hook_memcmp(
                null::<c_void>(),
                big.as_ptr().cast::<c_void>(),
                big.as_ptr().cast::<c_void>(),
                big.len(),
                0,
            );
        }
    }
}
