//! Headers served to `#include` without touching the filesystem
//!
//! The definitions follow the LP64 ABI the layout engine assumes.

/// Text of a built-in header, by the name used in `#include <...>`
pub fn builtin_header(name: &str) -> Option<&'static str> {
    let text = match name {
        "stddef.h" => STDDEF_H,
        "__stddef_max_align_t.h" => MAX_ALIGN_T_H,
        "stdint.h" => STDINT_H,
        "stdbool.h" => STDBOOL_H,
        "sys/types.h" => SYS_TYPES_H,
        "linux/types.h" => LINUX_TYPES_H,
        _ => return None,
    };
    Some(text)
}

/// Macros defined before the unit is read
pub const PREDEFINED: &str = "\
#define __LP64__ 1
#define _LP64 1
#define __CHAR_BIT__ 8
#define __SIZEOF_POINTER__ 8
#define __SIZEOF_LONG__ 8
#define __linux__ 1
";

const STDDEF_H: &str = "\
#ifndef __STDDEF_H
#define __STDDEF_H
typedef long int ptrdiff_t;
typedef unsigned long int size_t;
typedef int wchar_t;
#define NULL ((void *)0)
#include <__stddef_max_align_t.h>
#endif
";

const MAX_ALIGN_T_H: &str = "\
#ifndef __CLANG_MAX_ALIGN_T_DEFINED
#define __CLANG_MAX_ALIGN_T_DEFINED
typedef struct {
  long long __clang_max_align_nonce1
      __attribute__((__aligned__(__alignof__(long long))));
  long double __clang_max_align_nonce2
      __attribute__((__aligned__(__alignof__(long double))));
} max_align_t;
#endif
";

const STDINT_H: &str = "\
#ifndef _STDINT_H
#define _STDINT_H
typedef signed char int8_t;
typedef short int int16_t;
typedef int int32_t;
typedef long int int64_t;
typedef unsigned char uint8_t;
typedef unsigned short int uint16_t;
typedef unsigned int uint32_t;
typedef unsigned long int uint64_t;
typedef long int intptr_t;
typedef unsigned long int uintptr_t;
typedef long int intmax_t;
typedef unsigned long int uintmax_t;
#define INT8_MAX 127
#define INT16_MAX 32767
#define INT32_MAX 2147483647
#define INT64_MAX 9223372036854775807L
#define UINT8_MAX 255
#define UINT16_MAX 65535
#define UINT32_MAX 4294967295U
#endif
";

const STDBOOL_H: &str = "\
#ifndef __STDBOOL_H
#define __STDBOOL_H
#define bool _Bool
#define true 1
#define false 0
#endif
";

const SYS_TYPES_H: &str = "\
#ifndef _SYS_TYPES_H
#define _SYS_TYPES_H
#include <stddef.h>
#include <stdint.h>
typedef long int ssize_t;
typedef int pid_t;
typedef unsigned int uid_t;
typedef unsigned int gid_t;
typedef unsigned int mode_t;
typedef long int off_t;
typedef unsigned long int dev_t;
typedef unsigned long int ino_t;
typedef unsigned long int nlink_t;
typedef long int time_t;
typedef unsigned char u_int8_t;
typedef unsigned short int u_int16_t;
typedef unsigned int u_int32_t;
typedef unsigned long int u_int64_t;
#endif
";

const LINUX_TYPES_H: &str = "\
#ifndef _LINUX_TYPES_H
#define _LINUX_TYPES_H
typedef signed char __s8;
typedef unsigned char __u8;
typedef short __s16;
typedef unsigned short __u16;
typedef int __s32;
typedef unsigned int __u32;
typedef long long __s64;
typedef unsigned long long __u64;
typedef __u16 __le16;
typedef __u16 __be16;
typedef __u32 __le32;
typedef __u32 __be32;
typedef __u64 __le64;
typedef __u64 __be64;
typedef __u16 __sum16;
typedef __u32 __wsum;
typedef unsigned long __kernel_size_t;
typedef long __kernel_ssize_t;
typedef int __kernel_pid_t;
#endif
";
