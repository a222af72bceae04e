//! Seccomp filter that pins a process tree to its process group.
//!
//! `setsid` and `setpgid` fail with `EPERM`, so no descendant can leave the
//! group the governor kills and measures. Every other syscall is allowed.
//! Syscalls made under a foreign ABI kill the caller, since their numbers
//! would not be matched.

use std::io;
use std::sync::OnceLock;

use libc::sock_filter;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
#[cfg(target_arch = "x86_64")]
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// seccomp_data offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;

/// x32 syscalls share the x86_64 audit arch but carry this bit
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Whether this target has a filter at all
pub(crate) const fn supported() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// The compiled filter; built once so the post-fork hook never allocates
pub(crate) fn filter() -> &'static [sock_filter] {
    static FILTER: OnceLock<Vec<sock_filter>> = OnceLock::new();
    FILTER.get_or_init(build_filter)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn build_filter() -> Vec<sock_filter> {
    let mut filter = vec![
        stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH),
        jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
        stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR),
    ];
    // -> KILL, four instructions ahead
    #[cfg(target_arch = "x86_64")]
    filter.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 4, 0));

    filter.extend([
        // -> EPERM
        jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_setsid as u32, 2, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_setpgid as u32, 1, 0),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::EPERM as u32),
    ]);
    #[cfg(target_arch = "x86_64")]
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
    filter
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn build_filter() -> Vec<sock_filter> {
    Vec::new()
}

/// Installs `filter` on the calling thread.
///
/// # Safety
///
/// Meant for the window between fork and exec: it only issues syscalls and
/// must be handed the slice returned by [`filter`].
pub(crate) unsafe fn install(filter: &[sock_filter]) -> io::Result<()> {
    if filter.is_empty() {
        return Ok(());
    }

    let prog = libc::sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_ptr().cast_mut(),
    };

    // SAFETY: plain prctl calls; `prog` outlives both of them.
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
