//! Kernel-enforced socket denial for the process runtime.
//!
//! When the policy disallows network access, the child installs a
//! seccomp-bpf filter before `exec` that fails every `socket(2)` call (and
//! `io_uring_setup`, which can create sockets on its own) with `EACCES`.
//! This holds no matter which Python object the script reaches the call
//! through. `socketpair(2)` stays available.

/// Whether this build can install the filter.
pub const SUPPORTED: bool = cfg!(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
));

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod filter {
    #[cfg(target_arch = "x86_64")]
    const AUDIT_ARCH: u32 = 0xC000_003E;
    #[cfg(target_arch = "aarch64")]
    const AUDIT_ARCH: u32 = 0xC000_00B7;

    // x32 syscalls on x86_64 carry this bit in `nr`.
    const X32_SYSCALL_BIT: u32 = 0x4000_0000;

    const BPF_LD_W_ABS: u16 = 0x20;
    const BPF_JMP_JEQ_K: u16 = 0x15;
    const BPF_JMP_JGE_K: u16 = 0x35;
    const BPF_RET_K: u16 = 0x06;

    const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

    // Offsets into `struct seccomp_data`.
    const OFFSET_NR: u32 = 0;
    const OFFSET_ARCH: u32 = 4;

    const fn stmt(code: u16, k: u32) -> libc::sock_filter {
        libc::sock_filter { code, jt: 0, jf: 0, k }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
        libc::sock_filter { code, jt, jf, k }
    }

    pub(super) fn program() -> [libc::sock_filter; 9] {
        let deny = SECCOMP_RET_ERRNO | (libc::EACCES as u32 & 0xffff);
        [
            stmt(BPF_LD_W_ABS, OFFSET_ARCH),
            jump(BPF_JMP_JEQ_K, AUDIT_ARCH, 0, 6),
            stmt(BPF_LD_W_ABS, OFFSET_NR),
            jump(BPF_JMP_JGE_K, X32_SYSCALL_BIT, 3, 0),
            jump(BPF_JMP_JEQ_K, libc::SYS_socket as u32, 2, 0),
            jump(BPF_JMP_JEQ_K, libc::SYS_io_uring_setup as u32, 1, 0),
            stmt(BPF_RET_K, SECCOMP_RET_ALLOW),
            stmt(BPF_RET_K, deny),
            stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
        ]
    }

    pub(super) fn install() -> std::io::Result<()> {
        let mut filter = program();
        let prog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_mut_ptr(),
        };
        // SAFETY: prctl reads `prog` and the filter array it points to,
        // both of which outlive the calls.
        unsafe {
            let (one, zero): (libc::c_ulong, libc::c_ulong) = (1, 0);
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, one, zero, zero, zero) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog,
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Install the socket filter on the calling process.
///
/// Runs inside `pre_exec`: no allocation, only `prctl`.
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn deny_sockets() -> std::io::Result<()> {
    filter::install()
}

/// No filter is available on this target; the interpreter-level socket
/// guard is the only network check.
#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub fn deny_sockets() -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(
    test,
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod tests {
    use super::*;

    #[test]
    fn test_filter_jumps_stay_in_bounds() {
        let program = filter::program();
        for (index, insn) in program.iter().enumerate() {
            let next = index + 1;
            assert!(next + (insn.jt as usize) < program.len() || insn.code == 0x06);
            assert!(next + (insn.jf as usize) < program.len() || insn.code == 0x06);
        }
        assert!(program.iter().rev().take(3).all(|insn| insn.code == 0x06));
    }

    #[test]
    fn test_filter_denies_socket_in_forked_child() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let python = Command::new("python3").arg("--version").output();
        if !matches!(python, Ok(ref out) if out.status.success()) {
            eprintln!("skipping: python3 not found");
            return;
        }

        let mut command = Command::new("python3");
        command.args([
            "-c",
            "import socket\ntry:\n    socket.socket()\n    print('open')\nexcept PermissionError:\n    print('denied')",
        ]);
        // SAFETY: deny_sockets only calls prctl.
        unsafe {
            command.pre_exec(deny_sockets);
        }
        let out = command.output().unwrap();
        assert!(SUPPORTED);
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "denied");
    }
}
