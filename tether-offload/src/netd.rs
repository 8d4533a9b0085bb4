//! C entry points consumed by the netd host process.
//!
//! netd dispatches its socket tagging commands through these symbols; they
//! wrap a process-global [`BpfHandler`] installed by
//! [`libnetd_updatable_init`] (or by the daemon at startup). Until the
//! handler is installed the accounting maps are not valid, and tagging
//! fails with `-EPERM`.

use std::ffi::{c_char, c_int, CStr};
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::OnceLock;

use nix::errno::Errno;
use tracing::error;

use crate::bpf::BpfHandler;
use crate::config::BpfConfig;
use crate::platform::PlatformCapabilities;

static HANDLER: OnceLock<BpfHandler> = OnceLock::new();

/// Install the process-global handler. Returns `None` when one is already
/// installed.
pub fn install(handler: BpfHandler) -> Option<&'static BpfHandler> {
    HANDLER.set(handler).ok()?;
    HANDLER.get()
}

pub fn handler() -> Option<&'static BpfHandler> {
    HANDLER.get()
}

fn errno_result(result: Result<(), Errno>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => -(e as c_int),
    }
}

/// Bring the accounting plane up for a netd host process.
/// Returns 0 on success or a negated errno.
///
/// # Safety
///
/// `cgroup_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn libnetd_updatable_init(cgroup_path: *const c_char) -> c_int {
    if cgroup_path.is_null() {
        return -(Errno::EINVAL as c_int);
    }
    // SAFETY: non-null NUL-terminated string per the contract above.
    let cgroup = match unsafe { CStr::from_ptr(cgroup_path) }.to_str() {
        Ok(path) => path,
        Err(_) => return -(Errno::EINVAL as c_int),
    };

    let config = BpfConfig {
        cgroup_root: PathBuf::from(cgroup),
        ..BpfConfig::default()
    };
    let caps = PlatformCapabilities::detect(config.extended_socket_hooks);

    match BpfHandler::init(&config, &caps) {
        Ok(handler) => match install(handler) {
            Some(_) => 0,
            None => -(Errno::EEXIST as c_int),
        },
        Err(e) if e.is_fatal() => {
            // A partial cgroup attach set silently corrupts accounting;
            // the host process must not keep running.
            error!(error = %e, "fatal BPF bring-up failure");
            std::process::abort();
        }
        Err(e) => {
            error!(error = %e, "BPF bring-up failed");
            -(e.errno() as c_int)
        }
    }
}

/// Tag `fd`'s traffic with `(tag, charge_uid)` on behalf of `real_uid`.
/// Returns 0 or a negated errno.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn libnetd_updatable_tagSocket(
    fd: c_int,
    tag: u32,
    charge_uid: u32,
    real_uid: u32,
) -> c_int {
    let Some(handler) = handler() else {
        // Accounting maps not valid yet.
        return -(Errno::EPERM as c_int);
    };
    if fd < 0 {
        return -(Errno::EBADF as c_int);
    }
    // SAFETY: netd owns the descriptor for the duration of the call.
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    errno_result(handler.tag_socket(sock, tag, charge_uid, real_uid))
}

/// Remove `fd`'s tag entry. Returns 0 or a negated errno.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn libnetd_updatable_untagSocket(fd: c_int) -> c_int {
    let Some(handler) = handler() else {
        return -(Errno::EPERM as c_int);
    };
    if fd < 0 {
        return -(Errno::EBADF as c_int);
    }
    // SAFETY: netd owns the descriptor for the duration of the call.
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    errno_result(handler.untag_socket(sock))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global handler is never installed in unit tests, which is
    // exactly the "maps not valid yet" state of the contract.
    #[test]
    fn test_tagging_before_init_is_eperm() {
        assert_eq!(libnetd_updatable_tagSocket(0, 1, 1000, 1000), -libc::EPERM);
        assert_eq!(libnetd_updatable_untagSocket(0), -libc::EPERM);
    }
}
