//! Platform capability detection and the cgroup program attach table.
//!
//! The accounting plane attaches a different program set depending on the
//! running kernel and on which hook programs ship in the BPF object set.
//! All of that variance is captured once at startup in
//! [`PlatformCapabilities`]; program selection is then a pure function over
//! the capabilities and the fixed table below.

use aya::util::KernelVersion;
use tracing::warn;

use tether_offload_common::*;

use crate::bpf::syscalls;

/// Immutable snapshot of what the running platform supports, computed once
/// at startup.
#[derive(Clone, Copy, Debug)]
pub struct PlatformCapabilities {
    pub kernel: KernelVersion,
    /// Whether the extended per-socket hook programs (connect, UDP
    /// sendmsg/recvmsg, sockopt, release) ship in the object set.
    pub extended_socket_hooks: bool,
}

impl PlatformCapabilities {
    pub fn detect(extended_socket_hooks: bool) -> Self {
        let kernel = match KernelVersion::current() {
            Ok(kernel) => kernel,
            Err(e) => {
                warn!(error = %e, "unable to detect kernel version, assuming none of the gated hooks");
                KernelVersion::new(0, 0, 0)
            }
        };
        Self {
            kernel,
            extended_socket_hooks,
        }
    }

    pub fn at_least_kernel(&self, major: u8, minor: u8, patch: u16) -> bool {
        self.kernel >= KernelVersion::new(major, minor, patch)
    }
}

// ---------------------------------------------------------------------------
// Attach Table
// ---------------------------------------------------------------------------

/// A cgroup BPF program the accounting plane attaches at bring-up.
#[derive(Debug)]
pub struct CgroupProgram {
    /// Pinned program name under the netd pin root.
    pub pin_name: &'static str,
    /// Cgroup hook to attach at.
    pub attach_type: u32,
    min_kernel: Option<(u8, u8, u16)>,
    needs_extended_hooks: bool,
}

/// The full program set, in attach order. A partial attach of this table
/// produces silently wrong accounting, which is why attach failures are
/// treated as fatal by the caller.
pub const CGROUP_PROGRAMS: &[CgroupProgram] = &[
    CgroupProgram {
        pin_name: BPF_EGRESS_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET_EGRESS,
        min_kernel: None,
        needs_extended_hooks: false,
    },
    CgroupProgram {
        pin_name: BPF_INGRESS_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET_INGRESS,
        min_kernel: None,
        needs_extended_hooks: false,
    },
    // Cgroup socket filters exist since 4.14; on older kernels the object
    // set simply does not provide this program.
    CgroupProgram {
        pin_name: CGROUP_INET_CREATE_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET_SOCK_CREATE,
        min_kernel: Some((4, 14, 0)),
        needs_extended_hooks: false,
    },
    CgroupProgram {
        pin_name: CGROUP_CONNECT4_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET4_CONNECT,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_CONNECT6_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET6_CONNECT,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_UDP4_RECVMSG_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_UDP4_RECVMSG,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_UDP6_RECVMSG_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_UDP6_RECVMSG,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_UDP4_SENDMSG_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_UDP4_SENDMSG,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_UDP6_SENDMSG_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_UDP6_SENDMSG,
        min_kernel: None,
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_GETSOCKOPT_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_GETSOCKOPT,
        min_kernel: Some((5, 4, 0)),
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_SETSOCKOPT_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_SETSOCKOPT,
        min_kernel: Some((5, 4, 0)),
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_INET_RELEASE_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET_SOCK_RELEASE,
        min_kernel: Some((5, 10, 0)),
        needs_extended_hooks: true,
    },
    CgroupProgram {
        pin_name: CGROUP_BIND4_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET4_BIND,
        min_kernel: Some((4, 19, 0)),
        needs_extended_hooks: false,
    },
    CgroupProgram {
        pin_name: CGROUP_BIND6_PROG_NAME,
        attach_type: syscalls::BPF_CGROUP_INET6_BIND,
        min_kernel: Some((4, 19, 0)),
        needs_extended_hooks: false,
    },
];

/// Programs to attach on the given platform, in attach order.
pub fn required_programs(caps: &PlatformCapabilities) -> Vec<&'static CgroupProgram> {
    CGROUP_PROGRAMS
        .iter()
        .filter(|program| {
            if program.needs_extended_hooks && !caps.extended_socket_hooks {
                return false;
            }
            match program.min_kernel {
                Some((major, minor, patch)) => caps.at_least_kernel(major, minor, patch),
                None => true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(major: u8, minor: u8, extended: bool) -> PlatformCapabilities {
        PlatformCapabilities {
            kernel: KernelVersion::new(major, minor, 0),
            extended_socket_hooks: extended,
        }
    }

    fn names(caps: &PlatformCapabilities) -> Vec<&'static str> {
        required_programs(caps).iter().map(|p| p.pin_name).collect()
    }

    #[test]
    fn test_baseline_is_skb_accounting_only() {
        let selected = names(&caps(4, 9, false));
        assert_eq!(selected, vec![BPF_EGRESS_PROG_NAME, BPF_INGRESS_PROG_NAME]);
    }

    #[test]
    fn test_sock_create_gated_on_4_14() {
        assert!(!names(&caps(4, 9, false)).contains(&CGROUP_INET_CREATE_PROG_NAME));
        assert!(names(&caps(4, 14, false)).contains(&CGROUP_INET_CREATE_PROG_NAME));
    }

    #[test]
    fn test_bind_blocking_gated_on_4_19() {
        let selected = names(&caps(4, 19, false));
        assert!(selected.contains(&CGROUP_BIND4_PROG_NAME));
        assert!(selected.contains(&CGROUP_BIND6_PROG_NAME));
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn test_extended_hooks_respect_kernel_floors() {
        let selected = names(&caps(4, 19, true));
        assert!(selected.contains(&CGROUP_CONNECT4_PROG_NAME));
        assert!(selected.contains(&CGROUP_UDP6_SENDMSG_PROG_NAME));
        assert!(!selected.contains(&CGROUP_GETSOCKOPT_PROG_NAME));
        assert!(!selected.contains(&CGROUP_INET_RELEASE_PROG_NAME));
        assert_eq!(selected.len(), 11);

        let selected = names(&caps(5, 4, true));
        assert!(selected.contains(&CGROUP_GETSOCKOPT_PROG_NAME));
        assert!(!selected.contains(&CGROUP_INET_RELEASE_PROG_NAME));
        assert_eq!(selected.len(), 13);
    }

    #[test]
    fn test_modern_kernel_attaches_everything() {
        assert_eq!(names(&caps(5, 15, true)).len(), CGROUP_PROGRAMS.len());
    }

    #[test]
    fn test_extended_hooks_can_be_disabled() {
        let selected = names(&caps(5, 15, false));
        assert!(!selected.contains(&CGROUP_CONNECT4_PROG_NAME));
        assert!(!selected.contains(&CGROUP_SETSOCKOPT_PROG_NAME));
        assert_eq!(selected.len(), 5);
    }
}
