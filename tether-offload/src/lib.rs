//! Tethering hardware-offload control path and BPF socket accounting.
//!
//! Two independent planes share this crate:
//!   - the BPF accounting plane: cgroup program attachment, pinned map
//!     lifecycle and per-socket tag/untag with permission and entry-count
//!     enforcement ([`bpf`], [`netd`]);
//!   - the hardware offload plane: conntrack netlink socket pair handed to
//!     a privileged offload management process behind a capability-versioned
//!     HAL binding ([`netlink`], [`hal`], [`offload`]).
//!
//! Both are driven by the `tether-offload` daemon binary; `netbpfload`
//! loads and pins the BPF objects at boot ahead of it.

pub mod bpf;
pub mod config;
pub mod hal;
pub mod metrics;
pub mod netd;
pub mod netlink;
pub mod offload;
pub mod platform;
