//! Shared types between the tether-offload daemon and the network BPF programs.
//!
//! This crate is `no_std` compatible so it can be used from eBPF program
//! crates. All map key/value types are `repr(C)` for a stable ABI across the
//! kernel/userspace boundary; the struct layouts must match the reference
//! kernel programs byte for byte.

#![no_std]

// ---------------------------------------------------------------------------
// Map Sizing & Entry-Count Policy
// ---------------------------------------------------------------------------

/// Number of entries in each of the two rotating stats maps.
pub const STATS_MAP_SIZE: u32 = 5000;

/// Number of entries in the cookie tag map.
pub const COOKIE_UID_MAP_SIZE: u32 = 10000;

/// Maximum number of tagged stats entries a single uid may hold.
pub const PER_UID_STATS_ENTRIES_LIMIT: u32 = 500;

/// At most 90% of the stats map may be used by tagged traffic entries. The
/// remaining 10% stays available to count untagged traffic, one entry per
/// uid; otherwise apps could avoid data usage accounting entirely by filling
/// the map with tagged entries.
pub const TOTAL_UID_STATS_ENTRIES_LIMIT: u32 = STATS_MAP_SIZE / 10 * 9;

const _: () = assert!(
    STATS_MAP_SIZE - TOTAL_UID_STATS_ENTRIES_LIMIT > 100,
    "stats map reserve too small, untagged accounting may be lost to overflow"
);

// ---------------------------------------------------------------------------
// Map Key/Value Types
// ---------------------------------------------------------------------------

/// Accounting bucket a tagged socket belongs to. Value of the cookie tag map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UidTagValue {
    /// Uid the socket's traffic is charged to.
    pub uid: u32,
    /// Application-supplied grouping tag, orthogonal to uid.
    pub tag: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for UidTagValue {}

/// Key of the per-(uid, tag, counter set, iface) stats maps.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsKey {
    pub uid: u32,
    pub tag: u32,
    pub counter_set: u32,
    pub iface_index: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for StatsKey {}

/// Byte/packet counters stored in the stats maps.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for StatsValue {}

// ---------------------------------------------------------------------------
// Configuration Map
// ---------------------------------------------------------------------------

/// Entry in the configuration map that stores which stats map is in use.
pub const CURRENT_STATS_MAP_CONFIGURATION_KEY: u32 = 1;

/// Stats map A is live; tagged entries are counted against it.
pub const SELECT_MAP_A: u32 = 0;
/// Stats map B is live.
pub const SELECT_MAP_B: u32 = 1;

// ---------------------------------------------------------------------------
// Permissions & Well-Known Uids
// ---------------------------------------------------------------------------

/// Permission map bit allowing an app to charge traffic to another uid.
pub const BPF_PERMISSION_UPDATE_DEVICE_STATS: u8 = 1 << 3;

/// Uid range reserved per user profile; `uid % PER_USER_RANGE` is the app id.
pub const PER_USER_RANGE: u32 = 100_000;

pub const AID_ROOT: u32 = 0;
pub const AID_SYSTEM: u32 = 1000;
/// Reserved for the CLAT translation daemon; its traffic is tagged by a
/// privileged native path only.
pub const AID_CLAT: u32 = 1029;
pub const AID_DNS: u32 = 1051;

// ---------------------------------------------------------------------------
// Pinned Object Names (must match between the BPF objects and the loader)
// ---------------------------------------------------------------------------

/// Default directory the network BPF maps and programs are pinned under.
pub const DEFAULT_BPF_NETD_PATH: &str = "/sys/fs/bpf/netd_shared";

/// Map name: HashMap<u64 socket cookie, UidTagValue>.
pub const COOKIE_TAG_MAP_NAME: &str = "map_netd_cookie_tag_map";

/// Map names: HashMap<StatsKey, StatsValue>, rotated by the stats service.
pub const STATS_MAP_A_NAME: &str = "map_netd_stats_map_A";
pub const STATS_MAP_B_NAME: &str = "map_netd_stats_map_B";

/// Map name: Array<u32> of configuration scalars.
pub const CONFIGURATION_MAP_NAME: &str = "map_netd_configuration_map";

/// Map name: HashMap<u32 app id, u8 permission bits>.
pub const UID_PERMISSION_MAP_NAME: &str = "map_netd_uid_permission_map";

/// Cgroup skb accounting programs.
pub const BPF_EGRESS_PROG_NAME: &str = "prog_netd_cgroupskb_egress_stats";
pub const BPF_INGRESS_PROG_NAME: &str = "prog_netd_cgroupskb_ingress_stats";

/// Socket-filter programs consumed by the xt_bpf netfilter match.
pub const XT_BPF_INGRESS_PROG_NAME: &str = "prog_netd_skfilter_ingress_xtbpf";
pub const XT_BPF_EGRESS_PROG_NAME: &str = "prog_netd_skfilter_egress_xtbpf";
pub const XT_BPF_ALLOWLIST_PROG_NAME: &str = "prog_netd_skfilter_allowlist_xtbpf";
pub const XT_BPF_DENYLIST_PROG_NAME: &str = "prog_netd_skfilter_denylist_xtbpf";

/// Cgroup socket lifecycle and address-family hook programs.
pub const CGROUP_INET_CREATE_PROG_NAME: &str = "prog_netd_cgroupsock_inet_create";
pub const CGROUP_INET_RELEASE_PROG_NAME: &str = "prog_netd_cgroupsockrelease_inet_release";
pub const CGROUP_CONNECT4_PROG_NAME: &str = "prog_netd_connect4_inet4_connect";
pub const CGROUP_CONNECT6_PROG_NAME: &str = "prog_netd_connect6_inet6_connect";
pub const CGROUP_UDP4_RECVMSG_PROG_NAME: &str = "prog_netd_recvmsg4_udp4_recvmsg";
pub const CGROUP_UDP6_RECVMSG_PROG_NAME: &str = "prog_netd_recvmsg6_udp6_recvmsg";
pub const CGROUP_UDP4_SENDMSG_PROG_NAME: &str = "prog_netd_sendmsg4_udp4_sendmsg";
pub const CGROUP_UDP6_SENDMSG_PROG_NAME: &str = "prog_netd_sendmsg6_udp6_sendmsg";
pub const CGROUP_GETSOCKOPT_PROG_NAME: &str = "prog_netd_getsockopt_prog";
pub const CGROUP_SETSOCKOPT_PROG_NAME: &str = "prog_netd_setsockopt_prog";
pub const CGROUP_BIND4_PROG_NAME: &str = "prog_netd_block_bind4_block_port";
pub const CGROUP_BIND6_PROG_NAME: &str = "prog_netd_block_bind6_block_port";

/// Marker written once all network BPF objects are loaded and pinned.
pub const NET_BPF_LOAD_DONE_MARKER: &str = "mainline_done";

// ---------------------------------------------------------------------------
// Layout Checks
// ---------------------------------------------------------------------------

const _: () = assert!(core::mem::size_of::<UidTagValue>() == 8);
const _: () = assert!(core::mem::size_of::<StatsKey>() == 16);
const _: () = assert!(core::mem::size_of::<StatsValue>() == 32);
