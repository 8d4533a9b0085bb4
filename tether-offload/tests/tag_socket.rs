//! Socket tagging against real kernel maps.
//!
//! Each test creates the accounting maps through bpf(2), pins them under a
//! scratch directory on bpffs and exercises tag/untag end to end. The
//! whole suite skips itself when the environment cannot create or pin BPF
//! maps (no CAP_BPF, read-only bpffs, container without bpffs).

use std::fs;
use std::io;
use std::mem;
use std::net::UdpSocket;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use tether_offload::bpf::{syscalls, BpfHandler, EntryLimits};
use tether_offload_common::*;

// ---------------------------------------------------------------------------
// Raw bpf(2) helpers for fixture setup
// ---------------------------------------------------------------------------

const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;

const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_MAP_TYPE_ARRAY: u32 = 2;

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<libc::c_long> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn create_map(map_type: u32, key_size: u32, value_size: u32, max_entries: u32) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
    };
    let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)?;
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd as libc::c_int) })
}

fn map_update<K: Copy, V: Copy>(map: &OwnedFd, key: &K, value: &V) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: key as *const K as u64,
        value: value as *const V as u64,
        flags: 0, // BPF_ANY
        ..Default::default()
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr)?;
    Ok(())
}

fn map_lookup<K: Copy, V: Copy + Default>(map: &OwnedFd, key: &K) -> io::Result<V> {
    let mut value = V::default();
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: key as *const K as u64,
        value: &mut value as *mut V as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr)?;
    Ok(value)
}

fn map_delete<K: Copy>(map: &OwnedFd, key: &K) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: key as *const K as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    dir: PathBuf,
    cookie_tag: OwnedFd,
    stats_a: OwnedFd,
    #[allow(dead_code)]
    stats_b: OwnedFd,
    configuration: OwnedFd,
    permissions: OwnedFd,
    handler: BpfHandler,
}

static FIXTURE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Build the pinned map set, or None (with a note) when the environment
/// cannot host it.
fn try_setup(limits: EntryLimits) -> Option<Fixture> {
    macro_rules! skip_on_err {
        ($what:expr, $result:expr) => {
            match $result {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("skipping: {} failed: {e}", $what);
                    return None;
                }
            }
        };
    }

    let cookie_tag = skip_on_err!(
        "BPF_MAP_CREATE",
        create_map(BPF_MAP_TYPE_HASH, 8, 8, COOKIE_UID_MAP_SIZE)
    );
    let stats_a = skip_on_err!("stats map A", create_map(BPF_MAP_TYPE_HASH, 16, 32, STATS_MAP_SIZE));
    let stats_b = skip_on_err!("stats map B", create_map(BPF_MAP_TYPE_HASH, 16, 32, STATS_MAP_SIZE));
    let configuration = skip_on_err!("configuration map", create_map(BPF_MAP_TYPE_ARRAY, 4, 4, 2));
    let permissions = skip_on_err!("permission map", create_map(BPF_MAP_TYPE_HASH, 4, 1, 100));

    let seq = FIXTURE_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = PathBuf::from(format!(
        "/sys/fs/bpf/tether-offload-test-{}-{}",
        std::process::id(),
        seq
    ));
    skip_on_err!("creating bpffs scratch dir", fs::create_dir_all(&dir));

    for (fd, name) in [
        (&stats_a, STATS_MAP_A_NAME),
        (&stats_b, STATS_MAP_B_NAME),
        (&configuration, CONFIGURATION_MAP_NAME),
        (&permissions, UID_PERMISSION_MAP_NAME),
        (&cookie_tag, COOKIE_TAG_MAP_NAME),
    ] {
        let path = dir.join(name);
        if let Err(e) = syscalls::obj_pin(fd.as_fd(), &path) {
            eprintln!("skipping: pinning {} failed: {e}", path.display());
            let _ = fs::remove_dir_all(&dir);
            return None;
        }
    }

    // Stats map A is live unless a test flips it.
    map_update(&configuration, &CURRENT_STATS_MAP_CONFIGURATION_KEY, &SELECT_MAP_A)
        .expect("selecting stats map A");

    let handler = BpfHandler::open_pinned(&dir, limits).expect("opening pinned maps");

    Some(Fixture {
        dir,
        cookie_tag,
        stats_a,
        stats_b,
        configuration,
        permissions,
        handler,
    })
}

impl Fixture {
    fn fill_stats_a(&self, uid: u32, entries: u32) {
        for tag in 0..entries {
            let key = StatsKey { uid, tag, counter_set: 0, iface_index: 0 };
            map_update(&self.stats_a, &key, &StatsValue::default()).expect("filling stats map");
        }
    }

    fn grant_update_stats(&self, app_id: u32) {
        map_update(&self.permissions, &app_id, &BPF_PERMISSION_UPDATE_DEVICE_STATS)
            .expect("granting permission");
    }

    fn cookie_entry(&self, sock: &UdpSocket) -> io::Result<UidTagValue> {
        let cookie = socket_cookie(sock);
        map_lookup(&self.cookie_tag, &cookie)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn socket_cookie(sock: &UdpSocket) -> u64 {
    let mut cookie: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    assert_eq!(rc, 0, "SO_COOKIE failed");
    cookie
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn tag_then_untag_round_trip() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    fx.handler.tag_socket(sock.as_fd(), 0x42, 7777, 7777).unwrap();
    assert_eq!(fx.cookie_entry(&sock).unwrap(), UidTagValue { uid: 7777, tag: 0x42 });

    // Re-tagging overwrites in place (BPF_ANY).
    fx.handler.tag_socket(sock.as_fd(), 0x43, 7777, 7777).unwrap();
    assert_eq!(fx.cookie_entry(&sock).unwrap(), UidTagValue { uid: 7777, tag: 0x43 });

    fx.handler.untag_socket(sock.as_fd()).unwrap();
    assert_eq!(
        fx.cookie_entry(&sock).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );

    // Untagging an already-untagged socket reports the error but is
    // harmless.
    assert_eq!(fx.handler.untag_socket(sock.as_fd()), Err(Errno::ENOENT));
}

#[test]
fn per_uid_entry_ceiling_blocks_at_limit() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let uid = 7777;

    fx.fill_stats_a(uid, 500);
    assert_eq!(fx.handler.tag_socket(sock.as_fd(), 1, uid, uid), Err(Errno::EMFILE));
    // A rejected request writes nothing.
    assert_eq!(
        fx.cookie_entry(&sock).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );

    // One entry below the ceiling the identical request goes through.
    let key = StatsKey { uid, tag: 0, counter_set: 0, iface_index: 0 };
    map_delete(&fx.stats_a, &key).unwrap();
    fx.handler.tag_socket(sock.as_fd(), 1, uid, uid).unwrap();
}

#[test]
fn total_entry_ceiling_counts_all_uids() {
    let limits = EntryLimits { per_uid: 500, total: 5 };
    let Some(fx) = try_setup(limits) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    for uid in 100..105 {
        fx.fill_stats_a(uid, 1);
    }
    assert_eq!(fx.handler.tag_socket(sock.as_fd(), 1, 7777, 7777), Err(Errno::EMFILE));
}

#[test]
fn cross_uid_charging_requires_permission() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let (charge_uid, real_uid) = (4242, 31337);

    assert_eq!(
        fx.handler.tag_socket(sock.as_fd(), 9, charge_uid, real_uid),
        Err(Errno::EPERM)
    );

    fx.grant_update_stats(real_uid % PER_USER_RANGE);
    fx.handler.tag_socket(sock.as_fd(), 9, charge_uid, real_uid).unwrap();
    assert_eq!(
        fx.cookie_entry(&sock).unwrap(),
        UidTagValue { uid: charge_uid, tag: 9 }
    );
}

#[test]
fn clat_uid_is_never_taggable() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    assert_eq!(
        fx.handler.tag_socket(sock.as_fd(), 0, AID_CLAT, AID_CLAT),
        Err(Errno::EPERM)
    );

    // Even an explicit permission grant does not open the door.
    fx.grant_update_stats(AID_CLAT);
    assert_eq!(
        fx.handler.tag_socket(sock.as_fd(), 0, AID_CLAT, AID_CLAT),
        Err(Errno::EPERM)
    );
}

#[test]
fn non_inet_sockets_are_rejected() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let (unix_sock, _peer) = UnixDatagram::pair().unwrap();

    assert_eq!(
        fx.handler.tag_socket(unix_sock.as_fd(), 1, 7777, 7777),
        Err(Errno::EAFNOSUPPORT)
    );
}

#[test]
fn corrupt_map_selector_is_einval() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    map_update(&fx.configuration, &CURRENT_STATS_MAP_CONFIGURATION_KEY, &7u32).unwrap();
    assert_eq!(fx.handler.tag_socket(sock.as_fd(), 1, 7777, 7777), Err(Errno::EINVAL));
}

#[test]
fn ceiling_applies_to_live_map_only() {
    let Some(fx) = try_setup(EntryLimits::default()) else { return };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let uid = 7777;

    // Fill map A to the ceiling, then make B live: the scan must follow
    // the selector and accept the tag.
    fx.fill_stats_a(uid, 500);
    map_update(&fx.configuration, &CURRENT_STATS_MAP_CONFIGURATION_KEY, &SELECT_MAP_B).unwrap();
    fx.handler.tag_socket(sock.as_fd(), 1, uid, uid).unwrap();
}
