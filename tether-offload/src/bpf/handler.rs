//! BPF map lifecycle and socket tagging.
//!
//! Owns the pinned network accounting maps, attaches the cgroup program
//! set at bring-up, and implements the per-socket tag/untag operations
//! with permission and entry-count enforcement.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use aya::maps::{Array, HashMap as BpfHashMap, Map, MapData, MapError};
use aya::Pod;
use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tether_offload_common::*;

use crate::bpf::syscalls;
use crate::config::BpfConfig;
use crate::platform::{required_programs, PlatformCapabilities};

/// Ceilings enforced before a tagged entry may be inserted.
#[derive(Clone, Copy, Debug)]
pub struct EntryLimits {
    pub per_uid: u32,
    pub total: u32,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            per_uid: PER_UID_STATS_ENTRIES_LIMIT,
            total: TOTAL_UID_STATS_ENTRIES_LIMIT,
        }
    }
}

/// Errors raised while bringing the accounting plane up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("opening cgroup root {path}: {source}")]
    CgroupOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("opening pinned map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: MapError,
    },

    /// Attach and self-check failures leave a partial program set behind,
    /// which produces silently wrong accounting. There is no recovery; the
    /// caller is expected to abort the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl InitError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InitError::Fatal(_))
    }

    /// Errno equivalent for the netd entry points.
    pub fn errno(&self) -> Errno {
        match self {
            InitError::CgroupOpen { source, .. } => {
                Errno::from_raw(source.raw_os_error().unwrap_or(libc::EIO))
            }
            InitError::Map { source, .. } => map_errno_ref(source),
            InitError::Fatal(_) => Errno::EIO,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct BpfHandler {
    stats_map_a: BpfHashMap<MapData, StatsKey, StatsValue>,
    stats_map_b: BpfHashMap<MapData, StatsKey, StatsValue>,
    configuration_map: Array<MapData, u32>,
    uid_permission_map: BpfHashMap<MapData, u32, u8>,
    /// Guards only the single-entry kernel writes. The entry-count scan
    /// deliberately runs unsynchronized (see [`Self::tag_socket`]).
    cookie_tag_map: Mutex<BpfHashMap<MapData, u64, UidTagValue>>,
    limits: EntryLimits,
}

impl BpfHandler {
    /// Bring the accounting plane up: wait for the BPF objects, attach the
    /// cgroup program set and open the pinned maps.
    ///
    /// A [`InitError::Fatal`] result means the kernel was left with a
    /// partial attach set; the caller must abort rather than continue with
    /// silently wrong accounting.
    pub fn init(config: &BpfConfig, caps: &PlatformCapabilities) -> Result<Self, InitError> {
        if !config.platform_marker.exists() {
            info!("waiting for platform BPF programs");
            wait_for_progs_loaded(&config.platform_marker);
        }
        ensure_net_progs_loaded(config);
        info!("BPF programs are loaded");

        attach_programs(&config.cgroup_root, &config.pin_root, caps)?;
        Self::open_pinned(&config.pin_root, config.entry_limits())
    }

    /// Open the pinned accounting maps under `pin_root`.
    pub fn open_pinned(pin_root: &Path, limits: EntryLimits) -> Result<Self, InitError> {
        let stats_map_a = open_hash(pin_root, STATS_MAP_A_NAME)?;
        let stats_map_b = open_hash(pin_root, STATS_MAP_B_NAME)?;
        let configuration_map = open_array(pin_root, CONFIGURATION_MAP_NAME)?;
        let uid_permission_map = open_hash(pin_root, UID_PERMISSION_MAP_NAME)?;
        // Opened last: a constructed handler therefore implies the whole
        // map set is available, and tagging never observes a partial set.
        let cookie_tag_map = open_hash(pin_root, COOKIE_TAG_MAP_NAME)?;

        info!(pin_root = %pin_root.display(), "network accounting maps opened");
        Ok(Self {
            stats_map_a,
            stats_map_b,
            configuration_map,
            uid_permission_map,
            cookie_tag_map: Mutex::new(cookie_tag_map),
            limits,
        })
    }

    /// Whether `uid` may charge traffic to other uids. Mirrors the
    /// platform's component permission check, keyed on the app id.
    pub fn has_update_device_stats_permission(&self, uid: u32) -> bool {
        let app_id = uid % PER_USER_RANGE;
        match self.uid_permission_map.get(&app_id, 0) {
            Ok(bits) if bits & BPF_PERMISSION_UPDATE_DEVICE_STATS != 0 => true,
            _ => matches!(app_id, AID_ROOT | AID_SYSTEM | AID_DNS),
        }
    }

    /// Tag `sock` so its traffic is charged to `(charge_uid, tag)`.
    ///
    /// Returns the negated-errno taxonomy of the netd contract:
    /// `EPERM` for permission failures, `EAFNOSUPPORT`/`EPROTONOSUPPORT`
    /// for sockets the destroy listener cannot clean up after, `EMFILE`
    /// when an entry ceiling would be crossed, `EINVAL` for a corrupt map
    /// selector, and raw kernel errnos otherwise.
    pub fn tag_socket(
        &self,
        sock: BorrowedFd<'_>,
        tag: u32,
        charge_uid: u32,
        real_uid: u32,
    ) -> Result<(), Errno> {
        if charge_uid != real_uid && !self.has_update_device_stats_permission(real_uid) {
            return Err(Errno::EPERM);
        }

        // CLAT traffic is tagged exclusively by the privileged translation
        // path; accepting it here would double count its data usage.
        if charge_uid == AID_CLAT {
            return Err(Errno::EPERM);
        }

        // The socket destroy listener only observes INET/INET6 TCP and UDP
        // sockets. A tag on any other class could never be cleaned up
        // automatically and would slowly fill the map with dead entries.
        if let Err(e) = socket_class_supported(socket_domain(sock)?, socket_protocol(sock)?) {
            warn!(fd = sock.as_raw_fd(), errno = %e, "unsupported socket class for tagging");
            return Err(e);
        }

        let cookie = socket_cookie(sock)?;

        let selector = self
            .configuration_map
            .get(&CURRENT_STATS_MAP_CONFIGURATION_KEY, 0)
            .map_err(map_errno)?;
        let current_map = match selector {
            SELECT_MAP_A => &self.stats_map_a,
            SELECT_MAP_B => &self.stats_map_b,
            other => {
                error!(configuration = other, "unknown stats map selector");
                return Err(Errno::EINVAL);
            }
        };

        // Count how many entries the live stats map holds in total and for
        // the charged uid, leaving room for the entry this tag will create.
        // The stats service may swap and clean the live map concurrently,
        // so this scan is a best-effort approximation rather than a
        // snapshot; the ceilings can be transiently over- or
        // under-enforced.
        let mut total_entries = 0u32;
        let mut per_uid_entries = 0u32;
        for entry in current_map.iter() {
            let (key, _) = entry.map_err(map_errno)?;
            if key.uid == charge_uid {
                per_uid_entries += 1;
            }
            total_entries += 1;
        }
        if total_entries >= self.limits.total || per_uid_entries >= self.limits.per_uid {
            warn!(
                total_entries,
                charge_uid,
                per_uid_entries,
                "too many stats entries, blocking tag request to prevent map overflow"
            );
            return Err(Errno::EMFILE);
        }

        // BPF_ANY: insert a fresh entry or update the tag in place. Kernel
        // readers are RCU-protected single-entry lookups, so a concurrent
        // update of the same cookie is safe.
        let value = UidTagValue { uid: charge_uid, tag };
        self.cookie_tag_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cookie, value, 0)
            .map_err(map_errno)?;
        debug!(cookie, tag, charge_uid, real_uid, "socket tagged");
        Ok(())
    }

    /// Remove `sock`'s tag entry. Deleting an entry that does not exist
    /// returns the kernel's errno; callers treat that as tolerable.
    pub fn untag_socket(&self, sock: BorrowedFd<'_>) -> Result<(), Errno> {
        let cookie = socket_cookie(sock)?;
        self.cookie_tag_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cookie)
            .map_err(map_errno)?;
        debug!(cookie, "socket untagged");
        Ok(())
    }

    /// Live cookie tag entry count, for diagnostics.
    pub fn cookie_tag_entries(&self) -> Result<u32, Errno> {
        let map = self.cookie_tag_map.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0u32;
        for entry in map.iter() {
            entry.map_err(map_errno)?;
            count += 1;
        }
        Ok(count)
    }

    /// Entry counts of stats maps A and B, for diagnostics.
    pub fn stats_entries(&self) -> Result<(u32, u32), Errno> {
        Ok((
            count_entries(&self.stats_map_a)?,
            count_entries(&self.stats_map_b)?,
        ))
    }
}

fn count_entries(map: &BpfHashMap<MapData, StatsKey, StatsValue>) -> Result<u32, Errno> {
    let mut count = 0u32;
    for entry in map.iter() {
        entry.map_err(map_errno)?;
        count += 1;
    }
    Ok(count)
}

fn open_hash<K: Pod, V: Pod>(
    pin_root: &Path,
    name: &str,
) -> Result<BpfHashMap<MapData, K, V>, InitError> {
    let path = pin_root.join(name);
    let data = MapData::from_pin(&path).map_err(|source| InitError::Map {
        path: path.clone(),
        source,
    })?;
    BpfHashMap::try_from(Map::HashMap(data)).map_err(|source| InitError::Map { path, source })
}

fn open_array<V: Pod>(pin_root: &Path, name: &str) -> Result<Array<MapData, V>, InitError> {
    let path = pin_root.join(name);
    let data = MapData::from_pin(&path).map_err(|source| InitError::Map {
        path: path.clone(),
        source,
    })?;
    Array::try_from(Map::Array(data)).map_err(|source| InitError::Map { path, source })
}

pub(crate) fn map_errno(err: MapError) -> Errno {
    map_errno_ref(&err)
}

fn map_errno_ref(err: &MapError) -> Errno {
    match err {
        MapError::KeyNotFound => Errno::ENOENT,
        MapError::SyscallError(s) => Errno::from_raw(s.io_error.raw_os_error().unwrap_or(libc::EIO)),
        _ => Errno::EINVAL,
    }
}

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

/// Block until `marker` exists. Boot is gated on the BPF objects, so this
/// wait is deliberately unbounded; the retry log backs off 5s -> 60s.
fn wait_for_progs_loaded(marker: &Path) {
    let mut delay = 5u64;
    loop {
        for _ in 0..delay {
            if marker.exists() {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        warn!(marker = %marker.display(), waited_secs = delay, "still waiting for BPF programs");
        delay = (delay * 2).min(60);
    }
}

fn net_bpf_load_done(pin_root: &Path) -> bool {
    pin_root.join(NET_BPF_LOAD_DONE_MARKER).exists()
}

/// Kick the network object loader if it has not completed yet.
fn ensure_net_progs_loaded(config: &BpfConfig) {
    if net_bpf_load_done(&config.pin_root) {
        return;
    }

    // TODO: flip to true and wait for the marker synchronously once every
    // supported boot flow runs netbpfload ahead of this daemon.
    const ENFORCE_NET_PROGS: bool = false;

    let Some(loader) = config.loader_command.as_ref() else {
        warn!("network BPF objects not loaded and no loader command configured");
        return;
    };
    match Command::new(loader).spawn() {
        Ok(child) => {
            info!(pid = child.id(), loader = %loader.display(), "started netbpfload asynchronously")
        }
        Err(e) => error!(loader = %loader.display(), error = %e, "failed to start netbpfload"),
    }

    if ENFORCE_NET_PROGS {
        info!("waiting for network BPF programs");
        wait_for_progs_loaded(&config.pin_root.join(NET_BPF_LOAD_DONE_MARKER));
        info!("network BPF programs are loaded");
    }
}

fn attach_programs(
    cgroup_root: &Path,
    pin_root: &Path,
    caps: &PlatformCapabilities,
) -> Result<(), InitError> {
    let cgroup = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(cgroup_root)
        .map_err(|source| InitError::CgroupOpen {
            path: cgroup_root.to_path_buf(),
            source,
        })?;

    // The xt_bpf socket filters are consumed by netfilter rules rather
    // than attached here, but accounting must not start unless they are
    // retrievable.
    for name in [
        XT_BPF_ALLOWLIST_PROG_NAME,
        XT_BPF_DENYLIST_PROG_NAME,
        XT_BPF_EGRESS_PROG_NAME,
        XT_BPF_INGRESS_PROG_NAME,
    ] {
        let path = pin_root.join(name);
        syscalls::obj_get(&path).map_err(|e| {
            InitError::Fatal(format!("program {} inaccessible: {}", path.display(), e))
        })?;
    }

    let programs = required_programs(caps);
    for program in &programs {
        let path = pin_root.join(program.pin_name);
        let fd = syscalls::obj_get(&path).map_err(|e| {
            InitError::Fatal(format!("failed to get program from {}: {}", path.display(), e))
        })?;
        syscalls::attach_program(fd.as_fd(), cgroup.as_fd(), program.attach_type)
            .map_err(|e| InitError::Fatal(format!("program {} attach failed: {}", path.display(), e)))?;
        debug!(program = program.pin_name, "attached cgroup BPF program");
    }

    // Re-query every attachment as a self check. This should trivially
    // pass since we just attached above, but BPF_PROG_QUERY is only
    // implemented on 4.19+ kernels.
    if caps.at_least_kernel(4, 19, 0) {
        for program in &programs {
            let attached = syscalls::query_program_count(cgroup.as_fd(), program.attach_type)
                .map_err(|e| {
                    InitError::Fatal(format!("querying {} failed: {}", program.pin_name, e))
                })?;
            if attached == 0 {
                return Err(InitError::Fatal(format!(
                    "program {} missing from its hook right after attach",
                    program.pin_name
                )));
            }
        }
    }

    info!(
        programs = programs.len(),
        cgroup = %cgroup_root.display(),
        "cgroup BPF program set attached"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Socket Introspection
// ---------------------------------------------------------------------------

fn getsockopt_int(sock: BorrowedFd<'_>, opt: libc::c_int) -> Result<libc::c_int, Errno> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len point at properly sized local storage.
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(value)
}

fn socket_domain(sock: BorrowedFd<'_>) -> Result<libc::c_int, Errno> {
    getsockopt_int(sock, libc::SO_DOMAIN)
}

fn socket_protocol(sock: BorrowedFd<'_>) -> Result<libc::c_int, Errno> {
    getsockopt_int(sock, libc::SO_PROTOCOL)
}

/// Kernel-assigned cookie, allocated on first query and stable for the
/// socket's lifetime.
fn socket_cookie(sock: BorrowedFd<'_>) -> Result<u64, Errno> {
    let mut cookie: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    // SAFETY: cookie and len point at properly sized local storage.
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(cookie)
}

fn socket_class_supported(family: libc::c_int, protocol: libc::c_int) -> Result<(), Errno> {
    if family != libc::AF_INET && family != libc::AF_INET6 {
        return Err(Errno::EAFNOSUPPORT);
    }
    if protocol != libc::IPPROTO_TCP && protocol != libc::IPPROTO_UDP {
        return Err(Errno::EPROTONOSUPPORT);
    }
    Ok(())
}
