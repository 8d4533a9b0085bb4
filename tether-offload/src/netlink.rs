//! Conntrack netlink plumbing for the offload management process.
//!
//! The offload management process consumes kernel connection-tracking
//! events through two `NETLINK_NETFILTER` sockets we create, bind to the
//! relevant multicast groups and hand over at init. Before the handoff, a
//! dump request is issued on the first socket so the process starts from
//! the full conntrack table rather than only incremental events.

use std::io;
use std::mem;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tracing::debug;

// Reference kernel uapi linux/netfilter/nfnetlink_compat.h
pub const NF_NETLINK_CONNTRACK_NEW: u32 = 1;
pub const NF_NETLINK_CONNTRACK_UPDATE: u32 = 2;
pub const NF_NETLINK_CONNTRACK_DESTROY: u32 = 4;

// Reference libnetfilter_conntrack/linux_nfnetlink_conntrack.h
pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub const IPCTNL_MSG_CT_NEW: u16 = 0;
pub const IPCTNL_MSG_CT_GET: u16 = 1;

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NFNETLINK_V0: u8 = 0;

/// Bounded wait for netlink sends. The dump request is advisory, so a slow
/// or wedged receiver must not stall offload bring-up.
pub const NETLINK_MESSAGE_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Socket Creation
// ---------------------------------------------------------------------------

/// Create a `NETLINK_NETFILTER` socket subscribed to the conntrack
/// multicast `groups`, bound and connected to the kernel.
///
/// Every failure path closes the descriptor before returning; a partially
/// set up socket never leaks out of this function.
pub fn create_conntrack_socket(groups: u32) -> io::Result<OwnedFd> {
    let socket = Socket::new(
        Domain::from(libc::AF_NETLINK),
        Type::RAW,
        Some(Protocol::from(libc::NETLINK_NETFILTER)),
    )?;

    let addr = netlink_addr(0, groups);
    socket.bind(&addr)?;
    socket.connect(&addr)?;

    debug!(groups, "created conntrack netlink socket");
    Ok(socket.into())
}

fn netlink_addr(pid: u32, groups: u32) -> SockAddr {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    {
        // SAFETY: sockaddr_nl fits inside sockaddr_storage.
        let nl = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_nl>() };
        nl.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        nl.nl_pid = pid;
        nl.nl_groups = groups;
    }
    // SAFETY: storage holds a valid sockaddr_nl of the stated length.
    unsafe { SockAddr::new(storage, mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t) }
}

// ---------------------------------------------------------------------------
// Netfilter Message Framing
// ---------------------------------------------------------------------------

/// Serialize an IPv4 `nlmsghdr` + `nfgenmsg` request.
///
/// Native byte order throughout: the receiver shares the host's endianness
/// and expects the raw kernel uapi struct layout, so this framing is not
/// cross-endian portable.
pub fn build_nfgen_msg(ty: u16, flags: u16) -> Vec<u8> {
    let len = NLMSG_HDRLEN + NFGENMSG_LEN;
    let mut msg = Vec::with_capacity(len);

    // struct nlmsghdr
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&ty.to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid

    // struct nfgenmsg
    msg.push(libc::AF_INET as u8);
    msg.push(NFNETLINK_V0);
    msg.extend_from_slice(&0u16.to_ne_bytes()); // res_id

    msg
}

/// Ask the kernel to dump the current conntrack table onto `sock`.
///
/// Callers treat failure (including the bounded-send timeout) as advisory:
/// log it and continue, the offload process merely starts without the
/// pre-existing connections.
pub fn request_conntrack_dump(sock: &impl AsFd) -> io::Result<()> {
    let msg = build_nfgen_msg(
        (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET,
        (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
    );

    let sock = SockRef::from(sock);
    sock.set_write_timeout(Some(NETLINK_MESSAGE_TIMEOUT))?;
    sock.send(&msg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_request_layout() {
        let ty = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET;
        let flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
        let msg = build_nfgen_msg(ty, flags);

        assert_eq!(msg.len(), 20);
        assert_eq!(msg[0..4], 20u32.to_ne_bytes());
        assert_eq!(msg[4..6], ty.to_ne_bytes());
        assert_eq!(msg[6..8], flags.to_ne_bytes());
        // seq and pid are always zero
        assert_eq!(msg[8..16], [0u8; 8]);
        // nfgenmsg: family, version, reserved id
        assert_eq!(msg[16], libc::AF_INET as u8);
        assert_eq!(msg[17], 0);
        assert_eq!(msg[18..20], [0u8; 2]);
    }

    #[test]
    fn test_message_type_encoding() {
        assert_eq!((NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET, 0x0101);
        assert_eq!((NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW, 0x0100);
    }

    #[test]
    fn test_conntrack_group_masks() {
        assert_eq!(NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_DESTROY, 5);
        assert_eq!(NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY, 6);
    }

    #[test]
    fn test_dump_request_on_socketpair() {
        // A datagram pair stands in for the netlink socket; the send path
        // (timeout setup + 20-byte write) is transport agnostic.
        let (a, b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        request_conntrack_dump(&a).unwrap();
        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(n, 20);
        assert_eq!(buf[0..4], 20u32.to_ne_bytes());
    }
}
