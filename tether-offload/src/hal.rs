//! Offload HAL binding surface.
//!
//! The hardware offload management process is a privileged external
//! service reachable through one of several transport generations. This
//! module models the binding as a capability trait; transports register
//! through [`crate::offload::Dependencies`] and the orchestrator never
//! sees the wire format.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Version Negotiation
// ---------------------------------------------------------------------------

/// Offload service transport generations, ordered by capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HalVersion {
    /// No offload service declared on this device.
    None,
    Hidl1_0,
    /// Adds data warning quotas on top of 1.0.
    Hidl1_1,
    /// Stable AIDL service; receives the original netlink fds.
    Aidl,
}

impl fmt::Display for HalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HalVersion::None => "None",
            HalVersion::Hidl1_0 => "HIDL 1.0",
            HalVersion::Hidl1_1 => "HIDL 1.1",
            HalVersion::Aidl => "AIDL",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Data Types
// ---------------------------------------------------------------------------

/// Tx/Rx bytes forwarded on an upstream since the last query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardedStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl ForwardedStats {
    pub fn add(&mut self, other: ForwardedStats) {
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;
    }
}

impl fmt::Display for ForwardedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx:{} tx:{}", self.rx_bytes, self.tx_bytes)
    }
}

/// A NAT session timeout refresh streamed by the management process.
#[derive(Clone, Debug)]
pub struct NatTimeoutUpdate {
    pub proto: i32,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
}

// ---------------------------------------------------------------------------
// Callback Boundary
// ---------------------------------------------------------------------------

/// Notifications from the offload management process.
///
/// Invoked on the service's own thread; no ordering is guaranteed relative
/// to control calls beyond "after the corresponding state change".
pub trait OffloadHalCallback: Send + Sync {
    /// Offload started.
    fn on_started(&self) {}
    /// Offload stopped because an error occurred in a lower layer.
    fn on_stopped_error(&self) {}
    /// Offload stopped because the current bearer cannot support it.
    /// Configuration pushed afterwards cannot be presumed to be retained;
    /// on [`Self::on_support_available`] the caller must reprogram the
    /// hardware from scratch.
    fn on_stopped_unsupported(&self) {}
    /// Offload can be supported again.
    fn on_support_available(&self) {}
    /// Offload stopped because the data limit was reached.
    fn on_stopped_limit_reached(&self) {}
    /// The data warning quota was reached.
    fn on_warning_reached(&self) {}
    /// A forwarded NAT session had its timeout refreshed.
    fn on_nat_timeout_update(&self, _update: NatTimeoutUpdate) {}
}

// ---------------------------------------------------------------------------
// HAL Boundary
// ---------------------------------------------------------------------------

/// Control surface of the offload management service.
///
/// Boolean results follow the service contract: `false` is a transport or
/// service failure, never a capability statement. Capability gating happens
/// one layer up in the orchestrator, keyed on [`OffloadHal::version`].
pub trait OffloadHal {
    /// Hand over the two conntrack event descriptors and register the
    /// callback. `conntrack_new` watches NEW|DESTROY events,
    /// `conntrack_updates` watches UPDATE|DESTROY.
    ///
    /// HIDL transports duplicate the descriptors internally; AIDL services
    /// take over the originals. The caller owns the corresponding close
    /// obligations (see the orchestrator).
    fn init_offload(
        &mut self,
        conntrack_new: BorrowedFd<'_>,
        conntrack_updates: BorrowedFd<'_>,
        callback: Arc<dyn OffloadHalCallback>,
    ) -> bool;

    fn stop_offload(&mut self) -> bool;

    fn version(&self) -> HalVersion;

    fn forwarded_stats(&mut self, upstream: &str) -> ForwardedStats;

    fn set_local_prefixes(&mut self, prefixes: &[String]) -> bool;

    /// AIDL deprecated the bare limit; bindings for it implement this by
    /// delegating to [`Self::set_data_warning_and_limit`] with the warning
    /// set to `u64::MAX`.
    fn set_data_limit(&mut self, iface: &str, limit: u64) -> bool;

    /// Only meaningful on HAL 1.1 and later.
    fn set_data_warning_and_limit(&mut self, iface: &str, warning: u64, limit: u64) -> bool;

    fn set_upstream_parameters(
        &mut self,
        iface: &str,
        v4_addr: &str,
        v4_gateway: &str,
        v6_gateways: &[String],
    ) -> bool;

    fn add_downstream(&mut self, ifname: &str, prefix: &str) -> bool;

    fn remove_downstream(&mut self, ifname: &str, prefix: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(HalVersion::None < HalVersion::Hidl1_0);
        assert!(HalVersion::Hidl1_0 < HalVersion::Hidl1_1);
        assert!(HalVersion::Hidl1_1 < HalVersion::Aidl);
        assert!(HalVersion::Hidl1_0 < HalVersion::Aidl);
    }

    #[test]
    fn test_version_display() {
        assert_eq!(HalVersion::None.to_string(), "None");
        assert_eq!(HalVersion::Hidl1_0.to_string(), "HIDL 1.0");
        assert_eq!(HalVersion::Hidl1_1.to_string(), "HIDL 1.1");
        assert_eq!(HalVersion::Aidl.to_string(), "AIDL");
    }

    #[test]
    fn test_forwarded_stats_accumulate() {
        let mut total = ForwardedStats::default();
        total.add(ForwardedStats { rx_bytes: 10, tx_bytes: 1 });
        total.add(ForwardedStats { rx_bytes: 5, tx_bytes: 2 });
        assert_eq!(total, ForwardedStats { rx_bytes: 15, tx_bytes: 3 });
        assert_eq!(total.to_string(), "rx:15 tx:3");
    }
}
