//! Tethering hardware-offload orchestrator.
//!
//! Owns the binding to the offload management service, the conntrack
//! netlink socket pair handed to it, and the typed control surface used by
//! the tethering controller. Not internally synchronized: callers run on a
//! single serialized handler; reentrant or concurrent calls are outside
//! the contract.

use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::hal::{ForwardedStats, HalVersion, OffloadHal, OffloadHalCallback};
use crate::netlink::{
    self, NF_NETLINK_CONNTRACK_DESTROY, NF_NETLINK_CONNTRACK_NEW, NF_NETLINK_CONNTRACK_UPDATE,
};

const NO_INTERFACE_NAME: &str = "";
const NO_IPV4_ADDRESS: &str = "";
const NO_IPV4_GATEWAY: &str = "";

/// Capability errors surfaced by version-gated control operations, distinct
/// from transient service failures (which stay boolean).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffloadError {
    #[error("{operation} is not supported below HAL {required} (bound version is {bound})")]
    UnsupportedOperation {
        operation: &'static str,
        required: HalVersion,
        bound: HalVersion,
    },
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Orchestrator dependencies, for injection.
pub trait Dependencies {
    /// Resolve a binding to the offload management service, or `None` when
    /// no service is declared. AIDL bindings are preferred over HIDL when
    /// both are available.
    fn get_offload_hal(&self) -> Option<Box<dyn OffloadHal>>;

    /// Create a conntrack netlink socket subscribed to `groups`, or `None`
    /// on failure (already logged).
    fn create_conntrack_socket(&self, groups: u32) -> Option<OwnedFd>;
}

/// Production dependencies: raw conntrack sockets plus whatever HAL
/// factories the embedder registered. The first factory to resolve wins,
/// so AIDL factories must be registered ahead of HIDL ones.
#[derive(Default)]
pub struct SystemDependencies {
    #[allow(clippy::type_complexity)]
    hal_factories: Vec<Box<dyn Fn() -> Option<Box<dyn OffloadHal>> + Send>>,
}

impl SystemDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hal_factory(
        mut self,
        factory: impl Fn() -> Option<Box<dyn OffloadHal>> + Send + 'static,
    ) -> Self {
        self.hal_factories.push(Box::new(factory));
        self
    }
}

impl Dependencies for SystemDependencies {
    fn get_offload_hal(&self) -> Option<Box<dyn OffloadHal>> {
        self.hal_factories.iter().find_map(|factory| factory())
    }

    fn create_conntrack_socket(&self, groups: u32) -> Option<OwnedFd> {
        match netlink::create_conntrack_socket(groups) {
            Ok(fd) => Some(fd),
            Err(e) => {
                error!(groups, error = %e, "unable to create conntrack socket");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    /// A HAL binding is resolved but offload is not running.
    Bound,
    Running,
    Stopped,
}

pub struct OffloadHardwareInterface {
    deps: Box<dyn Dependencies>,
    hal: Option<Box<dyn OffloadHal>>,
    callback: Option<Arc<dyn OffloadHalCallback>>,
    state: State,
    version: HalVersion,
}

impl OffloadHardwareInterface {
    pub fn new(deps: Box<dyn Dependencies>) -> Self {
        Self {
            deps,
            hal: None,
            callback: None,
            state: State::Uninitialized,
            version: HalVersion::None,
        }
    }

    /// Negotiated HAL version, `None` until offload is running.
    pub fn version(&self) -> HalVersion {
        self.version
    }

    /// Initialize the tethering offload service.
    ///
    /// Idempotent while running: repeated calls return the cached version
    /// without creating another socket pair. Returns
    /// [`HalVersion::None`] when no service is declared or bring-up failed.
    pub fn init_offload(&mut self, callback: Arc<dyn OffloadHalCallback>) -> HalVersion {
        if self.state == State::Running {
            return self.version;
        }

        if self.hal.is_none() {
            match self.deps.get_offload_hal() {
                Some(hal) => {
                    info!(version = %hal.version(), "tethering offload service is declared");
                    self.hal = Some(hal);
                    self.state = State::Bound;
                }
                None => {
                    info!("no tethering offload service found");
                    return HalVersion::None;
                }
            }
        }

        // Per the offload service contract:
        //   h1  watches conntrack NEW | DESTROY events,
        //   h2  watches conntrack UPDATE | DESTROY events.
        let h1 = self
            .deps
            .create_conntrack_socket(NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_DESTROY);
        let h2 = self
            .deps
            .create_conntrack_socket(NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY);
        self.callback = Some(callback);

        let version = self.init_with_handles(h1, h2);
        self.version = version;
        if version != HalVersion::None {
            self.state = State::Running;
        }
        version
    }

    /// Hand the socket pair to the service and settle fd ownership.
    fn init_with_handles(&mut self, h1: Option<OwnedFd>, h2: Option<OwnedFd>) -> HalVersion {
        let (Some(h1), Some(h2)) = (h1, h2) else {
            // Whichever socket did get created is dropped (closed) here.
            error!("failed to create conntrack socket pair");
            return HalVersion::None;
        };

        // Seed the service with the current conntrack table; failure is
        // advisory, the offload process merely starts from incremental
        // events only.
        if let Err(e) = netlink::request_conntrack_dump(&h1) {
            warn!(error = %e, "unable to send conntrack dump request");
        }

        let (Some(hal), Some(callback)) = (self.hal.as_mut(), self.callback.clone()) else {
            // init_offload binds both before getting here.
            return HalVersion::None;
        };

        if !hal.init_offload(h1.as_fd(), h2.as_fd(), callback) {
            hal.stop_offload();
            error!("failed to initialize offload");
            // h1/h2 fall out of scope and are closed.
            return HalVersion::None;
        }

        let version = hal.version();
        // HIDL transports duplicate the descriptors internally, so our
        // copies must be closed after the handoff. An AIDL service receives
        // the original descriptors; closing them here would invalidate the
        // service's end, so ownership is relinquished instead.
        if version < HalVersion::Aidl {
            drop(h1);
            drop(h2);
        } else {
            let _ = h1.into_raw_fd();
            let _ = h2.into_raw_fd();
        }
        version
    }

    /// Stop the tethering offload service and drop the binding. Local state
    /// always ends up stopped, even if the service call fails.
    pub fn stop_offload(&mut self) {
        if let Some(hal) = self.hal.as_mut() {
            if !hal.stop_offload() {
                error!("failed to stop offload");
            }
        }
        self.hal = None;
        self.callback = None;
        self.version = HalVersion::None;
        self.state = State::Stopped;
    }

    /// Tx/Rx bytes forwarded on `upstream` since the last query.
    pub fn get_forwarded_stats(&mut self, upstream: &str) -> ForwardedStats {
        self.bound_hal().forwarded_stats(upstream)
    }

    /// Push the set of non-offloadable local prefixes.
    pub fn set_local_prefixes(&mut self, prefixes: &[String]) -> bool {
        self.bound_hal().set_local_prefixes(prefixes)
    }

    /// Set the byte limit on `iface` after which offload must stop.
    pub fn set_data_limit(&mut self, iface: &str, limit: u64) -> bool {
        self.bound_hal().set_data_limit(iface, limit)
    }

    /// Set the warning and limit quotas on `iface`. Only supported on HAL
    /// 1.1 and later; older versions yield a typed capability error rather
    /// than a transient failure.
    pub fn set_data_warning_and_limit(
        &mut self,
        iface: &str,
        warning: u64,
        limit: u64,
    ) -> Result<bool, OffloadError> {
        let hal = self.bound_hal();
        let bound = hal.version();
        if bound < HalVersion::Hidl1_1 {
            return Err(OffloadError::UnsupportedOperation {
                operation: "setDataWarningAndLimit",
                required: HalVersion::Hidl1_1,
                bound,
            });
        }
        Ok(hal.set_data_warning_and_limit(iface, warning, limit))
    }

    /// Push upstream parameters. The service contract does not accept
    /// absent values, so they are normalized to empty sentinels first.
    pub fn set_upstream_parameters(
        &mut self,
        iface: Option<&str>,
        v4_addr: Option<&str>,
        v4_gateway: Option<&str>,
        v6_gateways: Option<&[String]>,
    ) -> bool {
        let iface = iface.unwrap_or(NO_INTERFACE_NAME);
        let v4_addr = v4_addr.unwrap_or(NO_IPV4_ADDRESS);
        let v4_gateway = v4_gateway.unwrap_or(NO_IPV4_GATEWAY);
        let v6_gateways = v6_gateways.unwrap_or(&[]);
        self.bound_hal()
            .set_upstream_parameters(iface, v4_addr, v4_gateway, v6_gateways)
    }

    /// Offload traffic to the downstream prefix on `ifname`.
    pub fn add_downstream(&mut self, ifname: &str, prefix: &str) -> bool {
        self.bound_hal().add_downstream(ifname, prefix)
    }

    /// Stop offloading traffic to the downstream prefix on `ifname`.
    pub fn remove_downstream(&mut self, ifname: &str, prefix: &str) -> bool {
        self.bound_hal().remove_downstream(ifname, prefix)
    }

    /// Control calls require a successful [`Self::init_offload`] first.
    /// This is an internal interface driven by the serialized tethering
    /// handler, so the precondition is documented rather than recovered
    /// from.
    ///
    /// # Panics
    ///
    /// If no HAL binding is held.
    fn bound_hal(&mut self) -> &mut dyn OffloadHal {
        self.hal
            .as_mut()
            .expect("init_offload must succeed before control calls")
            .as_mut()
    }
}
