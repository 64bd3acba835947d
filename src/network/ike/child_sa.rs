use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::network::ike::child_cfg::ChildCfg;
use crate::network::ike::kernel::{KernelInterface, PolicyEntry, SaEntry};
use crate::network::ike::ts::{SecLabel, TrafficSelector};
use crate::network::ike::{Cpi, IkeError, IpcompTransform, IpsecMode, ProtocolId, SharedSecret, Spi};

static NEXT_UNIQUE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    Created,
    Installing,
    Installed,
    Retrying,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    None,
    /// Keys known, activation deferred until a rekey completes.
    Registered,
    Installed,
}

/// Parameters seeded into a CHILD_SA before negotiation, e.g. by a rekey
/// coordinator or a delayed retry.
#[derive(Debug, Clone, Default)]
pub struct ChildSeed {
    pub reqid: u32,
    pub mark_in: u32,
    pub mark_out: u32,
    pub if_id_in: u32,
    pub if_id_out: u32,
    pub if_id_in_def: u32,
    pub if_id_out_def: u32,
    pub label: Option<SecLabel>,
    pub encap: bool,
}

/// A CHILD_SA being negotiated or installed: the pair of kernel SAs plus the
/// policies binding them to traffic.
pub struct ChildSa {
    unique_id: u32,
    name: String,
    config: Arc<ChildCfg>,
    kernel: Arc<dyn KernelInterface>,
    my_host: SocketAddr,
    other_host: SocketAddr,
    state: ChildSaState,
    outbound_state: OutboundState,
    protocol: ProtocolId,
    mode: IpsecMode,
    ipcomp: IpcompTransform,
    my_spi: Option<Spi>,
    other_spi: Option<Spi>,
    my_cpi: Option<Cpi>,
    other_cpi: Option<Cpi>,
    reqid: u32,
    reqid_ref: bool,
    mark_in: u32,
    mark_out: u32,
    if_id_in: u32,
    if_id_out: u32,
    label: Option<SecLabel>,
    my_ts: Vec<TrafficSelector>,
    other_ts: Vec<TrafficSelector>,
    encap: bool,
    registered_outbound: Option<SaEntry>,
    installed_at: Option<DateTime<Utc>>,
}

impl ChildSa {
    pub fn new(
        my_host: SocketAddr,
        other_host: SocketAddr,
        config: Arc<ChildCfg>,
        seed: &ChildSeed,
        kernel: Arc<dyn KernelInterface>,
    ) -> Self {
        let pick = |seeded: u32, configured: u32, fallback: u32| {
            if seeded != 0 {
                seeded
            } else if configured != 0 {
                configured
            } else {
                fallback
            }
        };
        ChildSa {
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            name: config.name.clone(),
            my_host,
            other_host,
            state: ChildSaState::Created,
            outbound_state: OutboundState::None,
            protocol: ProtocolId::Esp,
            mode: config.mode,
            ipcomp: IpcompTransform::None,
            my_spi: None,
            other_spi: None,
            my_cpi: None,
            other_cpi: None,
            reqid: if seed.reqid != 0 { seed.reqid } else { config.reqid },
            reqid_ref: false,
            mark_in: pick(seed.mark_in, config.mark_in, 0),
            mark_out: pick(seed.mark_out, config.mark_out, 0),
            if_id_in: pick(seed.if_id_in, config.if_id_in, seed.if_id_in_def),
            if_id_out: pick(seed.if_id_out, config.if_id_out, seed.if_id_out_def),
            label: seed.label.clone().or_else(|| config.label.clone()),
            my_ts: Vec::new(),
            other_ts: Vec::new(),
            encap: seed.encap,
            registered_outbound: None,
            installed_at: None,
            config,
            kernel,
        }
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<ChildCfg> {
        &self.config
    }

    pub fn state(&self) -> ChildSaState {
        self.state
    }

    pub fn set_state(&mut self, state: ChildSaState) {
        self.state = state;
    }

    pub fn outbound_state(&self) -> OutboundState {
        self.outbound_state
    }

    pub fn mode(&self) -> IpsecMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: IpsecMode) {
        self.mode = mode;
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: ProtocolId) {
        self.protocol = protocol;
    }

    pub fn set_ipcomp(&mut self, ipcomp: IpcompTransform) {
        self.ipcomp = ipcomp;
    }

    pub fn reqid(&self) -> u32 {
        self.reqid
    }

    pub fn mark(&self, inbound: bool) -> u32 {
        if inbound {
            self.mark_in
        } else {
            self.mark_out
        }
    }

    pub fn if_id(&self, inbound: bool) -> u32 {
        if inbound {
            self.if_id_in
        } else {
            self.if_id_out
        }
    }

    pub fn label(&self) -> Option<&SecLabel> {
        self.label.as_ref()
    }

    pub fn spi(&self, inbound: bool) -> Option<Spi> {
        if inbound {
            self.my_spi
        } else {
            self.other_spi
        }
    }

    pub fn ts(&self, local: bool) -> &[TrafficSelector] {
        if local {
            &self.my_ts
        } else {
            &self.other_ts
        }
    }

    pub fn installed_at(&self) -> Option<DateTime<Utc>> {
        self.installed_at
    }

    /// Allocate our inbound SPI from the kernel.
    pub fn alloc_spi(&mut self, protocol: ProtocolId) -> Result<Spi, IkeError> {
        let spi = self.kernel.alloc_spi(protocol)?;
        self.protocol = protocol;
        self.my_spi = Some(spi);
        Ok(spi)
    }

    pub fn alloc_cpi(&mut self) -> Result<Cpi, IkeError> {
        let cpi = self.kernel.alloc_cpi()?;
        self.my_cpi = Some(cpi);
        Ok(cpi)
    }

    /// Refresh the endpoints, addresses may have changed since the request
    /// was sent.
    pub fn update(&mut self, my_host: SocketAddr, other_host: SocketAddr, encap: bool) {
        self.my_host = my_host;
        self.other_host = other_host;
        self.encap = encap;
    }

    pub fn set_policies(&mut self, my_ts: Vec<TrafficSelector>, other_ts: Vec<TrafficSelector>) {
        self.my_ts = my_ts;
        self.other_ts = other_ts;
    }

    fn sa_entry(
        &self,
        encr: SharedSecret,
        integ: SharedSecret,
        spi: Spi,
        cpi: Option<Cpi>,
        inbound: bool,
        tfcv3: bool,
    ) -> SaEntry {
        let (src, dst) = if inbound {
            (self.other_host, self.my_host)
        } else {
            (self.my_host, self.other_host)
        };
        SaEntry {
            spi,
            protocol: self.protocol,
            src,
            dst,
            inbound,
            mode: self.mode,
            encr_key: encr,
            integ_key: integ,
            ipcomp: self.ipcomp,
            cpi,
            reqid: self.reqid,
            encap: self.encap,
            tfcv3,
            if_id: self.if_id(inbound),
            label: self.label.clone(),
        }
    }

    /// Install one direction of the SA into the kernel SAD.
    pub fn install(
        &mut self,
        encr: SharedSecret,
        integ: SharedSecret,
        spi: Spi,
        cpi: Option<Cpi>,
        inbound: bool,
        tfcv3: bool,
    ) -> Result<(), IkeError> {
        if inbound {
            self.my_spi = Some(spi);
            self.my_cpi = cpi;
        } else {
            self.other_spi = Some(spi);
            self.other_cpi = cpi;
        }
        let entry = self.sa_entry(encr, integ, spi, cpi, inbound, tfcv3);
        self.kernel.add_sa(entry)?;
        if !inbound {
            self.outbound_state = OutboundState::Installed;
        }
        Ok(())
    }

    /// Record the outbound SA without installing it; a rekey coordinator
    /// activates it once the old SA is gone.
    pub fn register_outbound(
        &mut self,
        encr: SharedSecret,
        integ: SharedSecret,
        spi: Spi,
        cpi: Option<Cpi>,
        tfcv3: bool,
    ) -> Result<(), IkeError> {
        self.other_spi = Some(spi);
        self.other_cpi = cpi;
        let entry = self.sa_entry(encr, integ, spi, cpi, false, tfcv3);
        self.registered_outbound = Some(entry);
        self.outbound_state = OutboundState::Registered;
        Ok(())
    }

    /// Install the SPD entries for the negotiated selector pairs. Allocates
    /// or references the reqid binding policies to the SA pair.
    pub fn install_policies(&mut self) -> Result<(), IkeError> {
        if !self.reqid_ref {
            if self.reqid == 0 {
                self.reqid = self.kernel.alloc_reqid();
            } else {
                self.kernel.ref_reqid(self.reqid)?;
            }
            self.reqid_ref = true;
        }
        for my_ts in &self.my_ts {
            for other_ts in &self.other_ts {
                for inbound in [true, false] {
                    self.kernel.add_policy(PolicyEntry {
                        my_ts: my_ts.clone(),
                        other_ts: other_ts.clone(),
                        inbound,
                        protocol: self.protocol,
                        mode: self.mode,
                        reqid: self.reqid,
                        mark: self.mark(inbound),
                        if_id: self.if_id(inbound),
                        label: self.label.clone(),
                    })?;
                }
            }
        }
        self.installed_at = Some(Utc::now());
        Ok(())
    }
}

impl Drop for ChildSa {
    fn drop(&mut self) {
        if self.state == ChildSaState::Installed {
            return;
        }
        // negotiation did not complete, give the kernel resources back
        if let Some(spi) = self.my_spi.take() {
            self.kernel.release_spi(spi, self.protocol);
        }
        if let Some(cpi) = self.my_cpi.take() {
            self.kernel.release_cpi(cpi);
        }
        if self.reqid_ref {
            self.kernel.release_reqid(self.reqid);
        }
    }
}

impl std::fmt::Debug for ChildSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSa")
            .field("name", &self.name)
            .field("unique_id", &self.unique_id)
            .field("state", &self.state)
            .field("my_spi", &self.my_spi)
            .field("other_spi", &self.other_spi)
            .finish()
    }
}

/// Equality check used for duplicate suppression: same config, compatible
/// reqids, same marks, interface ids and label.
pub fn child_sa_equals(a: &ChildSa, b: &ChildSa) -> bool {
    a.config().as_ref() == b.config().as_ref()
        && (a.reqid() == 0 || b.reqid() == 0 || a.reqid() == b.reqid())
        && a.mark(true) == b.mark(true)
        && a.mark(false) == b.mark(false)
        && a.if_id(true) == b.if_id(true)
        && a.if_id(false) == b.if_id(false)
        && a.label() == b.label()
}
