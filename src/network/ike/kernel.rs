use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::network::ike::ts::{SecLabel, TrafficSelector};
use crate::network::ike::{Cpi, IkeError, IpcompTransform, IpsecMode, ProtocolId, SharedSecret, Spi};

/// Capabilities of the kernel IPsec backend, probed once per task.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFeatures {
    /// ESPv3 TFC padding supported.
    pub esp_v3_tfc: bool,
}

/// One SA to install into the SAD.
#[derive(Debug, Clone)]
pub struct SaEntry {
    pub spi: Spi,
    pub protocol: ProtocolId,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub inbound: bool,
    pub mode: IpsecMode,
    pub encr_key: SharedSecret,
    pub integ_key: SharedSecret,
    pub ipcomp: IpcompTransform,
    pub cpi: Option<Cpi>,
    pub reqid: u32,
    pub encap: bool,
    pub tfcv3: bool,
    pub if_id: u32,
    pub label: Option<SecLabel>,
}

/// One policy to install into the SPD.
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub my_ts: TrafficSelector,
    pub other_ts: TrafficSelector,
    pub inbound: bool,
    pub protocol: ProtocolId,
    pub mode: IpsecMode,
    pub reqid: u32,
    pub mark: u32,
    pub if_id: u32,
    pub label: Option<SecLabel>,
}

/// Kernel IPsec engine contract: SPI/CPI allocation, SAD and SPD
/// maintenance, and reference-counted reqids.
pub trait KernelInterface: Send + Sync {
    fn features(&self) -> KernelFeatures;
    fn alloc_spi(&self, protocol: ProtocolId) -> Result<Spi, IkeError>;
    fn alloc_cpi(&self) -> Result<Cpi, IkeError>;
    fn release_spi(&self, spi: Spi, protocol: ProtocolId);
    fn release_cpi(&self, cpi: Cpi);
    fn add_sa(&self, entry: SaEntry) -> Result<(), IkeError>;
    fn del_sa(&self, spi: Spi, protocol: ProtocolId);
    fn add_policy(&self, entry: PolicyEntry) -> Result<(), IkeError>;
    fn alloc_reqid(&self) -> u32;
    fn ref_reqid(&self, reqid: u32) -> Result<(), IkeError>;
    fn release_reqid(&self, reqid: u32);
}

#[derive(Default)]
struct SimKernelState {
    next_spi: u32,
    next_cpi: u16,
    next_reqid: u32,
    allocated_spis: Vec<(Spi, ProtocolId)>,
    allocated_cpis: Vec<Cpi>,
    sad: HashMap<(u32, u8), SaEntry>,
    spd: Vec<PolicyEntry>,
    reqids: HashMap<u32, usize>,
}

/// In-memory kernel backend used by the daemon front-end and the tests.
pub struct SimKernel {
    state: Mutex<SimKernelState>,
    features: KernelFeatures,
    fail_sa_install: AtomicBool,
    fail_policy_install: AtomicBool,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_spi_base(0xc0000000)
    }

    /// Allocate SPIs sequentially starting at `base + 1`.
    pub fn with_spi_base(base: u32) -> Self {
        SimKernel {
            state: Mutex::new(SimKernelState {
                next_spi: base,
                next_cpi: 0x4000,
                next_reqid: 0,
                ..Default::default()
            }),
            features: KernelFeatures { esp_v3_tfc: true },
            fail_sa_install: AtomicBool::new(false),
            fail_policy_install: AtomicBool::new(false),
        }
    }

    pub fn without_tfc() -> Self {
        let mut kernel = Self::new();
        kernel.features.esp_v3_tfc = false;
        kernel
    }

    /// Make subsequent add_sa calls fail, to exercise rollback paths.
    pub fn fail_sa_installs(&self, fail: bool) {
        self.fail_sa_install.store(fail, Ordering::SeqCst);
    }

    pub fn fail_policy_installs(&self, fail: bool) {
        self.fail_policy_install.store(fail, Ordering::SeqCst);
    }

    pub fn sad_len(&self) -> usize {
        self.state.lock().unwrap().sad.len()
    }

    pub fn spd_len(&self) -> usize {
        self.state.lock().unwrap().spd.len()
    }

    pub fn allocated_spis(&self) -> usize {
        self.state.lock().unwrap().allocated_spis.len()
    }

    pub fn allocated_cpis(&self) -> usize {
        self.state.lock().unwrap().allocated_cpis.len()
    }

    pub fn reqid_refs(&self, reqid: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .reqids
            .get(&reqid)
            .copied()
            .unwrap_or(0)
    }

    pub fn sa(&self, spi: Spi, protocol: ProtocolId) -> Option<SaEntry> {
        self.state
            .lock()
            .unwrap()
            .sad
            .get(&(spi.0, protocol.to_u8()))
            .cloned()
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelInterface for SimKernel {
    fn features(&self) -> KernelFeatures {
        self.features
    }

    fn alloc_spi(&self, protocol: ProtocolId) -> Result<Spi, IkeError> {
        let mut state = self.state.lock().unwrap();
        state.next_spi += 1;
        let spi = Spi(state.next_spi);
        state.allocated_spis.push((spi, protocol));
        tracing::debug!("allocated SPI {} for {:?}", spi, protocol);
        Ok(spi)
    }

    fn alloc_cpi(&self) -> Result<Cpi, IkeError> {
        let mut state = self.state.lock().unwrap();
        state.next_cpi += 1;
        let cpi = Cpi(state.next_cpi);
        state.allocated_cpis.push(cpi);
        Ok(cpi)
    }

    fn release_spi(&self, spi: Spi, protocol: ProtocolId) {
        let mut state = self.state.lock().unwrap();
        state
            .allocated_spis
            .retain(|(s, p)| !(*s == spi && *p == protocol));
        tracing::debug!("released SPI {} for {:?}", spi, protocol);
    }

    fn release_cpi(&self, cpi: Cpi) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.allocated_cpis.iter().position(|c| *c == cpi) {
            state.allocated_cpis.remove(pos);
        }
    }

    fn add_sa(&self, entry: SaEntry) -> Result<(), IkeError> {
        if self.fail_sa_install.load(Ordering::SeqCst) {
            return Err(IkeError::Kernel("SA install rejected".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        tracing::debug!(
            "installing {} SA with SPI {} ({:?})",
            if entry.inbound { "inbound" } else { "outbound" },
            entry.spi,
            entry.mode
        );
        state
            .sad
            .insert((entry.spi.0, entry.protocol.to_u8()), entry);
        Ok(())
    }

    fn del_sa(&self, spi: Spi, protocol: ProtocolId) {
        let mut state = self.state.lock().unwrap();
        state.sad.remove(&(spi.0, protocol.to_u8()));
    }

    fn add_policy(&self, entry: PolicyEntry) -> Result<(), IkeError> {
        if self.fail_policy_install.load(Ordering::SeqCst) {
            return Err(IkeError::Kernel("policy install rejected".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.spd.push(entry);
        Ok(())
    }

    fn alloc_reqid(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_reqid += 1;
        let reqid = state.next_reqid;
        state.reqids.insert(reqid, 1);
        reqid
    }

    fn ref_reqid(&self, reqid: u32) -> Result<(), IkeError> {
        let mut state = self.state.lock().unwrap();
        *state.reqids.entry(reqid).or_insert(0) += 1;
        Ok(())
    }

    fn release_reqid(&self, reqid: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.reqids.get_mut(&reqid) {
            *count -= 1;
            if *count == 0 {
                state.reqids.remove(&reqid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_allocation_and_release() {
        let kernel = SimKernel::with_spi_base(0x1000);
        let spi = kernel.alloc_spi(ProtocolId::Esp).unwrap();
        assert_eq!(spi.0, 0x1001);
        assert_eq!(kernel.allocated_spis(), 1);
        kernel.release_spi(spi, ProtocolId::Esp);
        assert_eq!(kernel.allocated_spis(), 0);
    }

    #[test]
    fn test_reqid_refcounting() {
        let kernel = SimKernel::new();
        let reqid = kernel.alloc_reqid();
        kernel.ref_reqid(reqid).unwrap();
        assert_eq!(kernel.reqid_refs(reqid), 2);
        kernel.release_reqid(reqid);
        kernel.release_reqid(reqid);
        assert_eq!(kernel.reqid_refs(reqid), 0);
    }

    #[test]
    fn test_static_reqid_can_be_referenced() {
        let kernel = SimKernel::new();
        kernel.ref_reqid(7).unwrap();
        assert_eq!(kernel.reqid_refs(7), 1);
    }

    #[test]
    fn test_failure_injection() {
        let kernel = SimKernel::new();
        kernel.fail_sa_installs(true);
        let entry = SaEntry {
            spi: Spi(1),
            protocol: ProtocolId::Esp,
            src: "10.0.0.1:500".parse().unwrap(),
            dst: "10.0.0.2:500".parse().unwrap(),
            inbound: true,
            mode: IpsecMode::Tunnel,
            encr_key: SharedSecret(vec![0; 20]),
            integ_key: SharedSecret(vec![]),
            ipcomp: IpcompTransform::None,
            cpi: None,
            reqid: 1,
            encap: false,
            tfcv3: true,
            if_id: 0,
            label: None,
        };
        assert!(kernel.add_sa(entry.clone()).is_err());
        kernel.fail_sa_installs(false);
        assert!(kernel.add_sa(entry).is_ok());
        assert_eq!(kernel.sad_len(), 1);
    }
}
