use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IkeSettings;
use crate::network::ike::bus::{Alert, Bus, NarrowHook};
use crate::network::ike::child_cfg::ChildCfg;
use crate::network::ike::child_sa::{child_sa_equals, ChildSa, ChildSaState, ChildSeed};
use crate::network::ike::ike_sa::{ChildlessPolicy, IkeCondition, IkeExtension, IkeSa, IkeSaState};
use crate::network::ike::kernel::{KernelFeatures, KernelInterface};
use crate::network::ike::keymat::{ChildKeymat, KeyExchange};
use crate::network::ike::payload::{
    DeletePayload, KePayload, Message, NoncePayload, Payload, SaPayload, TsPayload,
};
use crate::network::ike::proposal::{Proposal, SelectionFlags};
use crate::network::ike::scheduler::{Job, Scheduler};
use crate::network::ike::ts::{self, SecLabel, SecLabelMode, TrafficSelector};
use crate::network::ike::{
    Cpi, ExchangeType, IpcompTransform, IpsecMode, KeMethod, LinkToken, Nonce, NotifyType,
    ProtocolId, Spi, TaskStatus, TransformType, MAX_KEY_EXCHANGES,
};

/// Collaborators a CHILD_SA task needs, injected at construction.
#[derive(Clone)]
pub struct TaskContext {
    pub keymat: Arc<dyn ChildKeymat>,
    pub kernel: Arc<dyn KernelInterface>,
    pub scheduler: Arc<dyn Scheduler>,
    pub bus: Arc<Bus>,
    pub settings: Arc<IkeSettings>,
}

/// The task's current sub-protocol; replaces the build/process pair at
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Initial four-phase negotiation.
    Create,
    /// IKE_FOLLOWUP_KE rounds for additional key exchanges.
    MultiKe,
    /// Tearing down a half-allocated SA after a failure or abort.
    Delete,
}

/// One slot of the key exchange schedule.
#[derive(Debug, Clone, Copy, Default)]
struct KeSlot {
    ttype: Option<TransformType>,
    method: KeMethod,
    done: bool,
}

/// The CHILD_SA creation task: negotiates a proposal, performs one or more
/// key exchanges, narrows traffic selectors and installs the SA pair.
pub struct ChildCreate {
    context: TaskContext,
    initiator: bool,
    phase: Phase,
    /// CHILD payloads go out with the first IKE_AUTH round only.
    auth_built: bool,
    auth_processed: bool,

    config: Option<Arc<ChildCfg>>,
    my_nonce: Option<Nonce>,
    other_nonce: Option<Nonce>,
    proposals: Option<Vec<Proposal>>,
    proposal: Option<Proposal>,
    tsi: Option<Vec<TrafficSelector>>,
    tsr: Option<Vec<TrafficSelector>>,
    labels_i: Vec<SecLabel>,
    labels_r: Vec<SecLabel>,
    packet_tsi: Option<TrafficSelector>,
    packet_tsr: Option<TrafficSelector>,

    key_exchanges: [KeSlot; MAX_KEY_EXCHANGES],
    ke_index: usize,
    ke_method: KeMethod,
    ke: Option<Box<dyn KeyExchange>>,
    kes: Vec<Box<dyn KeyExchange>>,
    ke_failed: bool,
    link: Option<LinkToken>,

    mode: IpsecMode,
    tfcv3: bool,
    ipcomp: IpcompTransform,
    ipcomp_received: IpcompTransform,
    proto: ProtocolId,
    my_spi: Option<Spi>,
    other_spi: Option<Spi>,
    my_cpi: Option<Cpi>,
    other_cpi: Option<Cpi>,

    child: ChildSeed,
    child_sa: Option<ChildSa>,
    established: bool,
    rekey: bool,
    retry: bool,
    aborted: bool,
    features: KernelFeatures,
}

impl ChildCreate {
    /// Create a task. With a config the task initiates; without, it responds.
    pub fn new(
        context: TaskContext,
        config: Option<Arc<ChildCfg>>,
        rekey: bool,
        packet_tsi: Option<TrafficSelector>,
        packet_tsr: Option<TrafficSelector>,
    ) -> Self {
        let initiator = config.is_some();
        let features = context.kernel.features();
        ChildCreate {
            context,
            initiator,
            phase: Phase::Create,
            auth_built: false,
            auth_processed: false,
            config,
            my_nonce: None,
            other_nonce: None,
            proposals: None,
            proposal: None,
            tsi: None,
            tsr: None,
            labels_i: Vec::new(),
            labels_r: Vec::new(),
            packet_tsi,
            packet_tsr,
            key_exchanges: [KeSlot::default(); MAX_KEY_EXCHANGES],
            ke_index: 0,
            ke_method: KeMethod::None,
            ke: None,
            kes: Vec::new(),
            ke_failed: false,
            link: None,
            mode: IpsecMode::Tunnel,
            tfcv3: true,
            ipcomp: IpcompTransform::None,
            ipcomp_received: IpcompTransform::None,
            proto: ProtocolId::Esp,
            my_spi: None,
            other_spi: None,
            my_cpi: None,
            other_cpi: None,
            child: ChildSeed::default(),
            child_sa: None,
            established: false,
            rekey,
            retry: false,
            aborted: false,
            features,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn established(&self) -> bool {
        self.established
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn child(&self) -> Option<&ChildSa> {
        self.child_sa.as_ref()
    }

    pub fn other_spi(&self) -> Option<Spi> {
        self.other_spi
    }

    pub fn set_config(&mut self, config: Arc<ChildCfg>) {
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&Arc<ChildCfg>> {
        if self.initiator {
            self.config.as_ref()
        } else {
            None
        }
    }

    /// Reuse a reqid, taking a kernel reference on it. A previously held
    /// reqid is released.
    pub fn use_reqid(&mut self, reqid: u32) {
        if reqid == 0 || self.context.kernel.ref_reqid(reqid).is_ok() {
            let existing = std::mem::replace(&mut self.child.reqid, reqid);
            if existing != 0 {
                self.context.kernel.release_reqid(existing);
            }
        }
    }

    pub fn use_marks(&mut self, mark_in: u32, mark_out: u32) {
        self.child.mark_in = mark_in;
        self.child.mark_out = mark_out;
    }

    pub fn use_if_ids(&mut self, if_id_in: u32, if_id_out: u32) {
        self.child.if_id_in = if_id_in;
        self.child.if_id_out = if_id_out;
    }

    pub fn use_label(&mut self, label: Option<SecLabel>) {
        self.child.label = label;
    }

    pub fn use_ke_method(&mut self, ke_method: KeMethod) {
        self.ke_method = ke_method;
    }

    /// The lower of the two nonces, used to resolve rekey collisions.
    pub fn lower_nonce(&self) -> Option<&Nonce> {
        match (&self.my_nonce, &self.other_nonce) {
            (Some(mine), Some(other)) => {
                let len = mine.len().min(other.len());
                if mine.as_bytes()[..len] < other.as_bytes()[..len] {
                    Some(mine)
                } else {
                    Some(other)
                }
            }
            (Some(mine), None) => Some(mine),
            (None, other) => other.as_ref(),
        }
    }

    /// Request the task to stop; the next process step emits a DELETE for
    /// any SPI we allocated.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Entry point for the build half-step.
    pub fn build(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        match (self.initiator, self.phase) {
            (true, Phase::Create) => self.build_i(ike_sa, message),
            (true, Phase::MultiKe) => self.build_i_multi_ke(message),
            (true, Phase::Delete) => self.build_i_delete(message),
            (false, Phase::Create) => self.build_r(ike_sa, message),
            (false, Phase::MultiKe) => self.build_r_multi_ke(ike_sa, message),
            (false, Phase::Delete) => TaskStatus::Success,
        }
    }

    /// Entry point for the process half-step.
    pub fn process(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        match (self.initiator, self.phase) {
            (true, Phase::Create) => self.process_i(ike_sa, message),
            (true, Phase::MultiKe) => self.process_i_multi_ke(ike_sa, message),
            (true, Phase::Delete) => TaskStatus::NeedMore,
            (false, Phase::Create) => self.process_r(ike_sa, message),
            (false, Phase::MultiKe) => self.process_r_multi_ke(message),
            (false, Phase::Delete) => TaskStatus::NeedMore,
        }
    }

    /// Reassign the task for a fresh attempt, keeping only what a retry
    /// needs: the KE method, and the retry/rekey flags.
    pub fn migrate(&mut self) {
        self.my_nonce = None;
        self.other_nonce = None;
        self.link = None;
        self.tsi = None;
        self.tsr = None;
        self.labels_i.clear();
        self.labels_r.clear();
        self.child_sa = None;
        self.proposal = None;
        self.proposals = None;
        self.ke = None;
        self.ke_failed = false;
        self.clear_key_exchanges();
        if !self.rekey && !self.retry {
            self.ke_method = KeMethod::None;
        }
        self.mode = IpsecMode::Tunnel;
        self.ipcomp = IpcompTransform::None;
        self.ipcomp_received = IpcompTransform::None;
        self.my_spi = None;
        self.other_spi = None;
        self.my_cpi = None;
        self.other_cpi = None;
        self.established = false;
        self.auth_built = false;
        self.auth_processed = false;
        self.phase = Phase::Create;
    }

    // --- nonce and SPI handling -------------------------------------------

    fn generate_nonce(&mut self) -> bool {
        match self.context.keymat.create_nonce() {
            Ok(nonce) => {
                self.my_nonce = Some(nonce);
                true
            }
            Err(e) => {
                tracing::warn!("nonce generation failed: {}", e);
                false
            }
        }
    }

    fn allocate_spi(&mut self) -> bool {
        self.proto = if self.initiator {
            self.proposals
                .as_ref()
                .and_then(|p| p.first())
                .map(|p| p.protocol)
                .unwrap_or(ProtocolId::Esp)
        } else {
            self.proposal
                .as_ref()
                .map(|p| p.protocol)
                .unwrap_or(ProtocolId::Esp)
        };
        let Some(child_sa) = self.child_sa.as_mut() else {
            return false;
        };
        match child_sa.alloc_spi(self.proto) {
            Ok(spi) => {
                self.my_spi = Some(spi);
                true
            }
            Err(e) => {
                tracing::warn!("unable to allocate SPI from kernel: {}", e);
                false
            }
        }
    }

    /// Stamp our SPI on all proposals and promote the selected KE method.
    /// Proposals lacking the method move to the back; fails if none has it.
    fn update_and_check_proposals(&mut self) -> bool {
        let Some(proposals) = self.proposals.as_mut() else {
            return false;
        };
        let spi = self.my_spi.map(|s| s.0).unwrap_or(0);
        for proposal in proposals.iter_mut() {
            proposal.set_spi(spi);
        }
        if self.ke_method == KeMethod::None {
            return true;
        }
        let mut with_method = Vec::new();
        let mut without = Vec::new();
        for mut proposal in proposals.drain(..) {
            if proposal.promote_transform(TransformType::KeyExchangeMethod, self.ke_method.to_u16())
            {
                with_method.push(proposal);
            } else {
                without.push(proposal);
            }
        }
        let found = !with_method.is_empty();
        with_method.extend(without);
        *proposals = with_method;
        found
    }

    // --- key exchange schedule --------------------------------------------

    /// Fill the key exchange schedule from the selected proposal: the
    /// KE_METHOD transform first, additional exchanges after it.
    fn determine_key_exchanges(&mut self) {
        let Some(proposal) = self.proposal.as_ref() else {
            return;
        };
        let Some((alg, _)) = proposal.get_algorithm(TransformType::KeyExchangeMethod) else {
            return;
        };
        self.key_exchanges[0] = KeSlot {
            ttype: Some(TransformType::KeyExchangeMethod),
            method: KeMethod::from_u16(alg),
            done: false,
        };
        let mut slot = 1;
        for ttype in TransformType::additional_key_exchanges() {
            if let Some((alg, _)) = proposal.get_algorithm(ttype) {
                self.key_exchanges[slot] = KeSlot {
                    ttype: Some(ttype),
                    method: KeMethod::from_u16(alg),
                    done: false,
                };
                slot += 1;
            }
        }
    }

    fn additional_key_exchange_required(&self) -> bool {
        self.key_exchanges[self.ke_index..]
            .iter()
            .any(|slot| slot.ttype.is_some() && !slot.done)
    }

    fn clear_key_exchanges(&mut self) {
        self.key_exchanges = [KeSlot::default(); MAX_KEY_EXCHANGES];
        self.ke_index = 0;
        self.kes.clear();
    }

    /// Record the completed exchange; true once no further exchange remains.
    fn key_exchange_done(&mut self) -> bool {
        let Some(ke) = self.ke.take() else {
            return true;
        };
        self.key_exchanges[self.ke_index].done = true;
        self.ke_index += 1;
        let additional = self.additional_key_exchange_required();
        self.kes.push(ke);
        !additional
    }

    fn process_ke_payload(&mut self, payload: &KePayload) {
        let expected = self.key_exchanges[self.ke_index].method;
        let received = payload.method;

        // the proposal is selected after processing the KE payload, so this
        // only triggers for additional key exchanges
        if expected != KeMethod::None && expected != received {
            tracing::warn!(
                "key exchange method in received payload {} doesn't match negotiated {}",
                received,
                expected
            );
            self.ke_failed = true;
            return;
        }

        self.ke_method = received;

        if !self.initiator {
            self.ke = match self.context.keymat.create_ke(received) {
                Ok(ke) => Some(ke),
                Err(_) => {
                    tracing::warn!("key exchange method {} not supported", received);
                    None
                }
            };
        } else if let Some(ke) = &self.ke {
            if ke.method() != received {
                tracing::warn!(
                    "key exchange method {} in received payload doesn't match {}",
                    received,
                    ke.method()
                );
                self.ke_failed = true;
            }
        }

        if let Some(ke) = self.ke.as_mut() {
            if !self.ke_failed && ke.set_public_key(&payload.data).is_err() {
                tracing::warn!("applying key exchange public key failed");
                self.ke_failed = true;
            }
        }
    }

    /// Verify the received KE method against the selected proposal. Returns
    /// the preferred method if the peer should retry with another one.
    fn check_ke_method(&mut self) -> (bool, Option<u16>) {
        let Some(proposal) = self.proposal.as_ref() else {
            return (false, None);
        };
        if !proposal.has_transform(TransformType::KeyExchangeMethod, self.ke_method.to_u16()) {
            if let Some((alg, _)) = proposal.get_algorithm(TransformType::KeyExchangeMethod) {
                return (false, Some(alg));
            }
            // the selected proposal does not use a key exchange method;
            // drop the payload and any error recorded while parsing it
            tracing::debug!("ignoring KE payload, agreed on a proposal without key exchange");
            self.ke = None;
            self.ke_method = KeMethod::None;
            self.ke_failed = false;
        }
        (true, None)
    }

    fn check_ke_method_r(&mut self, message: &mut Message) -> bool {
        let (ok, requested) = self.check_ke_method();
        if !ok {
            if let Some(alg) = requested {
                tracing::info!(
                    "key exchange method {} unacceptable, requesting {}",
                    self.ke_method,
                    KeMethod::from_u16(alg)
                );
                message.add_notify(
                    false,
                    NotifyType::InvalidKePayload,
                    alg.to_be_bytes().to_vec(),
                );
            }
            return false;
        }
        if self.ke_method != KeMethod::None && self.ke.is_none() {
            message.add_notify(true, NotifyType::NoProposalChosen, vec![]);
            return false;
        }
        true
    }

    // --- payload processing -----------------------------------------------

    fn handle_notify(&mut self, ike_sa: &IkeSa, notify_type: NotifyType, data: &[u8]) {
        match notify_type {
            NotifyType::UseTransportMode => {
                self.mode = IpsecMode::Transport;
            }
            NotifyType::UseBeetMode => {
                if ike_sa.supports_extension(IkeExtension::PrivateExtensions) {
                    self.mode = IpsecMode::Beet;
                } else {
                    tracing::info!(
                        "received a private BEET mode notify from an unknown implementation, skipped"
                    );
                }
            }
            NotifyType::IpcompSupported => {
                if data.len() < 3 {
                    return;
                }
                let cpi = Cpi(u16::from_be_bytes([data[0], data[1]]));
                match IpcompTransform::from_u8(data[2]) {
                    IpcompTransform::Deflate => {
                        self.other_cpi = Some(cpi);
                        self.ipcomp_received = IpcompTransform::Deflate;
                    }
                    other => {
                        tracing::info!(
                            "received IPCOMP_SUPPORTED notify with unsupported transform {:?}",
                            other
                        );
                    }
                }
            }
            NotifyType::EspTfcPaddingNotSupported => {
                tracing::info!("peer does not support ESPv3 TFC padding");
                self.tfcv3 = false;
            }
            _ => {}
        }
    }

    fn process_payloads(&mut self, ike_sa: &IkeSa, message: &Message) {
        // modes other than tunnel arrive as notifies
        self.mode = IpsecMode::Tunnel;

        for payload in &message.payloads {
            match payload {
                Payload::Sa(sa) => {
                    self.proposals = Some(sa.proposals.clone());
                }
                Payload::Ke(ke) => {
                    self.process_ke_payload(ke);
                }
                Payload::Ts(ts) if ts.initiator => {
                    self.tsi = Some(ts.selectors.clone());
                    self.labels_i = ts.labels.clone();
                }
                Payload::Ts(ts) => {
                    self.tsr = Some(ts.selectors.clone());
                    self.labels_r = ts.labels.clone();
                }
                Payload::Notify(notify) => {
                    self.handle_notify(ike_sa, notify.notify_type, &notify.data);
                }
                _ => {}
            }
        }
    }

    fn process_link(&mut self, message: &Message) {
        match message.get_notify(NotifyType::AdditionalKeyExchange) {
            Some(notify) => {
                if self.initiator {
                    self.link = Some(LinkToken(notify.data.clone()));
                } else if !self
                    .link
                    .as_ref()
                    .map(|link| link.ct_eq(&notify.data))
                    .unwrap_or(false)
                {
                    tracing::warn!("data in ADDITIONAL_KEY_EXCHANGE notify doesn't match");
                    self.link = None;
                }
            }
            None => {
                self.link = None;
            }
        }
    }

    fn process_payloads_multi_ke(&mut self, message: &Message) {
        match message.ke() {
            Some(ke) => {
                let ke = ke.clone();
                self.process_ke_payload(&ke);
            }
            None => {
                tracing::warn!("KE payload missing in message");
                self.ke_failed = true;
            }
        }
        self.process_link(message);
    }

    // --- payload building -------------------------------------------------

    fn add_ke_payload(&self, message: &mut Message) -> bool {
        let ke = match (&self.ke, self.kes.last()) {
            (Some(ke), _) => ke,
            (None, Some(ke)) => ke,
            (None, None) => return true,
        };
        message.add_payload(Payload::Ke(KePayload {
            method: ke.method(),
            data: ke.public_key().to_vec(),
        }));
        true
    }

    fn build_payloads_multi_ke(&self, message: &mut Message) -> bool {
        if !self.add_ke_payload(message) {
            return false;
        }
        if let Some(link) = &self.link {
            message.add_notify(
                false,
                NotifyType::AdditionalKeyExchange,
                link.as_bytes().to_vec(),
            );
        }
        true
    }

    fn build_payloads(&mut self, message: &mut Message) -> bool {
        if message.exchange_type == ExchangeType::IkeFollowupKe {
            return self.build_payloads_multi_ke(message);
        }

        let proposals = if self.initiator {
            self.proposals.clone().unwrap_or_default()
        } else {
            self.proposal.clone().into_iter().collect()
        };
        message.add_payload(Payload::Sa(SaPayload { proposals }));

        // IKE_AUTH piggybacks on the IKE_SA_INIT nonces
        if message.exchange_type == ExchangeType::CreateChildSa {
            if let Some(nonce) = &self.my_nonce {
                message.add_payload(Payload::Nonce(NoncePayload {
                    nonce: nonce.clone(),
                }));
            }
        }

        if let Some(link) = &self.link {
            message.add_notify(
                false,
                NotifyType::AdditionalKeyExchange,
                link.as_bytes().to_vec(),
            );
        }

        if !self.add_ke_payload(message) {
            return false;
        }

        let labels: Vec<SecLabel> = self.child.label.clone().into_iter().collect();
        message.add_payload(Payload::Ts(TsPayload {
            initiator: true,
            selectors: self.tsi.clone().unwrap_or_default(),
            labels: labels.clone(),
        }));
        message.add_payload(Payload::Ts(TsPayload {
            initiator: false,
            selectors: self.tsr.clone().unwrap_or_default(),
            labels,
        }));

        match self.mode {
            IpsecMode::Transport => {
                message.add_notify(false, NotifyType::UseTransportMode, vec![]);
            }
            IpsecMode::Beet => {
                message.add_notify(false, NotifyType::UseBeetMode, vec![]);
            }
            IpsecMode::Tunnel => {}
        }

        if !self.features.esp_v3_tfc {
            message.add_notify(false, NotifyType::EspTfcPaddingNotSupported, vec![]);
        }
        true
    }

    /// Allocate a CPI and emit an IPCOMP_SUPPORTED notify for the transform.
    fn add_ipcomp_notify(&mut self, message: &mut Message, transform: IpcompTransform) {
        let Some(child_sa) = self.child_sa.as_mut() else {
            return;
        };
        match child_sa.alloc_cpi() {
            Ok(cpi) => {
                self.my_cpi = Some(cpi);
                self.ipcomp = transform;
                let mut data = cpi.0.to_be_bytes().to_vec();
                data.push(transform.to_u8());
                message.add_notify(false, NotifyType::IpcompSupported, data);
            }
            Err(_) => {
                tracing::info!("unable to allocate a CPI from kernel, IPComp disabled");
            }
        }
    }

    // --- proposal and config selection ------------------------------------

    fn selection_flags(&self, ike_sa: &IkeSa, no_ke: bool) -> SelectionFlags {
        SelectionFlags {
            skip_ke: no_ke,
            skip_private: !ike_sa.supports_extension(IkeExtension::PrivateExtensions)
                && !self.context.settings.accept_private_algs,
            prefer_supplied: !self.context.settings.prefer_configured_proposals,
        }
    }

    fn select_proposal(&mut self, ike_sa: &IkeSa, no_ke: bool) -> bool {
        let Some(proposals) = self.proposals.as_ref() else {
            tracing::info!("SA payload missing in message");
            return false;
        };
        let Some(config) = self.config.as_ref() else {
            return false;
        };
        let flags = self.selection_flags(ike_sa, no_ke);
        match config.select_proposal(proposals, flags) {
            Some(proposal) => {
                self.proposal = Some(proposal);
                true
            }
            None => {
                tracing::info!("no acceptable proposal found");
                self.context.bus.alert(Alert::ProposalMismatchChild);
                false
            }
        }
    }

    /// Select a matching CHILD config as responder, trying NAT-substituted
    /// transport selectors first and falling back to the originals.
    fn select_child_cfg(&self, ike_sa: &IkeSa) -> Option<Arc<ChildCfg>> {
        let (tsi, tsr) = match (&self.tsi, &self.tsr) {
            (Some(tsi), Some(tsr)) => (tsi, tsr),
            _ => return None,
        };
        let nat_tsr = self.ts_if_nat_transport(ike_sa, true, tsr);
        let nat_tsi = self.ts_if_nat_transport(ike_sa, false, tsi);
        let hosts_local = ike_sa.dynamic_hosts(true);
        let hosts_remote = ike_sa.dynamic_hosts(false);

        let matches = |cfg: &Arc<ChildCfg>, tsr: &[TrafficSelector], tsi: &[TrafficSelector]| {
            !cfg.get_traffic_selectors(true, Some(tsr), &hosts_local)
                .is_empty()
                && !cfg
                    .get_traffic_selectors(false, Some(tsi), &hosts_remote)
                    .is_empty()
                && cfg.select_label(&self.labels_i).is_ok()
                && cfg.select_label(&self.labels_r).is_ok()
        };

        if nat_tsi.is_some() || nat_tsr.is_some() {
            let sub_tsr = nat_tsr.as_deref().unwrap_or(tsr);
            let sub_tsi = nat_tsi.as_deref().unwrap_or(tsi);
            if let Some(cfg) = ike_sa
                .child_cfgs
                .iter()
                .find(|cfg| matches(cfg, sub_tsr, sub_tsi))
            {
                if cfg.mode == IpsecMode::Transport {
                    return Some(cfg.clone());
                }
                // matched via substituted selectors but not transport mode
            }
        }
        ike_sa
            .child_cfgs
            .iter()
            .find(|cfg| matches(cfg, tsr, tsi))
            .cloned()
    }

    fn ts_if_nat_transport(
        &self,
        ike_sa: &IkeSa,
        local: bool,
        list: &[TrafficSelector],
    ) -> Option<Vec<TrafficSelector>> {
        if self.mode != IpsecMode::Transport {
            return None;
        }
        let condition = if local {
            IkeCondition::NatHere
        } else {
            IkeCondition::NatThere
        };
        if !ike_sa.has_condition(condition) {
            return None;
        }
        let endpoint = if local {
            ike_sa.my_host().ip()
        } else {
            ike_sa.other_host().ip()
        };
        let substituted = ts::transport_nat_ts(list, endpoint);
        if substituted.is_empty() {
            None
        } else {
            Some(substituted)
        }
    }

    // --- traffic selector narrowing ---------------------------------------

    fn narrow_ts(
        &self,
        ike_sa: &IkeSa,
        local: bool,
        supplied: &[TrafficSelector],
    ) -> Vec<TrafficSelector> {
        let Some(config) = self.config.as_ref() else {
            return Vec::new();
        };
        let hosts: Vec<IpAddr> = ike_sa.dynamic_hosts(local);
        match self.ts_if_nat_transport(ike_sa, local, supplied) {
            Some(nat) => config.get_traffic_selectors(local, Some(&nat), &hosts),
            None => config.get_traffic_selectors(local, Some(supplied), &hosts),
        }
    }

    fn check_mode(&self, initiator_host: IpAddr, responder_host: IpAddr) -> bool {
        let Some(config) = self.config.as_ref() else {
            return false;
        };
        let tsi = self.tsi.as_deref().unwrap_or_default();
        let tsr = self.tsr.as_deref().unwrap_or_default();
        match self.mode {
            IpsecMode::Transport => {
                if !config.proxy_mode
                    && (!ts::ts_list_is_host(tsi, Some(initiator_host))
                        || !ts::ts_list_is_host(tsr, Some(responder_host)))
                {
                    tracing::info!("not using transport mode, not host-to-host");
                    return false;
                }
                config.mode == IpsecMode::Transport
            }
            IpsecMode::Beet => {
                if !ts::ts_list_is_host(tsi, None) || !ts::ts_list_is_host(tsr, None) {
                    tracing::info!("not using BEET mode, not host-to-host");
                    return false;
                }
                config.mode == IpsecMode::Beet
            }
            IpsecMode::Tunnel => true,
        }
    }

    /// Narrow the negotiated selectors and verify the mode:
    /// `Failed` on a mode mismatch, `NotFound` when the selectors are
    /// unacceptable.
    fn narrow_and_check_ts(&mut self, ike_sa: &IkeSa, ike_auth: bool) -> TaskStatus {
        let me = ike_sa.my_host().ip();
        let other = ike_sa.other_host().ip();
        let tsi = self.tsi.clone().unwrap_or_default();
        let tsr = self.tsr.clone().unwrap_or_default();

        let (mut my_ts, mut other_ts) = if self.initiator {
            (
                self.narrow_ts(ike_sa, true, &tsi),
                self.narrow_ts(ike_sa, false, &tsr),
            )
        } else {
            (
                self.narrow_ts(ike_sa, true, &tsr),
                self.narrow_ts(ike_sa, false, &tsi),
            )
        };

        if let Some(child_sa) = self.child_sa.as_ref() {
            let hook = if self.initiator {
                if ike_auth {
                    NarrowHook::InitiatorPostNoAuth
                } else {
                    NarrowHook::InitiatorPostAuth
                }
            } else {
                NarrowHook::Responder
            };
            self.context
                .bus
                .narrow(child_sa, hook, &mut my_ts, &mut other_ts);
        }

        if my_ts.is_empty() || other_ts.is_empty() {
            self.context.bus.alert(Alert::TsMismatch);
            tracing::info!("no acceptable traffic selectors found");
            return TaskStatus::NotFound;
        }

        if self.initiator {
            self.tsi = Some(my_ts);
            self.tsr = Some(other_ts);
            if !self.check_mode(me, other) {
                tracing::info!("mode requested by responder is unacceptable");
                return TaskStatus::Failed;
            }
        } else {
            self.tsr = Some(my_ts);
            self.tsi = Some(other_ts);
            if !self.check_mode(other, me) {
                self.mode = IpsecMode::Tunnel;
            }
        }
        TaskStatus::Success
    }

    // --- security labels ---------------------------------------------------

    fn generic_label_only(&self) -> bool {
        self.config
            .as_ref()
            .map(|cfg| {
                cfg.label.is_some()
                    && self.child.label.is_none()
                    && cfg.label_mode == SecLabelMode::Selinux
            })
            .unwrap_or(false)
    }

    /// Verify the peer's labels: both sides must carry the same one, and it
    /// must match a label selected earlier (e.g. on rekey).
    fn select_label(&mut self) -> bool {
        let Some(config) = self.config.as_ref() else {
            return false;
        };
        let (Ok(li), Ok(lr)) = (
            config.select_label(&self.labels_i),
            config.select_label(&self.labels_r),
        ) else {
            return false;
        };
        if let Some(li) = li {
            if Some(&li) != lr.as_ref() {
                tracing::info!("security labels in TSi and TSr don't match");
                return false;
            }
            match &self.child.label {
                None => self.child.label = Some(li),
                Some(label) if *label == li => {}
                Some(label) => {
                    tracing::info!(
                        "returned security label '{}' doesn't match proposed '{}'",
                        li,
                        label
                    );
                    return false;
                }
            }
        }
        if let Some(label) = &self.child.label {
            tracing::debug!("selected security label: {}", label);
        }
        true
    }

    // --- childless policy --------------------------------------------------

    /// Decide whether to defer CHILD creation until after IKE_AUTH.
    fn defer_child_sa(&self, ike_sa: &IkeSa) -> TaskStatus {
        if ike_sa.supports_extension(IkeExtension::Childless) {
            if ike_sa.childless == ChildlessPolicy::Prefer
                || ike_sa.childless == ChildlessPolicy::Force
                || self.generic_label_only()
            {
                return TaskStatus::NeedMore;
            }
        } else if ike_sa.childless == ChildlessPolicy::Force {
            tracing::info!("peer does not support childless IKE_SA initiation");
            return TaskStatus::DestroyMe;
        }
        TaskStatus::NotSupported
    }

    /// Responder-side childless handling for IKE_AUTH.
    fn handle_childless(&self, ike_sa: &IkeSa) -> TaskStatus {
        if self.proposals.is_none() && self.tsi.is_none() && self.tsr.is_none() {
            // looks like a childless IKE_SA, check if we allow it
            if ike_sa.childless == ChildlessPolicy::Never {
                tracing::info!("peer tried to initiate a childless IKE_SA");
                return TaskStatus::InvalidState;
            }
            return TaskStatus::Success;
        }
        if ike_sa.childless == ChildlessPolicy::Force {
            tracing::info!("peer did not initiate a childless IKE_SA");
            return TaskStatus::InvalidState;
        }
        TaskStatus::NotSupported
    }

    // --- duplicate suppression ---------------------------------------------

    fn check_for_duplicate(&self, ike_sa: &IkeSa) -> bool {
        let Some(child_sa) = self.child_sa.as_ref() else {
            return false;
        };
        let found = ike_sa.child_sas().iter().find(|existing| {
            existing.state() == ChildSaState::Installed && child_sa_equals(existing, child_sa)
        });
        if let Some(found) = found {
            tracing::info!(
                "not establishing CHILD_SA {}{{{}}} due to existing duplicate {{{}}} with SPIs {}_i {}_o",
                child_sa.name(),
                child_sa.unique_id(),
                found.unique_id(),
                found.spi(true).unwrap_or(Spi(0)),
                found.spi(false).unwrap_or(Spi(0)),
            );
            return true;
        }
        false
    }

    fn check_for_generic_label(&self) -> bool {
        if self.generic_label_only() {
            if let (Some(child_sa), Some(config)) = (&self.child_sa, &self.config) {
                if let Some(label) = &config.label {
                    tracing::info!(
                        "not establishing CHILD_SA {}{{{}}} with generic label '{}'",
                        child_sa.name(),
                        child_sa.unique_id(),
                        label
                    );
                }
            }
            return true;
        }
        false
    }

    // --- installation -------------------------------------------------------

    fn schedule_inactivity_timeout(&self, child_sa: &ChildSa) {
        if let Some(timeout) = self.config.as_ref().and_then(|cfg| cfg.inactivity) {
            self.context.scheduler.schedule_job(
                Job::Inactivity {
                    child_id: child_sa.unique_id(),
                    timeout,
                    close_ike: self.context.settings.inactivity_close_ike,
                },
                timeout,
            );
        }
    }

    /// Derive keys and install both SA directions and the policies.
    /// `Failed` on SA install errors, `NotFound` on policy errors or an
    /// empty post-hook selector set.
    fn install_child_sa(&mut self, ike_sa: &mut IkeSa) -> TaskStatus {
        // nonces feed the PRF in initiator/responder order, independent of
        // our role in the task
        let my_nonce = self.my_nonce.clone().unwrap_or(Nonce(Vec::new()));
        let other_nonce = self.other_nonce.clone().unwrap_or(Nonce(Vec::new()));
        let (nonce_i, nonce_r) = if self.initiator {
            (&my_nonce, &other_nonce)
        } else {
            (&other_nonce, &my_nonce)
        };
        let tsi = self.tsi.clone().unwrap_or_default();
        let tsr = self.tsr.clone().unwrap_or_default();

        let Some(mut child_sa) = self.child_sa.take() else {
            return TaskStatus::Failed;
        };
        let Some(proposal) = self.proposal.clone() else {
            self.child_sa = Some(child_sa);
            return TaskStatus::Failed;
        };

        let (my_ts, other_ts) = if self.initiator {
            (tsi.clone(), tsr.clone())
        } else {
            // the post hook may shrink a copy, the response payloads keep
            // the already narrowed set
            let mut my_ts = tsr.clone();
            let mut other_ts = tsi.clone();
            self.context.bus.narrow(
                &child_sa,
                NarrowHook::ResponderPost,
                &mut my_ts,
                &mut other_ts,
            );
            if my_ts.is_empty() || other_ts.is_empty() {
                self.child_sa = Some(child_sa);
                return TaskStatus::NotFound;
            }
            (my_ts, other_ts)
        };

        if self.my_cpi.is_none() || self.other_cpi.is_none() || self.ipcomp == IpcompTransform::None
        {
            self.my_cpi = None;
            self.other_cpi = None;
            self.ipcomp = IpcompTransform::None;
        }

        child_sa.set_ipcomp(self.ipcomp);
        child_sa.set_mode(self.mode);
        child_sa.set_protocol(proposal.protocol);
        child_sa.set_state(ChildSaState::Installing);

        // addresses may have changed since the request went out
        child_sa.update(ike_sa.my_host(), ike_sa.other_host(), ike_sa.has_any_nat());
        child_sa.set_policies(my_ts, other_ts);

        let keys = match self.context.keymat.derive_child_keys(
            &proposal,
            &self.kes,
            nonce_i,
            nonce_r,
        ) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("deriving CHILD_SA keys failed: {}", e);
                self.child_sa = Some(child_sa);
                self.context.bus.alert(Alert::InstallChildSaFailed);
                return TaskStatus::Failed;
            }
        };

        let my_spi = self.my_spi.unwrap_or(Spi(0));
        let other_spi = self.other_spi.unwrap_or(Spi(0));
        let (inbound_encr, inbound_integ, outbound_encr, outbound_integ) = if self.initiator {
            (
                keys.encr_r.clone(),
                keys.integ_r.clone(),
                keys.encr_i.clone(),
                keys.integ_i.clone(),
            )
        } else {
            (
                keys.encr_i.clone(),
                keys.integ_i.clone(),
                keys.encr_r.clone(),
                keys.integ_r.clone(),
            )
        };

        let status_in = child_sa.install(
            inbound_encr,
            inbound_integ,
            my_spi,
            self.my_cpi,
            true,
            self.tfcv3,
        );
        let status_out = if status_in.is_err() {
            Ok(())
        } else if self.rekey {
            // the outbound SA is activated later by the rekey coordinator
            child_sa.register_outbound(
                outbound_encr,
                outbound_integ,
                other_spi,
                self.other_cpi,
                self.tfcv3,
            )
        } else {
            child_sa.install(
                outbound_encr,
                outbound_integ,
                other_spi,
                self.other_cpi,
                false,
                self.tfcv3,
            )
        };

        if status_in.is_err() || status_out.is_err() {
            tracing::warn!(
                "unable to install {}{}{}IPsec SA (SAD) in kernel",
                if status_in.is_err() { "inbound " } else { "" },
                if status_in.is_err() && status_out.is_err() {
                    "and "
                } else {
                    ""
                },
                if status_out.is_err() { "outbound " } else { "" },
            );
            self.child_sa = Some(child_sa);
            self.context.bus.alert(Alert::InstallChildSaFailed);
            return TaskStatus::Failed;
        }

        if child_sa.install_policies().is_err() {
            tracing::warn!("unable to install IPsec policies (SPD) in kernel");
            self.child_sa = Some(child_sa);
            self.context.bus.alert(Alert::InstallChildPolicyFailed);
            return TaskStatus::NotFound;
        }

        self.context
            .bus
            .child_derived_keys(&child_sa, self.initiator, &keys);
        self.context
            .bus
            .child_keys(&child_sa, self.initiator, nonce_i, nonce_r);
        drop(keys);

        tracing::info!(
            "CHILD_SA {}{{{}}} established with SPIs {}_i {}_o",
            child_sa.name(),
            child_sa.unique_id(),
            my_spi,
            other_spi
        );

        child_sa.set_state(ChildSaState::Installed);
        self.schedule_inactivity_timeout(&child_sa);
        ike_sa.add_child_sa(child_sa);
        self.established = true;
        TaskStatus::Success
    }

    // --- failure handling ---------------------------------------------------

    fn handle_child_sa_failure(&self, ike_sa: &IkeSa, message: &Message) {
        if self.aborted {
            return;
        }
        let is_first = message.exchange_type == ExchangeType::IkeAuth;
        if is_first && self.context.settings.close_ike_on_child_failure {
            // delay the delete so the IKE_AUTH response goes out first
            tracing::info!("closing IKE_SA due to CHILD_SA setup failure");
            self.context.scheduler.schedule_job(
                Job::DeleteIkeSa { ike_sa: ike_sa.id },
                Duration::from_millis(100),
            );
        } else {
            tracing::info!("failed to establish CHILD_SA, keeping IKE_SA");
            self.context
                .bus
                .alert(Alert::KeepOnChildSaFailure { first: is_first });
        }
    }

    fn schedule_delayed_retry(&self, ike_sa: &mut IkeSa) {
        let Some(config) = self.config.clone() else {
            return;
        };
        let jitter = self.context.settings.retry_jitter.max(1);
        let retry = self.context.settings.retry_interval - (rand::random::<u64>() % jitter);

        let mut task = ChildCreate::new(
            self.context.clone(),
            Some(config),
            false,
            self.packet_tsi.clone(),
            self.packet_tsr.clone(),
        );
        task.use_reqid(self.child.reqid);
        task.use_marks(self.child.mark_in, self.child.mark_out);
        task.use_if_ids(self.child.if_id_in, self.child.if_id_out);
        task.use_label(self.child.label.clone());

        tracing::info!("creating CHILD_SA failed, trying again in {} seconds", retry);
        ike_sa.queue_task_delayed(task, Duration::from_secs(retry));
    }

    fn raise_alerts(&self, notify_type: NotifyType) {
        if notify_type == NotifyType::NoProposalChosen {
            self.context.bus.alert(Alert::ProposalMismatchChild);
        }
    }

    /// Switch to the delete phase to free the peer's half-open SA.
    fn delete_failed_sa(&mut self) -> TaskStatus {
        if self.my_spi.is_some() {
            self.phase = Phase::Delete;
            // dropping the handle here releases the kernel SPI; the delete
            // message only informs the peer
            self.child_sa = None;
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }

    // --- key exchange completion --------------------------------------------

    fn key_exchange_done_and_install_r(
        &mut self,
        ike_sa: &mut IkeSa,
        message: &mut Message,
    ) -> bool {
        let all_done = if self.key_exchange_done() {
            self.link = None;
            true
        } else {
            if self.link.is_none() {
                self.link = Some(LinkToken::random());
            }
            false
        };

        if !self.build_payloads(message) {
            message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return true;
        }

        if all_done {
            match self.install_child_sa(ike_sa) {
                TaskStatus::Success => {}
                TaskStatus::NotFound => {
                    message.add_notify(true, NotifyType::TsUnacceptable, vec![]);
                    self.handle_child_sa_failure(ike_sa, message);
                    return true;
                }
                _ => {
                    message.add_notify(true, NotifyType::NoProposalChosen, vec![]);
                    self.handle_child_sa_failure(ike_sa, message);
                    return true;
                }
            }
            if !self.rekey {
                if let Some(child_sa) = ike_sa.child_sas().last() {
                    self.context.bus.child_updown(child_sa, true);
                }
            }
        }
        all_done
    }

    fn key_exchange_done_and_install_i(
        &mut self,
        ike_sa: &mut IkeSa,
        message: &Message,
    ) -> TaskStatus {
        if self.key_exchange_done() {
            if self.install_child_sa(ike_sa) == TaskStatus::Success {
                if !self.rekey {
                    if let Some(child_sa) = ike_sa.child_sas().last() {
                        self.context.bus.child_updown(child_sa, true);
                    }
                }
                return TaskStatus::Success;
            }
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }
        TaskStatus::NeedMore
    }

    // --- initiator ----------------------------------------------------------

    fn build_i(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        let mut no_ke = true;
        match message.exchange_type {
            ExchangeType::IkeSaInit => {
                // record the nonce the IKE_SA_INIT task put into the message
                return match message.nonce() {
                    Some(nonce) => {
                        self.my_nonce = Some(nonce.clone());
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if !self.generate_nonce() {
                    message.set_exchange_type(ExchangeType::Undefined);
                    return TaskStatus::Success;
                }
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                if self.auth_built {
                    return TaskStatus::NeedMore;
                }
                match self.defer_child_sa(ike_sa) {
                    TaskStatus::DestroyMe => {
                        // config mismatch
                        return TaskStatus::DestroyMe;
                    }
                    TaskStatus::NeedMore => {
                        // defer until the IKE_SA is established childless
                        self.my_nonce = None;
                        return TaskStatus::NeedMore;
                    }
                    _ => {}
                }
                // send only in the first request, not in subsequent rounds
                self.auth_built = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        let Some(config) = self.config.clone() else {
            return TaskStatus::Failed;
        };

        // propose a whole-family subnet when virtual IPs are in play
        let local_hosts: Vec<IpAddr> = if !self.rekey && !ike_sa.my_vips.is_empty() {
            ike_sa
                .my_vips
                .iter()
                .map(|vip| {
                    if vip.is_ipv6() {
                        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                    } else {
                        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
                    }
                })
                .collect()
        } else {
            ike_sa.dynamic_hosts(true)
        };
        let mut tsi = config.get_traffic_selectors(true, None, &local_hosts);
        let remote_hosts = ike_sa.dynamic_hosts(false);
        let mut tsr = config.get_traffic_selectors(false, None, &remote_hosts);

        if let Some(packet_tsi) = &self.packet_tsi {
            tsi.insert(0, packet_tsi.clone());
        }
        if let Some(packet_tsr) = &self.packet_tsr {
            tsr.insert(0, packet_tsr.clone());
        }
        self.tsi = Some(tsi);
        self.tsr = Some(tsr);

        if !self.generic_label_only() && self.child.label.is_none() {
            // in simple label mode propose the configured label, there are
            // no labels from acquires
            self.child.label = config.label.clone();
        }
        if let Some(label) = &self.child.label {
            tracing::debug!("proposing security label '{}'", label);
        }

        self.proposals = Some(config.get_proposals(no_ke));
        self.mode = config.mode;

        self.child.if_id_in_def = ike_sa.if_id(true);
        self.child.if_id_out_def = ike_sa.if_id(false);
        self.child.encap = ike_sa.has_any_nat();
        self.child_sa = Some(ChildSa::new(
            ike_sa.my_host(),
            ike_sa.other_host(),
            config.clone(),
            &self.child,
            self.context.kernel.clone(),
        ));

        // checked after creating the SA handle so observers see the attempt
        if !self.rekey
            && message.exchange_type == ExchangeType::CreateChildSa
            && (self.check_for_generic_label() || self.check_for_duplicate(ike_sa))
        {
            message.set_exchange_type(ExchangeType::Undefined);
            return TaskStatus::Success;
        }

        if let Some(child_sa) = self.child_sa.as_ref() {
            if self.child.reqid != 0 {
                tracing::info!(
                    "establishing CHILD_SA {}{{{}}} reqid {}",
                    child_sa.name(),
                    child_sa.unique_id(),
                    self.child.reqid
                );
            } else {
                tracing::info!(
                    "establishing CHILD_SA {}{{{}}}",
                    child_sa.name(),
                    child_sa.unique_id()
                );
            }
        }

        if !self.allocate_spi() {
            return TaskStatus::Failed;
        }

        if !no_ke && !self.retry && self.ke_method == KeMethod::None {
            // a rekeying or retried task may have the method pinned already
            self.ke_method = config.ke_method();
        }

        if !self.update_and_check_proposals() {
            tracing::warn!(
                "requested key exchange method {} not contained in any of our proposals",
                self.ke_method
            );
            return TaskStatus::Failed;
        }

        if self.ke_method != KeMethod::None {
            self.ke = match self.context.keymat.create_ke(self.ke_method) {
                Ok(ke) => Some(ke),
                Err(_) => {
                    tracing::warn!(
                        "selected key exchange method {} not supported",
                        self.ke_method
                    );
                    return TaskStatus::Failed;
                }
            };
        }

        if config.ipcomp {
            // DEFLATE is the only transform we support
            self.add_ipcomp_notify(message, IpcompTransform::Deflate);
        }

        if let Some(child_sa) = self.child_sa.as_ref() {
            let hook = if message.exchange_type == ExchangeType::IkeAuth {
                NarrowHook::InitiatorPreNoAuth
            } else {
                NarrowHook::InitiatorPreAuth
            };
            let mut tsi = self.tsi.clone().unwrap_or_default();
            let mut tsr = self.tsr.clone().unwrap_or_default();
            self.context.bus.narrow(child_sa, hook, &mut tsi, &mut tsr);
            self.tsi = Some(tsi);
            self.tsr = Some(tsr);
        }

        if !self.build_payloads(message) {
            return TaskStatus::Failed;
        }

        self.tsi = None;
        self.tsr = None;
        self.proposals = None;

        TaskStatus::NeedMore
    }

    fn build_i_multi_ke(&mut self, message: &mut Message) -> TaskStatus {
        message.set_exchange_type(ExchangeType::IkeFollowupKe);
        let method = self.key_exchanges[self.ke_index].method;
        self.ke = match self.context.keymat.create_ke(method) {
            Ok(ke) => Some(ke),
            Err(_) => {
                tracing::warn!("negotiated key exchange method {} not supported", method);
                return TaskStatus::Failed;
            }
        };
        if self.link.is_none() {
            tracing::warn!("ADDITIONAL_KEY_EXCHANGE notify missing");
            return TaskStatus::Failed;
        }
        if !self.build_payloads_multi_ke(message) {
            return TaskStatus::Failed;
        }
        TaskStatus::NeedMore
    }

    fn build_i_delete(&mut self, message: &mut Message) -> TaskStatus {
        message.set_exchange_type(ExchangeType::Informational);
        if let Some(spi) = self.my_spi {
            message.add_payload(Payload::Delete(DeletePayload {
                protocol: self.proto,
                spis: vec![spi],
            }));
            tracing::info!(
                "sending DELETE for {:?} CHILD_SA with SPI {}",
                self.proto,
                spi
            );
        }
        TaskStatus::Success
    }

    fn process_i(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        let mut no_ke = true;
        let mut ike_auth = false;
        match message.exchange_type {
            ExchangeType::IkeSaInit => {
                return match message.nonce() {
                    Some(nonce) => {
                        self.other_nonce = Some(nonce.clone());
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if let Some(nonce) = message.nonce() {
                    self.other_nonce = Some(nonce.clone());
                }
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                if !ike_sa.has_condition(IkeCondition::Authenticated) {
                    // wait until all authentication rounds completed
                    return TaskStatus::NeedMore;
                }
                if self.defer_child_sa(ike_sa) == TaskStatus::NeedMore {
                    // defer until the IKE_SA is established childless
                    self.other_nonce = None;
                    return TaskStatus::NeedMore;
                }
                ike_auth = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        // check for erroneous notifies before regular payload processing
        for notify in message.notifies() {
            match notify.notify_type {
                NotifyType::NoProposalChosen
                | NotifyType::SinglePairRequired
                | NotifyType::NoAdditionalSas
                | NotifyType::InternalAddressFailure
                | NotifyType::FailedCpRequired
                | NotifyType::TsUnacceptable
                | NotifyType::InvalidSelectors => {
                    tracing::info!(
                        "received {:?} notify, no CHILD_SA built",
                        notify.notify_type
                    );
                    self.raise_alerts(notify.notify_type);
                    self.handle_child_sa_failure(ike_sa, message);
                    // an error in CHILD_SA creation is not critical
                    return TaskStatus::Success;
                }
                NotifyType::TemporaryFailure => {
                    tracing::info!("received TEMPORARY_FAILURE notify");
                    if !self.rekey && !self.aborted {
                        // the rekey task retries itself if necessary
                        self.schedule_delayed_retry(ike_sa);
                    }
                    return TaskStatus::Success;
                }
                NotifyType::InvalidKePayload => {
                    if self.aborted {
                        tracing::info!("received INVALID_KE_PAYLOAD notify in aborted task");
                        return TaskStatus::Success;
                    }
                    let mut alg = KeMethod::None;
                    if notify.data.len() == 2 {
                        alg = KeMethod::from_u16(u16::from_be_bytes([
                            notify.data[0],
                            notify.data[1],
                        ]));
                    }
                    if self.retry {
                        tracing::info!(
                            "already retried with key exchange method {}, ignore requested {}",
                            self.ke_method,
                            alg
                        );
                        self.handle_child_sa_failure(ike_sa, message);
                        return TaskStatus::Success;
                    }
                    tracing::info!(
                        "peer didn't accept key exchange method {}, it requested {}",
                        self.ke_method,
                        alg
                    );
                    self.retry = true;
                    self.ke_method = alg;
                    if let Some(child_sa) = self.child_sa.as_mut() {
                        child_sa.set_state(ChildSaState::Retrying);
                    }
                    self.migrate();
                    return TaskStatus::NeedMore;
                }
                other => {
                    if message.exchange_type == ExchangeType::CreateChildSa {
                        if other.is_error() {
                            tracing::info!("received {:?} notify error", other);
                            return TaskStatus::Success;
                        }
                        tracing::debug!("received {:?} notify", other);
                    }
                }
            }
        }

        self.process_payloads(ike_sa, message);

        if !self.select_proposal(ike_sa, no_ke) {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }
        if let Some(proposal) = self.proposal.as_mut() {
            self.other_spi = Some(Spi(proposal.spi));
            proposal.set_spi(self.my_spi.map(|s| s.0).unwrap_or(0));
        }

        if self.aborted {
            tracing::info!(
                "deleting CHILD_SA with SPIs {}_i {}_o of aborted task",
                self.my_spi.unwrap_or(Spi(0)),
                self.other_spi.unwrap_or(Spi(0))
            );
            return self.delete_failed_sa();
        }

        if self.ipcomp == IpcompTransform::None && self.ipcomp_received != IpcompTransform::None {
            tracing::info!(
                "received an IPCOMP_SUPPORTED notify without requesting one, no CHILD_SA built"
            );
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        } else if self.ipcomp != IpcompTransform::None
            && self.ipcomp_received == IpcompTransform::None
        {
            tracing::info!(
                "peer didn't accept our proposed IPComp transforms, IPComp is disabled"
            );
            self.ipcomp = IpcompTransform::None;
        } else if self.ipcomp != IpcompTransform::None && self.ipcomp != self.ipcomp_received {
            tracing::info!(
                "received an IPCOMP_SUPPORTED notify we didn't propose, no CHILD_SA built"
            );
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if !self.check_ke_method().0 {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.ke_failed {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        self.determine_key_exchanges();

        if !self.select_label() {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.narrow_and_check_ts(ike_sa, ike_auth) != TaskStatus::Success {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.key_exchange_done_and_install_i(ike_sa, message) == TaskStatus::NeedMore {
            // installation failure switches to the delete phase; otherwise
            // more key exchanges are required
            if self.phase == Phase::Create {
                self.process_link(message);
                self.phase = Phase::MultiKe;
            }
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }

    fn process_i_multi_ke(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        if message.get_notify(NotifyType::TemporaryFailure).is_some() {
            tracing::info!("received TEMPORARY_FAILURE notify");
            if !self.rekey && !self.aborted {
                self.schedule_delayed_retry(ike_sa);
            }
            return TaskStatus::Success;
        }

        self.process_payloads_multi_ke(message);

        if self.ke_failed || self.aborted {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        self.key_exchange_done_and_install_i(ike_sa, message)
    }

    // --- responder ----------------------------------------------------------

    fn process_r(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        match message.exchange_type {
            ExchangeType::IkeSaInit => {
                return match message.nonce() {
                    Some(nonce) => {
                        self.other_nonce = Some(nonce.clone());
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if let Some(nonce) = message.nonce() {
                    self.other_nonce = Some(nonce.clone());
                }
            }
            ExchangeType::IkeAuth => {
                // only handle the first AUTH message, not additional rounds
                if self.auth_processed {
                    return TaskStatus::NeedMore;
                }
                self.auth_processed = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        self.process_payloads(ike_sa, message);

        TaskStatus::NeedMore
    }

    fn process_r_multi_ke(&mut self, message: &Message) -> TaskStatus {
        if message.exchange_type == ExchangeType::IkeFollowupKe {
            self.process_payloads_multi_ke(message);
        }
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        let mut no_ke = true;
        let mut ike_auth = false;
        match message.exchange_type {
            ExchangeType::IkeSaInit => {
                return match message.nonce() {
                    Some(nonce) => {
                        self.my_nonce = Some(nonce.clone());
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if !self.generate_nonce() {
                    message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
                    return TaskStatus::Success;
                }
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                if !ike_sa.has_condition(IkeCondition::Authenticated) {
                    // wait until all authentication rounds completed
                    return TaskStatus::NeedMore;
                }
                if ike_sa.has_condition(IkeCondition::Redirected) {
                    // no CHILD_SA is created for redirected IKE_SAs
                    return TaskStatus::Success;
                }
                match self.handle_childless(ike_sa) {
                    TaskStatus::Success => {
                        // no CHILD_SA built
                        return TaskStatus::Success;
                    }
                    TaskStatus::InvalidState => {
                        message.add_notify(false, NotifyType::InvalidSyntax, vec![]);
                        return TaskStatus::Failed;
                    }
                    _ => {}
                }
                ike_auth = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        if ike_sa.state() == IkeSaState::Rekeying {
            tracing::info!("unable to create CHILD_SA while rekeying IKE_SA");
            message.add_notify(true, NotifyType::TemporaryFailure, vec![]);
            return TaskStatus::Success;
        }
        if ike_sa.state() == IkeSaState::Deleting {
            tracing::info!("unable to create CHILD_SA while deleting IKE_SA");
            message.add_notify(true, NotifyType::TemporaryFailure, vec![]);
            return TaskStatus::Success;
        }

        if self.config.is_none() {
            self.config = self.select_child_cfg(ike_sa);
        }
        if self.config.is_none() || self.tsi.is_none() || self.tsr.is_none() {
            if self.tsi.is_none() || self.tsr.is_none() {
                tracing::info!("TS payloads missing in message");
            } else {
                tracing::info!("traffic selectors unacceptable");
                self.context.bus.alert(Alert::TsMismatch);
            }
            message.add_notify(false, NotifyType::TsUnacceptable, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        // config payload errors piggybacked by other tasks kill the CHILD
        for notify in message.notifies() {
            match notify.notify_type {
                NotifyType::InternalAddressFailure | NotifyType::FailedCpRequired => {
                    tracing::info!("configuration payload negotiation failed, no CHILD_SA built");
                    self.handle_child_sa_failure(ike_sa, message);
                    return TaskStatus::Success;
                }
                _ => {}
            }
        }

        if !self.select_proposal(ike_sa, no_ke) {
            message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        if !self.check_ke_method_r(message) {
            // the peer retries with another method, not a failure here
            return TaskStatus::Success;
        }

        // may have been cleared if a proposal without key exchange was chosen
        if self.ke_failed {
            message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        self.determine_key_exchanges();

        if !self.select_label() {
            message.add_notify(false, NotifyType::TsUnacceptable, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        let Some(config) = self.config.clone() else {
            return TaskStatus::Failed;
        };
        self.child.if_id_in_def = ike_sa.if_id(true);
        self.child.if_id_out_def = ike_sa.if_id(false);
        self.child.encap = ike_sa.has_any_nat();
        self.child_sa = Some(ChildSa::new(
            ike_sa.my_host(),
            ike_sa.other_host(),
            config.clone(),
            &self.child,
            self.context.kernel.clone(),
        ));

        self.other_spi = self.proposal.as_ref().map(|p| Spi(p.spi));
        if !self.allocate_spi() {
            message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if let Some(proposal) = self.proposal.as_mut() {
            proposal.set_spi(self.my_spi.map(|s| s.0).unwrap_or(0));
        }

        if self.ipcomp_received != IpcompTransform::None {
            if config.ipcomp {
                let transform = self.ipcomp_received;
                self.add_ipcomp_notify(message, transform);
            } else {
                tracing::info!("received IPCOMP_SUPPORTED notify but IPComp is disabled, ignoring");
            }
        }

        match self.narrow_and_check_ts(ike_sa, ike_auth) {
            TaskStatus::Success => {}
            TaskStatus::NotFound => {
                message.add_notify(false, NotifyType::TsUnacceptable, vec![]);
                self.handle_child_sa_failure(ike_sa, message);
                return TaskStatus::Success;
            }
            _ => {
                message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
                self.handle_child_sa_failure(ike_sa, message);
                return TaskStatus::Success;
            }
        }

        if !self.key_exchange_done_and_install_r(ike_sa, message) {
            self.phase = Phase::MultiKe;
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }

    fn build_r_multi_ke(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        if self.ke.is_none() {
            message.add_notify(false, NotifyType::InvalidSyntax, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if self.ke_failed {
            message.add_notify(false, NotifyType::NoProposalChosen, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if self.link.is_none() {
            tracing::warn!("ADDITIONAL_KEY_EXCHANGE notify missing");
            message.add_notify(false, NotifyType::StateNotFound, vec![]);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if !self.key_exchange_done_and_install_r(ike_sa, message) {
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }
}

impl Drop for ChildCreate {
    fn drop(&mut self) {
        // an owned CHILD_SA handle releases its SPI/CPI itself; the reqid
        // reference taken in use_reqid is ours to give back
        if self.child.reqid != 0 {
            self.context.kernel.release_reqid(self.child.reqid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::bus::BusListener;
    use crate::network::ike::child_cfg::CfgTs;
    use crate::network::ike::kernel::SimKernel;
    use crate::network::ike::keymat::{ChildKeys, IkeKeymat, PrfAlgorithm};
    use crate::network::ike::proposal::{Transform, ENCR_AES_GCM_16};
    use crate::network::ike::scheduler::RecordingScheduler;
    use crate::network::ike::{IkeError, SharedSecret, RETRY_INTERVAL, RETRY_JITTER};
    use std::sync::Mutex;

    // --- stub collaborators ------------------------------------------------

    struct MockKe {
        method: KeMethod,
        public: Vec<u8>,
        peer: Option<Vec<u8>>,
    }

    impl KeyExchange for MockKe {
        fn method(&self) -> KeMethod {
            self.method
        }

        fn public_key(&self) -> &[u8] {
            &self.public
        }

        fn set_public_key(&mut self, peer: &[u8]) -> Result<(), IkeError> {
            if peer.is_empty() {
                return Err(IkeError::Crypto("empty public key".to_string()));
            }
            self.peer = Some(peer.to_vec());
            Ok(())
        }

        fn shared_secret(&self) -> Result<SharedSecret, IkeError> {
            let peer = self
                .peer
                .clone()
                .ok_or_else(|| IkeError::Crypto("no peer key".to_string()))?;
            // symmetric in both publics, so both sides agree
            let mut pair = [self.public.clone(), peer];
            pair.sort();
            Ok(SharedSecret(pair.concat()))
        }
    }

    /// Keymat accepting any KE method, including post-quantum ones the real
    /// backend lacks. Derivation and nonces delegate to the real code.
    struct MockKeymat {
        inner: IkeKeymat,
    }

    impl MockKeymat {
        fn new() -> Self {
            MockKeymat {
                inner: IkeKeymat::new(SharedSecret(vec![0x5d; 32]), PrfAlgorithm::HmacSha256),
            }
        }
    }

    impl ChildKeymat for MockKeymat {
        fn create_nonce(&self) -> Result<Nonce, IkeError> {
            self.inner.create_nonce()
        }

        fn create_ke(&self, method: KeMethod) -> Result<Box<dyn KeyExchange>, IkeError> {
            Ok(Box::new(MockKe {
                method,
                public: rand::random::<[u8; 8]>().to_vec(),
                peer: None,
            }))
        }

        fn derive_child_keys(
            &self,
            proposal: &Proposal,
            kes: &[Box<dyn KeyExchange>],
            nonce_i: &Nonce,
            nonce_r: &Nonce,
        ) -> Result<ChildKeys, IkeError> {
            self.inner.derive_child_keys(proposal, kes, nonce_i, nonce_r)
        }
    }

    #[derive(Default)]
    struct EventRecorder {
        ups: Mutex<usize>,
        alerts: Mutex<Vec<Alert>>,
        encr_i: Mutex<Option<Vec<u8>>>,
    }

    impl BusListener for EventRecorder {
        fn child_updown(&self, _child: &ChildSa, up: bool) {
            if up {
                *self.ups.lock().unwrap() += 1;
            }
        }

        fn alert(&self, alert: &Alert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }

        fn child_derived_keys(&self, _child: &ChildSa, _initiator: bool, keys: &ChildKeys) {
            *self.encr_i.lock().unwrap() = Some(keys.encr_i.as_bytes().to_vec());
        }
    }

    struct Peer {
        context: TaskContext,
        kernel: Arc<SimKernel>,
        scheduler: Arc<RecordingScheduler>,
        events: Arc<EventRecorder>,
    }

    fn peer_with(settings: IkeSettings, spi_base: u32) -> Peer {
        let kernel = Arc::new(SimKernel::with_spi_base(spi_base));
        let scheduler = Arc::new(RecordingScheduler::new());
        let bus = Arc::new(Bus::new());
        let events = Arc::new(EventRecorder::default());
        bus.register(Box::new(EventForwarder(events.clone())));
        let context = TaskContext {
            keymat: Arc::new(MockKeymat::new()),
            kernel: kernel.clone(),
            scheduler: scheduler.clone(),
            bus,
            settings: Arc::new(settings),
        };
        Peer {
            context,
            kernel,
            scheduler,
            events,
        }
    }

    /// BusListener must be 'static, so the recorder is shared via Arc.
    struct EventForwarder(Arc<EventRecorder>);

    impl BusListener for EventForwarder {
        fn child_updown(&self, child: &ChildSa, up: bool) {
            self.0.child_updown(child, up);
        }

        fn alert(&self, alert: &Alert) {
            self.0.alert(alert);
        }

        fn child_derived_keys(&self, child: &ChildSa, initiator: bool, keys: &ChildKeys) {
            self.0.child_derived_keys(child, initiator, keys);
        }
    }

    fn peer(spi_base: u32) -> Peer {
        peer_with(IkeSettings::default(), spi_base)
    }

    // --- config helpers ----------------------------------------------------

    fn gcm_proposal(kes: &[u16], additional: &[u16]) -> Proposal {
        let mut proposal = Proposal::new(ProtocolId::Esp);
        proposal.add_transform(Transform::with_key_length(
            TransformType::Encryption,
            ENCR_AES_GCM_16,
            128,
        ));
        for ke in kes {
            proposal.add_transform(Transform::new(TransformType::KeyExchangeMethod, *ke));
        }
        for (i, ake) in additional.iter().enumerate() {
            proposal.add_transform(Transform::new(
                TransformType::AdditionalKeyExchange(i as u8 + 1),
                *ake,
            ));
        }
        proposal
    }

    fn tunnel_cfg(proposal: Proposal, local: &str, remote: &str) -> Arc<ChildCfg> {
        let mut cfg = ChildCfg::new("net-net");
        cfg.proposals.push(proposal);
        cfg.local_ts.push(CfgTs::subnet(local.parse().unwrap()));
        cfg.remote_ts.push(CfgTs::subnet(remote.parse().unwrap()));
        Arc::new(cfg)
    }

    fn ike_pair() -> (IkeSa, IkeSa) {
        let mut ike_i = IkeSa::new(
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
        );
        let mut ike_r = IkeSa::new(
            "198.51.100.1:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
        );
        ike_i.set_condition(IkeCondition::Authenticated);
        ike_r.set_condition(IkeCondition::Authenticated);
        (ike_i, ike_r)
    }

    /// Drive a full CREATE_CHILD_SA negotiation including IKE_FOLLOWUP_KE
    /// rounds, returning the terminal initiator/responder statuses.
    fn run_create(
        initiator: &mut ChildCreate,
        responder: &mut ChildCreate,
        ike_i: &mut IkeSa,
        ike_r: &mut IkeSa,
    ) -> (TaskStatus, TaskStatus) {
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds <= MAX_KEY_EXCHANGES + 1, "negotiation did not converge");
            let mut request = Message::new(ExchangeType::CreateChildSa);
            let build_status = initiator.build(ike_i, &mut request);
            if request.exchange_type == ExchangeType::Undefined {
                return (build_status, TaskStatus::Success);
            }
            assert_eq!(build_status, TaskStatus::NeedMore);
            responder.process(ike_r, &request);
            let mut response = Message::new(request.exchange_type);
            let responder_status = responder.build(ike_r, &mut response);
            let initiator_status = initiator.process(ike_i, &response);
            if initiator_status != TaskStatus::NeedMore
                || responder_status != TaskStatus::NeedMore
            {
                return (initiator_status, responder_status);
            }
        }
    }

    // --- scenarios ---------------------------------------------------------

    #[test]
    fn test_create_child_sa_single_ke() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let (si, sr) = run_create(&mut initiator, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!((si, sr), (TaskStatus::Success, TaskStatus::Success));
        assert!(initiator.established());
        assert!(responder.established());
        assert_eq!(ike_i.child_sas().len(), 1);
        assert_eq!(ike_r.child_sas().len(), 1);

        let child_i = &ike_i.child_sas()[0];
        let child_r = &ike_r.child_sas()[0];
        assert_eq!(child_i.state(), ChildSaState::Installed);
        assert_eq!(child_r.state(), ChildSaState::Installed);
        // each side's outbound SPI names the peer's inbound SA
        assert_eq!(child_i.spi(false), child_r.spi(true));
        assert_eq!(child_r.spi(false), child_i.spi(true));
        assert_eq!(child_i.ts(true)[0].start_addr, "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(child_i.ts(false)[0].start_addr, "10.0.1.0".parse::<IpAddr>().unwrap());

        // inbound and outbound SAs and both policies reached the kernel
        assert_eq!(initiator_peer.kernel.sad_len(), 2);
        assert_eq!(responder_peer.kernel.sad_len(), 2);
        assert_eq!(initiator_peer.kernel.spd_len(), 2);

        // both sides derived identical initiator-side keys
        let keys_i = initiator_peer.events.encr_i.lock().unwrap().clone().unwrap();
        let keys_r = responder_peer.events.encr_i.lock().unwrap().clone().unwrap();
        assert_eq!(keys_i, keys_r);

        assert_eq!(*initiator_peer.events.ups.lock().unwrap(), 1);
        assert_eq!(*responder_peer.events.ups.lock().unwrap(), 1);

        // the installed SA survives the task
        drop(initiator);
        assert_eq!(initiator_peer.kernel.sad_len(), 2);
        assert_eq!(initiator_peer.kernel.allocated_spis(), 1);
    }

    #[test]
    fn test_ike_auth_piggyback() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        // IKE_SA_INIT: the init task put nonces into the messages, the
        // CHILD task just records them
        let mut init_req = Message::new(ExchangeType::IkeSaInit);
        init_req.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![1; 32]),
        }));
        assert_eq!(initiator.build(&mut ike_i, &mut init_req), TaskStatus::NeedMore);
        assert_eq!(responder.process(&mut ike_r, &init_req), TaskStatus::NeedMore);
        let mut init_resp = Message::new(ExchangeType::IkeSaInit);
        init_resp.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![2; 32]),
        }));
        assert_eq!(responder.build(&mut ike_r, &mut init_resp), TaskStatus::NeedMore);
        assert_eq!(initiator.process(&mut ike_i, &init_resp), TaskStatus::NeedMore);

        // IKE_AUTH round
        let mut auth_req = Message::new(ExchangeType::IkeAuth);
        assert_eq!(initiator.build(&mut ike_i, &mut auth_req), TaskStatus::NeedMore);
        assert!(auth_req.sa().is_some());
        assert!(auth_req.nonce().is_none());
        assert!(auth_req.ke().is_none());
        // piggybacked proposals carry no key exchange transforms
        assert!(auth_req.sa().unwrap().proposals.iter().all(|p| p
            .get_algorithm(TransformType::KeyExchangeMethod)
            .is_none()));

        assert_eq!(responder.process(&mut ike_r, &auth_req), TaskStatus::NeedMore);
        let mut auth_resp = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut auth_resp), TaskStatus::Success);
        assert_eq!(initiator.process(&mut ike_i, &auth_resp), TaskStatus::Success);

        assert!(initiator.established());
        assert!(responder.established());
        // a second AUTH round is skipped by both sides
        let mut second = Message::new(ExchangeType::IkeAuth);
        assert_eq!(initiator.build(&mut ike_i, &mut second), TaskStatus::NeedMore);
        assert!(second.payloads.is_empty());
    }

    #[test]
    fn test_invalid_ke_payload_retry() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        // we prefer ECP_256, the responder only accepts ECP_384
        let cfg_i = tunnel_cfg(gcm_proposal(&[19, 20], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[20], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        assert_eq!(request.ke().unwrap().method, KeMethod::Ecp256);

        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        let notify = response.get_notify(NotifyType::InvalidKePayload).unwrap();
        assert_eq!(notify.data, vec![0x00, 0x14]);

        // retry: the task migrates, keeping the requested method
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);
        assert!(initiator.retry);
        assert_eq!(initiator.ke_method, KeMethod::Ecp384);
        assert!(initiator.my_nonce.is_none());
        assert!(initiator.proposals.is_none());
        assert!(initiator.tsi.is_none());
        assert!(initiator.kes.is_empty());

        // second attempt with a fresh responder task succeeds
        let cfg_r = tunnel_cfg(gcm_proposal(&[20], &[]), "10.0.1.0/24", "10.0.0.0/24");
        ike_r.child_cfgs = vec![cfg_r];
        let mut responder2 =
            ChildCreate::new(responder_peer.context.clone(), None, false, None, None);
        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        assert_eq!(request.ke().unwrap().method, KeMethod::Ecp384);
        responder2.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder2.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);
        assert!(initiator.established());
        assert!(initiator.retry);
    }

    #[test]
    fn test_invalid_ke_payload_only_one_retry() {
        let initiator_peer = peer(0x10000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19, 20], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, _) = ike_pair();
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        response.add_notify(
            false,
            NotifyType::InvalidKePayload,
            20u16.to_be_bytes().to_vec(),
        );
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        response.add_notify(
            false,
            NotifyType::InvalidKePayload,
            19u16.to_be_bytes().to_vec(),
        );
        // a second suggestion is not followed
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);
        assert!(!initiator.established());
    }

    #[test]
    fn test_multi_ke_followup_rounds() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[36]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[36]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        // round 1: CREATE_CHILD_SA with the initial exchange
        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::NeedMore);
        let link = response
            .get_notify(NotifyType::AdditionalKeyExchange)
            .unwrap()
            .data
            .clone();
        assert!(!link.is_empty());
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);
        assert!(!initiator.established());

        // round 2: IKE_FOLLOWUP_KE with the additional exchange
        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        assert_eq!(request.exchange_type, ExchangeType::IkeFollowupKe);
        assert_eq!(request.ke().unwrap().method, KeMethod::MlKem768);
        assert_eq!(
            request
                .get_notify(NotifyType::AdditionalKeyExchange)
                .unwrap()
                .data,
            link
        );
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::IkeFollowupKe);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        // the link is dropped with the last round
        assert!(response.get_notify(NotifyType::AdditionalKeyExchange).is_none());
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);

        assert!(initiator.established());
        assert!(responder.established());
        assert_eq!(initiator.kes.len(), 2);
        assert_eq!(responder.kes.len(), 2);
        assert!(initiator.link.is_none());
        assert!(responder.link.is_none());

        let keys_i = initiator_peer.events.encr_i.lock().unwrap().clone().unwrap();
        let keys_r = responder_peer.events.encr_i.lock().unwrap().clone().unwrap();
        assert_eq!(keys_i, keys_r);
    }

    #[test]
    fn test_multi_ke_link_mismatch_rejected() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[36]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[36]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        responder.build(&mut ike_r, &mut response);
        initiator.process(&mut ike_i, &response);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        // tamper with the echoed link token
        for payload in &mut request.payloads {
            if let Payload::Notify(notify) = payload {
                if notify.notify_type == NotifyType::AdditionalKeyExchange {
                    notify.data[0] ^= 0xff;
                }
            }
        }
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::IkeFollowupKe);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.get_notify(NotifyType::StateNotFound).is_some());
        assert!(!responder.established());
    }

    #[test]
    fn test_transport_mode_nat_substitution() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);

        let transport_cfg = || {
            let mut cfg = ChildCfg::new("host-host");
            cfg.proposals.push(gcm_proposal(&[19], &[]));
            cfg.local_ts.push(CfgTs::dynamic());
            cfg.remote_ts.push(CfgTs::dynamic());
            cfg.mode = IpsecMode::Transport;
            Arc::new(cfg)
        };

        // the initiator sits behind a NAT: it sees 192.168.1.5, the
        // responder sees the mapped address 203.0.113.7
        let mut ike_i = IkeSa::new(
            "192.168.1.5:4500".parse().unwrap(),
            "198.51.100.1:4500".parse().unwrap(),
        );
        let mut ike_r = IkeSa::new(
            "198.51.100.1:4500".parse().unwrap(),
            "203.0.113.7:4500".parse().unwrap(),
        );
        ike_i.set_condition(IkeCondition::Authenticated);
        ike_i.set_condition(IkeCondition::NatHere);
        ike_r.set_condition(IkeCondition::Authenticated);
        ike_r.set_condition(IkeCondition::NatThere);
        ike_r.child_cfgs.push(transport_cfg());

        let mut initiator = ChildCreate::new(
            initiator_peer.context.clone(),
            Some(transport_cfg()),
            false,
            None,
            None,
        );
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let (si, sr) = run_create(&mut initiator, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!((si, sr), (TaskStatus::Success, TaskStatus::Success));

        let child_i = &ike_i.child_sas()[0];
        assert_eq!(child_i.mode(), IpsecMode::Transport);
        // narrowing substituted our IKE endpoint into the local selector
        assert!(child_i.ts(true)[0].is_host(Some("192.168.1.5".parse().unwrap())));
        let child_r = &ike_r.child_sas()[0];
        assert_eq!(child_r.mode(), IpsecMode::Transport);
        assert!(child_r.ts(false)[0].is_host(Some("203.0.113.7".parse().unwrap())));
    }

    #[test]
    fn test_transport_fallback_to_tunnel() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let mut cfg = ChildCfg::new("net-net");
        cfg.proposals.push(gcm_proposal(&[19], &[]));
        cfg.local_ts.push(CfgTs::subnet("10.0.0.0/24".parse().unwrap()));
        cfg.remote_ts
            .push(CfgTs::subnet("10.0.1.0/24".parse().unwrap()));
        cfg.mode = IpsecMode::Transport;
        let cfg_i = Arc::new(cfg);
        // the responder only accepts tunnel mode
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let (si, sr) = run_create(&mut initiator, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!((si, sr), (TaskStatus::Success, TaskStatus::Success));
        // the responder silently fell back to tunnel mode
        assert_eq!(ike_r.child_sas()[0].mode(), IpsecMode::Tunnel);
        assert_eq!(ike_i.child_sas()[0].mode(), IpsecMode::Tunnel);
    }

    #[test]
    fn test_temporary_failure_schedules_delayed_retry() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.state = IkeSaState::Rekeying;
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        initiator.use_reqid(7);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.get_notify(NotifyType::TemporaryFailure).is_some());

        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);
        assert!(!initiator.established());
        assert_eq!(ike_i.pending_tasks.len(), 1);
        let queued = &ike_i.pending_tasks[0];
        let delay = queued.delay.as_secs();
        assert!((RETRY_INTERVAL - RETRY_JITTER..=RETRY_INTERVAL).contains(&delay));
        // the retry carries the original reqid
        assert_eq!(queued.task.child.reqid, 7);
    }

    #[test]
    fn test_abort_emits_delete_for_allocated_spi() {
        let initiator_peer = peer(0xdeadbee0);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        let spi = initiator.my_spi.unwrap();

        initiator.abort();

        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        responder.build(&mut ike_r, &mut response);
        // the aborted task switches to the delete phase instead of installing
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);
        assert!(!initiator.established());

        let mut delete = Message::new(ExchangeType::Informational);
        assert_eq!(initiator.build(&mut ike_i, &mut delete), TaskStatus::Success);
        assert_eq!(delete.exchange_type, ExchangeType::Informational);
        let Payload::Delete(payload) = &delete.payloads[0] else {
            panic!("expected delete payload");
        };
        assert_eq!(payload.spis, vec![spi]);
        // the half-allocated SPI went back to the kernel
        assert_eq!(initiator_peer.kernel.allocated_spis(), 0);
        assert_eq!(initiator_peer.kernel.sad_len(), 0);
    }

    #[test]
    fn test_duplicate_suppression() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut first =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i.clone()), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);
        run_create(&mut first, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!(ike_i.child_sas().len(), 1);

        // a second task for the same config does not initiate
        let mut second =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(second.build(&mut ike_i, &mut request), TaskStatus::Success);
        assert_eq!(request.exchange_type, ExchangeType::Undefined);
        assert!(!second.established());
        assert_eq!(ike_i.child_sas().len(), 1);
    }

    // --- childless policy --------------------------------------------------

    #[test]
    fn test_childless_force_without_peer_support_is_fatal() {
        let initiator_peer = peer(0x10000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, _) = ike_pair();
        ike_i.childless = ChildlessPolicy::Force;
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);

        let mut request = Message::new(ExchangeType::IkeAuth);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::DestroyMe);
    }

    #[test]
    fn test_childless_prefer_defers_child() {
        let initiator_peer = peer(0x10000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, _) = ike_pair();
        ike_i.childless = ChildlessPolicy::Prefer;
        ike_i.enable_extension(IkeExtension::Childless);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);

        let mut request = Message::new(ExchangeType::IkeAuth);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::NeedMore);
        assert!(request.payloads.is_empty());
        assert_eq!(initiator_peer.kernel.allocated_spis(), 0);
    }

    #[test]
    fn test_childless_responder_policy() {
        // an IKE_AUTH request without SA/TS payloads
        let empty_auth = Message::new(ExchangeType::IkeAuth);

        // policy NEVER rejects childless initiation
        let responder_peer = peer(0x20000000);
        let (_, mut ike_r) = ike_pair();
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);
        responder.process(&mut ike_r, &empty_auth);
        let mut response = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Failed);
        assert!(response.get_notify(NotifyType::InvalidSyntax).is_some());

        // policy PREFER accepts it without building a CHILD
        let (_, mut ike_r) = ike_pair();
        ike_r.childless = ChildlessPolicy::Prefer;
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);
        responder.process(&mut ike_r, &empty_auth);
        let mut response = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.payloads.is_empty());
        assert!(!responder.established());
    }

    #[test]
    fn test_childless_responder_force_rejects_child_payloads() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.childless = ChildlessPolicy::Force;

        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut init_req = Message::new(ExchangeType::IkeSaInit);
        init_req.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![1; 32]),
        }));
        initiator.build(&mut ike_i, &mut init_req);
        responder.process(&mut ike_r, &init_req);
        let mut auth_req = Message::new(ExchangeType::IkeAuth);
        initiator.build(&mut ike_i, &mut auth_req);
        responder.process(&mut ike_r, &auth_req);
        let mut response = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Failed);
        assert!(response.get_notify(NotifyType::InvalidSyntax).is_some());
    }

    // --- IPComp -------------------------------------------------------------

    fn ipcomp_cfg(local: &str, remote: &str) -> Arc<ChildCfg> {
        let mut cfg = ChildCfg::new("compressed");
        cfg.proposals.push(gcm_proposal(&[19], &[]));
        cfg.local_ts.push(CfgTs::subnet(local.parse().unwrap()));
        cfg.remote_ts.push(CfgTs::subnet(remote.parse().unwrap()));
        cfg.ipcomp = true;
        Arc::new(cfg)
    }

    #[test]
    fn test_ipcomp_negotiation() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(ipcomp_cfg("10.0.1.0/24", "10.0.0.0/24"));
        let mut initiator = ChildCreate::new(
            initiator_peer.context.clone(),
            Some(ipcomp_cfg("10.0.0.0/24", "10.0.1.0/24")),
            false,
            None,
            None,
        );
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let (si, sr) = run_create(&mut initiator, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!((si, sr), (TaskStatus::Success, TaskStatus::Success));
        assert_eq!(initiator.ipcomp, IpcompTransform::Deflate);
        assert_eq!(responder.ipcomp, IpcompTransform::Deflate);
        assert!(initiator.my_cpi.is_some());
        assert!(initiator.other_cpi.is_some());
    }

    #[test]
    fn test_ipcomp_silently_disabled_when_peer_declines() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let (mut ike_i, mut ike_r) = ike_pair();
        // the responder has IPComp disabled
        ike_r.child_cfgs
            .push(tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24"));
        let mut initiator = ChildCreate::new(
            initiator_peer.context.clone(),
            Some(ipcomp_cfg("10.0.0.0/24", "10.0.1.0/24")),
            false,
            None,
            None,
        );
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let (si, _) = run_create(&mut initiator, &mut responder, &mut ike_i, &mut ike_r);
        assert_eq!(si, TaskStatus::Success);
        assert!(initiator.established());
        assert_eq!(initiator.ipcomp, IpcompTransform::None);
        assert!(initiator.my_cpi.is_none());
    }

    #[test]
    fn test_ipcomp_unsolicited_notify_fails_child() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");
        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        responder.build(&mut ike_r, &mut response);
        // inject an IPCOMP_SUPPORTED notify we never asked for
        response.add_notify(false, NotifyType::IpcompSupported, vec![0x12, 0x34, 2]);

        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);
        assert!(!initiator.established());
        // the task is now tearing down the half-open SA
        let mut delete = Message::new(ExchangeType::Informational);
        initiator.build(&mut ike_i, &mut delete);
        assert_eq!(delete.exchange_type, ExchangeType::Informational);
    }

    // --- failure policy ----------------------------------------------------

    #[test]
    fn test_first_child_failure_closes_ike_sa_when_configured() {
        let settings = IkeSettings {
            close_ike_on_child_failure: true,
            ..Default::default()
        };
        let initiator_peer = peer_with(settings, 0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        // no matching config on the responder
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut init_req = Message::new(ExchangeType::IkeSaInit);
        init_req.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![1; 32]),
        }));
        initiator.build(&mut ike_i, &mut init_req);
        responder.process(&mut ike_r, &init_req);
        let mut init_resp = Message::new(ExchangeType::IkeSaInit);
        init_resp.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![2; 32]),
        }));
        responder.build(&mut ike_r, &mut init_resp);
        initiator.process(&mut ike_i, &init_resp);

        let mut auth_req = Message::new(ExchangeType::IkeAuth);
        initiator.build(&mut ike_i, &mut auth_req);
        responder.process(&mut ike_r, &auth_req);
        let mut auth_resp = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut auth_resp), TaskStatus::Success);
        assert!(auth_resp.get_notify(NotifyType::TsUnacceptable).is_some());

        assert_eq!(initiator.process(&mut ike_i, &auth_resp), TaskStatus::Success);
        assert!(!initiator.established());
        let jobs = initiator_peer.scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0].0, Job::DeleteIkeSa { ike_sa } if ike_sa == ike_i.id));
        // the delete is delayed so the response goes out first
        assert_eq!(jobs[0].1, Duration::from_millis(100));
    }

    #[test]
    fn test_negotiation_failure_releases_resources() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        // disjoint selectors on the responder
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "172.16.0.0/24", "172.16.1.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.get_notify(NotifyType::TsUnacceptable).is_some());
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);

        assert!(!initiator.established());
        drop(initiator);
        drop(responder);
        // every SPI allocation was rolled back on both peers
        assert_eq!(initiator_peer.kernel.allocated_spis(), 0);
        assert_eq!(responder_peer.kernel.allocated_spis(), 0);
        assert_eq!(initiator_peer.kernel.allocated_cpis(), 0);
    }

    #[test]
    fn test_install_failure_triggers_delete_and_alert() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        responder.build(&mut ike_r, &mut response);

        initiator_peer.kernel.fail_sa_installs(true);
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::NeedMore);
        assert!(!initiator.established());
        assert!(initiator_peer
            .events
            .alerts
            .lock()
            .unwrap()
            .contains(&Alert::InstallChildSaFailed));

        let mut delete = Message::new(ExchangeType::Informational);
        assert_eq!(initiator.build(&mut ike_i, &mut delete), TaskStatus::Success);
        assert_eq!(delete.exchange_type, ExchangeType::Informational);
    }

    #[test]
    fn test_responder_policy_failure_returns_ts_unacceptable() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let cfg_i = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let cfg_r = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.1.0/24", "10.0.0.0/24");

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(cfg_r);
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg_i), false, None, None);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        responder.process(&mut ike_r, &request);
        responder_peer.kernel.fail_policy_installs(true);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.get_notify(NotifyType::TsUnacceptable).is_some());
        assert!(!responder.established());
    }

    // --- misc behaviors ----------------------------------------------------

    #[test]
    fn test_tfc_notify_emitted_without_kernel_support() {
        let kernel = Arc::new(SimKernel::without_tfc());
        let scheduler = Arc::new(RecordingScheduler::new());
        let context = TaskContext {
            keymat: Arc::new(MockKeymat::new()),
            kernel: kernel.clone(),
            scheduler,
            bus: Arc::new(Bus::new()),
            settings: Arc::new(IkeSettings::default()),
        };
        let cfg = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, _) = ike_pair();
        let mut initiator = ChildCreate::new(context, Some(cfg), false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        assert!(request
            .get_notify(NotifyType::EspTfcPaddingNotSupported)
            .is_some());
    }

    #[test]
    fn test_packet_selectors_lead_the_proposed_set() {
        let initiator_peer = peer(0x10000000);
        let cfg = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let (mut ike_i, _) = ike_pair();
        let packet_tsi = TrafficSelector::from_host("10.0.0.7".parse().unwrap(), 6);
        let mut initiator = ChildCreate::new(
            initiator_peer.context.clone(),
            Some(cfg),
            false,
            Some(packet_tsi.clone()),
            None,
        );

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        let ts = request.ts(true).unwrap();
        assert_eq!(ts.selectors[0], packet_tsi);
        assert_eq!(ts.selectors.len(), 2);
    }

    #[test]
    fn test_labels_require_agreement() {
        let initiator_peer = peer(0x10000000);
        let responder_peer = peer(0x20000000);
        let label = SecLabel(b"system_u:object_r:ipsec_spd_t:s0".to_vec());
        let labeled_cfg = |local: &str, remote: &str| {
            let mut cfg = ChildCfg::new("labeled");
            cfg.proposals.push(gcm_proposal(&[19], &[]));
            cfg.local_ts.push(CfgTs::subnet(local.parse().unwrap()));
            cfg.remote_ts.push(CfgTs::subnet(remote.parse().unwrap()));
            cfg.label = Some(label.clone());
            Arc::new(cfg)
        };

        let (mut ike_i, mut ike_r) = ike_pair();
        ike_r.child_cfgs.push(labeled_cfg("10.0.1.0/24", "10.0.0.0/24"));
        let mut initiator = ChildCreate::new(
            initiator_peer.context.clone(),
            Some(labeled_cfg("10.0.0.0/24", "10.0.1.0/24")),
            false,
            None,
            None,
        );
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        initiator.build(&mut ike_i, &mut request);
        // the proposed label rides in both TS payloads
        assert_eq!(request.ts(true).unwrap().labels, vec![label.clone()]);
        assert_eq!(request.ts(false).unwrap().labels, vec![label.clone()]);

        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert_eq!(initiator.process(&mut ike_i, &response), TaskStatus::Success);
        assert!(initiator.established());
        assert_eq!(ike_i.child_sas()[0].label(), Some(&label));
    }

    #[test]
    fn test_generic_selinux_label_aborts_initiation() {
        let initiator_peer = peer(0x10000000);
        let mut cfg = ChildCfg::new("selinux");
        cfg.proposals.push(gcm_proposal(&[19], &[]));
        cfg.local_ts.push(CfgTs::subnet("10.0.0.0/24".parse().unwrap()));
        cfg.remote_ts
            .push(CfgTs::subnet("10.0.1.0/24".parse().unwrap()));
        cfg.label = Some(SecLabel(b"system_u:object_r:generic_t:s0".to_vec()));
        cfg.label_mode = SecLabelMode::Selinux;
        let (mut ike_i, _) = ike_pair();
        let mut initiator =
            ChildCreate::new(initiator_peer.context.clone(), Some(Arc::new(cfg)), false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(initiator.build(&mut ike_i, &mut request), TaskStatus::Success);
        assert_eq!(request.exchange_type, ExchangeType::Undefined);
    }

    #[test]
    fn test_responder_temporary_failure_while_deleting() {
        let responder_peer = peer(0x20000000);
        let (_, mut ike_r) = ike_pair();
        ike_r.state = IkeSaState::Deleting;
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut request = Message::new(ExchangeType::CreateChildSa);
        request.add_payload(Payload::Nonce(NoncePayload {
            nonce: Nonce(vec![3; 32]),
        }));
        responder.process(&mut ike_r, &request);
        let mut response = Message::new(ExchangeType::CreateChildSa);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.get_notify(NotifyType::TemporaryFailure).is_some());
    }

    #[test]
    fn test_redirected_ike_sa_builds_no_child() {
        let responder_peer = peer(0x20000000);
        let (_, mut ike_r) = ike_pair();
        ike_r.set_condition(IkeCondition::Redirected);
        let mut responder = ChildCreate::new(responder_peer.context.clone(), None, false, None, None);

        let mut response = Message::new(ExchangeType::IkeAuth);
        assert_eq!(responder.build(&mut ike_r, &mut response), TaskStatus::Success);
        assert!(response.payloads.is_empty());
    }

    #[test]
    fn test_use_reqid_swaps_references() {
        let initiator_peer = peer(0x10000000);
        let cfg = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let mut task =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg), false, None, None);
        task.use_reqid(7);
        assert_eq!(initiator_peer.kernel.reqid_refs(7), 1);
        task.use_reqid(9);
        assert_eq!(initiator_peer.kernel.reqid_refs(7), 0);
        assert_eq!(initiator_peer.kernel.reqid_refs(9), 1);
        drop(task);
        assert_eq!(initiator_peer.kernel.reqid_refs(9), 0);
    }

    #[test]
    fn test_lower_nonce_selection() {
        let initiator_peer = peer(0x10000000);
        let cfg = tunnel_cfg(gcm_proposal(&[19], &[]), "10.0.0.0/24", "10.0.1.0/24");
        let mut task =
            ChildCreate::new(initiator_peer.context.clone(), Some(cfg), false, None, None);
        task.my_nonce = Some(Nonce(vec![2; 32]));
        task.other_nonce = Some(Nonce(vec![1; 32]));
        assert_eq!(task.lower_nonce(), Some(&Nonce(vec![1; 32])));
    }
}
