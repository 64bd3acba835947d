use std::sync::Mutex;

use crate::network::ike::child_sa::ChildSa;
use crate::network::ike::keymat::ChildKeys;
use crate::network::ike::ts::TrafficSelector;
use crate::network::ike::Nonce;

/// Points at which an observer may shrink the negotiated traffic selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrowHook {
    /// Initiator building the request during IKE_AUTH.
    InitiatorPreNoAuth,
    /// Initiator building a CREATE_CHILD_SA request.
    InitiatorPreAuth,
    /// Initiator processing the response during IKE_AUTH.
    InitiatorPostNoAuth,
    /// Initiator processing a CREATE_CHILD_SA response.
    InitiatorPostAuth,
    Responder,
    ResponderPost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    ProposalMismatchChild,
    TsMismatch,
    InstallChildSaFailed,
    InstallChildPolicyFailed,
    KeepOnChildSaFailure { first: bool },
}

/// Observer of CHILD_SA negotiation events. All methods default to no-ops.
pub trait BusListener: Send + Sync {
    fn narrow(
        &self,
        _child: &ChildSa,
        _hook: NarrowHook,
        _my_ts: &mut Vec<TrafficSelector>,
        _other_ts: &mut Vec<TrafficSelector>,
    ) {
    }

    fn alert(&self, _alert: &Alert) {}

    fn child_updown(&self, _child: &ChildSa, _up: bool) {}

    fn child_derived_keys(&self, _child: &ChildSa, _initiator: bool, _keys: &ChildKeys) {}

    fn child_keys(&self, _child: &ChildSa, _initiator: bool, _nonce_i: &Nonce, _nonce_r: &Nonce) {}
}

/// Event distribution for CHILD_SA negotiation. Events are logged and fanned
/// out to registered listeners.
pub struct Bus {
    listeners: Mutex<Vec<Box<dyn BusListener>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Box<dyn BusListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn narrow(
        &self,
        child: &ChildSa,
        hook: NarrowHook,
        my_ts: &mut Vec<TrafficSelector>,
        other_ts: &mut Vec<TrafficSelector>,
    ) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.narrow(child, hook, my_ts, other_ts);
        }
    }

    pub fn alert(&self, alert: Alert) {
        tracing::debug!("alert: {:?}", alert);
        for listener in self.listeners.lock().unwrap().iter() {
            listener.alert(&alert);
        }
    }

    pub fn child_updown(&self, child: &ChildSa, up: bool) {
        tracing::info!(
            "CHILD_SA {}{{{}}} {}",
            child.name(),
            child.unique_id(),
            if up { "up" } else { "down" }
        );
        for listener in self.listeners.lock().unwrap().iter() {
            listener.child_updown(child, up);
        }
    }

    pub fn child_derived_keys(&self, child: &ChildSa, initiator: bool, keys: &ChildKeys) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.child_derived_keys(child, initiator, keys);
        }
    }

    pub fn child_keys(&self, child: &ChildSa, initiator: bool, nonce_i: &Nonce, nonce_r: &Nonce) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.child_keys(child, initiator, nonce_i, nonce_r);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
