use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::network::ike::child_cfg::ChildCfg;
use crate::network::ike::child_create::ChildCreate;
use crate::network::ike::child_sa::ChildSa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeSaState {
    Created,
    Connecting,
    Established,
    Rekeying,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IkeCondition {
    NatHere,
    NatThere,
    Authenticated,
    Redirected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IkeExtension {
    /// Peer supports childless IKE_SA initiation (RFC 6023).
    Childless,
    /// Peer is known to understand our private-use notifies and algorithms.
    PrivateExtensions,
}

/// Whether this IKE_SA may or must come up without an initial CHILD_SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildlessPolicy {
    #[default]
    Never,
    Prefer,
    Force,
}

/// A CHILD_SA task queued for later initiation.
pub struct DelayedTask {
    pub task: ChildCreate,
    pub delay: Duration,
}

/// The per-peer control-plane context a CHILD_SA task operates in. The task
/// pump serializes all access, tasks receive it mutably per half-step.
pub struct IkeSa {
    pub id: Uuid,
    pub my_host: SocketAddr,
    pub other_host: SocketAddr,
    pub state: IkeSaState,
    pub conditions: HashSet<IkeCondition>,
    pub extensions: HashSet<IkeExtension>,
    pub childless: ChildlessPolicy,
    pub if_id_in: u32,
    pub if_id_out: u32,
    /// Virtual IPs assigned to us (initiator side input).
    pub my_vips: Vec<IpAddr>,
    pub other_vips: Vec<IpAddr>,
    /// CHILD configs offered to responders for config selection.
    pub child_cfgs: Vec<Arc<ChildCfg>>,
    pub child_sas: Vec<ChildSa>,
    pub pending_tasks: Vec<DelayedTask>,
}

impl IkeSa {
    pub fn new(my_host: SocketAddr, other_host: SocketAddr) -> Self {
        IkeSa {
            id: Uuid::new_v4(),
            my_host,
            other_host,
            state: IkeSaState::Established,
            conditions: HashSet::new(),
            extensions: HashSet::new(),
            childless: ChildlessPolicy::default(),
            if_id_in: 0,
            if_id_out: 0,
            my_vips: Vec::new(),
            other_vips: Vec::new(),
            child_cfgs: Vec::new(),
            child_sas: Vec::new(),
            pending_tasks: Vec::new(),
        }
    }

    pub fn my_host(&self) -> SocketAddr {
        self.my_host
    }

    pub fn other_host(&self) -> SocketAddr {
        self.other_host
    }

    pub fn state(&self) -> IkeSaState {
        self.state
    }

    pub fn has_condition(&self, condition: IkeCondition) -> bool {
        self.conditions.contains(&condition)
    }

    pub fn has_any_nat(&self) -> bool {
        self.has_condition(IkeCondition::NatHere) || self.has_condition(IkeCondition::NatThere)
    }

    pub fn set_condition(&mut self, condition: IkeCondition) {
        self.conditions.insert(condition);
    }

    pub fn supports_extension(&self, extension: IkeExtension) -> bool {
        self.extensions.contains(&extension)
    }

    pub fn enable_extension(&mut self, extension: IkeExtension) {
        self.extensions.insert(extension);
    }

    pub fn if_id(&self, inbound: bool) -> u32 {
        if inbound {
            self.if_id_in
        } else {
            self.if_id_out
        }
    }

    /// The addresses traffic selectors are evaluated against: virtual IPs if
    /// assigned, the IKE endpoint otherwise.
    pub fn dynamic_hosts(&self, local: bool) -> Vec<IpAddr> {
        let (vips, endpoint) = if local {
            (&self.my_vips, self.my_host)
        } else {
            (&self.other_vips, self.other_host)
        };
        if vips.is_empty() {
            vec![endpoint.ip()]
        } else {
            vips.clone()
        }
    }

    /// Take ownership of an installed CHILD_SA.
    pub fn add_child_sa(&mut self, child_sa: ChildSa) {
        self.child_sas.push(child_sa);
    }

    pub fn child_sas(&self) -> &[ChildSa] {
        &self.child_sas
    }

    /// Queue a task for re-initiation after a delay (delayed retry).
    pub fn queue_task_delayed(&mut self, task: ChildCreate, delay: Duration) {
        self.pending_tasks.push(DelayedTask { task, delay });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ike_sa() -> IkeSa {
        IkeSa::new(
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
        )
    }

    #[test]
    fn test_conditions_and_extensions() {
        let mut sa = ike_sa();
        assert!(!sa.has_condition(IkeCondition::NatHere));
        sa.set_condition(IkeCondition::NatHere);
        assert!(sa.has_condition(IkeCondition::NatHere));
        assert!(sa.has_any_nat());
        assert!(!sa.supports_extension(IkeExtension::Childless));
        sa.enable_extension(IkeExtension::Childless);
        assert!(sa.supports_extension(IkeExtension::Childless));
    }

    #[test]
    fn test_dynamic_hosts_prefer_virtual_ips() {
        let mut sa = ike_sa();
        assert_eq!(sa.dynamic_hosts(true), vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        sa.my_vips.push("10.99.0.5".parse().unwrap());
        assert_eq!(sa.dynamic_hosts(true), vec!["10.99.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(sa.dynamic_hosts(false), vec!["192.0.2.2".parse::<IpAddr>().unwrap()]);
    }
}
