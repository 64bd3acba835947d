use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::network::ike::proposal::{self, Proposal, SelectionFlags};
use crate::network::ike::ts::{self, SecLabel, SecLabelMode, TrafficSelector};
use crate::network::ike::{IpsecMode, KeMethod, TransformType};

/// A configured traffic selector: either a fixed subnet/range or a dynamic
/// one that follows the host addresses of the SA endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CfgTs {
    Static(TrafficSelector),
    Dynamic {
        protocol: u8,
        start_port: u16,
        end_port: u16,
    },
}

impl CfgTs {
    pub fn subnet(net: ipnet::IpNet) -> Self {
        CfgTs::Static(TrafficSelector::from_subnet(net, 0, 0, 65535))
    }

    pub fn dynamic() -> Self {
        CfgTs::Dynamic {
            protocol: 0,
            start_port: 0,
            end_port: 65535,
        }
    }

    fn materialize(&self, hosts: &[IpAddr], out: &mut Vec<TrafficSelector>) {
        match self {
            CfgTs::Static(ts) => out.push(ts.clone()),
            CfgTs::Dynamic {
                protocol,
                start_port,
                end_port,
            } => {
                for host in hosts {
                    let mut ts = if host.is_unspecified() {
                        // a wildcard host stands for the whole address family
                        TrafficSelector::any(host.is_ipv6())
                    } else {
                        TrafficSelector::from_host(*host, *protocol)
                    };
                    ts.protocol = *protocol;
                    ts.start_port = *start_port;
                    ts.end_port = *end_port;
                    if !out.contains(&ts) {
                        out.push(ts);
                    }
                }
            }
        }
    }
}

/// Configuration for one CHILD_SA: the proposals to offer, the traffic to
/// protect and how to protect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildCfg {
    pub name: String,
    pub proposals: Vec<Proposal>,
    pub local_ts: Vec<CfgTs>,
    pub remote_ts: Vec<CfgTs>,
    pub mode: IpsecMode,
    pub inactivity: Option<Duration>,
    pub label: Option<SecLabel>,
    pub label_mode: SecLabelMode,
    pub ipcomp: bool,
    pub proxy_mode: bool,
    /// Static reqid; 0 allocates dynamically at install time.
    pub reqid: u32,
    pub mark_in: u32,
    pub mark_out: u32,
    pub if_id_in: u32,
    pub if_id_out: u32,
}

impl ChildCfg {
    pub fn new(name: &str) -> Self {
        ChildCfg {
            name: name.to_string(),
            proposals: Vec::new(),
            local_ts: Vec::new(),
            remote_ts: Vec::new(),
            mode: IpsecMode::Tunnel,
            inactivity: None,
            label: None,
            label_mode: SecLabelMode::Simple,
            ipcomp: false,
            proxy_mode: false,
            reqid: 0,
            mark_in: 0,
            mark_out: 0,
            if_id_in: 0,
            if_id_out: 0,
        }
    }

    /// Proposals to send as initiator, KE transforms stripped for exchanges
    /// that perform no key exchange (IKE_AUTH piggyback).
    pub fn get_proposals(&self, no_ke: bool) -> Vec<Proposal> {
        let mut proposals = self.proposals.clone();
        if no_ke {
            for proposal in &mut proposals {
                proposal.strip_ke();
            }
        }
        for (i, proposal) in proposals.iter_mut().enumerate() {
            proposal.number = (i + 1) as u8;
        }
        proposals
    }

    pub fn select_proposal(
        &self,
        supplied: &[Proposal],
        flags: SelectionFlags,
    ) -> Option<Proposal> {
        proposal::select_proposal(&self.get_proposals(flags.skip_ke), supplied, flags)
    }

    /// The configured default key exchange method, from the first proposal.
    pub fn ke_method(&self) -> KeMethod {
        self.proposals
            .first()
            .and_then(|p| p.get_algorithm(TransformType::KeyExchangeMethod))
            .map(|(id, _)| KeMethod::from_u16(id))
            .unwrap_or(KeMethod::None)
    }

    /// Resolve the configured selectors of one side against the dynamic host
    /// addresses, then narrow them with the peer-supplied set if given.
    pub fn get_traffic_selectors(
        &self,
        local: bool,
        supplied: Option<&[TrafficSelector]>,
        hosts: &[IpAddr],
    ) -> Vec<TrafficSelector> {
        let templates = if local { &self.local_ts } else { &self.remote_ts };
        let mut configured = Vec::new();
        for template in templates {
            template.materialize(hosts, &mut configured);
        }
        match supplied {
            Some(supplied) => ts::narrow(&configured, supplied),
            None => configured,
        }
    }

    /// Select a label from a peer-proposed list. Proposed labels must match
    /// the configured one exactly; an empty list is acceptable.
    pub fn select_label(&self, proposed: &[SecLabel]) -> Result<Option<SecLabel>, ()> {
        let Some(first) = proposed.first() else {
            return Ok(None);
        };
        match &self.label {
            Some(label) if label == first => Ok(Some(first.clone())),
            _ => Err(()),
        }
    }
}
