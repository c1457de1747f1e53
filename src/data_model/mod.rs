use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

use crate::utils::get_epoch_time_in_ms;

/// Allocation index assigned by the provider. Indices are expected to be
/// monotonically non-decreasing over the life of the provider process.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct AllocationIdx(u64);

impl AllocationIdx {
    pub fn new(idx: u64) -> Self {
        Self(idx)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for AllocationIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AllocationIdx {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: String) -> Self {
        Self(id)
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// Highest phase an allocation has reached. `Rejected` and `Dead` are
/// terminal; `Done` allocations still transition to `Dead` when the
/// provider tears them down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AllocationPhase {
    Requested,
    Rejected,
    Created,
    Done,
    Dead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChainType {
    Unknown,
    Local,
    Remote,
}

/// Allocation notification as delivered on the all-allocations and
/// per-allocation registrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AllocationEvent {
    Requested {
        #[serde(rename = "allocationInfo")]
        allocation_info: serde_json::Value,
        requirements: HashMap<String, serde_json::Value>,
    },
    Rejected {
        reason: String,
    },
    Created {
        #[serde(rename = "allocationID")]
        allocation_id: AllocationIdx,
        allocated: HashMap<String, HostId>,
    },
    Done {
        #[serde(rename = "allocationID")]
        allocation_id: AllocationIdx,
    },
    Dead {
        #[serde(rename = "allocationID")]
        allocation_id: AllocationIdx,
        reason: String,
    },
}

/// Inauguration notification as delivered on a per-host registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InaugurationEvent {
    pub id: HostId,
    #[serde(flatten)]
    pub status: InaugurationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InaugurationStatus {
    Progress { progress: InaugurationProgress },
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InaugurationProgress {
    pub state: String,
    #[serde(rename = "chainGetCount", default)]
    pub chain_get_count: Vec<u64>,
}

/// Progress states other than this one carry no chain counters.
pub const FETCHING_STATE: &str = "fetching";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_name: String,
    pub requirements: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<HostId>,
}

/// Persisted allocation lifecycle document. Created in phase `requested`
/// and updated in place on every subsequent phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation_info: serde_json::Value,
    pub nodes: Vec<NodeRecord>,
    pub nr_nodes: usize,
    pub highest_phase_reached: AllocationPhase,
    pub done: bool,
    pub reason: String,
    /// Epoch milliseconds of the request.
    pub date: u64,
    pub allocation_duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationIdx>,
    /// Epoch milliseconds, set when the allocation is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inauguration_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_duration: Option<f64>,
}

impl AllocationRecord {
    pub fn requested(
        allocation_info: serde_json::Value,
        requirements: &HashMap<String, serde_json::Value>,
    ) -> Self {
        let nodes: Vec<NodeRecord> = requirements
            .iter()
            .map(|(node_name, node_requirements)| NodeRecord {
                node_name: node_name.clone(),
                requirements: node_requirements.clone(),
                server_name: None,
            })
            .collect();
        Self {
            allocation_info,
            nr_nodes: nodes.len(),
            nodes,
            highest_phase_reached: AllocationPhase::Requested,
            done: false,
            reason: "Unknown".to_string(),
            date: get_epoch_time_in_ms(),
            allocation_duration: 0.0,
            allocation_id: None,
            creation_time: None,
            inauguration_duration: None,
            test_duration: None,
        }
    }

    /// Fills in the assigned host of every node for which the provider
    /// reported an assignment.
    pub fn bind_allocated(&mut self, allocated: &HashMap<String, HostId>) {
        for node in &mut self.nodes {
            node.server_name = allocated.get(&node.node_name).cloned();
        }
    }

    pub fn requirements_of(&self, node_name: &str) -> Option<&serde_json::Value> {
        self.nodes
            .iter()
            .find(|node| node.node_name == node_name)
            .map(|node| &node.requirements)
    }
}

/// In-memory state of a host whose inauguration is being tracked.
#[derive(Debug, Clone)]
pub struct HostState {
    pub name: String,
    pub allocation_idx: AllocationIdx,
    /// Epoch milliseconds at which the host was assigned.
    pub start_timestamp: u64,
    pub end_timestamp: Option<u64>,
    pub requirements: serde_json::Value,
    pub latest_chain_count: Option<Vec<u64>>,
    pub inauguration_done: bool,
}

impl HostState {
    pub fn new(name: String, allocation_idx: AllocationIdx, requirements: serde_json::Value) -> Self {
        Self {
            name,
            allocation_idx,
            start_timestamp: get_epoch_time_in_ms(),
            end_timestamp: None,
            requirements,
            latest_chain_count: None,
            inauguration_done: false,
        }
    }
}

/// Assigns each host a process-wide sequence number at first sight.
#[derive(Debug, Default)]
pub struct HostSequence {
    next: u64,
    assigned: HashMap<HostId, u64>,
}

impl HostSequence {
    pub fn sequence_of(&mut self, host_id: &HostId) -> u64 {
        if let Some(seq) = self.assigned.get(host_id) {
            return *seq;
        }
        let seq = self.next;
        self.next += 1;
        self.assigned.insert(host_id.clone(), seq);
        seq
    }
}

/// Persisted inauguration lifecycle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InaugurationRecord {
    /// Epoch milliseconds at which the host was assigned.
    pub date: u64,
    pub host_id: HostId,
    pub name: String,
    pub allocation_idx: AllocationIdx,
    pub inauguration_done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_store_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_store_count: Option<u64>,
    pub majority_chain_type: ChainType,
    /// Seconds from assignment to inauguration completion. Absent on
    /// partial records for hosts torn down before finishing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inauguration_period_length: Option<f64>,
    pub requirements: serde_json::Value,
}

pub fn majority_chain_type(local: Option<u64>, remote: Option<u64>) -> ChainType {
    match local {
        None => ChainType::Unknown,
        Some(local) => match remote {
            Some(remote) if local < remote => ChainType::Remote,
            _ => ChainType::Local,
        },
    }
}

impl InaugurationRecord {
    /// Derives the finished (or partial) lifecycle record and its store
    /// identifier from the accumulated host state. The identifier
    /// concatenates the assignment second, the owning allocation index and
    /// the host's sequence number, which keeps it stable within one process
    /// run and distinct for hosts assigned in the same second.
    pub fn build(host_id: &HostId, state: &HostState, sequence: u64) -> (String, Self) {
        let mut counts = state
            .latest_chain_count
            .clone()
            .unwrap_or_default()
            .into_iter();
        let local_store_count = counts.next();
        let remote_store_count = counts.next();

        let inauguration_period_length = state
            .end_timestamp
            .filter(|_| state.inauguration_done)
            .map(|end| (end.saturating_sub(state.start_timestamp)) as f64 / 1000.0);

        let id = format!(
            "{}{:03}{:05}",
            state.start_timestamp / 1000,
            state.allocation_idx.get(),
            sequence
        );
        let record = Self {
            date: state.start_timestamp,
            host_id: host_id.clone(),
            name: state.name.clone(),
            allocation_idx: state.allocation_idx,
            inauguration_done: state.inauguration_done,
            end_timestamp: state.end_timestamp,
            local_store_count,
            remote_store_count,
            majority_chain_type: majority_chain_type(local_store_count, remote_store_count),
            inauguration_period_length,
            requirements: state.requirements.clone(),
        };
        (id, record)
    }
}
