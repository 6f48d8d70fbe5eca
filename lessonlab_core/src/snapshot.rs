//! Tagged snapshot of one module's world.
//!
//! Each module kind contributes one variant, so "the state is a plain,
//! serializable value" is a property of the type rather than a convention:
//! no variant can hold a live handle or a cycle.

use crate::modules::balancer::BalancerState;
use crate::modules::bits::BitsState;
use crate::modules::btree::BTreeState;
use crate::modules::cache::CacheState;
use crate::modules::consensus::ConsensusState;
use crate::modules::cpu::CpuState;
use crate::modules::database::DatabaseState;
use crate::modules::gates::GatesState;
use crate::modules::memory::MemoryState;
use crate::modules::request::RequestState;
use crate::modules::tcp::TcpState;
use lessonlab_env::SimError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum Snapshot {
    Bits(BitsState),
    Gates(GatesState),
    Cpu(CpuState),
    Memory(MemoryState),
    Cache(CacheState),
    Request(RequestState),
    Tcp(TcpState),
    Database(DatabaseState),
    #[serde(rename = "btree")]
    BTree(BTreeState),
    Balancer(BalancerState),
    Consensus(ConsensusState),
}

impl Snapshot {
    /// Returns the variant tag as it appears in JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Snapshot::Bits(_) => "bits",
            Snapshot::Gates(_) => "gates",
            Snapshot::Cpu(_) => "cpu",
            Snapshot::Memory(_) => "memory",
            Snapshot::Cache(_) => "cache",
            Snapshot::Request(_) => "request",
            Snapshot::Tcp(_) => "tcp",
            Snapshot::Database(_) => "database",
            Snapshot::BTree(_) => "btree",
            Snapshot::Balancer(_) => "balancer",
            Snapshot::Consensus(_) => "consensus",
        }
    }

    /// Serializes to a JSON value; failure means the module broke the
    /// snapshot contract.
    pub fn to_json(&self) -> Result<serde_json::Value, SimError> {
        serde_json::to_value(self).map_err(SimError::snapshot)
    }

    /// Serializes to a compact JSON string (used for byte-level comparison).
    pub fn to_json_string(&self) -> Result<String, SimError> {
        serde_json::to_string(self).map_err(SimError::snapshot)
    }

    pub fn as_bits(&self) -> Option<&BitsState> {
        match self {
            Snapshot::Bits(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_gates(&self) -> Option<&GatesState> {
        match self {
            Snapshot::Gates(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuState> {
        match self {
            Snapshot::Cpu(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryState> {
        match self {
            Snapshot::Memory(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_cache(&self) -> Option<&CacheState> {
        match self {
            Snapshot::Cache(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&RequestState> {
        match self {
            Snapshot::Request(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpState> {
        match self {
            Snapshot::Tcp(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_database(&self) -> Option<&DatabaseState> {
        match self {
            Snapshot::Database(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_btree(&self) -> Option<&BTreeState> {
        match self {
            Snapshot::BTree(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_balancer(&self) -> Option<&BalancerState> {
        match self {
            Snapshot::Balancer(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_consensus(&self) -> Option<&ConsensusState> {
        match self {
            Snapshot::Consensus(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::bits::{BitsConfig, BitsMachine};
    use crate::module::Machine;

    #[test]
    fn test_snapshot_json_is_tagged() {
        let machine = BitsMachine::new(BitsConfig::default());
        let snapshot = BitsMachine::snapshot(&machine.init());

        let json = snapshot.to_json().unwrap();
        assert_eq!(json["kind"], "bits");
        assert!(json["state"].is_object());
        assert_eq!(snapshot.kind(), "bits");
    }
}
