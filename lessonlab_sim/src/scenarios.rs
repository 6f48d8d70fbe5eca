//! Scripted tick/fault scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// SCN-001: 4-instruction program runs to completion in 12 ticks
    CpuProgram,

    /// SCN-002: sequential addresses 0..7, two cold misses
    CacheSequential,

    /// SCN-003: one partitioned node, commits continue
    PartitionMinority,

    /// SCN-004: three of five partitioned, commits stall until healed
    PartitionMajority,

    /// SCN-005: aliasing stride misses on every access
    CacheThrash,

    /// SCN-006: B-tree grows only by root splits
    BTreeGrowth,

    /// SCN-007: dropped packet is retransmitted
    TcpRetransmit,

    /// SCN-008: killed servers under a spike drop requests, then recover
    BalancerCrash,

    /// SCN-009: reset replays every module byte for byte
    ResetReplay,

    /// SCN-010: power loss wipes RAM; the program reloads from SSD
    MemoryPowerLoss,

    /// SCN-011: slow queries dominate request latency; a 500 skips the database
    RequestSlowQuery,

    /// SCN-012: dropping the city index turns lookups into full scans
    DatabaseIndex,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::CpuProgram,
            ScenarioId::CacheSequential,
            ScenarioId::PartitionMinority,
            ScenarioId::PartitionMajority,
            ScenarioId::CacheThrash,
            ScenarioId::BTreeGrowth,
            ScenarioId::TcpRetransmit,
            ScenarioId::BalancerCrash,
            ScenarioId::ResetReplay,
            ScenarioId::MemoryPowerLoss,
            ScenarioId::RequestSlowQuery,
            ScenarioId::DatabaseIndex,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::CpuProgram => "cpu_program",
            ScenarioId::CacheSequential => "cache_sequential",
            ScenarioId::PartitionMinority => "partition_minority",
            ScenarioId::PartitionMajority => "partition_majority",
            ScenarioId::CacheThrash => "cache_thrash",
            ScenarioId::BTreeGrowth => "btree_growth",
            ScenarioId::TcpRetransmit => "tcp_retransmit",
            ScenarioId::BalancerCrash => "balancer_crash",
            ScenarioId::ResetReplay => "reset_replay",
            ScenarioId::MemoryPowerLoss => "memory_power_loss",
            ScenarioId::RequestSlowQuery => "request_slow_query",
            ScenarioId::DatabaseIndex => "database_index",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::CpuProgram => "R0=5; R1=3; R2=R0+R1; R3=R2 -> R3 == 8 and halted after 12 steps",
            ScenarioId::CacheSequential => "8 sequential accesses with 4-byte lines: 2 misses, 6 hits",
            ScenarioId::PartitionMinority => "5 nodes, partition node 4, 3 steps: every step commits",
            ScenarioId::PartitionMajority => "5 nodes, partition 3: no commits until heal_partition",
            ScenarioId::CacheThrash => "pathological stride: every access aliases to one set and misses",
            ScenarioId::BTreeGrowth => "insert keys plus an ascending burst: height grows only on root splits",
            ScenarioId::TcpRetransmit => "drop a packet in flight: HELLO still arrives after a retransmit",
            ScenarioId::BalancerCrash => "spike plus a killed server overflows the backlog; recovery drains it",
            ScenarioId::ResetReplay => "every module: reset + same script = identical snapshots",
            ScenarioId::MemoryPowerLoss => "program reaches the CPU, power cut empties RAM, reload takes three hops",
            ScenarioId::RequestSlowQuery => "slow_query multiplies latency; server_error answers 500 without a query",
            ScenarioId::DatabaseIndex => "city lookup examines 3 rows with the index, every row without it",
        }
    }

    /// Module the scenario mounts, if it targets a single one.
    pub fn module(&self) -> Option<&'static str> {
        match self {
            ScenarioId::CpuProgram => Some("cpu"),
            ScenarioId::CacheSequential | ScenarioId::CacheThrash => Some("cache"),
            ScenarioId::PartitionMinority | ScenarioId::PartitionMajority => Some("consensus"),
            ScenarioId::BTreeGrowth => Some("btree"),
            ScenarioId::TcpRetransmit => Some("tcp"),
            ScenarioId::BalancerCrash => Some("balancer"),
            ScenarioId::MemoryPowerLoss => Some("memory"),
            ScenarioId::RequestSlowQuery => Some("request"),
            ScenarioId::DatabaseIndex => Some("database"),
            ScenarioId::ResetReplay => None,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu_program" | "cpu" | "scn-001" => Ok(ScenarioId::CpuProgram),
            "cache_sequential" | "scn-002" => Ok(ScenarioId::CacheSequential),
            "partition_minority" | "scn-003" => Ok(ScenarioId::PartitionMinority),
            "partition_majority" | "scn-004" => Ok(ScenarioId::PartitionMajority),
            "cache_thrash" | "scn-005" => Ok(ScenarioId::CacheThrash),
            "btree_growth" | "btree" | "scn-006" => Ok(ScenarioId::BTreeGrowth),
            "tcp_retransmit" | "tcp" | "scn-007" => Ok(ScenarioId::TcpRetransmit),
            "balancer_crash" | "balancer" | "scn-008" => Ok(ScenarioId::BalancerCrash),
            "reset_replay" | "scn-009" => Ok(ScenarioId::ResetReplay),
            "memory_power_loss" | "memory" | "scn-010" => Ok(ScenarioId::MemoryPowerLoss),
            "request_slow_query" | "request" | "scn-011" => Ok(ScenarioId::RequestSlowQuery),
            "database_index" | "database" | "scn-012" => Ok(ScenarioId::DatabaseIndex),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("SCN-004".parse::<ScenarioId>(), Ok(ScenarioId::PartitionMajority));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
