#![allow(non_camel_case_types, clippy::missing_panics_doc)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// DRAM command kinds tracked per channel.
///
/// Mirrors the simulator-side command enum; the simulator converts into
/// this type when recording issue counts.
#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum CommandKind {
    PIM_ACTIVATE,
    PIM_READ,
    PIM_READ_PRECHARGE,
    PIM_WRITE,
    PIM_WRITE_PRECHARGE,
    PRECHARGE,
}

impl CommandKind {
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, CommandKind::PIM_READ | CommandKind::PIM_READ_PRECHARGE)
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            CommandKind::PIM_WRITE | CommandKind::PIM_WRITE_PRECHARGE
        )
    }
}

/// Per-kind command issue counts for one channel.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCounts(pub HashMap<CommandKind, u64>);

impl CommandCounts {
    pub fn inc(&mut self, kind: CommandKind) {
        *self.0.entry(kind).or_insert(0) += 1;
    }

    #[must_use]
    pub fn get(&self, kind: CommandKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    #[must_use]
    pub fn num_reads(&self) -> u64 {
        self.0
            .iter()
            .filter(|(kind, _)| kind.is_read())
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn num_writes(&self) -> u64 {
        self.0
            .iter()
            .filter(|(kind, _)| kind.is_write())
            .map(|(_, count)| count)
            .sum()
    }
}

impl std::ops::AddAssign for CommandCounts {
    fn add_assign(&mut self, other: Self) {
        for (kind, count) in other.0 {
            *self.0.entry(kind).or_insert(0) += count;
        }
    }
}

impl std::fmt::Display for CommandCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.0.iter().collect();
        kinds.sort_by_key(|(kind, _)| **kind);
        f.debug_map().entries(kinds).finish()
    }
}

/// Statistics for a single memory channel.
///
/// Used both as the cumulative, whole-run record and as the per-epoch
/// snapshot written to the epoch output file.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel: usize,
    /// Cycle at which this snapshot was taken.
    pub cycle: u64,
    /// Completed ordinary read transactions.
    pub num_reads_done: u64,
    /// Completed ordinary write transactions.
    pub num_writes_done: u64,
    /// PIM command issue counts.
    pub commands: CommandCounts,
}

impl Channel {
    #[must_use]
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }
}

impl std::ops::AddAssign for Channel {
    fn add_assign(&mut self, other: Self) {
        self.cycle = self.cycle.max(other.cycle);
        self.num_reads_done += other.num_reads_done;
        self.num_writes_done += other.num_writes_done;
        self.commands += other.commands;
    }
}
