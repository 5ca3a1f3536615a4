use crate::address;

/// Physical `(channel, rank, bankgroup, bank, row, column)` target of a
/// DRAM command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub channel: usize,
    pub rank: usize,
    pub bankgroup: usize,
    pub bank: usize,
    pub row: u64,
    pub column: u64,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ch{} ra{} bg{} ba{} row {:#x} col {}",
            self.channel, self.rank, self.bankgroup, self.bank, self.row, self.column
        )
    }
}

/// Low-level DRAM command kinds the PIM scheduler negotiates with the
/// per-channel controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum CommandKind {
    PimActivate,
    PimRead,
    PimReadPrecharge,
    PimWrite,
    PimWritePrecharge,
    Precharge,
}

impl CommandKind {
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, CommandKind::PimRead | CommandKind::PimReadPrecharge)
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, CommandKind::PimWrite | CommandKind::PimWritePrecharge)
    }

    /// Whether issuing this command leaves the target row open.
    #[must_use]
    pub fn opens_row(self) -> bool {
        matches!(self, CommandKind::PimActivate)
    }

    /// Whether issuing this command closes the target row.
    #[must_use]
    pub fn closes_row(self) -> bool {
        matches!(
            self,
            CommandKind::PimReadPrecharge | CommandKind::PimWritePrecharge | CommandKind::Precharge
        )
    }
}

impl From<CommandKind> for stats::CommandKind {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::PimActivate => stats::CommandKind::PIM_ACTIVATE,
            CommandKind::PimRead => stats::CommandKind::PIM_READ,
            CommandKind::PimReadPrecharge => stats::CommandKind::PIM_READ_PRECHARGE,
            CommandKind::PimWrite => stats::CommandKind::PIM_WRITE,
            CommandKind::PimWritePrecharge => stats::CommandKind::PIM_WRITE_PRECHARGE,
            CommandKind::Precharge => stats::CommandKind::PRECHARGE,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandKind::PimActivate => "PIM_ACTIVATE",
            CommandKind::PimRead => "PIM_READ",
            CommandKind::PimReadPrecharge => "PIM_READ_PRECHARGE",
            CommandKind::PimWrite => "PIM_WRITE",
            CommandKind::PimWritePrecharge => "PIM_WRITE_PRECHARGE",
            CommandKind::Precharge => "PRECHARGE",
        };
        write!(f, "{name}")
    }
}

/// A DRAM command toward one bank of one channel.
///
/// The controller seam returns the command actually issuable toward the
/// same target (possibly an ACTIVATE or PRECHARGE prerequisite); `None`
/// at that seam is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub kind: CommandKind,
    pub addr: Address,
    pub hex_addr: address,
}

impl Command {
    #[must_use]
    pub fn new(kind: CommandKind, addr: Address, hex_addr: address) -> Self {
        Self {
            kind,
            addr,
            hex_addr,
        }
    }

    /// Same target, different kind.
    #[must_use]
    pub fn with_kind(self, kind: CommandKind) -> Self {
        Self { kind, ..self }
    }

    #[must_use]
    pub fn channel(&self) -> usize {
        self.addr.channel
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] ({:#x})", self.kind, self.addr, self.hex_addr)
    }
}
