use crate::{
    address,
    command::{Command, CommandKind},
    config::Config,
    transaction::Transaction,
};
use std::collections::VecDeque;

/// Direction of a completed transaction handed back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDir {
    Read,
    Write,
}

/// Per-channel controller seam.
///
/// The PIM scheduler negotiates every command it wants to issue through
/// [`get_ready_command`](ChannelController::get_ready_command): the
/// controller answers with the command actually issuable toward the same
/// target (possibly an ACTIVATE or PRECHARGE prerequisite) or `None` when
/// nothing can issue this cycle. Committed batches are handed over through
/// the three typed submit entry points; how a controller queues and
/// schedules them internally is its own concern.
pub trait ChannelController: Send + Sync + 'static {
    fn as_any(&self) -> &dyn std::any::Any;

    fn get_ready_command(&self, cmd: &Command, clk: u64) -> Option<Command>;

    /// Pull one completed ordinary transaction, if any.
    fn return_done_transaction(&mut self, clk: u64) -> Option<(address, AccessDir)>;

    #[must_use]
    fn will_accept_transaction(&self, addr: address, is_write: bool) -> bool;

    fn add_transaction(&mut self, trans: Transaction);

    fn cycle(&mut self, clk: u64);

    /// A refresh will start within the ACTIVATE-suppression window.
    #[must_use]
    fn refresh_imminent(&self) -> bool;

    /// A refresh will start within the extended (tile-pausing) window.
    #[must_use]
    fn refresh_imminent_extended(&self) -> bool;

    #[must_use]
    fn in_refresh(&self) -> bool;

    fn set_multitenant(&mut self, multitenant: bool);

    fn push_weight_command(&mut self, cmd: Command);
    fn push_input_command(&mut self, cmd: Command, release_time: u64);
    fn push_output_command(&mut self, cmd: Command);

    /// Snapshot and reset the running epoch statistics.
    fn take_epoch_stats(&mut self, clk: u64) -> stats::Channel;

    /// Cumulative whole-run statistics.
    fn final_stats(&self, clk: u64) -> stats::Channel;
}

/// Minimal open-row controller model.
///
/// Tracks per-bank open rows to answer ready-command negotiation, serves
/// ordinary transactions at a fixed latency and opens a periodic refresh
/// window. Submitted PIM batches take effect synchronously; it models no
/// DRAM timing beyond that. A timing-accurate controller plugs in behind
/// the same trait.
#[derive(Debug)]
pub struct SimpleController {
    pub channel: usize,
    banks_per_group: usize,
    latency: u64,
    queue_depth: usize,

    open_rows: Vec<Option<u64>>,
    trans_queue: VecDeque<Transaction>,

    refresh_interval: u64,
    t_rfc: u64,
    pre_window: u64,
    ext_window: u64,
    cycles_to_refresh: u64,
    in_refresh_remaining: u64,

    multitenant: bool,

    totals: stats::Channel,
    epoch: stats::Channel,
}

impl SimpleController {
    #[must_use]
    pub fn new(channel: usize, config: &Config) -> Self {
        Self {
            channel,
            banks_per_group: config.banks_per_group,
            latency: config.ideal_memory_latency,
            queue_depth: config.trans_queue_depth,
            open_rows: vec![None; config.banks()],
            trans_queue: VecDeque::new(),
            refresh_interval: config.refresh_interval,
            t_rfc: config.t_rfc,
            pre_window: config.refresh_pre_window,
            ext_window: config.refresh_ext_window,
            cycles_to_refresh: config.refresh_interval,
            in_refresh_remaining: 0,
            multitenant: false,
            totals: stats::Channel::new(channel),
            epoch: stats::Channel::new(channel),
        }
    }

    fn bank_index(&self, cmd: &Command) -> usize {
        cmd.addr.bankgroup * self.banks_per_group + cmd.addr.bank
    }

    #[must_use]
    pub fn multitenant(&self) -> bool {
        self.multitenant
    }

    #[must_use]
    pub fn open_row(&self, bankgroup: usize, bank: usize) -> Option<u64> {
        self.open_rows[bankgroup * self.banks_per_group + bank]
    }

    fn refresh_enabled(&self) -> bool {
        self.refresh_interval != 0
    }

    fn record(&mut self, kind: CommandKind) {
        self.totals.commands.inc(kind.into());
        self.epoch.commands.inc(kind.into());
    }

    /// Apply a committed command's effect on bank state.
    fn apply(&mut self, cmd: &Command) {
        let bank = self.bank_index(cmd);
        if cmd.kind.opens_row() {
            self.open_rows[bank] = Some(cmd.addr.row);
        } else if cmd.kind.closes_row() {
            self.open_rows[bank] = None;
        }
        self.record(cmd.kind);
        log::trace!("ctrl {}: issue {}", self.channel, cmd);
    }
}

impl ChannelController for SimpleController {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn get_ready_command(&self, cmd: &Command, _clk: u64) -> Option<Command> {
        if self.in_refresh() || self.refresh_imminent() {
            return None;
        }
        let bank = self.bank_index(cmd);
        match self.open_rows[bank] {
            None => Some(cmd.with_kind(CommandKind::PimActivate)),
            Some(row) if row == cmd.addr.row => Some(*cmd),
            Some(_) => Some(cmd.with_kind(CommandKind::Precharge)),
        }
    }

    fn return_done_transaction(&mut self, clk: u64) -> Option<(address, AccessDir)> {
        let trans = self.trans_queue.front()?;
        if clk < trans.added_cycle + self.latency {
            return None;
        }
        let trans = self.trans_queue.pop_front()?;
        let dir = if trans.is_write {
            self.totals.num_writes_done += 1;
            self.epoch.num_writes_done += 1;
            AccessDir::Write
        } else {
            self.totals.num_reads_done += 1;
            self.epoch.num_reads_done += 1;
            AccessDir::Read
        };
        Some((trans.addr, dir))
    }

    fn will_accept_transaction(&self, _addr: address, _is_write: bool) -> bool {
        self.trans_queue.len() < self.queue_depth
    }

    fn add_transaction(&mut self, trans: Transaction) {
        self.trans_queue.push_back(trans);
    }

    fn cycle(&mut self, _clk: u64) {
        if !self.refresh_enabled() {
            return;
        }
        if self.in_refresh_remaining > 0 {
            self.in_refresh_remaining -= 1;
            if self.in_refresh_remaining == 0 {
                self.cycles_to_refresh = self.refresh_interval;
            }
        } else if self.cycles_to_refresh == 0 {
            self.in_refresh_remaining = self.t_rfc;
            for row in &mut self.open_rows {
                *row = None;
            }
            log::trace!("ctrl {}: refresh window opens", self.channel);
        } else {
            self.cycles_to_refresh -= 1;
        }
    }

    fn refresh_imminent(&self) -> bool {
        self.refresh_enabled()
            && self.in_refresh_remaining == 0
            && self.cycles_to_refresh <= self.pre_window
    }

    fn refresh_imminent_extended(&self) -> bool {
        self.refresh_enabled()
            && self.in_refresh_remaining == 0
            && self.cycles_to_refresh <= self.ext_window
    }

    fn in_refresh(&self) -> bool {
        self.in_refresh_remaining > 0
    }

    fn set_multitenant(&mut self, multitenant: bool) {
        self.multitenant = multitenant;
    }

    fn push_weight_command(&mut self, cmd: Command) {
        self.apply(&cmd);
    }

    fn push_input_command(&mut self, cmd: Command, _release_time: u64) {
        self.apply(&cmd);
    }

    fn push_output_command(&mut self, cmd: Command) {
        self.apply(&cmd);
    }

    fn take_epoch_stats(&mut self, clk: u64) -> stats::Channel {
        let mut epoch = std::mem::replace(&mut self.epoch, stats::Channel::new(self.channel));
        epoch.cycle = clk;
        epoch
    }

    fn final_stats(&self, clk: u64) -> stats::Channel {
        let mut totals = self.totals.clone();
        totals.cycle = clk;
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessDir, ChannelController};
    use crate::command::{Address, Command, CommandKind};

    fn config() -> crate::config::Config {
        crate::config::Config {
            refresh_interval: 0,
            ideal_memory_latency: 10,
            ..crate::config::Config::default()
        }
    }

    fn read_cmd(bankgroup: usize, bank: usize, row: u64) -> Command {
        let addr = Address {
            channel: 0,
            rank: 0,
            bankgroup,
            bank,
            row,
            column: 0,
        };
        Command::new(CommandKind::PimRead, addr, 0)
    }

    #[test]
    fn test_open_row_negotiation() {
        let mut ctrl = super::SimpleController::new(0, &config());
        let want = read_cmd(1, 0, 7);

        // closed bank: prerequisite ACTIVATE
        let ready = ctrl.get_ready_command(&want, 0).unwrap();
        assert_eq!(ready.kind, CommandKind::PimActivate);
        ctrl.push_weight_command(ready);
        assert_eq!(ctrl.open_row(1, 0), Some(7));

        // matching open row: the requested command
        let ready = ctrl.get_ready_command(&want, 1).unwrap();
        assert_eq!(ready.kind, CommandKind::PimRead);

        // conflicting open row: prerequisite PRECHARGE
        let conflict = read_cmd(1, 0, 9);
        let ready = ctrl.get_ready_command(&conflict, 2).unwrap();
        assert_eq!(ready.kind, CommandKind::Precharge);

        // read-precharge closes the row again
        ctrl.push_weight_command(want.with_kind(CommandKind::PimReadPrecharge));
        assert_eq!(ctrl.open_row(1, 0), None);
    }

    #[test]
    fn test_refresh_windows() {
        let mut ctrl = super::SimpleController::new(
            0,
            &crate::config::Config {
                refresh_interval: 20,
                t_rfc: 5,
                refresh_pre_window: 2,
                refresh_ext_window: 4,
                ..crate::config::Config::default()
            },
        );
        // open a row so we can observe the refresh closing it
        ctrl.push_weight_command(read_cmd(0, 0, 3).with_kind(CommandKind::PimActivate));

        let mut saw_pre = false;
        let mut saw_ext = false;
        let mut saw_ref = false;
        for clk in 0..40 {
            if ctrl.refresh_imminent() {
                saw_pre = true;
                assert!(ctrl.refresh_imminent_extended());
                assert!(ctrl.get_ready_command(&read_cmd(0, 0, 3), clk).is_none());
            }
            if ctrl.refresh_imminent_extended() {
                saw_ext = true;
            }
            if ctrl.in_refresh() {
                saw_ref = true;
                assert_eq!(ctrl.open_row(0, 0), None);
            }
            ctrl.cycle(clk);
        }
        assert!(saw_pre && saw_ext && saw_ref);
    }

    #[test]
    fn test_done_transactions_after_latency() {
        let mut ctrl = super::SimpleController::new(0, &config());
        let mut trans = crate::transaction::Transaction::new(0x80, false);
        trans.added_cycle = 5;
        assert!(ctrl.will_accept_transaction(0x80, false));
        ctrl.add_transaction(trans);

        assert_eq!(ctrl.return_done_transaction(14), None);
        assert_eq!(ctrl.return_done_transaction(15), Some((0x80, AccessDir::Read)));
        assert_eq!(ctrl.return_done_transaction(16), None);

        let stats = ctrl.final_stats(20);
        assert_eq!(stats.num_reads_done, 1);
    }
}
