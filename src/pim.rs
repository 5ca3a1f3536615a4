use crate::{
    command::{Address, Command, CommandKind},
    config::{AddressMapping, Config},
    controller::ChannelController,
    transaction::{CutCommand, LoadKind, PimOp},
};
use bitvec::{order::Lsb0, view::BitView};
use color_eyre::eyre;
use console::style;
use itertools::Itertools;
use smallvec::SmallVec;
use std::sync::Arc;

/// Processing elements along one DRAM row.
pub const PES_PER_ROW: usize = 128;
/// Processing elements served by one bank's IO.
pub const PES_PER_BANK_IO: usize = 16;
/// Upper bound on the M-dimension tile a CUTTING may configure.
pub const MAX_M_TILE_SIZE: usize = 2048;

pub type CommandBatch = SmallVec<[Command; 16]>;

/// Commands emitted by one tile step, split by operand category.
#[derive(Debug, Default)]
pub struct TileBatches {
    pub weight: CommandBatch,
    pub input: CommandBatch,
    pub output: CommandBatch,
}

/// Tile grid configured by the most recent CUTTING transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutGrid {
    pub vcuts: usize,
    pub hcuts: usize,
    pub mcf: usize,
    pub ucf: usize,
    pub mc: usize,
    pub df: usize,
    pub m_tile_size: usize,
    pub vcuts_next: usize,
    pub hcuts_next: usize,
    pub kernel_size: usize,
    pub stride: usize,
}

impl CutGrid {
    #[must_use]
    pub fn cuts(&self) -> usize {
        self.vcuts * self.hcuts
    }
}

impl From<CutCommand> for CutGrid {
    fn from(cut: CutCommand) -> Self {
        Self {
            vcuts: cut.vcuts,
            hcuts: cut.hcuts,
            mcf: cut.mcf,
            ucf: cut.ucf,
            mc: cut.mcf * cut.ucf,
            df: cut.df,
            m_tile_size: cut.m_tile_size,
            vcuts_next: cut.vcuts_next,
            hcuts_next: cut.hcuts_next,
            kernel_size: cut.kernel_size,
            stride: cut.stride,
        }
    }
}

/// Per-step tile geometry, derived from the grid and the tile's cursors.
#[derive(Debug, Clone, Copy)]
struct TileGeometry {
    vcut_no: usize,
    hcut_no: usize,
    cut_height: usize,
    cut_width: usize,
    n_tile_size: u64,
    n_tile_it: u64,
    m_tile_size: u64,
    m_tile_it: u64,
    m_current_tile_size: u64,
    k_tile_size: u64,
    weight_banks_reduce: usize,
}

/// The PIM scheduler: decodes configuration transactions and drives the
/// per-tile weight-fetch → input-feed → output-write state machines.
///
/// Per-tile state lives in parallel vectors of primitives indexed by tile
/// id; a CUTTING transaction resizes all of them at once.
pub struct PimScheduler {
    config: Arc<Config>,
    mapping: AddressMapping,
    grid: Option<CutGrid>,

    pub m: Vec<u64>,
    pub n: Vec<u64>,
    pub k: Vec<u64>,
    pub base_rows_w: Vec<u64>,
    pub base_rows_in: Vec<u64>,
    pub base_rows_out: Vec<u64>,
    pub m_it: Vec<u64>,
    pub k_tile_it: Vec<u64>,
    pub n_it: Vec<u64>,
    pub m_out_it: Vec<u64>,
    pub n_out_tile_it: Vec<u64>,
    pub in_pim: Vec<bool>,
    /// Tile phase: 0 fetch-weight, 1 weight-done, 2 feed-input, 3 input-done.
    pub iw_status: Vec<u8>,
    pub in_cnt: Vec<i64>,
    pub out_cnt: Vec<i64>,
    pub vpu_cnt: Vec<i64>,
    pub output_valid: Vec<i64>,
    pub in_act_placed: Vec<bool>,
    pub w_act_placed: Vec<bool>,
    pub out_act_placed: Vec<bool>,

    /// Set when the last active tile finishes writing outputs.
    pub turn_off: bool,
}

impl PimScheduler {
    pub fn new(config: Arc<Config>) -> eyre::Result<Self> {
        let mapping = AddressMapping::new(&config)?;
        Ok(Self {
            config,
            mapping,
            grid: None,
            m: Vec::new(),
            n: Vec::new(),
            k: Vec::new(),
            base_rows_w: Vec::new(),
            base_rows_in: Vec::new(),
            base_rows_out: Vec::new(),
            m_it: Vec::new(),
            k_tile_it: Vec::new(),
            n_it: Vec::new(),
            m_out_it: Vec::new(),
            n_out_tile_it: Vec::new(),
            in_pim: Vec::new(),
            iw_status: Vec::new(),
            in_cnt: Vec::new(),
            out_cnt: Vec::new(),
            vpu_cnt: Vec::new(),
            output_valid: Vec::new(),
            in_act_placed: Vec::new(),
            w_act_placed: Vec::new(),
            out_act_placed: Vec::new(),
            turn_off: false,
        })
    }

    /// Number of concurrently configured tiles (0 before the first CUTTING).
    #[must_use]
    pub fn cuts(&self) -> usize {
        self.grid.map_or(0, |grid| grid.cuts())
    }

    #[must_use]
    pub fn configured(&self) -> bool {
        self.grid.is_some()
    }

    #[must_use]
    pub fn grid(&self) -> Option<CutGrid> {
        self.grid
    }

    /// Refresh interlock: force every category to re-assert its ACTIVATE.
    pub fn clear_act_placed(&mut self) {
        self.in_act_placed.fill(false);
        self.w_act_placed.fill(false);
        self.out_act_placed.fill(false);
    }

    /// Apply one decoded PIM transaction. Returns whether it was consumed;
    /// a COMPUTE naming an unconfigured tile stays at the queue front.
    pub fn apply(&mut self, op: &PimOp, ctrls: &mut [Box<dyn ChannelController>]) -> bool {
        match *op {
            PimOp::Compute { mask } => {
                let cuts = self.cuts();
                let bits = mask.view_bits::<Lsb0>();
                let configured = bits
                    .iter_ones()
                    .filter(|&i| i < cuts)
                    .all(|i| self.m[i] != 0 && self.n[i] != 0 && self.k[i] != 0);
                if !configured {
                    return false;
                }
                for i in bits.iter_ones().filter(|&i| i < cuts) {
                    self.in_pim[i] = true;
                    log::debug!("tile {i} enters PIM mode");
                }
                true
            }
            PimOp::Cutting(cut) => {
                assert!(
                    cut.m_tile_size <= MAX_M_TILE_SIZE,
                    "M tile size {} exceeds {MAX_M_TILE_SIZE}",
                    cut.m_tile_size
                );
                let grid = CutGrid::from(cut);
                let cuts = grid.cuts();
                self.m = vec![0; cuts];
                self.n = vec![0; cuts];
                self.k = vec![0; cuts];
                self.base_rows_w = vec![0; cuts];
                self.base_rows_in = vec![0; cuts];
                self.base_rows_out = vec![0; cuts];
                self.m_it = vec![0; cuts];
                self.k_tile_it = vec![0; cuts];
                self.n_it = vec![0; cuts];
                self.m_out_it = vec![0; cuts];
                self.n_out_tile_it = vec![0; cuts];
                self.in_pim = vec![false; cuts];
                self.iw_status = vec![0; cuts];
                self.in_cnt = vec![0; cuts];
                self.out_cnt = vec![-1; cuts];
                self.vpu_cnt = vec![0; cuts];
                self.output_valid = vec![0; cuts];
                self.in_act_placed = vec![false; cuts];
                self.w_act_placed = vec![false; cuts];
                self.out_act_placed = vec![false; cuts];
                if cuts > 1 {
                    for ctrl in ctrls.iter_mut() {
                        ctrl.set_multitenant(true);
                    }
                }
                log::debug!(
                    "cutting: {}x{} tiles, mc={}, df={}, M tile {}",
                    grid.vcuts,
                    grid.hcuts,
                    grid.mc,
                    grid.df,
                    grid.m_tile_size
                );
                self.grid = Some(grid);
                true
            }
            PimOp::Load {
                cut_no,
                kind,
                dim_value,
                base_row,
            } => {
                assert!(
                    cut_no < self.m.len(),
                    "LOAD for tile {cut_no} before CUTTING"
                );
                match kind {
                    LoadKind::Weight => {
                        self.m[cut_no] = dim_value;
                        self.base_rows_w[cut_no] = base_row;
                    }
                    LoadKind::Output => {
                        self.k[cut_no] = dim_value;
                        self.base_rows_out[cut_no] = base_row;
                    }
                    LoadKind::Input => {
                        self.n[cut_no] = dim_value;
                        self.base_rows_in[cut_no] = base_row;
                    }
                }
                true
            }
        }
    }

    fn geometry(&self, i: usize, grid: CutGrid) -> TileGeometry {
        let cut_height = self.config.channels / grid.hcuts;
        let m_tile_size = grid.m_tile_size as u64;
        let m_tile_it = self.m_it[i] / m_tile_size;
        let n_tile_size = (PES_PER_ROW / grid.vcuts) as u64;
        TileGeometry {
            vcut_no: i % grid.vcuts,
            hcut_no: i / grid.vcuts,
            cut_height,
            cut_width: self.config.banks() / grid.vcuts,
            n_tile_size,
            n_tile_it: self.n_it[i] / n_tile_size,
            m_tile_size,
            m_tile_it,
            m_current_tile_size: if self.m[i] < m_tile_size * (m_tile_it + 1) {
                self.m[i] % m_tile_size
            } else {
                m_tile_size
            },
            k_tile_size: ((cut_height * PES_PER_BANK_IO) as u64).min(self.k[i]),
            weight_banks_reduce: if grid.df == 1 { 16 } else { 1 },
        }
    }

    fn operand_address(
        &self,
        channel: usize,
        bank_flat: usize,
        base_row: u64,
        col_offset: u64,
    ) -> Address {
        let cpb = self.config.columns_per_burst() as u64;
        Address {
            channel,
            rank: 0,
            bankgroup: bank_flat / self.config.banks_per_group,
            bank: bank_flat % self.config.banks_per_group,
            row: base_row + col_offset / cpb,
            column: col_offset % cpb,
        }
    }

    /// Advance tile `i` by one cycle.
    ///
    /// Builds this cycle's candidate batches, negotiating each command with
    /// the owning channel controller; cursor updates only happen when the
    /// batch commits. The caller routes the returned batches into the
    /// controllers' typed queues.
    pub fn tile_cycle(
        &mut self,
        i: usize,
        ctrls: &[Box<dyn ChannelController>],
        clk: u64,
        wait_refresh: bool,
    ) -> TileBatches {
        let Some(grid) = self.grid else {
            return TileBatches::default();
        };
        let geom = self.geometry(i, grid);
        let mut batches = TileBatches::default();
        let output_ready = self.iw_status[i] == 3;

        match self.iw_status[i] {
            0 => batches.weight = self.fetch_weight(i, grid, &geom, ctrls, clk, wait_refresh),
            1 => self.weight_done(i, grid.cuts()),
            2 => batches.input = self.feed_input(i, grid, &geom, ctrls, clk, wait_refresh),
            3 => self.input_done(i),
            other => unreachable!("invalid tile phase {other}"),
        }

        if self.out_cnt[i] == 0 {
            self.output_valid[i] += 1;
        }
        if self.out_cnt[i] != -1 {
            self.out_cnt[i] -= 1;
        }

        let out_enable = geom.cut_height / grid.vcuts > 0 || geom.vcut_no % 2 == 0;
        if self.output_valid[i] > 0 && output_ready && out_enable {
            batches.output = self.emit_output(i, grid, &geom, ctrls, clk, wait_refresh);
        }
        batches
    }

    /// Phase 0: stream one weight column group per cycle across the tile's
    /// banks.
    fn fetch_weight(
        &mut self,
        i: usize,
        grid: CutGrid,
        geom: &TileGeometry,
        ctrls: &[Box<dyn ChannelController>],
        clk: u64,
        wait_refresh: bool,
    ) -> CommandBatch {
        let cpb = self.config.columns_per_burst() as u64;
        let banks_per_cut = geom.cut_width / geom.weight_banks_reduce;
        if banks_per_cut == 0 {
            return CommandBatch::new();
        }
        let n_tile_size_per_bank = self
            .n[i]
            .min((geom.n_tile_size - 1) / banks_per_cut as u64 + 1);
        let k_tiles = (self.k[i] - 1) / geom.k_tile_size + 1;
        let col_offset = geom.n_tile_it * (n_tile_size_per_bank * k_tiles)
            + self.k_tile_it[i] * n_tile_size_per_bank
            + self.n_it[i] % geom.n_tile_size;
        let close_every = self
            .n[i]
            .min(((PES_PER_ROW / self.config.banks()).max(1) * geom.weight_banks_reduce) as u64);

        let mut batch = CommandBatch::new();
        'build: for j in 0..geom.cut_height {
            for k in 0..banks_per_cut {
                let channel = geom.hcut_no * geom.cut_height + j;
                let bank_flat = geom.vcut_no * geom.cut_width + k * geom.weight_banks_reduce;
                let addr = self.operand_address(channel, bank_flat, self.base_rows_w[i], col_offset);
                let kind = if (addr.column + 1) % close_every == 0 || (addr.column + 1) % cpb == 0 {
                    CommandKind::PimReadPrecharge
                } else {
                    CommandKind::PimRead
                };
                let want = Command::new(kind, addr, self.mapping.hex_address(addr));
                let Some(ready) = ctrls[channel].get_ready_command(&want, clk) else {
                    batch.clear();
                    break 'build;
                };
                if batch.first().is_some_and(|first| first.kind != ready.kind) {
                    batch.clear();
                    break 'build;
                }
                batch.push(ready);
            }
        }
        if batch.is_empty() {
            return batch;
        }

        let leader = batch[0].kind;
        if leader == CommandKind::PimActivate {
            if self.w_act_placed[i] || wait_refresh {
                batch.clear();
                return batch;
            }
            self.w_act_placed[i] = true;
            return batch;
        }
        if leader == CommandKind::PimReadPrecharge {
            self.w_act_placed[i] = false;
        }
        if grid.df == 1 && leader == CommandKind::Precharge {
            batch.clear();
            return batch;
        }
        if leader.is_read() {
            self.n_it[i] += 1;
            if self.n_it[i] % n_tile_size_per_bank == 0
                && (geom.n_tile_size == n_tile_size_per_bank
                    || self.n_it[i] % geom.n_tile_size != 0)
            {
                self.n_it[i] = geom.n_tile_size * geom.n_tile_it;
                self.iw_status[i] += 1;
            }
        }
        batch
    }

    /// Phase 1: hand over to the input feed once the array has its weights.
    ///
    /// At `cuts == 1` the advance is reverted while any entry of the phase
    /// vector still fetches weights or drains inputs, keeping single-tile
    /// runs in lockstep.
    fn weight_done(&mut self, i: usize, cuts: usize) {
        self.iw_status[i] += 1;
        self.vpu_cnt[i] = 1;
        if cuts == 1 && self.iw_status.iter().any(|&phase| phase == 0 || phase == 3) {
            self.iw_status[i] -= 1;
        }
    }

    /// Phase 2: stream input columns; arms the output and input-drain
    /// counters at tile boundaries.
    fn feed_input(
        &mut self,
        i: usize,
        grid: CutGrid,
        geom: &TileGeometry,
        ctrls: &[Box<dyn ChannelController>],
        clk: u64,
        wait_refresh: bool,
    ) -> CommandBatch {
        self.vpu_cnt[i] = (self.vpu_cnt[i] - 1).max(0);

        let cpb = self.config.columns_per_burst() as u64;
        let k_tiles = (self.k[i] - 1) / geom.k_tile_size + 1;
        let col_offset = geom.m_tile_it * (geom.m_tile_size * k_tiles)
            + self.k_tile_it[i] * geom.m_current_tile_size
            + self.m_it[i] % geom.m_tile_size;

        let mut mixed = false;
        let mut batch = CommandBatch::new();
        for j in 0..geom.cut_height {
            for k in 0..grid.mc {
                let channel = geom.hcut_no * geom.cut_height + j;
                let bank_flat = geom.vcut_no * geom.cut_width + k * (geom.cut_width / grid.mc);
                let addr =
                    self.operand_address(channel, bank_flat, self.base_rows_in[i], col_offset);
                let mut close = self.m_it[i] + 1 == self.m[i];
                if grid.df == 1 {
                    close = close && (self.k_tile_it[i] + 1) * geom.k_tile_size >= self.k[i];
                }
                let kind = if addr.column == cpb - 1 || close {
                    CommandKind::PimReadPrecharge
                } else {
                    CommandKind::PimRead
                };
                let want = Command::new(kind, addr, self.mapping.hex_address(addr));
                match ctrls[channel].get_ready_command(&want, clk) {
                    None => {
                        batch.clear();
                        break;
                    }
                    Some(ready) => {
                        if batch.first().is_some_and(|first| first.kind != ready.kind) {
                            mixed = true;
                        }
                        batch.push(ready);
                    }
                }
            }
        }

        if grid.cuts() > 1 {
            let channels_covered = batch.iter().map(Command::channel).unique().count();
            if channels_covered != geom.cut_height {
                batch.clear();
                return batch;
            }
        }
        if mixed {
            // only the prerequisite ACTIVATEs/PRECHARGEs may issue together
            batch.retain(|cmd| !cmd.kind.is_read());
        }
        if batch.is_empty() {
            return batch;
        }

        let leader = batch[0].kind;
        if leader == CommandKind::PimActivate {
            if (!mixed && self.in_act_placed[i]) || wait_refresh {
                batch.clear();
                return batch;
            }
            self.in_act_placed[i] = true;
            return batch;
        }
        if leader == CommandKind::PimReadPrecharge {
            self.in_act_placed[i] = false;
        }
        if self.vpu_cnt[i] != 0 {
            batch.clear();
            return batch;
        }
        if leader.is_read() {
            assert!(
                geom.m_tile_size > (PES_PER_ROW / grid.vcuts) as u64,
                "M tile must exceed the per-cut PE row"
            );
            if (self.k_tile_it[i] + 1) * geom.k_tile_size >= self.k[i]
                && self.m_it[i] % geom.m_tile_size == 0
            {
                self.out_cnt[i] = output_delay(&self.config);
            }
            self.m_it[i] += 1;
            if self.m_it[i] % geom.m_tile_size == 0 || self.m_it[i] == self.m[i] {
                self.in_cnt[i] = input_drain_delay(&self.config, grid);
                self.iw_status[i] += 1;
                self.m_it[i] = geom.m_tile_size * geom.m_tile_it;
                self.k_tile_it[i] += 1;
                if self.k_tile_it[i] * geom.k_tile_size >= self.k[i] {
                    self.k_tile_it[i] = 0;
                    self.n_it[i] = geom.n_tile_size * (geom.n_tile_it + 1);
                    if self.n_it[i] >= self.n[i] {
                        self.n_it[i] = 0;
                        self.m_it[i] = geom.m_tile_size * (geom.m_tile_it + 1);
                        if self.m_it[i] >= self.m[i] {
                            log::debug!(
                                "{clk}: tile {} finished feeding inputs",
                                style(i).cyan()
                            );
                            self.in_cnt[i] = -1;
                        }
                    }
                }
            }
        }
        batch
    }

    /// Phase 3: wait out the drain counter, then start the next weight
    /// fetch once no output batch is pending.
    fn input_done(&mut self, i: usize) {
        if self.in_cnt[i] == -1 {
            return;
        }
        self.in_cnt[i] = (self.in_cnt[i] - 1).max(0);
        if self.in_cnt[i] == 0 && self.output_valid[i] == 0 {
            self.iw_status[i] = 0;
        }
    }

    /// Write back one output column group toward the permuted output cut.
    fn emit_output(
        &mut self,
        i: usize,
        grid: CutGrid,
        geom: &TileGeometry,
        ctrls: &[Box<dyn ChannelController>],
        clk: u64,
        wait_refresh: bool,
    ) -> CommandBatch {
        let cpb = self.config.columns_per_burst() as u64;
        let vcuts = grid.vcuts as u64;

        let vcut_out_no = if self.m[i] == 1 {
            geom.vcut_no
        } else if grid.vcuts == 16 {
            geom.vcut_no / 2
        } else {
            (geom.vcut_no + self.n_out_tile_it[i] as usize) % grid.vcuts
        };
        let m_tile_size_out = if grid.df == 1 {
            (geom.m_tile_size / PES_PER_ROW as u64) * grid.mcf as u64
        } else {
            geom.m_tile_size
        };
        let m_out = if grid.df == 1 {
            (self.m[i] * grid.mcf as u64 / PES_PER_ROW as u64).max(1)
        } else {
            self.m[i]
        };
        let m_out_tile_it = self.m_out_it[i] / m_tile_size_out;
        let m_out_current_tile_size = if m_out < m_tile_size_out * (m_out_tile_it + 1) {
            m_out % m_tile_size_out
        } else {
            m_tile_size_out
        };
        let n_out = if grid.df == 1 {
            PES_PER_ROW as u64
        } else {
            self.n[i]
        };
        let n_tile_size_out = if grid.df == 1 {
            PES_PER_ROW as u64
        } else {
            geom.n_tile_size
        };
        let n_tile_num = (self.n[i] - 1) / n_tile_size_out + 1;
        let mut n_tile_num_ch = n_tile_num / vcuts;
        if n_tile_num % vcuts > self.n_out_tile_it[i] % vcuts {
            n_tile_num_ch += 1;
        }
        let n_tile_it_ch = self.n_out_tile_it[i] / vcuts;
        let col_offset = m_out_tile_it * (m_tile_size_out * n_tile_num_ch)
            + n_tile_it_ch * m_out_current_tile_size
            + self.m_out_it[i] % m_tile_size_out;

        let cut_height_out = if geom.cut_height < grid.vcuts {
            1
        } else {
            geom.cut_height / grid.vcuts
        };
        let k_bound = if grid.df == 1 || self.m[i] == 1 {
            1
        } else {
            grid.mc
        };

        let mut mixed = false;
        let mut batch = CommandBatch::new();
        'build: for j in 0..cut_height_out {
            let channel = geom.hcut_no * geom.cut_height + vcut_out_no * cut_height_out + j;
            for k in 0..k_bound {
                let mut bank_flat = geom.vcut_no * geom.cut_width + k * (geom.cut_width / grid.mc);
                if grid.df != 1 {
                    bank_flat += 1;
                }
                let addr =
                    self.operand_address(channel, bank_flat, self.base_rows_out[i], col_offset);
                let kind = if addr.column == cpb - 1 || self.m_out_it[i] + 1 == m_out {
                    CommandKind::PimWritePrecharge
                } else {
                    CommandKind::PimWrite
                };
                let want = Command::new(kind, addr, self.mapping.hex_address(addr));
                let Some(ready) = ctrls[channel].get_ready_command(&want, clk) else {
                    batch.clear();
                    break 'build;
                };
                if batch.first().is_some_and(|first| first.kind != ready.kind) {
                    mixed = true;
                }
                batch.push(ready);
            }
        }

        if mixed {
            batch.retain(|cmd| !cmd.kind.is_write());
        }
        if batch.is_empty() {
            return batch;
        }

        let leader = batch[0].kind;
        if leader == CommandKind::PimActivate {
            if (!mixed && self.out_act_placed[i]) || wait_refresh {
                batch.clear();
                return batch;
            }
            self.out_act_placed[i] = true;
            return batch;
        }
        if leader == CommandKind::PimWritePrecharge {
            self.out_act_placed[i] = false;
        }
        if leader != CommandKind::PimActivate {
            self.m_out_it[i] += 1;
            if self.m_out_it[i] % m_tile_size_out == 0 || self.m_out_it[i] == m_out {
                self.m_out_it[i] = m_tile_size_out * m_out_tile_it;
                self.n_out_tile_it[i] += 1;
                if self.n_out_tile_it[i] * n_tile_size_out >= n_out {
                    self.n_out_tile_it[i] = 0;
                    self.m_out_it[i] = m_tile_size_out * (m_out_tile_it + 1);
                    if self.m_out_it[i] >= m_out {
                        assert_eq!(self.in_cnt[i], -1, "output drained before inputs finished");
                        log::debug!(
                            "{clk}: output exhausted, tile {} leaves PIM mode",
                            style(i).cyan()
                        );
                        self.in_pim[i] = false;
                        if geom.cut_height < grid.vcuts {
                            self.in_pim[i + 1] = false;
                        }
                        self.turn_off = self.in_pim.iter().all(|&active| !active);
                    }
                }
                self.output_valid[i] -= 1;
                if geom.cut_height < grid.vcuts {
                    self.output_valid[i + 1] -= 1;
                }
            }
        }
        batch
    }
}

/// Cycles between arming an output batch and it becoming writable.
fn output_delay(config: &Config) -> i64 {
    (config.t_ccd_l as i64 * 19 - config.t_rcd_wr as i64).max(1)
}

/// Cycles the input feed takes to drain after its last column.
fn input_drain_delay(config: &Config, grid: CutGrid) -> i64 {
    let fanout = (PES_PER_ROW / (grid.vcuts * grid.mc)).max(PES_PER_BANK_IO) as i64;
    (config.t_ccd_l as i64 * fanout - config.t_rcd_rd as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::PimScheduler;
    use crate::controller::{ChannelController, SimpleController};
    use crate::transaction::{CutCommand, LoadKind, PimOp};
    use similar_asserts as diff;
    use std::sync::Arc;

    fn config() -> crate::config::Config {
        crate::config::Config {
            channels: 1,
            refresh_interval: 0,
            ..crate::config::Config::default()
        }
    }

    fn controllers(config: &crate::config::Config) -> Vec<Box<dyn ChannelController>> {
        (0..config.channels)
            .map(|ch| Box::new(SimpleController::new(ch, config)) as Box<dyn ChannelController>)
            .collect()
    }

    fn cutting(vcuts: usize) -> PimOp {
        PimOp::Cutting(CutCommand {
            vcuts,
            hcuts: 1,
            mcf: 1,
            ucf: 1,
            df: 0,
            m_tile_size: 256,
            vcuts_next: 1,
            hcuts_next: 1,
            kernel_size: 1,
            stride: 1,
        })
    }

    fn load_unit_dims(scheduler: &mut PimScheduler, ctrls: &mut [Box<dyn ChannelController>], i: usize) {
        for (kind, base_row) in [
            (LoadKind::Weight, 0x100),
            (LoadKind::Output, 0x200),
            (LoadKind::Input, 0x300),
        ] {
            assert!(scheduler.apply(
                &PimOp::Load {
                    cut_no: i,
                    kind,
                    dim_value: 1,
                    base_row,
                },
                ctrls,
            ));
        }
    }

    fn submit(ctrls: &mut [Box<dyn ChannelController>], batches: super::TileBatches, clk: u64) {
        for cmd in batches.weight {
            ctrls[cmd.channel()].push_weight_command(cmd);
        }
        for cmd in batches.input {
            ctrls[cmd.channel()].push_input_command(cmd, clk);
        }
        for cmd in batches.output {
            ctrls[cmd.channel()].push_output_command(cmd);
        }
    }

    #[test]
    fn test_cutting_resets_tile_vectors() {
        crate::testing::init_logging();
        let config = Arc::new(config());
        let mut ctrls = controllers(&config);
        let mut scheduler = PimScheduler::new(config).unwrap();

        assert!(scheduler.apply(&cutting(2), &mut ctrls));
        diff::assert_eq!(scheduler.cuts(), 2);
        diff::assert_eq!(scheduler.out_cnt, vec![-1, -1]);
        diff::assert_eq!(scheduler.iw_status, vec![0, 0]);
        diff::assert_eq!(scheduler.in_pim, vec![false, false]);

        load_unit_dims(&mut scheduler, &mut ctrls, 0);
        assert_eq!(scheduler.m[0], 1);

        // a second CUTTING wipes everything
        assert!(scheduler.apply(&cutting(1), &mut ctrls));
        diff::assert_eq!(scheduler.cuts(), 1);
        diff::assert_eq!(scheduler.m, vec![0]);
    }

    #[test]
    fn test_compute_pops_only_when_selected_tiles_configured() {
        let config = Arc::new(config());
        let mut ctrls = controllers(&config);
        let mut scheduler = PimScheduler::new(config).unwrap();
        assert!(scheduler.apply(&cutting(2), &mut ctrls));

        load_unit_dims(&mut scheduler, &mut ctrls, 0);
        // tile 1 unconfigured: selecting it must not pop
        assert!(!scheduler.apply(&PimOp::Compute { mask: 0b11 }, &mut ctrls));
        assert!(!scheduler.in_pim[0]);

        // selecting only the configured tile pops
        assert!(scheduler.apply(&PimOp::Compute { mask: 0b01 }, &mut ctrls));
        assert!(scheduler.in_pim[0]);
        assert!(!scheduler.in_pim[1]);
    }

    #[test]
    fn test_cutting_sets_multitenant_flag() {
        let config = Arc::new(config());
        let mut ctrls = controllers(&config);
        let mut scheduler = PimScheduler::new(config).unwrap();

        assert!(scheduler.apply(&cutting(1), &mut ctrls));
        let ctrl = ctrls[0]
            .as_any()
            .downcast_ref::<SimpleController>()
            .unwrap();
        assert!(!ctrl.multitenant());

        assert!(scheduler.apply(&cutting(2), &mut ctrls));
        let ctrl = ctrls[0]
            .as_any()
            .downcast_ref::<SimpleController>()
            .unwrap();
        assert!(ctrl.multitenant());
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_oversized_m_tile_aborts() {
        let config = Arc::new(config());
        let mut ctrls = controllers(&config);
        let mut scheduler = PimScheduler::new(config).unwrap();
        scheduler.apply(
            &PimOp::Cutting(CutCommand {
                m_tile_size: 4096,
                ..match cutting(1) {
                    PimOp::Cutting(cut) => cut,
                    _ => unreachable!(),
                }
            }),
            &mut ctrls,
        );
    }

    /// Regression test for the single-tile lockstep guard: with a peer
    /// entry still in phase 0, the phase-1 advance is undone until the
    /// peer moves on.
    #[test]
    fn test_lockstep_guard_holds_at_single_cut() {
        crate::testing::init_logging();
        let config = Arc::new(config());
        let mut ctrls = controllers(&config);
        let mut scheduler = PimScheduler::new(Arc::clone(&config)).unwrap();

        assert!(scheduler.apply(&cutting(1), &mut ctrls));
        load_unit_dims(&mut scheduler, &mut ctrls, 0);
        assert!(scheduler.apply(&PimOp::Compute { mask: 0b1 }, &mut ctrls));

        // fabricate a configured-but-idle peer blocked in phase 0
        scheduler.iw_status.push(0);

        // drive the weight fetch until the tile reaches phase 1
        let mut clk = 0;
        while scheduler.iw_status[0] != 1 {
            let batches = scheduler.tile_cycle(0, &ctrls, clk, false);
            submit(&mut ctrls, batches, clk);
            clk += 1;
            assert!(clk < 100, "weight fetch did not complete");
        }

        // the guard keeps reverting the advance while the peer sits in 0
        for _ in 0..5 {
            let batches = scheduler.tile_cycle(0, &ctrls, clk, false);
            submit(&mut ctrls, batches, clk);
            clk += 1;
            diff::assert_eq!(scheduler.iw_status[0], 1);
        }

        // peer completes: the tile moves on to feeding inputs
        scheduler.iw_status[1] = 2;
        let batches = scheduler.tile_cycle(0, &ctrls, clk, false);
        submit(&mut ctrls, batches, clk);
        diff::assert_eq!(scheduler.iw_status[0], 2);
    }
}
