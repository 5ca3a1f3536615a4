use crate::{address, config::is_power_of_two};

/// A host transaction: ordinary read/write traffic or a PIM-encoded word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub addr: address,
    pub is_write: bool,
    pub added_cycle: u64,
}

impl Transaction {
    #[must_use]
    pub fn new(addr: address, is_write: bool) -> Self {
        Self {
            addr,
            is_write,
            added_cycle: 0,
        }
    }

    /// A PIM configuration/compute word (direction carries no meaning).
    #[must_use]
    pub fn pim(addr: address) -> Self {
        Self::new(addr, true)
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:#x} @{}",
            if self.is_write { "WRITE" } else { "READ" },
            self.addr,
            self.added_cycle
        )
    }
}

// Field widths of the PIM word layout, least significant first.
const BW_TRANS_TYPE: u32 = 1;
const BW_CUT_NO: u32 = 4;
const BW_LOAD_TYPE: u32 = 2;
const BW_VCUTS: u32 = 3;
const BW_HCUTS: u32 = 1;
const BW_MCF: u32 = 3;
const BW_UCF: u32 = 3;
const BW_DF: u32 = 1;
const BW_M_TILE: u32 = 4;
const BW_KERNEL_SIZE: u32 = 5;
const BW_STRIDE: u32 = 5;
const BW_DIM_VALUE: u32 = 32;
const BW_BASE_ROW: u32 = 22;

// loadType 3 is the CUTTING marker; valid LOADs use 0..=2.
const CUTTING_MARKER: address = 0b11 << (BW_TRANS_TYPE + BW_CUT_NO);

/// Which operand a LOAD transaction configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// M dimension + weight base row.
    Weight,
    /// K dimension + output base row.
    Output,
    /// N dimension + input base row.
    Input,
}

/// Tile-set geometry carried by a CUTTING transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutCommand {
    pub vcuts: usize,
    pub hcuts: usize,
    pub mcf: usize,
    pub ucf: usize,
    pub df: usize,
    pub m_tile_size: usize,
    pub vcuts_next: usize,
    pub hcuts_next: usize,
    pub kernel_size: usize,
    pub stride: usize,
}

/// A decoded PIM transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PimOp {
    /// Bitmask over tiles to switch into compute mode.
    Compute { mask: u64 },
    Cutting(CutCommand),
    Load {
        cut_no: usize,
        kind: LoadKind,
        dim_value: u64,
        base_row: u64,
    },
}

impl PimOp {
    /// Decode one PIM word. Aborts on an invalid load type (fatal
    /// misconfiguration).
    #[must_use]
    pub fn decode(addr: address) -> Self {
        if addr & 1 == 1 {
            return PimOp::Compute {
                mask: addr >> BW_TRANS_TYPE,
            };
        }

        let mut bits = addr;
        let mut take = |width: u32| -> u64 {
            let value = bits & ((1u64 << width) - 1);
            bits >>= width;
            value
        };

        if addr & CUTTING_MARKER == CUTTING_MARKER {
            // trans_type + cut_no + loadType are reserved here
            take(BW_TRANS_TYPE + BW_CUT_NO + BW_LOAD_TYPE);
            let cut = CutCommand {
                vcuts: 1 << take(BW_VCUTS),
                hcuts: 1 << take(BW_HCUTS),
                mcf: 1 << take(BW_MCF),
                ucf: 1 << take(BW_UCF),
                df: take(BW_DF) as usize,
                m_tile_size: 1 << take(BW_M_TILE),
                vcuts_next: 1 << take(BW_VCUTS),
                hcuts_next: 1 << take(BW_HCUTS),
                kernel_size: take(BW_KERNEL_SIZE) as usize,
                stride: take(BW_STRIDE) as usize,
            };
            return PimOp::Cutting(cut);
        }

        take(BW_TRANS_TYPE);
        let cut_no = take(BW_CUT_NO) as usize;
        let kind = match take(BW_LOAD_TYPE) {
            0 => LoadKind::Weight,
            1 => LoadKind::Output,
            2 => LoadKind::Input,
            other => panic!("invalid load type {other}"),
        };
        let dim_value = take(BW_DIM_VALUE);
        let base_row = take(BW_BASE_ROW);
        PimOp::Load {
            cut_no,
            kind,
            dim_value,
            base_row,
        }
    }
}

/// Encode a COMPUTE word selecting the tiles in `mask`.
#[must_use]
pub fn encode_compute(mask: u64) -> address {
    (mask << 1) | 1
}

/// Encode a CUTTING word. Partition counts and fan-outs must be the
/// powers of two their field widths admit.
#[must_use]
pub fn encode_cutting(cut: &CutCommand) -> address {
    fn log2_field(name: &str, value: usize, width: u32) -> u64 {
        assert!(
            is_power_of_two(value),
            "{name} must be a power of two (got {value})"
        );
        let field = value.ilog2() as u64;
        assert!(field < (1 << width), "{name} {value} exceeds field width");
        field
    }

    let mut bits: u64 = 0;
    let mut pos: u32 = 0;
    let mut push = |value: u64, width: u32| {
        assert!(value < (1u64 << width));
        bits |= value << pos;
        pos += width;
    };

    push(log2_field("vcuts", cut.vcuts, BW_VCUTS), BW_VCUTS);
    push(log2_field("hcuts", cut.hcuts, BW_HCUTS), BW_HCUTS);
    push(log2_field("mcf", cut.mcf, BW_MCF), BW_MCF);
    push(log2_field("ucf", cut.ucf, BW_UCF), BW_UCF);
    push(cut.df as u64, BW_DF);
    push(
        log2_field("M_tile_size", cut.m_tile_size, BW_M_TILE),
        BW_M_TILE,
    );
    push(log2_field("vcuts_next", cut.vcuts_next, BW_VCUTS), BW_VCUTS);
    push(log2_field("hcuts_next", cut.hcuts_next, BW_HCUTS), BW_HCUTS);
    push(cut.kernel_size as u64, BW_KERNEL_SIZE);
    push(cut.stride as u64, BW_STRIDE);

    (bits << (BW_TRANS_TYPE + BW_CUT_NO + BW_LOAD_TYPE)) | CUTTING_MARKER
}

/// Encode a LOAD word for one tile's operand dimension and base row.
#[must_use]
pub fn encode_load(cut_no: usize, kind: LoadKind, dim_value: u64, base_row: u64) -> address {
    assert!(cut_no < (1 << BW_CUT_NO), "cut_no {cut_no} out of range");
    assert!(dim_value < (1u64 << BW_DIM_VALUE));
    assert!(base_row < (1u64 << BW_BASE_ROW));
    let load_type: u64 = match kind {
        LoadKind::Weight => 0,
        LoadKind::Output => 1,
        LoadKind::Input => 2,
    };
    let mut bits = cut_no as u64;
    bits |= load_type << BW_CUT_NO;
    bits |= dim_value << (BW_CUT_NO + BW_LOAD_TYPE);
    bits |= base_row << (BW_CUT_NO + BW_LOAD_TYPE + BW_DIM_VALUE);
    bits << BW_TRANS_TYPE
}
