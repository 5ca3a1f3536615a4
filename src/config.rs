use crate::{address, command::Address};
use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};

#[must_use]
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    DDR4,
    GDDR6,
    HBM,
    HMC,
}

/// Memory system geometry, timing and output configuration.
///
/// Deserialized from a flat JSON file by the CLI driver. Counts are per
/// channel; `banks()` is the product of bank groups and banks per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub channels: usize,
    pub ranks: usize,
    pub bankgroups: usize,
    pub banks_per_group: usize,
    pub rows: usize,
    pub columns: usize,
    #[serde(default = "default_device_width")]
    pub device_width: usize,
    /// Burst length: columns transferred per READ/WRITE.
    #[serde(rename = "BL")]
    pub burst_length: usize,

    /// Field order of the physical address, most significant first.
    /// Two-letter tokens: ro, ra, bg, ba, ch, co.
    #[serde(default = "default_address_mapping")]
    pub address_mapping: String,

    #[serde(rename = "tCCD_S", default = "default_t_ccd_s")]
    pub t_ccd_s: u64,
    #[serde(rename = "tCCD_L", default = "default_t_ccd_l")]
    pub t_ccd_l: u64,
    #[serde(rename = "tRCDRD", default = "default_t_rcd_rd")]
    pub t_rcd_rd: u64,
    #[serde(rename = "tRCDWR", default = "default_t_rcd_wr")]
    pub t_rcd_wr: u64,

    /// Cycles between refresh windows (0 disables refresh).
    #[serde(rename = "tREFI", default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Refresh window length.
    #[serde(rename = "tRFC", default = "default_t_rfc")]
    pub t_rfc: u64,
    /// Pre-refresh window in which new PIM ACTIVATEs are suppressed.
    #[serde(default = "default_refresh_pre_window")]
    pub refresh_pre_window: u64,
    /// Extended pre-refresh window in which tiles pause entirely.
    #[serde(default = "default_refresh_ext_window")]
    pub refresh_ext_window: u64,

    #[serde(default = "default_epoch_period")]
    pub epoch_period: u64,
    #[serde(default = "default_ideal_memory_latency")]
    pub ideal_memory_latency: u64,
    #[serde(default = "default_pim_trans_queue_depth")]
    pub pim_trans_queue_depth: usize,
    /// Per-controller ordinary transaction queue depth.
    #[serde(default = "default_trans_queue_depth")]
    pub trans_queue_depth: usize,

    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub json_epoch_name: Option<String>,
    #[serde(default)]
    pub json_stats_name: Option<String>,
}

fn default_protocol() -> Protocol {
    Protocol::DDR4
}
fn default_device_width() -> usize {
    16
}
fn default_address_mapping() -> String {
    "rochrababgco".to_string()
}
fn default_t_ccd_s() -> u64 {
    2
}
fn default_t_ccd_l() -> u64 {
    4
}
fn default_t_rcd_rd() -> u64 {
    14
}
fn default_t_rcd_wr() -> u64 {
    10
}
fn default_refresh_interval() -> u64 {
    3900
}
fn default_t_rfc() -> u64 {
    350
}
fn default_refresh_pre_window() -> u64 {
    8
}
fn default_refresh_ext_window() -> u64 {
    16
}
fn default_epoch_period() -> u64 {
    100_000
}
fn default_ideal_memory_latency() -> u64 {
    120
}
fn default_pim_trans_queue_depth() -> usize {
    16
}
fn default_trans_queue_depth() -> usize {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            channels: 2,
            ranks: 1,
            bankgroups: 2,
            banks_per_group: 2,
            rows: 1 << 14,
            columns: 64,
            device_width: default_device_width(),
            burst_length: 8,
            address_mapping: default_address_mapping(),
            t_ccd_s: default_t_ccd_s(),
            t_ccd_l: default_t_ccd_l(),
            t_rcd_rd: default_t_rcd_rd(),
            t_rcd_wr: default_t_rcd_wr(),
            refresh_interval: default_refresh_interval(),
            t_rfc: default_t_rfc(),
            refresh_pre_window: default_refresh_pre_window(),
            refresh_ext_window: default_refresh_ext_window(),
            epoch_period: default_epoch_period(),
            ideal_memory_latency: default_ideal_memory_latency(),
            pim_trans_queue_depth: default_pim_trans_queue_depth(),
            trans_queue_depth: default_trans_queue_depth(),
            output_prefix: String::new(),
            json_epoch_name: None,
            json_stats_name: None,
        }
    }
}

impl Config {
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .wrap_err_with(|| eyre::eyre!("failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)
            .wrap_err_with(|| eyre::eyre!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.protocol == Protocol::HMC {
            eyre::bail!("initialized a memory system with an HMC config");
        }
        for (name, value) in [
            ("channels", self.channels),
            ("ranks", self.ranks),
            ("bankgroups", self.bankgroups),
            ("banks_per_group", self.banks_per_group),
            ("rows", self.rows),
            ("columns", self.columns),
            ("BL", self.burst_length),
        ] {
            if !is_power_of_two(value) {
                eyre::bail!("{} must be a nonzero power of two (got {})", name, value);
            }
        }
        if self.columns < self.burst_length {
            eyre::bail!(
                "columns ({}) must be at least BL ({})",
                self.columns,
                self.burst_length
            );
        }
        if self.epoch_period == 0 {
            eyre::bail!("epoch_period must be nonzero");
        }
        AddressMapping::new(self).map(|_| ())
    }

    /// Banks per rank.
    #[must_use]
    pub fn banks(&self) -> usize {
        self.bankgroups * self.banks_per_group
    }

    /// Addressable column groups per row (one per burst).
    #[must_use]
    pub fn columns_per_burst(&self) -> usize {
        self.columns / self.burst_length
    }
}

/// One field of the physical address within the shifted hex address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBits {
    pub pos: u32,
    pub width: u32,
}

impl FieldBits {
    #[must_use]
    pub fn mask(self) -> u64 {
        (1u64 << self.width) - 1
    }

    #[must_use]
    pub fn extract(self, bits: u64) -> u64 {
        (bits >> self.pos) & self.mask()
    }

    #[must_use]
    pub fn place(self, value: u64) -> u64 {
        (value & self.mask()) << self.pos
    }
}

/// Bidirectional map between `(channel, rank, bankgroup, bank, row, column)`
/// tuples and 64-bit hex addresses.
///
/// Field positions derive from the config's `address_mapping` order string;
/// the low `shift_bits` bits address bytes within one burst and carry no
/// field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMapping {
    pub shift_bits: u32,
    pub channel: FieldBits,
    pub rank: FieldBits,
    pub bankgroup: FieldBits,
    pub bank: FieldBits,
    pub row: FieldBits,
    pub column: FieldBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FieldToken {
    Channel,
    Rank,
    Bankgroup,
    Bank,
    Row,
    Column,
}

impl AddressMapping {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let mapping = config.address_mapping.as_bytes();
        if mapping.len() != 12 {
            eyre::bail!(
                "address mapping {:?} must consist of six two-letter fields",
                config.address_mapping
            );
        }
        let mut order = Vec::with_capacity(6);
        for token in mapping.chunks(2) {
            let token = match token {
                b"ch" => FieldToken::Channel,
                b"ra" => FieldToken::Rank,
                b"bg" => FieldToken::Bankgroup,
                b"ba" => FieldToken::Bank,
                b"ro" => FieldToken::Row,
                b"co" => FieldToken::Column,
                other => eyre::bail!(
                    "undefined address mapping field {:?}",
                    String::from_utf8_lossy(other)
                ),
            };
            if order.contains(&token) {
                eyre::bail!("duplicate address mapping field {:?}", token);
            }
            order.push(token);
        }

        let width = |token: FieldToken| -> u32 {
            let count = match token {
                FieldToken::Channel => config.channels,
                FieldToken::Rank => config.ranks,
                FieldToken::Bankgroup => config.bankgroups,
                FieldToken::Bank => config.banks_per_group,
                FieldToken::Row => config.rows,
                FieldToken::Column => config.columns_per_burst(),
            };
            count.ilog2()
        };

        // fields are listed most significant first
        let mut fields = std::collections::HashMap::new();
        let mut pos = 0;
        for token in order.iter().rev() {
            fields.insert(*token, FieldBits { pos, width: width(*token) });
            pos += width(*token);
        }

        let request_bytes = config.burst_length * config.device_width / 8;
        Ok(Self {
            shift_bits: request_bytes.ilog2(),
            channel: fields[&FieldToken::Channel],
            rank: fields[&FieldToken::Rank],
            bankgroup: fields[&FieldToken::Bankgroup],
            bank: fields[&FieldToken::Bank],
            row: fields[&FieldToken::Row],
            column: fields[&FieldToken::Column],
        })
    }

    /// Inverse address map: build the hex address a command targets.
    #[must_use]
    pub fn hex_address(&self, addr: Address) -> address {
        let bits = self.channel.place(addr.channel as u64)
            | self.rank.place(addr.rank as u64)
            | self.bankgroup.place(addr.bankgroup as u64)
            | self.bank.place(addr.bank as u64)
            | self.row.place(addr.row)
            | self.column.place(addr.column);
        bits << self.shift_bits
    }

    /// Decode a hex address back into its physical tuple.
    #[must_use]
    pub fn physical_address(&self, hex_addr: address) -> Address {
        let bits = hex_addr >> self.shift_bits;
        Address {
            channel: self.channel.extract(bits) as usize,
            rank: self.rank.extract(bits) as usize,
            bankgroup: self.bankgroup.extract(bits) as usize,
            bank: self.bank.extract(bits) as usize,
            row: self.row.extract(bits),
            column: self.column.extract(bits),
        }
    }

    /// Channel an ordinary transaction routes to.
    #[must_use]
    pub fn channel_of(&self, hex_addr: address) -> usize {
        ((hex_addr >> self.shift_bits >> self.channel.pos) & self.channel.mask()) as usize
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre;
    use similar_asserts as diff;

    fn config() -> super::Config {
        super::Config {
            channels: 4,
            bankgroups: 4,
            banks_per_group: 4,
            rows: 1 << 15,
            columns: 1 << 10,
            burst_length: 8,
            ..super::Config::default()
        }
    }

    #[test]
    fn test_address_roundtrip() -> eyre::Result<()> {
        let config = config();
        let mapping = super::AddressMapping::new(&config)?;
        let addr = crate::command::Address {
            channel: 3,
            rank: 0,
            bankgroup: 2,
            bank: 1,
            row: 0x1a2b,
            column: 97,
        };
        let hex = mapping.hex_address(addr);
        diff::assert_eq!(mapping.physical_address(hex), addr);
        diff::assert_eq!(mapping.channel_of(hex), 3);
        Ok(())
    }

    #[test]
    fn test_fields_do_not_overlap() -> eyre::Result<()> {
        let config = config();
        let mapping = super::AddressMapping::new(&config)?;
        let fields = [
            mapping.channel,
            mapping.rank,
            mapping.bankgroup,
            mapping.bank,
            mapping.row,
            mapping.column,
        ];
        let mut seen: u64 = 0;
        for field in fields {
            let placed = field.mask() << field.pos;
            assert_eq!(seen & placed, 0, "field {field:?} overlaps");
            seen |= placed;
        }
        Ok(())
    }

    #[test]
    fn test_hmc_config_rejected() {
        let config = super::Config {
            protocol: super::Protocol::HMC,
            ..super::Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_mapping_token() {
        let config = super::Config {
            address_mapping: "rochraxxbgco".to_string(),
            ..super::Config::default()
        };
        assert!(super::AddressMapping::new(&config).is_err());
    }
}
