use crate::address;
use color_eyre::eyre::{self, WrapErr};
use std::io::Write;

/// Kind tag written per address-trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Read,
    Write,
    Pim,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraceKind::Read => "READ",
            TraceKind::Write => "WRITE",
            TraceKind::Pim => "PIM",
        };
        write!(f, "{name}")
    }
}

/// Sink for the optional address trace. Recording has no effect on
/// scheduling; sinks may drop lines on I/O errors.
pub trait TraceSink: Send + Sync + 'static {
    fn record(&mut self, hex_addr: address, kind: TraceKind, clk: u64);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn record(&mut self, _hex_addr: address, _kind: TraceKind, _clk: u64) {}
}

/// Writes one `«hex» «kind» «clk»` line per transaction.
#[derive(Debug)]
pub struct FileTraceSink {
    writer: std::io::BufWriter<std::fs::File>,
}

impl FileTraceSink {
    pub fn create(path: impl AsRef<std::path::Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .wrap_err_with(|| eyre::eyre!("failed to create trace file {}", path.display()))?;
        Ok(Self {
            writer: std::io::BufWriter::new(file),
        })
    }
}

impl TraceSink for FileTraceSink {
    fn record(&mut self, hex_addr: address, kind: TraceKind, clk: u64) {
        if let Err(err) = writeln!(self.writer, "{hex_addr:x} {kind} {clk}") {
            log::error!("address trace write failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TraceSink;
    use color_eyre::eyre;

    #[test]
    fn test_file_sink_line_format() -> eyre::Result<()> {
        let path = std::env::temp_dir().join("pimsim-trace-test.trace");
        {
            let mut sink = super::FileTraceSink::create(&path)?;
            sink.record(0xdead_beef, super::TraceKind::Pim, 42);
            sink.record(0x1000, super::TraceKind::Read, 43);
        }
        let contents = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path).ok();
        assert_eq!(contents, "deadbeef PIM 42\n1000 READ 43\n");
        Ok(())
    }
}
