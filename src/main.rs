use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use pimsim::trace::FileTraceSink;
use pimsim::{Config, IdealDramSystem, JedecDramSystem, MemorySystem};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(author, version, about = "Cycle-level PIM DRAM memory system simulator", long_about = None)]
struct Options {
    /// Memory system configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Transaction trace to replay: `<hex-addr> R|W|P [cycle]` per line
    #[arg(short, long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Number of cycles to simulate
    #[arg(short = 'n', long, default_value_t = 100_000)]
    cycles: u64,

    /// Use the fixed-latency ideal memory model
    #[arg(long)]
    ideal: bool,

    /// Record every accepted transaction to `<output_prefix>addr.trace`
    #[arg(long)]
    addr_trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Write,
    Pim,
}

#[derive(Debug, Clone, Copy)]
struct TraceEntry {
    cycle: u64,
    addr: u64,
    op: Op,
}

fn parse_trace(path: &Path) -> eyre::Result<Vec<TraceEntry>> {
    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| eyre::eyre!("failed to read trace {}", path.display()))?;
    let mut entries = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let addr = parts
            .next()
            .ok_or_else(|| eyre::eyre!("line {}: missing address", lineno + 1))?;
        let addr = u64::from_str_radix(addr.trim_start_matches("0x"), 16)
            .wrap_err_with(|| eyre::eyre!("line {}: bad address {:?}", lineno + 1, addr))?;
        let op = match parts.next() {
            Some("R" | "READ") => Op::Read,
            Some("W" | "WRITE") => Op::Write,
            Some("P" | "PIM") => Op::Pim,
            other => eyre::bail!("line {}: bad op {:?}", lineno + 1, other),
        };
        let cycle = parts
            .next()
            .map(str::parse::<u64>)
            .transpose()
            .wrap_err_with(|| eyre::eyre!("line {}: bad cycle", lineno + 1))?
            .unwrap_or(0);
        entries.push(TraceEntry { cycle, addr, op });
    }
    Ok(entries)
}

/// Replay the trace, retrying entries the system is not ready for.
fn run(sys: &mut dyn MemorySystem, entries: &[TraceEntry], cycles: u64) {
    let mut next = 0;
    for _ in 0..cycles {
        let clk = sys.clk();
        while next < entries.len() && entries[next].cycle <= clk {
            let entry = entries[next];
            let accepted = match entry.op {
                Op::Pim => {
                    if sys.will_accept_pim() {
                        sys.add_pim(entry.addr);
                        true
                    } else {
                        false
                    }
                }
                Op::Read | Op::Write => {
                    let is_write = entry.op == Op::Write;
                    if sys.will_accept(entry.addr, is_write) {
                        sys.add(entry.addr, is_write);
                        true
                    } else {
                        false
                    }
                }
            };
            if !accepted {
                break;
            }
            next += 1;
        }
        sys.tick();
    }
    if next < entries.len() {
        log::warn!("{} trace entries were never accepted", entries.len() - next);
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let options = Options::parse();

    let config = Arc::new(Config::from_json_file(&options.config)?);
    let entries = match &options.trace {
        Some(path) => parse_trace(path)?,
        None => Vec::new(),
    };

    let reads = Rc::new(Cell::new(0u64));
    let writes = Rc::new(Cell::new(0u64));
    let read_cb = {
        let reads = Rc::clone(&reads);
        Box::new(move |_addr: u64| reads.set(reads.get() + 1)) as pimsim::sim::Callback
    };
    let write_cb = {
        let writes = Rc::clone(&writes);
        Box::new(move |_addr: u64| writes.set(writes.get() + 1)) as pimsim::sim::Callback
    };

    if options.ideal {
        eyre::ensure!(
            entries.iter().all(|entry| entry.op != Op::Pim),
            "PIM transactions require the JEDEC system"
        );
        let mut sys = IdealDramSystem::new(&config, read_cb, write_cb);
        run(&mut sys, &entries, options.cycles);
    } else {
        let mut sys = JedecDramSystem::new(Arc::clone(&config), read_cb, write_cb)?;
        if options.addr_trace {
            let path = format!("{}addr.trace", config.output_prefix);
            sys.set_trace_sink(Box::new(FileTraceSink::create(path)?));
        }
        run(&mut sys, &entries, options.cycles);
        sys.write_final_stats()?;
    }

    println!(
        "simulated {} cycles: {} reads, {} writes completed",
        options.cycles,
        reads.get(),
        writes.get()
    );
    Ok(())
}
