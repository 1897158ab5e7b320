//! aie-partition: AI Engine partition manager over a simulated aperture

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};

use aie_partition::aperture::{Aperture, SlotStatus};
use aie_partition::config::Config;
use aie_partition::device::sim::SimRegisters;
use aie_partition::device::{Location, ModuleType, TileKind};
use aie_partition::interrupt::simulate_tile_error;
use aie_partition::sync::CancelToken;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }

    let config = Config::get();
    let command = args.iter().skip(1).find(|a| !a.starts_with('-')).map(|s| s.as_str());
    let operands: Vec<&str> = args
        .iter()
        .skip(2)
        .filter(|a| !a.starts_with('-'))
        .map(|s| s.as_str())
        .collect();

    match command {
        Some("demo") | None => run_demo(config),
        Some("enumerate") => run_enumerate(config, &operands),
        Some("topology") => run_topology(config),
        Some(other) => {
            print_usage();
            bail!("unknown command: {}", other)
        }
    }
}

fn print_usage() {
    println!("Usage: aie-partition [COMMAND] [ARGS]");
    println!();
    println!("Commands:");
    println!("  demo                  Run the partition walkthrough (default)");
    println!("  enumerate START:COLS  Create partitions and print the column map");
    println!("  topology              Print the tile kinds of the aperture");
    println!();
    println!("Options:");
    println!("  --sample-config       Print a sample configuration file");
    println!("  -h, --help            Show this help");
    println!();
    if let Some(path) = Config::user_config_path() {
        println!("User config: {}", path.display());
    }
}

fn open_aperture(config: &Config) -> anyhow::Result<(Arc<SimRegisters>, Aperture)> {
    let device = config.device.generation.description();
    let (regs, aperture) = Aperture::simulated(
        0,
        config.aperture_range(),
        device,
        config.runtime.poll_retries,
        config.aperture_settings(),
    )
    .context("failed to attach aperture")?;
    println!("Aperture: {} {}", device.name, aperture.range());
    Ok((regs, aperture))
}

fn print_enumeration(aperture: &Aperture, cancel: &CancelToken) -> anyhow::Result<()> {
    let listing = aperture.enumerate(cancel, usize::MAX)?;
    for slot in &listing.slots {
        println!("  {}", slot);
    }
    Ok(())
}

/// Parse a `START:COLS` operand.
fn parse_span(text: &str) -> anyhow::Result<(u32, u32)> {
    let (start, cols) = text
        .split_once(':')
        .with_context(|| format!("expected START:COLS, got {}", text))?;
    Ok((
        start.parse().with_context(|| format!("bad start column in {}", text))?,
        cols.parse().with_context(|| format!("bad column count in {}", text))?,
    ))
}

fn run_enumerate(config: &Config, operands: &[&str]) -> anyhow::Result<()> {
    let (_regs, aperture) = open_aperture(config)?;
    let cancel = CancelToken::new();
    for operand in operands {
        let (start, cols) = parse_span(operand)?;
        match aperture.request_partition(&cancel, start, cols) {
            Ok(handle) => println!("Created partition {} at {}", handle.id(), handle.range()),
            Err(e) => println!("Rejected {}: {}", operand, e),
        }
    }
    println!();
    print_enumeration(&aperture, &cancel)
}

fn run_topology(config: &Config) -> anyhow::Result<()> {
    let device = config.device.generation.description();
    let range = config.aperture_range();
    println!("{} {}", device.name, range);
    println!();
    for row in (range.start.row..range.end_row()).rev() {
        print!("{:>3} ", row);
        for col in range.start.col..range.end_col() {
            let symbol = match device.ops.classify(Location::new(col, row)) {
                TileKind::ArrayTile => 'A',
                TileKind::MemoryTile => 'M',
                TileKind::ShimPlain => 's',
                TileKind::ShimNoc => 'N',
            };
            print!("{}", symbol);
        }
        println!();
    }
    println!();
    println!("A = array tile, M = memory tile, s = shim (PL), N = shim (NOC)");
    Ok(())
}

fn run_demo(config: &Config) -> anyhow::Result<()> {
    let (regs, aperture) = open_aperture(config)?;
    let cancel = CancelToken::new();
    let range = aperture.range();
    if range.size.cols < 8 {
        bail!("the demo needs an aperture of at least 8 columns");
    }
    let base = range.start.col;

    // Two disjoint partitions, then an overlapping request
    println!();
    println!("Column allocation");
    println!("=================");
    let left = aperture.request_partition(&cancel, base, 4)?;
    let right = aperture.request_partition(&cancel, base + 4, 4)?;
    match aperture.request_partition(&cancel, base + 2, 4) {
        Ok(_) => bail!("overlapping partition was accepted"),
        Err(e) => println!("Overlapping request rejected: {}", e),
    }
    print_enumeration(&aperture, &cancel)?;

    // Lifecycle of the right partition
    println!();
    println!("Partition lifecycle");
    println!("===================");
    let part = aperture.mark_in_use(&cancel, &right)?;
    let top = Location::new(1, range.size.rows - 1);
    part.request_tiles(&cancel, &[top])?;
    println!(
        "Requested tile {}: enabled = {}",
        top,
        part.is_tile_enabled(&cancel, top)?
    );
    if let Err(e) = aperture.destroy(&cancel, right.clone()) {
        println!("Destroy while in use rejected: {}", e);
    }
    aperture.release(&cancel, &right, false)?;
    println!(
        "Released: tile {} enabled = {}",
        top,
        part.is_tile_enabled(&cancel, top)?
    );
    drop(part);
    aperture.destroy(&cancel, right.clone())?;
    println!(
        "Destroyed partition {}: handle valid = {}",
        right.id(),
        right.get().is_ok()
    );

    // Error propagation into the left partition
    println!();
    println!("Error interrupts");
    println!("================");
    let part = aperture.mark_in_use(&cancel, &left)?;
    part.request_tiles(&cancel, &[])?;
    part.register_error_callback(&cancel, |id| println!("Callback: partition {} has new errors", id))?;

    let device = aperture.hardware().device;
    let sources = [
        (Location::new(base + 2, 1), ModuleType::Core, 5),
        (Location::new(base + 1, 2), ModuleType::Memory, 3),
        (Location::new(base + 3, 0), ModuleType::Pl, 0),
    ];
    for (loc, module, bit) in sources {
        let module = if device.ops.classify(loc).has_module(module) {
            module
        } else {
            ModuleType::Memory
        };
        match simulate_tile_error(&regs, device, aperture.routing(), loc, module, bit) {
            Ok(event) => println!("Raised {} event {} at tile {}", module, event, loc),
            Err(e) => println!("Could not raise error at tile {}: {}", loc, e),
        }
    }
    aperture.interrupt_top_half();
    aperture.run_pending_work(&cancel)?;

    for error in part.errors(&cancel)? {
        println!("  {}", error);
    }
    println!("Categories: {:?}", part.error_categories(&cancel)?);

    let live = aperture
        .enumerate(&cancel, usize::MAX)?
        .slots
        .iter()
        .filter(|slot| slot.status != SlotStatus::Free)
        .count();
    println!();
    println!("Live partitions: {}", live);
    Ok(())
}
