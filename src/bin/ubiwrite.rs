//! Erase a window of NAND eraseblocks and write a payload into it, either verbatim or
//! formatted as a single-volume UBI image.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::ensure;
use clap::Parser;

use ubiflash::source::ByteSource;
use ubiflash::writer::{UbiOptions, WriteOptions};

/// Writes data from the specified input file to the specified MTD device.
#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Number of eraseblocks to erase/write (default: to end of device)
    #[clap(short, long)]
    blocks: Option<u32>,

    /// Write JFFS2 clean markers
    #[clap(short, long)]
    clm: bool,

    /// Read input data from stdin
    #[clap(short = 'i', long, conflicts_with = "input_file")]
    stdin: bool,

    /// Offset into input file
    #[clap(short = 'k', long, conflicts_with = "stdin")]
    skip: Option<u64>,

    /// Length of data to write (default: to end of input file)
    #[clap(short, long)]
    length: Option<u64>,

    /// ID of UBI volume
    #[clap(short = 'n', long, default_value_t = 0)]
    vol_id: u32,

    /// Name of UBI volume (mandatory if --ubi and input data are used)
    #[clap(short = 'N', long)]
    vol_name: Option<String>,

    /// First eraseblock to erase/write
    #[clap(short, long, default_value_t = 0)]
    start: u32,

    /// Number of LEBs for the UBI volume; 0 leaves 20 spare blocks for bad-block
    /// handling, and a negative -k leaves k spare blocks
    #[clap(short = 'S', long, allow_hyphen_values = true, default_value_t = 0)]
    vol_lebs: i64,

    /// Format as UBI device
    #[clap(short, long)]
    ubi: bool,

    /// Don't display progress messages
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Display more progress messages
    #[clap(short, long)]
    verbose: bool,

    /// MTD device to write (e.g. /dev/mtd1)
    mtd_device: PathBuf,

    /// File holding the payload
    input_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    ensure!(
        args.stdin || args.input_file.is_some() || (args.skip.is_none() && args.length.is_none()),
        "can't have --skip or --length without an input file"
    );
    if args.ubi && (args.stdin || args.input_file.is_some()) {
        ensure!(
            args.vol_name.is_some(),
            "--ubi and input data require --vol-name"
        );
    }

    let source = if args.stdin {
        Some(ByteSource::stdin(args.length))
    } else if let Some(path) = &args.input_file {
        Some(ByteSource::file(path, args.skip.unwrap_or(0), args.length)?)
    } else {
        None
    };

    let opts = WriteOptions {
        start: args.start,
        blocks: args.blocks,
        clean_markers: args.clm,
        ubi: args.ubi.then(|| UbiOptions {
            vol_id: args.vol_id,
            vol_name: args.vol_name.clone(),
            vol_lebs: args.vol_lebs,
        }),
    };

    if !args.quiet {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    let result = write(&args, source, &opts);

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    result
}

#[cfg(target_os = "linux")]
fn write(args: &Args, source: Option<ByteSource>, opts: &WriteOptions) -> anyhow::Result<()> {
    use ubiflash::nand::{mtd::MtdNand, Nand};

    let mut nand = MtdNand::open(&args.mtd_device)?;

    if args.verbose {
        let info = nand.info();
        eprintln!(
            "{}: {} eraseblocks of {} bytes, page size {}",
            args.mtd_device.display(),
            info.peb_count(),
            info.eb_size,
            info.min_io_size,
        );
    }

    ubiflash::writer::run(&mut nand, source, opts)
}

#[cfg(not(target_os = "linux"))]
fn write(_: &Args, _: Option<ByteSource>, _: &WriteOptions) -> anyhow::Result<()> {
    anyhow::bail!("MTD devices are only supported on Linux")
}
