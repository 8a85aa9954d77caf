//! Extract the contents, i.e. the raw binary image data, of one volume from a UBI
//! image file.

use std::fs::File;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use ubiflash::extract::{extract_volume, find_volume, ExtractOptions, PebSize, VolumeInfo, VolumeRef};

/// Extracts the contents of one UBI volume from a UBI image file.
#[derive(Parser, Debug)]
#[clap(version)]
#[clap(group(clap::ArgGroup::new("volume").required(true)))]
struct Args {
    /// Output file name
    #[clap(short, long)]
    output: PathBuf,

    /// Size of the physical eraseblock of the flash this UBI image was created for, in
    /// bytes, kilobytes (KiB), or megabytes (MiB)
    #[clap(short, long)]
    peb_size: PebSize,

    /// Volume table index of volume to extract
    #[clap(short = 'i', long, group = "volume")]
    vol_index: Option<u32>,

    /// Name of volume to extract
    #[clap(short = 'n', long, group = "volume")]
    vol_name: Option<String>,

    /// Skip eraseblocks with broken headers when reading data
    #[clap(short, long)]
    skip_bad_blocks: bool,

    /// Be verbose
    #[clap(short, long)]
    verbose: bool,

    /// The UBI image to read
    image: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    let result = extract(&args);

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    let info = result?;
    if args.verbose {
        eprintln!("Volume id:    {}", info.vol_index);
        eprintln!("Volume name:  {}", info.vol_name);
        eprintln!("PEB size:     {}", info.peb_size);
        eprintln!("LEB size:     {}", info.leb_size);
        eprintln!("VID offset:   {}", info.vid_hdr_offset);
        eprintln!("data offset:  {}", info.data_offset);
    }

    Ok(())
}

fn extract(args: &Args) -> anyhow::Result<VolumeInfo> {
    let volume = match (&args.vol_index, &args.vol_name) {
        (Some(index), None) => VolumeRef::Index(*index),
        (None, Some(name)) => VolumeRef::Name(name.clone()),
        _ => unreachable!("clap enforces exactly one volume selector"),
    };
    let opts = ExtractOptions {
        peb_size: args.peb_size.0,
        volume,
        skip_bad: args.skip_bad_blocks,
    };

    let mut image = File::open(&args.image)
        .with_context(|| format!("cannot open input file {}", args.image.display()))?;

    let info = find_volume(&mut image, &opts)?;

    // Only create (and truncate) the output once the volume has actually been found
    let mut out = File::create(&args.output)
        .with_context(|| format!("cannot open output file {}", args.output.display()))?;

    extract_volume(&mut image, &mut out, &info, opts.skip_bad)?;

    Ok(info)
}
