//! The write engine: erase a window of eraseblocks, then stream a payload into it,
//! either verbatim ("raw") or wrapped in a freshly-built single-volume UBI layout.
//!
//! Each logical block is generated once and then attempted on successive physical
//! eraseblocks until it sticks, so a block that fails to program keeps its logical
//! identity (UBI headers, volume table slice, payload window) when it moves on.

use std::ops::Range;

use anyhow::{ensure, Context};
use rand::random;

use crate::nand::{Nand, NandInfo, PageUtil};
use crate::source::ByteSource;
use crate::ubi::headers::{
    Ec, Vid, VolTableRecord, VolType, UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_COMPAT,
    UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VOL_NAME_MAX,
    UBI_VTBL_RECORD_SIZE,
};

/// The 8-byte JFFS2 clean marker, placed in the OOB area of the first page of an
/// eraseblock to certify that the block was fully erased.
pub const JFFS2_CLEAN_MARKER: [u8; 8] = [0x19, 0x85, 0x20, 0x03, 0x00, 0x00, 0x00, 0x08];

/// Spare blocks kept out of the volume when its size is left default
const DEFAULT_SPARE_LEBS: i64 = 20;

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// First eraseblock of the window
    pub start: u32,

    /// Number of eraseblocks to erase/write (default: to the end of the device)
    pub blocks: Option<u32>,

    /// Write JFFS2 clean markers to the first page of every written eraseblock
    pub clean_markers: bool,

    /// Build a UBI layout instead of writing the payload raw
    pub ubi: Option<UbiOptions>,
}

#[derive(Debug, Clone, Default)]
pub struct UbiOptions {
    /// Volume table slot of the volume to create
    pub vol_id: u32,

    /// Name of the volume to create; mandatory when there is a payload
    pub vol_name: Option<String>,

    /// Requested volume size in LEBs. Positive values are taken verbatim, 0 leaves 20
    /// spare blocks for bad-block handling, and a negative -k leaves k spare blocks.
    pub vol_lebs: i64,
}

/// Validate the eraseblock window `[start, end)` against the device
fn resolve_window(info: &NandInfo, opts: &WriteOptions) -> anyhow::Result<Range<u32>> {
    let pebs = info.peb_count();
    ensure!(opts.start < pebs, "start block out of range");

    let end = match opts.blocks {
        Some(blocks) => {
            let end = u64::from(opts.start) + u64::from(blocks);
            ensure!(end <= u64::from(pebs), "block count out of range");
            end as u32
        }
        None => pebs,
    };
    ensure!(end > opts.start, "empty eraseblock window");

    Ok(opts.start..end)
}

/// Fully-resolved UBI parameters for one run
#[derive(Debug)]
struct UbiParams {
    vol_id: u32,
    vol_name: Option<String>,
    vol_lebs: u32,
    vid_hdr_offset: u32,
    data_offset: u32,
    leb_size: u32,
}

impl UbiParams {
    fn resolve(opts: &UbiOptions, info: &NandInfo, window_pebs: u32) -> anyhow::Result<Self> {
        let vid_hdr_offset = info.min_io_size;
        let data_offset = info.min_io_size * 2;
        ensure!(
            data_offset as usize + UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE
                <= info.eb_size as usize,
            "eraseblocks too small for the volume table"
        );
        let leb_size = info.eb_size - data_offset;

        ensure!(
            opts.vol_id < UBI_MAX_VOLUMES as u32,
            "volume id {} out of range",
            opts.vol_id
        );
        if let Some(name) = &opts.vol_name {
            ensure!(name.len() <= UBI_VOL_NAME_MAX, "volume name too long");
        }

        let total_lebs = i64::from(window_pebs) - i64::from(UBI_LAYOUT_VOLUME_EBS);
        let vol_lebs = match opts.vol_lebs {
            0 => total_lebs - DEFAULT_SPARE_LEBS,
            n if n < 0 => total_lebs + n,
            n => n,
        };
        ensure!(
            (0..=total_lebs).contains(&vol_lebs),
            "volume LEBs do not fit into the allocated blocks"
        );

        Ok(Self {
            vol_id: opts.vol_id,
            vol_name: opts.vol_name.clone(),
            vol_lebs: vol_lebs as u32,
            vid_hdr_offset,
            data_offset,
            leb_size,
        })
    }

    /// LEBs that will carry a VID header; zero when no volume is being created
    fn data_lebs(&self) -> u32 {
        if self.vol_name.is_some() {
            self.vol_lebs
        } else {
            0
        }
    }
}

/// Generates the contents of successive logical blocks into an eraseblock-sized buffer.
///
/// `blk_no` advances exactly once per generated block, no matter how many physical
/// eraseblocks the block ends up being attempted on.
struct BlockGen {
    ubi: Option<UbiParams>,
    blk_no: u32,
    image_seq: u32,
}

impl BlockGen {
    fn new(ubi: Option<UbiParams>) -> Self {
        Self {
            ubi,
            blk_no: 0,
            image_seq: 0,
        }
    }

    /// Fill `buf` (one eraseblock, pre-filled with the erased pattern) and return the
    /// number of meaningful bytes in it
    fn next_block(
        &mut self,
        source: &mut Option<ByteSource>,
        buf: &mut [u8],
    ) -> anyhow::Result<usize> {
        buf.fill(0xFF);

        let data_len = match &self.ubi {
            None => match source {
                Some(source) => source.read_block(buf)?,
                None => 0,
            },

            Some(ubi) => {
                while self.image_seq == 0 {
                    self.image_seq = random();
                }

                Ec {
                    ec: 0,
                    vid_hdr_offset: ubi.vid_hdr_offset,
                    data_offset: ubi.data_offset,
                    image_seq: self.image_seq,
                }
                .encode(buf)?;

                let data_offset = ubi.data_offset as usize;
                if self.blk_no < UBI_LAYOUT_VOLUME_EBS {
                    // Volume table LEB
                    Vid {
                        vol_type: VolType::Dynamic,
                        compat: UBI_LAYOUT_VOLUME_COMPAT,
                        vol_id: UBI_LAYOUT_VOLUME_ID,
                        lnum: self.blk_no,
                        ..Default::default()
                    }
                    .encode(&mut buf[ubi.vid_hdr_offset as usize..])?;

                    for slot in 0..UBI_MAX_VOLUMES {
                        let record = match &ubi.vol_name {
                            Some(name) if slot as u32 == ubi.vol_id => VolTableRecord {
                                reserved_pebs: ubi.vol_lebs,
                                alignment: 1,
                                vol_type: VolType::Dynamic,
                                name: name.clone(),
                                ..Default::default()
                            }
                            .into_bytes(),
                            _ => VolTableRecord::none_into_bytes(),
                        };
                        let at = data_offset + slot * UBI_VTBL_RECORD_SIZE;
                        buf[at..at + UBI_VTBL_RECORD_SIZE].copy_from_slice(&record);
                    }

                    data_offset + UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE
                } else if self.blk_no - UBI_LAYOUT_VOLUME_EBS < ubi.data_lebs() {
                    // Volume data LEB
                    Vid {
                        vol_type: VolType::Dynamic,
                        vol_id: ubi.vol_id,
                        lnum: self.blk_no - UBI_LAYOUT_VOLUME_EBS,
                        ..Default::default()
                    }
                    .encode(&mut buf[ubi.vid_hdr_offset as usize..])?;

                    let read = match source {
                        Some(source) => {
                            let window = &mut buf[data_offset..][..ubi.leb_size as usize];
                            source.read_block(window)?
                        }
                        None => 0,
                    };
                    data_offset + read
                } else {
                    // Erase header only
                    UBI_EC_HDR_SIZE
                }
            }
        };

        self.blk_no += 1;
        Ok(data_len)
    }
}

/// Erase one eraseblock, skipping it if it is marked bad.
///
/// Failures are reported but not propagated; the write pass discovers genuinely
/// unusable blocks on its own.
fn erase_block<N: Nand>(nand: &mut N, peb: u32, rpt: &howudoin::Tx) {
    match nand.is_bad(peb) {
        Ok(true) => {
            rpt.add_info(format!("Skipping erase of bad block {peb}"));
        }
        Err(err) => {
            rpt.add_info(format!("Get bad block failed at {peb}: {err:#}"));
        }
        Ok(false) => {
            if let Err(err) = nand.erase(peb) {
                rpt.add_info(format!("Erase block failed at {peb}: {err:#}"));
            }
        }
    }
}

/// Write one generated block to the given eraseblock, page by page.
///
/// Pages whose bytes are all `0xFF` are left unprogrammed. With `clean_marker`, the
/// JFFS2 marker goes to the OOB area of the first page, whether or not that page
/// carries data; a block with no data at all still receives its marker.
///
/// On a page-write failure the eraseblock is erased again (best effort) and, when the
/// block was fully populated, marked bad; the error is returned so the caller can
/// retry the same content on the next eraseblock.
fn eb_write<N: Nand>(
    nand: &mut N,
    peb: u32,
    buf: &[u8],
    data_len: usize,
    clean_marker: bool,
    rpt: &howudoin::Tx,
) -> anyhow::Result<()> {
    let info = nand.info();
    let min_io = info.min_io_size as usize;

    if data_len == 0 && !clean_marker {
        return Ok(());
    }

    let mut write_clm = clean_marker;
    let mut page_addr = 0;
    while page_addr < data_len || write_clm {
        let page = &buf[page_addr..page_addr + min_io];
        let data = (!page.is_erased()).then_some(page);
        let oob = write_clm.then_some(&JFFS2_CLEAN_MARKER[..]);

        if let Err(err) = nand.write_page(peb, page_addr as u32, data, oob) {
            erase_block(nand, peb, rpt);
            if data_len % info.eb_size as usize == 0 {
                let _ = nand.mark_bad(peb);
            }
            return Err(err).with_context(|| {
                format!("write page failed at block {peb}, offset {page_addr:#x}")
            });
        }

        write_clm = false; // clean marker on first page only
        page_addr += min_io;
    }

    Ok(())
}

/// Erase the eraseblock window and stream the payload into it.
///
/// With no payload and no UBI layout requested, this is an erase-only run.
pub fn run<N: Nand>(
    nand: &mut N,
    mut source: Option<ByteSource>,
    opts: &WriteOptions,
) -> anyhow::Result<()> {
    let info = nand.info();
    let window = resolve_window(&info, opts)?;
    let window_pebs = window.end - window.start;

    let ubi = opts
        .ubi
        .as_ref()
        .map(|u| UbiParams::resolve(u, &info, window_pebs))
        .transpose()?;

    // All geometry checks happen before anything destructive
    let image_size = source.as_ref().and_then(ByteSource::remaining);
    if let Some(ubi) = &ubi {
        ensure!(
            source.is_none() || ubi.vol_name.is_some(),
            "input data requires a volume name"
        );
        if let Some(size) = image_size {
            ensure!(
                size <= u64::from(ubi.vol_lebs) * u64::from(ubi.leb_size),
                "image file does not fit into allocated LEBs"
            );
        }
    } else if let Some(size) = image_size {
        ensure!(
            size <= u64::from(window_pebs) * u64::from(info.eb_size),
            "image file does not fit into allocated blocks"
        );
    }

    let rpt = howudoin::new()
        .label("Erasing blocks")
        .set_len(u64::from(window_pebs));
    for peb in window.clone() {
        erase_block(nand, peb, &rpt);
        rpt.inc();
    }
    rpt.close();

    if source.is_none() && ubi.is_none() {
        return Ok(());
    }

    let rpt = howudoin::new()
        .label("Writing blocks")
        .set_len(u64::from(window_pebs));
    let mut gen = BlockGen::new(ubi);
    let mut buf = vec![0xFF; info.eb_size as usize];
    let mut peb = window.start;
    let mut delivered = true;

    while peb < window.end {
        let data_len = gen.next_block(&mut source, &mut buf)?;

        delivered = false;
        while peb < window.end {
            let result = eb_write(nand, peb, &buf, data_len, opts.clean_markers, &rpt);
            peb += 1;
            rpt.inc();
            match result {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(err) => {
                    rpt.add_info(format!("{err:#}"));
                }
            }
        }
    }
    rpt.close();

    let drained = payload_drained(&source);
    ensure!(
        delivered && drained,
        "data only partially written due to error"
    );

    Ok(())
}

/// Has the payload been fully consumed? Unbounded and absent payloads always have.
fn payload_drained(source: &Option<ByteSource>) -> bool {
    source
        .as_ref()
        .map_or(true, |s| s.remaining().map_or(true, |left| left == 0))
}
