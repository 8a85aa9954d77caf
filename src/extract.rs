//! The extract engine: walk a UBI image file, locate one volume through the volume
//! table, and reassemble its data in logical-block order.
//!
//! Physical order in the image is not logical order, so each matching eraseblock's
//! data is placed at `lnum * leb_size` in the output. Logical blocks the image never
//! wrote stay as holes.

use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;

use anyhow::{bail, ensure, Context};

use crate::ubi::headers::{
    Ec, Vid, VolTableRecord, UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES,
    UBI_VID_HDR_SIZE, UBI_VTBL_RECORD_SIZE,
};

/// How the volume to extract is identified
#[derive(Debug, Clone)]
pub enum VolumeRef {
    /// By volume table index
    Index(u32),

    /// By exact volume name
    Name(String),
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Physical eraseblock size the image was built for
    pub peb_size: u32,

    /// The volume to extract
    pub volume: VolumeRef,

    /// Skip eraseblocks with broken headers instead of aborting
    pub skip_bad: bool,
}

/// The resolved volume and image geometry, for reporting
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub vol_index: u32,
    pub vol_name: String,
    pub peb_size: u32,
    pub leb_size: u32,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
}

/// An eraseblock size argument, accepting `KiB`/`MiB`/`GiB` suffixes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PebSize(pub u32);

impl FromStr for PebSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (digits, multiplier) = match s {
            _ if s.ends_with("KiB") => (&s[..s.len() - 3], 1024),
            _ if s.ends_with("MiB") => (&s[..s.len() - 3], 1024 * 1024),
            _ if s.ends_with("GiB") => (&s[..s.len() - 3], 1024 * 1024 * 1024),
            _ => (s, 1),
        };

        let count: u64 = digits.parse().context("bad eraseblock size")?;
        let bytes = count.checked_mul(multiplier).unwrap_or(u64::MAX);
        ensure!(
            (1..=u64::from(u32::MAX)).contains(&bytes),
            "bad eraseblock size"
        );

        Ok(Self(bytes as u32))
    }
}

/// The headers of one eraseblock of the image
struct PebHeaders {
    data_offset: u32,
    vid_hdr_offset: u32,
    vid: Option<Vid>,
}

/// Read and validate the EC and VID headers of the eraseblock starting at `peb_base`
fn read_peb_headers<R: Read + Seek>(
    image: &mut R,
    peb_base: u64,
    peb_size: u32,
) -> anyhow::Result<PebHeaders> {
    let mut ec_buf = [0u8; UBI_EC_HDR_SIZE];
    image.seek(SeekFrom::Start(peb_base))?;
    image
        .read_exact(&mut ec_buf)
        .context("failed to read EC header")?;
    let ec = Ec::decode(&ec_buf).context("invalid EC header")?;

    ensure!(ec.data_offset < peb_size, "data offset beyond eraseblock");

    let mut vid_buf = [0u8; UBI_VID_HDR_SIZE];
    image.seek(SeekFrom::Start(peb_base + u64::from(ec.vid_hdr_offset)))?;
    image
        .read_exact(&mut vid_buf)
        .context("failed to read VID header")?;
    let vid = Vid::decode(&vid_buf).context("invalid VID header")?;

    Ok(PebHeaders {
        data_offset: ec.data_offset,
        vid_hdr_offset: ec.vid_hdr_offset,
        vid,
    })
}

/// Total image size, validated as a positive whole number of eraseblocks
fn checked_image_size<R: Seek>(image: &mut R, peb_size: u32) -> anyhow::Result<u64> {
    let image_size = image.seek(SeekFrom::End(0))?;
    ensure!(
        image_size > 0 && image_size % u64::from(peb_size) == 0,
        "bad size of input image ({image_size} bytes)"
    );
    Ok(image_size)
}

/// Walk the image until the layout volume turns up, then resolve the requested volume
/// against the 128-record table it carries.
///
/// Header failures here are always fatal; `skip_bad` only applies to the extraction
/// walk afterwards.
pub fn find_volume<R: Read + Seek>(
    image: &mut R,
    opts: &ExtractOptions,
) -> anyhow::Result<VolumeInfo> {
    let peb_size = opts.peb_size;
    let image_size = checked_image_size(image, peb_size)?;

    let mut peb_base = 0;
    let headers = loop {
        let headers = read_peb_headers(image, peb_base, peb_size)?;
        if headers.vid.as_ref().map(|v| v.vol_id) == Some(UBI_LAYOUT_VOLUME_ID) {
            break headers;
        }

        peb_base += u64::from(peb_size);
        ensure!(peb_base < image_size, "volume table eraseblock not found");
    };

    let vtbl_base = peb_base + u64::from(headers.data_offset);
    let mut record_buf = [0u8; UBI_VTBL_RECORD_SIZE];

    let (vol_index, vol_name) = match &opts.volume {
        VolumeRef::Name(name) => {
            let mut found = None;
            image.seek(SeekFrom::Start(vtbl_base))?;
            for index in 0..UBI_MAX_VOLUMES as u32 {
                image
                    .read_exact(&mut record_buf)
                    .context("failed to read volume table record")?;
                let record = VolTableRecord::decode(&record_buf)
                    .context("invalid volume table record")?;

                if record.is_some_and(|r| &r.name == name) {
                    found = Some(index);
                    break;
                }
            }

            match found {
                Some(index) => (index, name.clone()),
                None => bail!("volume '{name}' not found"),
            }
        }

        VolumeRef::Index(index) => {
            ensure!(
                *index < UBI_MAX_VOLUMES as u32,
                "bad volume index: {index}"
            );
            image.seek(SeekFrom::Start(
                vtbl_base + u64::from(*index) * UBI_VTBL_RECORD_SIZE as u64,
            ))?;
            image
                .read_exact(&mut record_buf)
                .context("failed to read volume table record")?;
            let record = VolTableRecord::decode(&record_buf)
                .context("invalid volume table record")?;

            match record {
                Some(record) => (*index, record.name),
                None => bail!("volume #{index} does not exist"),
            }
        }
    };

    Ok(VolumeInfo {
        vol_index,
        vol_name,
        peb_size,
        leb_size: peb_size - headers.data_offset,
        vid_hdr_offset: headers.vid_hdr_offset,
        data_offset: headers.data_offset,
    })
}

/// Copy the data of every eraseblock belonging to the volume resolved by
/// [find_volume] to its logical position in `out`.
///
/// With `skip_bad`, eraseblocks whose headers fail to validate are skipped;
/// I/O failures on the data itself always abort, so a short or failed read can
/// never silently produce a corrupt output file.
pub fn extract_volume<R, W>(
    image: &mut R,
    out: &mut W,
    info: &VolumeInfo,
    skip_bad: bool,
) -> anyhow::Result<()>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let image_size = checked_image_size(image, info.peb_size)?;

    let rpt = howudoin::new()
        .label("Extracting volume")
        .set_len(image_size / u64::from(info.peb_size));
    let result = extract_walk(image, out, info, skip_bad, image_size, &rpt);
    rpt.close();
    result
}

fn extract_walk<R, W>(
    image: &mut R,
    out: &mut W,
    info: &VolumeInfo,
    skip_bad: bool,
    image_size: u64,
    rpt: &howudoin::Tx,
) -> anyhow::Result<()>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let peb_size = info.peb_size;
    let data_size = (peb_size - info.data_offset) as usize;
    let mut buf = vec![0u8; data_size];

    for peb_base in (0..image_size).step_by(peb_size as usize) {
        rpt.inc();

        // `skip_bad` forgives header validation only
        let headers = match read_peb_headers(image, peb_base, peb_size) {
            Ok(headers) => headers,
            Err(err) if skip_bad => {
                rpt.add_info(format!(
                    "Skipping eraseblock at offset {peb_base:#x}: {err:#}"
                ));
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("eraseblock at offset {peb_base:#x}"))
            }
        };

        let vid = match headers.vid {
            Some(vid) if vid.vol_id == info.vol_index => vid,
            _ => continue, // empty, or some other volume
        };

        image
            .seek(SeekFrom::Start(peb_base + u64::from(headers.data_offset)))
            .context("cannot seek input file")?;
        image.read_exact(&mut buf).context("failed to read data")?;

        out.seek(SeekFrom::Start(u64::from(vid.lnum) * data_size as u64))
            .context("cannot seek output file")?;
        out.write_all(&buf).context("failed to write data")?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use crate::nand::{NandInfo, SimNand};
    use crate::source::ByteSource;
    use crate::writer::{self, UbiOptions, WriteOptions};

    const TEST_INFO: NandInfo = NandInfo {
        eb_size: 32768,
        min_io_size: 512,
        size: 16 * 32768,
    };
    const LEB_SIZE: usize = TEST_INFO.eb_size as usize - 1024;

    /// Build a UBI image holding `payload` in a volume named "testvol" (id 1)
    fn build_image(payload: &[u8], vol_lebs: i64, bad_peb: Option<u32>) -> Vec<u8> {
        let mut nand = SimNand::new(TEST_INFO);
        if let Some(peb) = bad_peb {
            nand.set_bad(peb);
        }

        let source = ByteSource::reader(Cursor::new(payload.to_vec()), Some(payload.len() as u64));
        writer::run(
            &mut nand,
            Some(source),
            &WriteOptions {
                ubi: Some(UbiOptions {
                    vol_id: 1,
                    vol_name: Some("testvol".to_string()),
                    vol_lebs,
                }),
                ..Default::default()
            },
        )
        .unwrap();

        let mut image = Vec::new();
        nand.save(&mut image).unwrap();
        image
    }

    fn extract(image: &[u8], volume: VolumeRef, skip_bad: bool) -> anyhow::Result<Vec<u8>> {
        let opts = ExtractOptions {
            peb_size: TEST_INFO.eb_size,
            volume,
            skip_bad,
        };
        let mut image = Cursor::new(image);
        let info = find_volume(&mut image, &opts)?;

        let mut out = Cursor::new(Vec::new());
        extract_volume(&mut image, &mut out, &info, opts.skip_bad)?;
        Ok(out.into_inner())
    }

    #[test]
    fn test_round_trip_by_name() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..LEB_SIZE * 3 / 2).map(|i| (i % 251) as u8).collect();
        let image = build_image(&payload, 4, None);

        let out = extract(&image, VolumeRef::Name("testvol".to_string()), false)?;

        // Every LEB of the volume was placed, so the file spans the full volume; the
        // payload occupies its prefix
        assert_eq!(out.len(), 4 * LEB_SIZE);
        assert_eq!(&out[..payload.len()], &payload[..]);
        Ok(())
    }

    #[test]
    fn test_round_trip_by_index() -> anyhow::Result<()> {
        let payload = vec![0x5Au8; LEB_SIZE + 17];
        let image = build_image(&payload, 3, None);

        let mut image = Cursor::new(&image);
        let info = find_volume(
            &mut image,
            &ExtractOptions {
                peb_size: TEST_INFO.eb_size,
                volume: VolumeRef::Index(1),
                skip_bad: false,
            },
        )?;

        assert_eq!(info.vol_name, "testvol");
        assert_eq!(info.vol_index, 1);
        assert_eq!(info.leb_size, LEB_SIZE as u32);

        let mut out = Cursor::new(Vec::new());
        extract_volume(&mut image, &mut out, &info, false)?;
        assert_eq!(&out.into_inner()[..payload.len()], &payload[..]);
        Ok(())
    }

    #[test]
    fn test_missing_volume() {
        let image = build_image(&[0xAA; 100], 2, None);

        let err = extract(&image, VolumeRef::Name("nope".to_string()), false).unwrap_err();
        assert!(err.to_string().contains("not found"));

        let err = extract(&image, VolumeRef::Index(7), false).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_skip_bad_blocks() -> anyhow::Result<()> {
        // A factory-bad block mid-window: the writer routes around it, and the saved
        // image renders it as 0xBD garbage with no valid headers
        let payload: Vec<u8> = (0..LEB_SIZE * 2).map(|i| (i % 239) as u8).collect();
        let image = build_image(&payload, 3, Some(3));

        assert!(extract(&image, VolumeRef::Name("testvol".to_string()), false).is_err());

        let out = extract(&image, VolumeRef::Name("testvol".to_string()), true)?;
        assert_eq!(&out[..payload.len()], &payload[..]);
        Ok(())
    }

    #[test]
    fn test_bad_image_size() {
        let image = vec![0u8; TEST_INFO.eb_size as usize + 1];
        let err = extract(&image, VolumeRef::Index(0), false).unwrap_err();
        assert!(err.to_string().contains("bad size"));

        let err = extract(&[], VolumeRef::Index(0), false).unwrap_err();
        assert!(err.to_string().contains("bad size"));
    }

    #[test]
    fn test_no_volume_table() {
        // Valid geometry, but no layout volume anywhere: EC-only blocks all the way
        let mut nand = SimNand::new(TEST_INFO);
        writer::run(
            &mut nand,
            None,
            &WriteOptions {
                ubi: Some(UbiOptions::default()),
                ..Default::default()
            },
        )
        .unwrap();
        let mut image = Vec::new();
        nand.save(&mut image).unwrap();

        // Blank the layout eraseblocks so only EC-only blocks remain
        let eb = TEST_INFO.eb_size as usize;
        let ec_only = image[4 * eb..5 * eb].to_vec();
        image[..eb].copy_from_slice(&ec_only);
        image[eb..2 * eb].copy_from_slice(&ec_only);

        let err = extract(&image, VolumeRef::Index(0), false).unwrap_err();
        assert!(err.to_string().contains("volume table eraseblock not found"));
    }

    #[test]
    fn test_peb_size_parsing() {
        assert_eq!("4096".parse::<PebSize>().unwrap(), PebSize(4096));
        assert_eq!("128KiB".parse::<PebSize>().unwrap(), PebSize(131072));
        assert_eq!("2MiB".parse::<PebSize>().unwrap(), PebSize(2 * 1024 * 1024));
        assert_eq!("1GiB".parse::<PebSize>().unwrap(), PebSize(1 << 30));
        assert!("".parse::<PebSize>().is_err());
        assert!("12KB".parse::<PebSize>().is_err());
        assert!("0".parse::<PebSize>().is_err());
        assert!("8GiB".parse::<PebSize>().is_err());
    }
}
