//! Abstractions and code to access NAND flash

use std::io::Write;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the geometry of a NAND flash device
#[derive(Debug, Copy, Clone)]
pub struct NandInfo {
    /// Size of a physical eraseblock, in bytes
    pub eb_size: u32,

    /// Size of a page, the smallest programmable unit, in bytes
    pub min_io_size: u32,

    /// Total device size, in bytes
    pub size: u64,
}

impl NandInfo {
    /// How many physical eraseblocks does the device hold?
    pub fn peb_count(&self) -> u32 {
        (self.size / u64::from(self.eb_size)) as u32
    }

    /// How many pages per eraseblock?
    pub fn pages_per_eb(&self) -> u32 {
        self.eb_size / self.min_io_size
    }
}

/// Represents a NAND flash device, addressed by physical eraseblock index
pub trait Nand {
    /// Get the geometry of the device
    fn info(&self) -> NandInfo;

    /// Is the eraseblock marked bad?
    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool>;

    /// Erase an eraseblock, returning all of its pages to the all-1s state
    fn erase(&mut self, peb: u32) -> anyhow::Result<()>;

    /// Program one page of an eraseblock.
    ///
    /// `page_offset` is the byte offset of the page within the eraseblock and must be
    /// page-aligned. `data`, when present, must be exactly one page long; when absent,
    /// the main area of the page is not programmed. `oob` bytes, when present, are
    /// placed into the page's out-of-band area by the driver.
    fn write_page(
        &mut self,
        peb: u32,
        page_offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()>;

    /// Mark the eraseblock bad. Further writes and erases of it will fail.
    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    pebs: Vec<SimPeb>,
    info: NandInfo,
    program_ops: u64,
}

/// An eraseblock of SimNand
#[derive(Debug, Clone)]
struct SimPeb {
    /// Contents of the main area, `eb_size` bytes
    data: Vec<u8>,

    /// Which pages have had their main area programmed since the last erase
    programmed: Vec<bool>,

    /// Out-of-band bytes per page, if any were written
    oob: Vec<Option<Vec<u8>>>,

    /// Is this eraseblock marked bad?
    marked_bad: bool,

    /// Fail this many upcoming `write_page` calls (test fault injection)
    fail_writes: u32,
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry
    pub fn new(info: NandInfo) -> Self {
        assert!(info.eb_size % info.min_io_size == 0);
        assert!(info.size % u64::from(info.eb_size) == 0);

        let pages = info.pages_per_eb() as usize;
        let peb = SimPeb {
            data: vec![0xFF; info.eb_size as usize],
            programmed: vec![false; pages],
            oob: vec![None; pages],
            marked_bad: false,
            fail_writes: 0,
        };

        Self {
            pebs: vec![peb; info.peb_count() as usize],
            info,
            program_ops: 0,
        }
    }

    fn peb(&mut self, peb: u32) -> anyhow::Result<&mut SimPeb> {
        self.pebs
            .get_mut(peb as usize)
            .ok_or(anyhow::anyhow!("eraseblock {peb} out of range"))
    }

    /// Pre-mark an eraseblock bad, as if it came bad from the factory
    pub fn set_bad(&mut self, peb: u32) {
        self.pebs[peb as usize].marked_bad = true;
    }

    /// Make the next `count` page writes to the eraseblock fail
    pub fn fail_next_writes(&mut self, peb: u32, count: u32) {
        self.pebs[peb as usize].fail_writes = count;
    }

    /// The main-area contents of an eraseblock
    pub fn peb_data(&self, peb: u32) -> &[u8] {
        &self.pebs[peb as usize].data
    }

    /// Has the main area of the given page been programmed since the last erase?
    pub fn page_programmed(&self, peb: u32, page: u32) -> bool {
        self.pebs[peb as usize].programmed[page as usize]
    }

    /// The out-of-band bytes written to the given page, if any
    pub fn page_oob(&self, peb: u32, page: u32) -> Option<&[u8]> {
        self.pebs[peb as usize].oob[page as usize].as_deref()
    }

    /// Total number of physical page programs performed
    pub fn program_ops(&self) -> u64 {
        self.program_ops
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File).
    ///
    /// Bad eraseblocks are rendered as `0xBD` filler.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let filler = vec![0xBD; self.info.eb_size as usize];
        for peb in &self.pebs {
            if peb.marked_bad {
                write.write_all(&filler)?;
            } else {
                write.write_all(&peb.data)?;
            }
        }
        Ok(())
    }
}

impl Nand for SimNand {
    fn info(&self) -> NandInfo {
        self.info
    }

    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool> {
        Ok(self.peb(peb)?.marked_bad)
    }

    fn erase(&mut self, peb: u32) -> anyhow::Result<()> {
        let block = self.peb(peb)?;
        ensure!(!block.marked_bad, "erase of bad eraseblock {peb}");

        block.data.fill(0xFF);
        block.programmed.fill(false);
        block.oob.fill(None);
        Ok(())
    }

    fn write_page(
        &mut self,
        peb: u32,
        page_offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let min_io = self.info.min_io_size;
        let block = self.peb(peb)?;

        ensure!(page_offset % min_io == 0, "unaligned page offset");
        ensure!(page_offset < block.data.len() as u32, "page out of bounds");
        let page = (page_offset / min_io) as usize;

        if block.fail_writes > 0 {
            block.fail_writes -= 1;
            bail!("simulated write failure at eraseblock {peb}");
        }
        ensure!(!block.marked_bad, "write to bad eraseblock {peb}");

        if let Some(data) = data {
            ensure!(data.len() == min_io as usize, "data not page-sized");
            ensure!(!block.programmed[page], "page written twice without erase");
            let begin = page_offset as usize;
            block.data[begin..begin + data.len()].copy_from_slice(data);
            block.programmed[page] = true;
        }

        if let Some(oob) = oob {
            ensure!(block.oob[page].is_none(), "page OOB written twice");
            block.oob[page] = Some(oob.to_vec());
        }

        if data.is_some() || oob.is_some() {
            self.program_ops += 1;
        }

        Ok(())
    }

    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()> {
        self.peb(peb)?.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_INFO: NandInfo = NandInfo {
    eb_size: 2048,
    min_io_size: 256,
    size: 8 * 2048,
};

#[test]
fn test_sim_geometry() {
    let mut nand = SimNand::new(TEST_INFO);
    assert_eq!(nand.info().peb_count(), 8);
    assert_eq!(nand.info().pages_per_eb(), 8);
    assert!(!nand.is_bad(0).unwrap());
    assert!(nand.is_bad(8).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_INFO);
    nand.mark_bad(3).unwrap();
    assert!(nand.is_bad(3).unwrap());
    assert!(nand.erase(3).is_err());
    assert!(nand.write_page(3, 0, Some(&[0u8; 256][..]), None).is_err());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_INFO);

    let data = [0xA5u8; 256];
    nand.write_page(0, 512, Some(&data[..]), None).unwrap();

    assert!(nand.peb_data(0)[..512].is_erased());
    assert_eq!(&nand.peb_data(0)[512..768], &data);
    assert!(nand.peb_data(0)[768..].is_erased());
    assert!(nand.page_programmed(0, 2));
    assert!(!nand.page_programmed(0, 1));

    // Programming the same page again without an erase must fail
    assert!(nand.write_page(0, 512, Some(&data[..]), None).is_err());
    nand.erase(0).unwrap();
    assert!(nand.peb_data(0).is_erased());
    nand.write_page(0, 512, Some(&data[..]), None).unwrap();
}

#[test]
fn test_sim_oob() {
    let mut nand = SimNand::new(TEST_INFO);

    nand.write_page(1, 0, None, Some(&[1, 2, 3][..])).unwrap();
    assert_eq!(nand.page_oob(1, 0), Some(&[1u8, 2, 3][..]));
    assert!(nand.peb_data(1).is_erased());
    assert!(!nand.page_programmed(1, 0));
    assert_eq!(nand.program_ops(), 1);
}

#[test]
fn test_sim_fault_injection() {
    let mut nand = SimNand::new(TEST_INFO);

    nand.fail_next_writes(0, 1);
    assert!(nand.write_page(0, 0, Some(&[0u8; 256][..]), None).is_err());
    nand.write_page(0, 0, Some(&[0u8; 256][..]), None).unwrap();
}
