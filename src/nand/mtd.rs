//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandInfo};

use anyhow::ensure;

use std::fs::File;
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    info: NandInfo,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, info })
    }

    /// Compute the offset of the first byte of an eraseblock, validating the index
    fn peb_base(&self, peb: u32) -> anyhow::Result<u64> {
        ensure!(peb < self.info.peb_count(), "eraseblock {peb} out of range");
        Ok(u64::from(peb) * u64::from(self.info.eb_size))
    }
}

impl Nand for MtdNand {
    fn info(&self) -> NandInfo {
        self.info
    }

    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool> {
        let base = self.peb_base(peb)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &base)? };
        Ok(bad != 0)
    }

    fn erase(&mut self, peb: u32) -> anyhow::Result<()> {
        let base = self.peb_base(peb)?;
        let erase_info = ioctl::erase_info_user {
            start: base as u32,
            length: self.info.eb_size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn write_page(
        &mut self,
        peb: u32,
        page_offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        ensure!(page_offset % self.info.min_io_size == 0, "unaligned page offset");
        ensure!(page_offset < self.info.eb_size, "page out of bounds");
        if let Some(data) = data {
            ensure!(data.len() == self.info.min_io_size as usize, "data not page-sized");
        }

        let start = self.peb_base(peb)? + u64::from(page_offset);

        match (data, oob) {
            (None, None) => Ok(()),

            // Plain page programs go through the regular write path
            (Some(data), None) => Ok(self.file.write_all_at(data, start)?),

            // Anything touching the OOB area needs the MEMWRITE ioctl
            (data, oob) => {
                let mut req = ioctl::mtd_write_req {
                    start,
                    len: data.map_or(0, |d| d.len() as u64),
                    ooblen: oob.map_or(0, |o| o.len() as u64),
                    usr_data: data.map_or(0, |d| d.as_ptr() as u64),
                    usr_oob: oob.map_or(0, |o| o.as_ptr() as u64),
                    mode: ioctl::MTD_OPS_AUTO_OOB,
                    padding: [0; 7],
                };
                unsafe {
                    ioctl::memwrite(self.file.as_raw_fd(), &mut req)?;
                }
                Ok(())
            }
        }
    }

    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()> {
        let base = self.peb_base(peb)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandInfo;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// OOB placement handled automatically by the driver's ECC layout
    pub const MTD_OPS_AUTO_OOB: u8 = 1;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandInfo> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandInfo> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandInfo {
                eb_size: self.erasesize,
                min_io_size: self.writesize,
                size: u64::from(self.size),
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);
}
