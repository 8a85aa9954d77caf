//! Payload input adapters for the writer.
//!
//! A [ByteSource] wraps either a regular file (with optional skip/length windowing) or
//! stdin (with an optional length cap) behind one bounded-read interface, so the write
//! engine never has to care where the payload comes from.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{ensure, Context};

use crate::util::ReadExt;

pub struct ByteSource {
    reader: Box<dyn Read>,
    /// Bytes remaining, or None when reading stdin without a length cap
    left: Option<u64>,
}

impl ByteSource {
    /// Open a file as the payload, skipping `skip` bytes and reading at most `length`
    /// bytes (default: the rest of the file).
    pub fn file<P: AsRef<Path>>(path: P, skip: u64, length: Option<u64>) -> anyhow::Result<Self> {
        let mut file = File::open(&path)
            .with_context(|| format!("failed to open image file {}", path.as_ref().display()))?;
        let file_size = file.metadata()?.len();

        ensure!(
            skip + length.unwrap_or(0) <= file_size,
            "image file is too small"
        );
        let size = length.unwrap_or(file_size - skip);

        if skip > 0 {
            file.seek(SeekFrom::Start(skip))
                .context("failed to seek input file")?;
        }

        Ok(Self {
            reader: Box::new(file),
            left: Some(size),
        })
    }

    /// Read the payload from stdin, optionally capped at `length` bytes.
    ///
    /// Without a length the stream is unbounded and end-of-stream terminates the
    /// payload gracefully.
    pub fn stdin(length: Option<u64>) -> Self {
        Self::reader(io::stdin(), length)
    }

    /// Read the payload from an arbitrary stream, optionally capped at `length` bytes
    pub fn reader(reader: impl Read + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            left: length,
        }
    }

    /// Bytes left to deliver, or None if the source is unbounded
    pub fn remaining(&self) -> Option<u64> {
        self.left
    }

    /// Read the next chunk of payload into the front of `buf`.
    ///
    /// At most `min(remaining, buf.len())` bytes are read. A short read is an error
    /// unless the source is unbounded, in which case it marks the end of the payload.
    pub fn read_block(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let want = match self.left {
            Some(left) => left.min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        if want == 0 {
            return Ok(0);
        }

        let got = self
            .reader
            .read_full(&mut buf[..want])
            .context("failed to read input data")?;

        if let Some(left) = &mut self.left {
            ensure!(got == want, "unexpected end of input data");
            *left -= got as u64;
        }

        Ok(got)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    fn temp_file(content: &[u8]) -> anyhow::Result<std::path::PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "ubiflash-source-test-{}-{}",
            std::process::id(),
            content.len()
        ));
        File::create(&path)?.write_all(content)?;
        Ok(path)
    }

    #[test]
    fn test_file_windowing() -> anyhow::Result<()> {
        let path = temp_file(&[1, 2, 3, 4, 5, 6, 7, 8])?;

        let mut src = ByteSource::file(&path, 2, Some(4))?;
        assert_eq!(src.remaining(), Some(4));
        let mut buf = [0u8; 16];
        assert_eq!(src.read_block(&mut buf)?, 4);
        assert_eq!(&buf[..4], &[3, 4, 5, 6]);
        assert_eq!(src.remaining(), Some(0));
        assert_eq!(src.read_block(&mut buf)?, 0);

        // A window past the end of the file is rejected up front
        assert!(ByteSource::file(&path, 4, Some(5)).is_err());

        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn test_premature_eof() -> anyhow::Result<()> {
        // A bounded source must deliver every byte it promised
        let mut src = ByteSource {
            reader: Box::new(&[1u8, 2, 3][..]),
            left: Some(8),
        };
        let mut buf = [0u8; 8];
        assert!(src.read_block(&mut buf).is_err());

        // An unbounded source treats EOF as end of payload
        let mut src = ByteSource {
            reader: Box::new(&[1u8, 2, 3][..]),
            left: None,
        };
        assert_eq!(src.read_block(&mut buf)?, 3);
        assert_eq!(src.read_block(&mut buf)?, 0);
        Ok(())
    }
}
