//! Buffered temporary files backing spills and redistribution overflow.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use quern_error::{QuernError, Result, ResultExt};
use tempfile::NamedTempFile;

/// A buffered file owned by the operator that created it.
///
/// Files are written append-only, then rewound and read back in full. The
/// backing temp file stays alive for as long as the creator holds the
/// `BufFile`, which lets peer workers open it by name in the meantime.
#[derive(Debug)]
pub struct BufFile {
    /// Present when this side created the file; keeps the file on disk.
    temp: Option<NamedTempFile>,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,
}

impl BufFile {
    /// Create a new buffered temp file.
    pub fn create_temp() -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("quern_spill_")
            .tempfile()
            .context("Failed to create spill file")?;
        let path = temp.path().to_path_buf();
        let writer = BufWriter::new(temp.reopen().context("Failed to reopen spill file")?);
        Ok(BufFile {
            temp: Some(temp),
            path,
            writer: Some(writer),
            reader: None,
        })
    }

    /// Open an existing file by name, read-only. Used by redistribution
    /// consumers draining a peer's published overflow files.
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .context_fn(|| format!("Failed to open buffered file: {}", path.display()))?;
        Ok(BufFile {
            temp: None,
            path: path.to_path_buf(),
            writer: None,
            reader: Some(BufReader::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| QuernError::new("Buffered file is not open for writing"))
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        self.reader
            .as_mut()
            .ok_or_else(|| QuernError::new("Buffered file is not open for reading"))
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer()?
            .write_all(bytes)
            .context("Failed to write to buffered file")
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Flush buffered writes to disk.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().context("Failed to flush buffered file")?;
        }
        Ok(())
    }

    /// Finish writing and position a reader at the start of the file.
    pub fn rewind_for_read(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("Failed to flush buffered file")?;
        }
        let file = match (&self.temp, self.reader.take()) {
            (Some(temp), _) => temp.reopen().context("Failed to reopen buffered file")?,
            (None, Some(reader)) => {
                let mut file = reader.into_inner();
                file.seek(SeekFrom::Start(0))
                    .context("Failed to rewind buffered file")?;
                file
            }
            (None, None) => return Err(QuernError::new("Buffered file has no readable handle")),
        };
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader()?
            .read_exact(buf)
            .context("Failed to read from buffered file")
    }

    /// Read a little-endian u32, or None at a clean end of file. A partial
    /// read is an error.
    pub fn read_u32_opt(&mut self) -> Result<Option<u32>> {
        match self.read_scalar_opt::<4>()? {
            Some(bytes) => Ok(Some(u32::from_le_bytes(bytes))),
            None => Ok(None),
        }
    }

    /// Read a little-endian i32, or None at a clean end of file.
    pub fn read_i32_opt(&mut self) -> Result<Option<i32>> {
        match self.read_scalar_opt::<4>()? {
            Some(bytes) => Ok(Some(i32::from_le_bytes(bytes))),
            None => Ok(None),
        }
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_scalar_opt<const N: usize>(&mut self) -> Result<Option<[u8; N]>> {
        let reader = self.reader()?;
        let mut bytes = [0u8; N];
        let mut filled = 0;
        while filled < N {
            let n = reader
                .read(&mut bytes[filled..])
                .context("Failed to read from buffered file")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(QuernError::new("Buffered file truncated mid-record"));
            }
            filled += n;
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rewind_read() {
        let mut file = BufFile::create_temp().unwrap();
        file.write_u32(7).unwrap();
        file.write_u64(1 << 40).unwrap();
        file.write_all(b"payload").unwrap();

        file.rewind_for_read().unwrap();
        assert_eq!(Some(7), file.read_u32_opt().unwrap());
        assert_eq!(1 << 40, file.read_u64().unwrap());
        let mut buf = [0u8; 7];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(b"payload", &buf);
        assert_eq!(None, file.read_u32_opt().unwrap());
    }

    #[test]
    fn open_by_path_sees_flushed_data() {
        let mut file = BufFile::create_temp().unwrap();
        file.write_u32(42).unwrap();
        file.flush().unwrap();

        let mut other = BufFile::open_path(file.path()).unwrap();
        other.rewind_for_read().unwrap();
        assert_eq!(Some(42), other.read_u32_opt().unwrap());
    }

    #[test]
    fn rereading_restarts_from_zero() {
        let mut file = BufFile::create_temp().unwrap();
        file.write_u32(1).unwrap();
        file.rewind_for_read().unwrap();
        assert_eq!(Some(1), file.read_u32_opt().unwrap());
        file.rewind_for_read().unwrap();
        assert_eq!(Some(1), file.read_u32_opt().unwrap());
    }
}
