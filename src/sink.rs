use std::{
  fs::OpenOptions,
  io::{self, Write},
  path::Path,
};

use memmap2::MmapMut;

/// Fixed-capacity log sink backed by an mmap'd file.
///
/// Useful when the producer must not take the page-cache write path on
/// every flush; the file is sized up front and writes fail once capacity
/// is exhausted rather than growing the log unboundedly.
pub struct MmapLogSink {
  mmap: MmapMut,
  position: usize,
}

impl MmapLogSink {
  /// # Errors
  ///
  /// Returns an error if the backing file cannot be created, resized, or
  /// mapped into memory.
  pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
    let capacity = capacity.max(1);

    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .truncate(true)
      .open(path)?;

    let capacity_u64 = u64::try_from(capacity)
      .map_err(|_| io::Error::other("capacity exceeds u64"))?;

    file.set_len(capacity_u64)?;

    // SAFETY: the file handle remains open for the lifetime of the mapping.
    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self { mmap, position: 0 })
  }

  /// Bytes written so far; the log's true length if the file is later
  /// truncated to it.
  #[must_use]
  pub fn position(&self) -> usize {
    self.position
  }
}

impl Write for MmapLogSink {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    let Some(end) = self.position.checked_add(data.len()) else {
      return Err(io::Error::other("mmap position overflow"));
    };

    if end > self.mmap.len() {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "mmap capacity exceeded",
      ));
    }

    self.mmap[self.position..end].copy_from_slice(data);

    self.position = end;

    Ok(data.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.mmap.flush_async()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_advance_position_until_capacity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sink =
      MmapLogSink::create(dir.path().join("log.bin"), 16).expect("create");

    sink.write_all(&[1u8; 8]).expect("first write");
    assert_eq!(sink.position(), 8);

    sink.write_all(&[2u8; 8]).expect("second write");
    assert_eq!(sink.position(), 16);

    assert!(sink.write_all(&[3u8; 1]).is_err());
  }
}
