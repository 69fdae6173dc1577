//! Positional I/O used by the transfer engines.
//!
//! Chunks finish in arbitrary order, so sources and sinks are addressed by
//! absolute offset instead of through a shared cursor.

use std::fs::File;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// A source that can be read at arbitrary offsets from several workers at once.
pub trait ReadAt: Sync {
    /// Reads up to `buf.len()` bytes at `offset`; returns 0 at end of data.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// A sink that accepts concurrent writes at disjoint offsets.
pub trait WriteAt: Sync {
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

#[cfg(unix)]
impl ReadAt for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(unix)]
impl WriteAt for File {
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

#[cfg(windows)]
impl WriteAt for File {
    fn write_all_at(&self, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = std::os::windows::fs::FileExt::seek_write(self, buf, offset)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(v) if v < self.len() => v,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

/// In-memory sink; grows as needed and zero-fills gaps.
impl WriteAt for Mutex<Vec<u8>> {
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows usize"))?;
        let end = start + buf.len();
        let mut inner = self.lock().expect("buffer mutex poisoned");
        if inner.len() < end {
            inner.resize(end, 0);
        }
        inner[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Exposes `[offset, offset + len)` of a [`ReadAt`] as an async stream.
pub struct SectionReader<'a, R: ?Sized> {
    source: &'a R,
    offset: u64,
    len: u64,
    pos: u64,
}

impl<'a, R: ReadAt + ?Sized> SectionReader<'a, R> {
    pub fn new(source: &'a R, offset: u64, len: u64) -> Self {
        Self {
            source,
            offset,
            len,
            pos: 0,
        }
    }
}

impl<R: ReadAt + ?Sized> AsyncRead for SectionReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.len - this.pos;
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let want = (buf.remaining() as u64).min(remaining) as usize;
        let dst = buf.initialize_unfilled_to(want);
        let n = this.source.read_at(this.offset + this.pos, dst)?;
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "source ended at {} while reading section of {} bytes",
                    this.offset + this.pos,
                    this.len
                ),
            )));
        }
        buf.advance(n);
        this.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn section_reader_reads_only_its_range() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut reader = SectionReader::new(&data, 10, 20);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data[10..30].to_vec());
    }

    #[tokio::test]
    async fn section_past_end_of_source_fails() {
        let data = vec![1u8; 8];
        let mut reader = SectionReader::new(&data, 4, 10);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn memory_sink_accepts_out_of_order_writes() {
        let sink: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        sink.write_all_at(4, b"world").unwrap();
        sink.write_all_at(0, b"hey ").unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), b"hey world");
    }

    #[test]
    fn file_positional_round_trip() {
        let file = tempfile::tempfile().unwrap();
        file.write_all_at(3, b"abc").unwrap();
        file.write_all_at(0, b"xyz").unwrap();
        let mut buf = [0u8; 6];
        let n = ReadAt::read_at(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyzabc");
    }
}
