use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Reads a fixed byte range of a shared seekable source.
///
/// Each reader keeps its own position and seeks the source before every
/// read, so any number of sections over the same source can be open at once.
pub struct SectionReader<'a, R: Read + Seek> {
    source: &'a Mutex<R>,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a, R: Read + Seek> SectionReader<'a, R> {
    pub fn new(source: &'a Mutex<R>, start: u64, len: u64) -> Self {
        Self {
            source,
            start,
            len,
            pos: 0,
        }
    }
}

impl<R: Read + Seek> Read for SectionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));

        let mut source = self
            .source
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "source lock poisoned"))?;
        source.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "source ended {} bytes before the end of the section",
                    remaining
                ),
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

/// Reads `len` bytes at `offset` from a shared source.
pub fn read_at<R: Read + Seek>(source: &Mutex<R>, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SectionReader::new(source, offset, len as u64).read_exact(&mut buf)?;
    Ok(buf)
}
