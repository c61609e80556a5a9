use super::ClusterContainer;
use crate::error::Result;
use crate::storage::Storage;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Seekable byte view of one logical stream
///
/// Writes past the end extend the stream; a gap between the old end and the
/// write position reads back as zeros.
pub struct ClusterStream<'a, S: Storage> {
    container: &'a mut ClusterContainer<S>,
    id: u64,
    position: u64,
    writable: bool,
}

impl<'a, S: Storage> ClusterStream<'a, S> {
    pub(super) fn new(container: &'a mut ClusterContainer<S>, id: u64, writable: bool) -> Self {
        ClusterStream {
            container,
            id,
            position: 0,
            writable,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> Result<u64> {
        self.container.stream_len(self.id)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or zero-extend the stream; the position is left unchanged
    pub fn set_len(&mut self, length: u64) -> Result<()> {
        self.check_writable()?;
        self.container.resize_stream(self.id, length)
    }

    fn check_writable(&self) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("stream {} opened read-only", self.id),
            ));
        }
        Ok(())
    }
}

impl<S: Storage> Read for ClusterStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length = self.container.stream_len(self.id)?;
        if self.position >= length || buf.is_empty() {
            return Ok(0);
        }
        let n = ((length - self.position) as usize).min(buf.len());
        self.container.read_at(self.id, self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: Storage> Write for ClusterStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        self.container.write_at(self.id, self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.container.flush()?;
        Ok(())
    }
}

impl<S: Storage> Seek for ClusterStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => {
                let length = self.container.stream_len(self.id)?;
                length.checked_add_signed(delta)
            }
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
