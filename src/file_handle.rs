/// Uniform stream-device surface.
///
/// Callers that only need a byte stream depend on [`FileHandle`] rather than on a concrete
/// device. [`BufferedSpi`] implements it, along with `std::io::Read` and `std::io::Write`.

use crate::buffered_spi::BufferedSpi;
use crate::error::Result;
use crate::hal::{InputPin, OutputPin, SpiBus};
use std::io::{self, SeekFrom};

pub trait FileHandle {
    /// Read available bytes. Non-blocking handles fail with `WouldBlock` when empty.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Queue bytes, returning how many were accepted.
    fn write(&self, data: &[u8]) -> Result<usize>;

    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    fn close(&self) -> Result<()>;

    fn set_blocking(&self, blocking: bool);

    fn is_blocking(&self) -> bool;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;
}

impl<B, C, R> FileHandle for BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        BufferedSpi::read(self, buf)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        BufferedSpi::write(self, data)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        BufferedSpi::seek(self, pos)
    }

    fn close(&self) -> Result<()> {
        BufferedSpi::close(self)
    }

    fn set_blocking(&self, blocking: bool) {
        BufferedSpi::set_blocking(self, blocking)
    }

    fn is_blocking(&self) -> bool {
        BufferedSpi::is_blocking(self)
    }

    fn readable(&self) -> bool {
        BufferedSpi::readable(self)
    }

    fn writable(&self) -> bool {
        self.writeable()
    }
}

impl<B, C, R> io::Read for BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BufferedSpi::read(&*self, buf).map_err(io::Error::from)
    }
}

impl<B, C, R> io::Write for BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BufferedSpi::write(&*self, buf).map_err(io::Error::from)
    }

    /// Bytes are handed to the interrupt pump as soon as they are queued.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::error::Error;
    use crate::sim::{EchoPeer, SimBus, SimPin};
    use std::io::{Read, Write};
    use std::sync::Arc;

    fn echo_handle() -> (
        BufferedSpi<Arc<SimBus<EchoPeer>>, SimPin, crate::sim::PeerReadyLine<EchoPeer>>,
        Arc<SimBus<EchoPeer>>,
    ) {
        let bus = Arc::new(SimBus::manual(EchoPeer::new(0)));
        let ready = bus.data_ready_line();
        let config = BufferConfig {
            buf_size: 16,
            tx_multiple: 2,
            blocking: false,
            ..BufferConfig::default()
        };
        let spi = BufferedSpi::new(Arc::clone(&bus), SimPin::new(true), ready, &config).unwrap();
        (spi, bus)
    }

    fn roundtrip(handle: &dyn FileHandle, bus: &SimBus<EchoPeer>) -> Vec<u8> {
        assert_eq!(handle.write(b"ping"), Ok(4));
        bus.run_until_idle();
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_through_trait_object() {
        let (spi, bus) = echo_handle();
        let handle: &dyn FileHandle = &spi;
        assert!(!handle.is_blocking());
        assert!(handle.writable());
        assert!(!handle.readable());
        assert_eq!(handle.read(&mut [0u8; 4]), Err(Error::WouldBlock));

        // First byte clocked in is the echo peer's idle output.
        assert_eq!(roundtrip(handle, &bus), b"\0ping".to_vec());
        assert_eq!(handle.seek(SeekFrom::End(0)), Err(Error::NotSeekable));
        assert_eq!(handle.close(), Ok(()));
    }

    #[test]
    fn test_io_traits() {
        let (mut spi, bus) = echo_handle();
        let mut buf = [0u8; 8];
        let err = Read::read(&mut spi, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        write!(spi, "ab").unwrap();
        spi.flush().unwrap();
        bus.run_until_idle();

        let n = Read::read(&mut spi, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\0ab");
    }
}
