/// Buffered, interrupt-driven byte stream over an SPI bus.
///
/// The foreground fills the tx ring and drains the rx ring; the transfer-complete interrupt
/// handler does the opposite. The only state both contexts mutate is the two rings and the
/// `active` flag, which acts as a token: whoever flips it from idle to active owns chip-select and
/// the bus until the interrupt handler hands it back.

use crate::config::{BufferConfig, OverrunPolicy};
use crate::error::{Error, Result};
use crate::hal::{Format, InputPin, IrqHandler, Mode, OutputPin, SpiBus};
use crate::irq::{Callback, CallbackTable, IrqType};
use crate::ring_buffer::RingBuffer;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::SeekFrom;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Frequency programmed at construction
pub const DEFAULT_FREQUENCY_HZ: u32 = 1_000_000;

/// Upper bound on one cooperative wait. Wakeups from the interrupt handler are sent without
/// taking the waiter's lock, so a waiter re-checks at least this often.
const WAIT_SLICE: Duration = Duration::from_millis(1);

const DEFAULT_NAME: &str = "buffered-spi";

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub transfers: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub rx_overruns: u64,
}

#[derive(Default)]
struct Counters {
    transfers: AtomicU64,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    rx_overruns: AtomicU64,
}

struct Shared<B, C, R> {
    bus: B,
    nss: C,
    ready: R,
    tx: RingBuffer,
    rx: RingBuffer,
    /// A transfer is outstanding and chip-select is asserted
    active: AtomicBool,
    /// The byte in flight came from the tx ring (not filler)
    payload_in_flight: AtomicBool,
    callbacks: CallbackTable,
    overrun: OverrunPolicy,
    filler: u8,
    counters: Counters,
    rx_lock: Mutex<()>,
    rx_signal: Condvar,
    tx_lock: Mutex<()>,
    tx_signal: Condvar,
}

impl<B: SpiBus, C: OutputPin, R: InputPin> Shared<B, C, R> {
    /// Start the interrupt pump if the bus is idle. Callable from either context.
    fn prime(&self) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.nss.set_low();
        match self.tx.pop() {
            Some(byte) => self.send(byte, true),
            None => self.send(self.filler, false),
        }
        true
    }

    /// Prime a receive when the peer has data and there is room for it.
    fn request_rx(&self) -> bool {
        self.peer_pending() && self.prime()
    }

    fn peer_pending(&self) -> bool {
        self.ready.is_high() && !self.rx.is_full()
    }

    fn send(&self, byte: u8, payload: bool) {
        self.payload_in_flight.store(payload, Ordering::Release);
        if payload {
            self.counters.tx_bytes.fetch_add(1, Ordering::Relaxed);
            self.tx_signal.notify_all();
        }
        self.bus.start_transfer(byte);
    }

    /// Transfer-complete interrupt handler.
    fn on_transfer_complete(&self) {
        let byte = self.bus.read_data();
        self.counters.transfers.fetch_add(1, Ordering::Relaxed);
        self.capture(byte);
        self.callbacks.dispatch(IrqType::Rx);

        if let Some(next) = self.tx.pop() {
            self.send(next, true);
            return;
        }

        if self.payload_in_flight.load(Ordering::Acquire) {
            self.callbacks.dispatch(IrqType::Tx);
        }

        // The tx callback may have queued more.
        if let Some(next) = self.tx.pop() {
            self.send(next, true);
        } else if self.peer_pending() {
            self.send(self.filler, false);
        } else {
            self.release();
        }
    }

    fn capture(&self, byte: u8) {
        self.counters.rx_bytes.fetch_add(1, Ordering::Relaxed);
        let overrun = match self.overrun {
            OverrunPolicy::OverwriteOldest => self.rx.push_overwrite(byte),
            OverrunPolicy::DropNewest => !self.rx.push(byte),
        };
        if overrun {
            self.counters.rx_overruns.fetch_add(1, Ordering::Relaxed);
            trace!("rx overrun ({:?})", self.overrun);
        }
        self.rx_signal.notify_all();
    }

    /// ACTIVE -> IDLE
    fn release(&self) {
        self.nss.set_high();
        self.payload_in_flight.store(false, Ordering::Release);
        self.active.store(false, Ordering::SeqCst);
        // A write may have queued bytes after the last pop but before the flag cleared.
        // Pairs with the fence in `write`: one side sees the other's store.
        fence(Ordering::SeqCst);
        if !self.tx.is_empty() {
            self.prime();
        }
    }

    fn stats(&self) -> Stats {
        Stats {
            transfers: self.counters.transfers.load(Ordering::Relaxed),
            tx_bytes: self.counters.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
            rx_overruns: self.counters.rx_overruns.load(Ordering::Relaxed),
        }
    }
}

/// Bounded `fmt::Write` sink used by `printf`
struct Truncated {
    buf: Vec<u8>,
    limit: usize,
}

impl fmt::Write for Truncated {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = s.len().min(room);
        self.buf.extend_from_slice(&s.as_bytes()[..take]);
        Ok(())
    }
}

/// Buffered SPI port with a POSIX-like stream interface.
///
/// The control surface (`frequency`, `format`, `enable_nss`, `disable_nss`, `read_u16`) must only
/// be used while no transfer is in flight; this is not checked. Callbacks run in the interrupt
/// context and must not call blocking `read` or `write`.
pub struct BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    shared: Arc<Shared<B, C, R>>,
    blocking: AtomicBool,
    buf_size: usize,
    nss_delay: Duration,
    name: String,
}

impl<B, C, R> BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    /// Create the port, configure the bus at 1 MHz / 8 bits / mode 0, deassert chip-select and
    /// bind the interrupt handler.
    pub fn new(bus: B, nss: C, ready: R, config: &BufferConfig) -> Result<Self> {
        let tx_capacity = config.validate()?;
        bus.set_frequency(DEFAULT_FREQUENCY_HZ)?;
        bus.set_format(Format::default())?;
        nss.set_high();

        let shared = Arc::new(Shared {
            bus,
            nss,
            ready,
            tx: RingBuffer::new(tx_capacity),
            rx: RingBuffer::new(config.buf_size),
            active: AtomicBool::new(false),
            payload_in_flight: AtomicBool::new(false),
            callbacks: CallbackTable::new(),
            overrun: config.overrun,
            filler: config.filler,
            counters: Counters::default(),
            rx_lock: Mutex::new(()),
            rx_signal: Condvar::new(),
            tx_lock: Mutex::new(()),
            tx_signal: Condvar::new(),
        });

        let weak: Weak<Shared<B, C, R>> = Arc::downgrade(&shared);
        let handler: IrqHandler = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_transfer_complete();
            }
        });
        shared.bus.bind_irq(Some(handler));

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        debug!(
            "{}: rx {} bytes, tx {} bytes, overrun policy {:?}",
            name, config.buf_size, tx_capacity, config.overrun
        );

        Ok(BufferedSpi {
            shared,
            blocking: AtomicBool::new(config.blocking),
            buf_size: config.buf_size,
            nss_delay: config.nss_delay(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rx_capacity(&self) -> usize {
        self.shared.rx.capacity()
    }

    pub fn tx_capacity(&self) -> usize {
        self.shared.tx.capacity()
    }

    /// Bytes queued for transmission
    pub fn tx_pending(&self) -> usize {
        self.shared.tx.len()
    }

    /// Bytes waiting to be read
    pub fn available(&self) -> usize {
        self.shared.rx.len()
    }

    /// A transfer is outstanding
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn frequency(&self, hz: u32) -> Result<()> {
        self.shared.bus.set_frequency(hz)?;
        debug!("{}: frequency {} Hz", self.name, hz);
        Ok(())
    }

    pub fn format(&self, bits: u8, mode: Mode) -> Result<()> {
        self.shared.bus.set_format(Format { bits, mode })?;
        debug!("{}: format {} bits, {:?}", self.name, bits, mode);
        Ok(())
    }

    pub fn enable_nss(&self) {
        self.shared.nss.set_low();
        self.settle();
    }

    pub fn disable_nss(&self) {
        self.shared.nss.set_high();
        self.settle();
    }

    fn settle(&self) {
        if !self.nss_delay.is_zero() {
            thread::sleep(self.nss_delay);
        }
    }

    /// At least one byte can be read without blocking
    pub fn readable(&self) -> bool {
        !self.shared.rx.is_empty()
    }

    /// Always `true`: room is never a precondition for calling `write`, which reports a short
    /// count instead.
    pub fn writeable(&self) -> bool {
        true
    }

    /// Next received byte, if any. Never blocks.
    pub fn getc(&self) -> Option<u8> {
        self.shared.rx.pop()
    }

    pub fn putc(&self, c: u8) -> Result<u8> {
        self.write(&[c]).map(|_| c)
    }

    /// Write `s` followed by a newline. Returns the number of bytes accepted.
    pub fn puts(&self, s: &str) -> Result<usize> {
        let mut accepted = self.write(s.as_bytes())?;
        if accepted == s.len() {
            match self.write(b"\n") {
                Ok(n) => accepted += n,
                Err(Error::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    /// Write formatted output, truncated to `buf_size` bytes.
    ///
    /// See also [`spi_printf!`](crate::spi_printf).
    pub fn printf(&self, args: fmt::Arguments<'_>) -> Result<usize> {
        let mut out = Truncated {
            buf: Vec::with_capacity(self.buf_size),
            limit: self.buf_size,
        };
        // Truncated never fails; a failing Display impl just ends the output early.
        let _ = fmt::write(&mut out, args);
        self.write(&out.buf)
    }

    /// Queue `data` for transmission and start the bus if it is idle.
    ///
    /// Non-blocking: returns how many bytes fit, or `WouldBlock` if none did.
    /// Blocking: waits for room until every byte is queued.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        let mut written = 0;
        loop {
            while written < data.len() && shared.tx.push(data[written]) {
                written += 1;
            }
            fence(Ordering::SeqCst);
            if !shared.tx.is_empty() && shared.prime() {
                trace!("{}: primed tx", self.name);
            }
            if written == data.len() {
                break;
            }
            if !self.is_blocking() {
                if written == 0 {
                    return Err(Error::WouldBlock);
                }
                break;
            }
            let mut guard = shared.tx_lock.lock();
            if shared.tx.is_full() {
                shared.tx_signal.wait_for(&mut guard, WAIT_SLICE);
            }
        }
        Ok(written)
    }

    /// Read up to `buf.len()` received bytes.
    ///
    /// Returns immediately when data is available. Otherwise fails with `WouldBlock` in
    /// non-blocking mode, or waits for the first byte in blocking mode. There is no timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.shared.rx.is_empty() {
            if !self.is_blocking() {
                return Err(Error::WouldBlock);
            }
            self.wait_readable();
        }
        let count = self.shared.rx.pop_into(buf);
        // Reception may have stalled on a full ring.
        self.shared.request_rx();
        Ok(count)
    }

    fn wait_readable(&self) {
        let shared = &self.shared;
        let mut guard = shared.rx_lock.lock();
        while shared.rx.is_empty() {
            shared.request_rx();
            shared.rx_signal.wait_for(&mut guard, WAIT_SLICE);
        }
    }

    /// Start a receive if the peer signals data-ready and the rx ring has room.
    /// Returns `true` if a transfer was started.
    pub fn request_rx(&self) -> bool {
        let started = self.shared.request_rx();
        if started {
            trace!("{}: primed rx", self.name);
        }
        started
    }

    /// Read one 16-bit frame with two blocking exchanges, low byte first.
    pub fn read_u16(&self) -> u16 {
        let lo = self.shared.bus.transfer(self.shared.filler);
        let hi = self.shared.bus.transfer(self.shared.filler);
        u16::from_le_bytes([lo, hi])
    }

    /// Drop queued tx bytes. The byte already in flight still completes.
    pub fn flush_txbuf(&self) {
        let dropped = self.shared.tx.len();
        self.shared.tx.clear();
        self.shared.tx_signal.notify_all();
        debug!("{}: flushed {} tx bytes", self.name, dropped);
    }

    /// Replace the callback for `irq`; `None` disables it.
    pub fn attach(&self, callback: Option<Callback>, irq: IrqType) {
        self.shared.callbacks.attach(callback, irq);
    }

    /// Bind `method` on `obj` as the callback for `irq`.
    pub fn attach_method<T>(&self, obj: Arc<T>, method: fn(&T), irq: IrqType)
    where
        T: Send + Sync + 'static,
    {
        self.attach(Some(Arc::new(move || method(&obj))), irq);
    }

    pub fn seek(&self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    /// Nothing to release for a device handle; always succeeds.
    pub fn close(&self) -> Result<()> {
        debug!("{}: close", self.name);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.shared.stats()
    }
}

impl<B, C, R> Drop for BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    fn drop(&mut self) {
        // Unbind first: the handler must not outlive the buffers it writes into.
        self.shared.bus.bind_irq(None);
        self.shared.nss.set_high();
        debug!("{}: interrupt unbound", self.name);
    }
}

impl<B, C, R> fmt::Debug for BufferedSpi<B, C, R>
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedSpi")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("tx", &self.shared.tx)
            .field("rx", &self.shared.rx)
            .field("callbacks", &self.shared.callbacks)
            .finish()
    }
}

/// `printf`-style formatted write to a [`BufferedSpi`].
#[macro_export]
macro_rules! spi_printf {
    ($spi:expr, $($arg:tt)*) => {
        $spi.printf(format_args!($($arg)*))
    };
}
