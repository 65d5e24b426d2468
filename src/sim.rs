/// Simulated SPI peripheral, GPIO lines and peer devices.
///
/// `SimBus` stands in for the hardware: an exchange started with `start_transfer` completes
/// later and raises the bound interrupt handler. In threaded mode a dedicated "irq" thread
/// completes exchanges as soon as they are started, which gives the engine a genuinely
/// preemptive second context. In manual mode nothing happens until the caller fires the
/// interrupt with [`SimBus::complete`], which makes tests deterministic.

use crate::error::BusError;
use crate::hal::{Format, InputPin, IrqHandler, OutputPin, SpiBus};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const MAX_FREQUENCY_HZ: u32 = 50_000_000;

/// Device on the far end of the bus
pub trait Peer: Send + 'static {
    /// Shift `mosi` in and return the byte shifted out on MISO.
    fn exchange(&mut self, mosi: u8) -> u8;

    /// Level of the peer's data-ready line
    fn data_ready(&self) -> bool {
        false
    }
}

struct SimState<P> {
    peer: P,
    pending: Option<u8>,
    data: u8,
    frequency: u32,
    format: Format,
    mosi_log: Vec<u8>,
    stop: bool,
}

struct SimInner<P> {
    state: Mutex<SimState<P>>,
    wakeup: Condvar,
    handler: Mutex<Option<IrqHandler>>,
}

impl<P: Peer> SimInner<P> {
    /// Finish the pending exchange, if any, then raise the interrupt.
    fn complete(&self) -> bool {
        {
            let mut state = self.state.lock();
            let byte = match state.pending.take() {
                Some(byte) => byte,
                None => return false,
            };
            let miso = state.peer.exchange(byte);
            state.data = miso;
            state.mosi_log.push(byte);
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
        true
    }
}

pub struct SimBus<P: Peer> {
    inner: Arc<SimInner<P>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: Peer> SimBus<P> {
    /// Bus whose interrupts are fired by the caller.
    pub fn manual(peer: P) -> Self {
        SimBus {
            inner: Self::new_inner(peer),
            worker: None,
        }
    }

    /// Bus with its own interrupt thread.
    pub fn threaded(peer: P) -> Self {
        let inner = Self::new_inner(peer);
        let irq_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("spi-irq".to_string())
            .spawn(move || Self::irq_loop(irq_inner))
            .ok();
        if worker.is_none() {
            warn!("Failed to spawn interrupt thread, falling back to manual completion");
        }
        SimBus { inner, worker }
    }

    fn new_inner(peer: P) -> Arc<SimInner<P>> {
        Arc::new(SimInner {
            state: Mutex::new(SimState {
                peer,
                pending: None,
                data: 0,
                frequency: 0,
                format: Format::default(),
                mosi_log: Vec::new(),
                stop: false,
            }),
            wakeup: Condvar::new(),
            handler: Mutex::new(None),
        })
    }

    fn irq_loop(inner: Arc<SimInner<P>>) {
        debug!("Interrupt thread started");
        loop {
            {
                let mut state = inner.state.lock();
                while state.pending.is_none() && !state.stop {
                    inner.wakeup.wait(&mut state);
                }
                if state.stop {
                    break;
                }
            }
            inner.complete();
        }
        debug!("Interrupt thread stopped");
    }

    /// Fire the transfer-complete interrupt for the exchange in flight.
    /// Returns `false` if no exchange was pending.
    pub fn complete(&self) -> bool {
        self.inner.complete()
    }

    /// Keep firing interrupts until the engine stops starting exchanges.
    pub fn run_until_idle(&self) -> usize {
        let mut completions = 0;
        while self.complete() {
            completions += 1;
        }
        completions
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Every byte shifted out on MOSI so far
    pub fn transmitted(&self) -> Vec<u8> {
        self.inner.state.lock().mosi_log.clone()
    }

    pub fn frequency(&self) -> u32 {
        self.inner.state.lock().frequency
    }

    pub fn format(&self) -> Format {
        self.inner.state.lock().format
    }

    pub fn with_peer<T>(&self, f: impl FnOnce(&mut P) -> T) -> T {
        f(&mut self.inner.state.lock().peer)
    }

    /// Input line following the peer's data-ready output
    pub fn data_ready_line(&self) -> PeerReadyLine<P> {
        PeerReadyLine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Peer> SpiBus for SimBus<P> {
    fn set_frequency(&self, hz: u32) -> Result<(), BusError> {
        if hz == 0 || hz > MAX_FREQUENCY_HZ {
            return Err(BusError::UnsupportedFrequency(hz));
        }
        self.inner.state.lock().frequency = hz;
        Ok(())
    }

    fn set_format(&self, format: Format) -> Result<(), BusError> {
        if format.bits != 8 && format.bits != 16 {
            return Err(BusError::UnsupportedFormat {
                bits: format.bits,
                mode: format.mode.into(),
            });
        }
        self.inner.state.lock().format = format;
        Ok(())
    }

    fn start_transfer(&self, byte: u8) {
        let mut state = self.inner.state.lock();
        if state.pending.is_some() {
            warn!("Transfer started while another is in flight, previous byte lost");
        }
        state.pending = Some(byte);
        self.inner.wakeup.notify_one();
    }

    fn read_data(&self) -> u8 {
        self.inner.state.lock().data
    }

    fn transfer(&self, byte: u8) -> u8 {
        let mut state = self.inner.state.lock();
        let miso = state.peer.exchange(byte);
        state.data = miso;
        state.mosi_log.push(byte);
        miso
    }

    fn bind_irq(&self, handler: Option<IrqHandler>) {
        *self.inner.handler.lock() = handler;
    }
}

impl<P: Peer> Drop for SimBus<P> {
    fn drop(&mut self) {
        self.inner.state.lock().stop = true;
        self.inner.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            // The last engine reference can be released from inside the interrupt handler.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Data-ready input driven by a simulated peer
pub struct PeerReadyLine<P: Peer> {
    inner: Arc<SimInner<P>>,
}

impl<P: Peer> InputPin for PeerReadyLine<P> {
    fn is_high(&self) -> bool {
        self.inner.state.lock().peer.data_ready()
    }
}

/// A GPIO line, usable as output (chip-select) or as an input driven by the test.
#[derive(Debug)]
pub struct SimPin {
    high: AtomicBool,
    falling_edges: AtomicUsize,
}

impl SimPin {
    pub fn new(high: bool) -> Self {
        SimPin {
            high: AtomicBool::new(high),
            falling_edges: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, high: bool) {
        let was_high = self.high.swap(high, Ordering::AcqRel);
        if was_high && !high {
            self.falling_edges.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of high-to-low transitions, i.e. chip-select assertions
    pub fn falling_edges(&self) -> usize {
        self.falling_edges.load(Ordering::Acquire)
    }
}

impl OutputPin for SimPin {
    fn set_low(&self) {
        self.set(false);
    }

    fn set_high(&self) {
        self.set(true);
    }

    fn is_set_low(&self) -> bool {
        !self.high.load(Ordering::Acquire)
    }
}

impl InputPin for SimPin {
    fn is_high(&self) -> bool {
        self.high.load(Ordering::Acquire)
    }
}

/// Peer that sends back every payload byte it receives, one exchange later.
///
/// Bytes equal to the filler are treated as clocking only and are not echoed.
#[derive(Debug)]
pub struct EchoPeer {
    filler: u8,
    pending: VecDeque<u8>,
}

impl EchoPeer {
    pub fn new(filler: u8) -> Self {
        EchoPeer {
            filler,
            pending: VecDeque::new(),
        }
    }
}

impl Peer for EchoPeer {
    fn exchange(&mut self, mosi: u8) -> u8 {
        let miso = self.pending.pop_front().unwrap_or(self.filler);
        if mosi != self.filler {
            self.pending.push_back(mosi);
        }
        miso
    }

    fn data_ready(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Peer with a preloaded outbound queue that records everything it receives.
#[derive(Debug, Default)]
pub struct ScriptedPeer {
    outbound: VecDeque<u8>,
    received: Vec<u8>,
    idle: u8,
}

impl ScriptedPeer {
    /// `idle` is shifted out once the outbound queue is empty.
    pub fn new(idle: u8) -> Self {
        ScriptedPeer {
            idle,
            ..Default::default()
        }
    }

    /// Queue bytes to send; raises data-ready.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }

    pub fn received(&self) -> &[u8] {
        &self.received
    }
}

impl Peer for ScriptedPeer {
    fn exchange(&mut self, mosi: u8) -> u8 {
        self.received.push(mosi);
        self.outbound.pop_front().unwrap_or(self.idle)
    }

    fn data_ready(&self) -> bool {
        !self.outbound.is_empty()
    }
}
