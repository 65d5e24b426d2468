use crate::buffered_spi::{BufferedSpi, Stats};
use crate::config::Config;
use crate::error::Error;
use crate::hal::{InputPin, OutputPin, SpiBus};
use crate::irq::IrqType;
use crate::sim::{EchoPeer, PeerReadyLine, SimBus, SimPin};
use crate::spi_printf;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

type LoopbackSpi = BufferedSpi<SimBus<EchoPeer>, SimPin, PeerReadyLine<EchoPeer>>;

/// How long a reload waits for the current transfer burst to finish
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Loopback daemon: writes a heartbeat line every polling interval over a simulated bus whose
/// peer echoes it back, and logs the echoed lines.
pub struct Daemon {
    spi: LoopbackSpi,
    config: Config,
    rx_events: Arc<AtomicU64>,
    tx_drained: Arc<AtomicU64>,
    heartbeat: u64,
    line: Vec<u8>,
    lines_received: u64,
    last_line: Option<String>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let bus = SimBus::threaded(EchoPeer::new(config.buffer.filler));
        let ready = bus.data_ready_line();
        let spi = BufferedSpi::new(bus, SimPin::new(true), ready, &config.buffer)
            .context("Failed to create buffered SPI port")?;

        Daemon::init(&config, &spi)?;

        let rx_events = Arc::new(AtomicU64::new(0));
        let tx_drained = Arc::new(AtomicU64::new(0));
        let rx_counter = Arc::clone(&rx_events);
        let tx_counter = Arc::clone(&tx_drained);
        spi.attach(
            Some(Arc::new(move || {
                rx_counter.fetch_add(1, Ordering::Relaxed);
            })),
            IrqType::Rx,
        );
        spi.attach(
            Some(Arc::new(move || {
                tx_counter.fetch_add(1, Ordering::Relaxed);
            })),
            IrqType::Tx,
        );

        info!("SPI port initialized: {}", spi.name());
        info!("Polling interval: {}ms", config.polling.interval_ms);

        Ok(Daemon {
            spi,
            config,
            rx_events,
            tx_drained,
            heartbeat: 0,
            line: Vec::new(),
            lines_received: 0,
            last_line: None,
        })
    }

    fn init(config: &Config, spi: &LoopbackSpi) -> Result<()> {
        let format = config.spi.validate().context("Invalid SPI settings")?;
        spi.frequency(config.spi.frequency_hz)
            .context(format!("Invalid SPI frequency: {}", config.spi.frequency_hz))?;
        spi.format(format.bits, format.mode)
            .context(format!("Invalid SPI format: {} bits", format.bits))?;
        // The daemon shares its thread with the runtime; it must never park in read/write.
        spi.set_blocking(false);
        info!(
            "  - {} Hz, {} bits, {:?}",
            config.spi.frequency_hz, config.spi.bits, config.spi.mode
        );
        Ok(())
    }

    pub async fn poll(&mut self) -> Result<()> {
        self.heartbeat += 1;
        match spi_printf!(self.spi, "heartbeat {}\n", self.heartbeat) {
            Ok(n) => debug!("Queued heartbeat {} ({} bytes)", self.heartbeat, n),
            Err(Error::WouldBlock) => warn!("tx buffer full, heartbeat {} dropped", self.heartbeat),
            Err(e) => return Err(e.into()),
        }

        // Sleep for the configured polling interval
        sleep(Duration::from_millis(self.config.polling.interval_ms)).await;

        self.spi.request_rx();
        self.drain_rx();
        Ok(())
    }

    fn drain_rx(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.spi.read(&mut buf) {
                Ok(n) => {
                    for &byte in &buf[..n] {
                        self.accept(byte);
                    }
                }
                Err(Error::WouldBlock) => break,
                Err(e) => {
                    warn!("Read failed: {}", e);
                    break;
                }
            }
        }
    }

    fn accept(&mut self, byte: u8) {
        if byte == b'\n' {
            let line = String::from_utf8_lossy(&self.line).into_owned();
            info!("Echo: {}", line);
            self.lines_received += 1;
            self.last_line = Some(line);
            self.line.clear();
        } else if byte != self.config.buffer.filler {
            self.line.push(byte);
        }
    }

    /// Apply bus and polling settings from `new_config`. Buffer sizes are fixed for the life of
    /// the port. Settings are checked before anything is applied; on error the current ones stay.
    pub async fn reload_config(&mut self, new_config: Config) -> Result<()> {
        new_config
            .spi
            .validate()
            .context("Rejected new SPI settings")?;
        self.spi.flush_txbuf();
        if !wait_idle(&self.spi, IDLE_TIMEOUT).await {
            warn!(
                "Bus still busy after {:?}, applying new settings mid-burst",
                IDLE_TIMEOUT
            );
        }
        Daemon::init(&new_config, &self.spi)?;
        self.config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    pub fn lines_received(&self) -> u64 {
        self.lines_received
    }

    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    pub fn stats(&self) -> Stats {
        self.spi.stats()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        let stats = self.spi.stats();
        info!(
            "Transfers: {}, tx bytes: {}, rx bytes: {}, rx overruns: {}",
            stats.transfers, stats.tx_bytes, stats.rx_bytes, stats.rx_overruns
        );
        info!(
            "Rx interrupts: {}, tx drained: {}",
            self.rx_events.load(Ordering::Relaxed),
            self.tx_drained.load(Ordering::Relaxed)
        );
        self.spi.close()?;
        Ok(())
    }
}

/// Wait for the port to finish its current transfer burst. Returns `false` on timeout.
async fn wait_idle<B, C, R>(spi: &BufferedSpi<B, C, R>, timeout: Duration) -> bool
where
    B: SpiBus + 'static,
    C: OutputPin + 'static,
    R: InputPin + 'static,
{
    let deadline = Instant::now() + timeout;
    while spi.is_active() {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(1)).await;
    }
    true
}
