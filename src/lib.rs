/// Buffered SPI - interrupt-driven byte stream over an SPI bus
///
/// This library provides a buffered transport that lets application code read and write an SPI
/// peer like a stream device, while the bus is driven byte by byte from the transfer-complete
/// interrupt. It includes the lock-free ring buffers shared by both contexts, the collaborator
/// traits for the bus and GPIO lines, and a simulated bus for hosts without the hardware.

pub mod buffered_spi;
pub mod config;
pub mod daemon;
pub mod error;
pub mod file_handle;
pub mod hal;
pub mod irq;
pub mod ring_buffer;
pub mod sim;

// Re-export main types for convenience
pub use buffered_spi::{BufferedSpi, Stats};
pub use config::{BufferConfig, Config, OverrunPolicy};
pub use error::{BusError, Error, Result};
pub use file_handle::FileHandle;
pub use hal::{Format, InputPin, Mode, OutputPin, SpiBus};
pub use irq::{Callback, IrqType};
