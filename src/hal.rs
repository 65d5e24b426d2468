/// Collaborator interfaces: the SPI peripheral and the two GPIO lines.
///
/// All methods take `&self`. They model register accesses, which are shared between the
/// foreground and the interrupt context; implementations provide their own interior mutability.

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transfer-complete interrupt handler bound to a bus driver
pub type IrqHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// SPI mode (clock polarity and phase)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// CPOL=0, CPHA=0
    #[default]
    Mode0,
    /// CPOL=0, CPHA=1
    Mode1,
    /// CPOL=1, CPHA=0
    Mode2,
    /// CPOL=1, CPHA=1
    Mode3,
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Mode0 => 0,
            Mode::Mode1 => 1,
            Mode::Mode2 => 2,
            Mode::Mode3 => 3,
        }
    }
}

/// Frame format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub bits: u8,
    pub mode: Mode,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            bits: 8,
            mode: Mode::Mode0,
        }
    }
}

/// SPI peripheral driver
///
/// The driver raises one combined interrupt per exchange: when the byte loaded with
/// [`SpiBus::start_transfer`] has been shifted out and the received byte is latched, the bound
/// handler runs in interrupt context.
pub trait SpiBus: Send + Sync {
    fn set_frequency(&self, hz: u32) -> Result<(), BusError>;

    fn set_format(&self, format: Format) -> Result<(), BusError>;

    /// Load the transmit register and start an exchange. Completion is signalled through the
    /// bound interrupt handler.
    fn start_transfer(&self, byte: u8);

    /// Byte latched by the last completed exchange
    fn read_data(&self) -> u8;

    /// Blocking exchange outside the interrupt pump. Only valid while no transfer is in flight.
    fn transfer(&self, byte: u8) -> u8;

    /// Bind (`Some`) or unbind (`None`) the transfer-complete handler.
    ///
    /// After `bind_irq(None)` returns the driver must not start new handler invocations.
    fn bind_irq(&self, handler: Option<IrqHandler>);
}

/// Digital output line
pub trait OutputPin: Send + Sync {
    fn set_low(&self);
    fn set_high(&self);
    fn is_set_low(&self) -> bool;
}

/// Digital input line
pub trait InputPin: Send + Sync {
    fn is_high(&self) -> bool;
}

impl<T: SpiBus + ?Sized> SpiBus for Arc<T> {
    fn set_frequency(&self, hz: u32) -> Result<(), BusError> {
        (**self).set_frequency(hz)
    }

    fn set_format(&self, format: Format) -> Result<(), BusError> {
        (**self).set_format(format)
    }

    fn start_transfer(&self, byte: u8) {
        (**self).start_transfer(byte)
    }

    fn read_data(&self) -> u8 {
        (**self).read_data()
    }

    fn transfer(&self, byte: u8) -> u8 {
        (**self).transfer(byte)
    }

    fn bind_irq(&self, handler: Option<IrqHandler>) {
        (**self).bind_irq(handler)
    }
}

impl<T: OutputPin + ?Sized> OutputPin for Arc<T> {
    fn set_low(&self) {
        (**self).set_low()
    }

    fn set_high(&self) {
        (**self).set_high()
    }

    fn is_set_low(&self) -> bool {
        (**self).is_set_low()
    }
}

impl<T: InputPin + ?Sized> InputPin for Arc<T> {
    fn is_high(&self) -> bool {
        (**self).is_high()
    }
}
