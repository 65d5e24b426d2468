use log::trace;
use parking_lot::Mutex;
use std::sync::Arc;

/// User callback run from the interrupt handler. Must be short and must not block.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    /// A byte was received
    Rx = 0,
    /// The tx buffer drained
    Tx = 1,
}

const IRQ_COUNT: usize = 2;

/// One optional callback per [`IrqType`].
///
/// `attach` takes the slot lock; dispatch only ever `try_lock`s it, so the interrupt handler
/// never waits. A completion that races an `attach` on the same slot skips that dispatch.
#[derive(Default)]
pub struct CallbackTable {
    slots: [Mutex<Option<Callback>>; IRQ_COUNT],
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, callback: Option<Callback>, irq: IrqType) {
        *self.slots[irq as usize].lock() = callback;
    }

    pub fn is_attached(&self, irq: IrqType) -> bool {
        self.slots[irq as usize].lock().is_some()
    }

    /// Run the callback for `irq`, if any. The callback is invoked after the slot is released,
    /// so it may re-attach itself.
    pub fn dispatch(&self, irq: IrqType) {
        let callback = match self.slots[irq as usize].try_lock() {
            Some(slot) => slot.clone(),
            None => {
                trace!("{:?} callback slot busy, dispatch skipped", irq);
                return;
            }
        };
        if let Some(cb) = callback {
            cb();
        }
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("rx", &self.is_attached(IrqType::Rx))
            .field("tx", &self.is_attached(IrqType::Tx))
            .finish()
    }
}
