//! Device-facing interfaces: the control dispatcher, the adapter command
//! rings, client transports, and the guest memory-slot translator.
//!
//! Everything in here crosses the boundary between the device thread (the
//! virtual graphics adapter) and the display worker thread. The worker owns
//! nothing below this crate; it consumes commands, control messages, and
//! transports handed over through these types.

pub mod device;
pub mod dispatcher;
pub mod slots;
pub mod transport;

pub use device::{
    AdapterDevice, CommandPayload, CursorPayload, CursorShape, ResourceTag, RingCommand,
    SurfaceCreateInfo,
};
pub use dispatcher::{
    Completion, Dispatcher, DispatcherError, PendingBits, WorkerMessage, WorkerPort,
};
pub use slots::{MemSlot, MemSlotConfig, SlotError, SlotMap};
pub use transport::{ClientTransport, SendOutcome, WireFrame};
