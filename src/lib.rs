//! Compatibility layer translating a legacy buffer-oriented audio API onto a
//! modern streaming backend.
//!
//! The legacy model is built around device objects, finite hardware/software
//! voice budgets, lockable sample buffers, position notifications, and a
//! deferred-commit 3D parameter protocol. This crate reproduces those
//! semantics (admission arbitration, the buffer location state machine,
//! interval-based notification crossing, millibel scalar conversions) on top
//! of an opaque [`backend::StreamingBackend`] that only knows about voices,
//! transport, and plain float parameters.
//!
//! Entry point is [`SoundDevice`]; the backend is injected through a
//! [`pool::PoolRegistry`] so hosts (and the test suite) choose the driver.

pub mod arena;
pub mod backend;
pub mod buffer;
pub mod device;
pub mod error;
pub mod format;
pub mod notify;
pub mod pool;
pub mod shared;
pub mod spatial;

pub use buffer::{Buffer3D, BufferLock, BufferStatus, LocationRequest, PlayFlags, SecondaryBuffer};
pub use device::{CooperativeLevel, DeviceCaps, Listener3D, PrimaryBuffer, SoundDevice};
pub use error::{DsError, Result};
pub use format::WaveFormat;
pub use notify::{NotifyEvent, NotifyPosition, NOTIFY_AT_STOP};
pub use pool::{Location, PoolRegistry};
pub use shared::{BufferCaps, BufferDescription};
pub use spatial::{Apply, BufferParams3D, ListenerParams3D, Mode3D};
