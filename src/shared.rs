//! Shared sample storage: one per legacy buffer description, referenced by
//! every duplicate playing from it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{BackendExtensions, BufferHandle, StreamingBackend};
use crate::error::{DsError, Result};
use crate::format::{SubFormat, WaveFormat};

bitflags::bitflags! {
    /// Capability flags from the legacy buffer description. Controls not
    /// requested here are rejected later with control-unavailable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferCaps: u32 {
        const PRIMARY         = 1 << 0;
        const CTRL_VOLUME     = 1 << 1;
        const CTRL_PAN        = 1 << 2;
        const CTRL_FREQUENCY  = 1 << 3;
        const CTRL_3D         = 1 << 4;
        const CTRL_POSITION_NOTIFY = 1 << 5;
        const CTRL_FX         = 1 << 6;
        /// Pin the voice to a hardware slot.
        const LOC_HARDWARE    = 1 << 7;
        /// Pin the voice to a software slot.
        const LOC_SOFTWARE    = 1 << 8;
        /// Defer voice admission until the first play.
        const LOC_DEFER       = 1 << 9;
    }
}

impl BufferCaps {
    /// Cross-flag rules from the legacy API, checked before any resource is
    /// touched.
    pub(crate) fn validate(self) -> Result<()> {
        if self.contains(BufferCaps::CTRL_3D | BufferCaps::CTRL_PAN) {
            return Err(DsError::InvalidParam("3D and pan control are mutually exclusive"));
        }
        if self.contains(BufferCaps::LOC_HARDWARE | BufferCaps::LOC_SOFTWARE) {
            return Err(DsError::InvalidParam("hardware and software location both pinned"));
        }
        if self.contains(BufferCaps::LOC_DEFER)
            && self.intersects(BufferCaps::LOC_HARDWARE | BufferCaps::LOC_SOFTWARE)
        {
            return Err(DsError::InvalidParam("deferred location with a pinned location"));
        }
        if self.contains(BufferCaps::PRIMARY)
            && self.intersects(
                BufferCaps::CTRL_POSITION_NOTIFY
                    | BufferCaps::CTRL_FX
                    | BufferCaps::LOC_HARDWARE
                    | BufferCaps::LOC_SOFTWARE
                    | BufferCaps::LOC_DEFER,
            )
        {
            return Err(DsError::InvalidParam("capability not valid on the primary buffer"));
        }
        Ok(())
    }
}

/// Legacy buffer description: format + requested length + capability flags.
#[derive(Debug, Clone, Copy)]
pub struct BufferDescription {
    pub caps: BufferCaps,
    pub bytes: u32,
    pub format: WaveFormat,
}

/// Byte store shared between this layer and the backend buffer object.
///
/// The backend maps this storage directly, so writes made through a region
/// lock are visible to the mixer with no copy on unlock. The mutex guards the
/// bytes themselves; region-lock exclusivity (one outstanding lock per buffer
/// instance) is enforced separately by the owning playback buffer.
pub struct SampleStorage {
    bytes: Mutex<Vec<u8>>,
    len: usize,
}

impl SampleStorage {
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0; len]),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy of the current contents (test/diagnostic use).
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub(crate) fn lock_bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap()
    }
}

/// Immutable per-description state: validated format, rounded length, the
/// shared storage, and the backend buffer it is bound to.
///
/// Held by `Arc` from every duplicate; the drop of the last reference is the
/// point where the backend buffer is destroyed (driven by the owning device,
/// which has the backend connection).
pub struct SharedAudioBuffer {
    format: WaveFormat,
    caps: BufferCaps,
    len: u32,
    storage: Arc<SampleStorage>,
    backend_buffer: BufferHandle,
}

impl SharedAudioBuffer {
    /// Validate the description, allocate zeroed storage rounded up to whole
    /// blocks, and bind it to a backend buffer.
    pub(crate) fn create(
        desc: &BufferDescription,
        backend: &mut dyn StreamingBackend,
    ) -> Result<Arc<Self>> {
        desc.caps.validate()?;
        let format = desc.format.validated()?;
        if desc.caps.contains(BufferCaps::CTRL_3D) && format.channels != 1 {
            return Err(DsError::InvalidParam("3D buffers must be mono"));
        }
        // Descriptor shapes the backend cannot mix are rejected here, before
        // any resource exists.
        let extensions = backend.extensions();
        if format.encoding() == SubFormat::IeeeFloat
            && !extensions.contains(BackendExtensions::FLOAT32)
        {
            return Err(DsError::BadFormat("backend does not mix float samples"));
        }
        if format.channels > 2 && !extensions.contains(BackendExtensions::MULTI_CHANNEL) {
            return Err(DsError::BadFormat("backend does not mix more than two channels"));
        }
        let len = format.rounded_buffer_len(desc.bytes)?;
        let storage = SampleStorage::zeroed(len as usize);
        let backend_buffer = backend.create_buffer(&format, Arc::clone(&storage))?;
        Ok(Arc::new(Self {
            format,
            caps: desc.caps,
            len,
            storage,
            backend_buffer,
        }))
    }

    pub fn format(&self) -> &WaveFormat {
        &self.format
    }

    pub fn caps(&self) -> BufferCaps {
        self.caps
    }

    /// Rounded byte length of the sample data.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn storage(&self) -> &Arc<SampleStorage> {
        &self.storage
    }

    pub(crate) fn backend_buffer(&self) -> BufferHandle {
        self.backend_buffer
    }
}
