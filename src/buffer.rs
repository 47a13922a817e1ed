//! Per-instance playback buffers.
//!
//! Every legacy buffer object maps to one [`BufferCore`] slot in the owning
//! device's arena plus a public [`SecondaryBuffer`] handle. The core runs the
//! location-arbitration state machine (which hardware/software voice slot, if
//! any, backs the buffer), tracks the playback offset for notifications, and
//! holds the deferred 3D state. All mutation goes through the device's single
//! state mutex; only the region-lock flag is independent so lock exclusivity
//! can be checked without it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::backend::{TransportState, VoiceHandle};
use crate::device::DeviceShared;
use crate::error::{DsError, Result};
use crate::format::{
    millibels_to_gain, pan_to_unit, validate_frequency_hz, validate_pan_mb, validate_volume_mb,
    FREQUENCY_ORIGINAL,
};
use crate::notify::{fired_events, poll_crossing, NotifyEvent, NotifyPosition, NOTIFY_AT_STOP};
use crate::pool::{DevicePool, Location};
use crate::shared::{BufferCaps, SampleStorage, SharedAudioBuffer};
use crate::spatial::{
    apply_buffer_fields, merge_buffer_fields, Apply, BufferField, BufferParams3D, DirtySet,
};
use crate::{arena::SlotId, backend::BackendExtensions};

/// Requested backing for a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationRequest {
    /// Hardware if available, else software.
    Any,
    Hardware,
    Software,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlayFlags: u32 {
        const LOOPING      = 1 << 0;
        /// Deferred-location buffers only: arbitrate to hardware.
        const LOC_HARDWARE = 1 << 1;
        /// Deferred-location buffers only: arbitrate to software.
        const LOC_SOFTWARE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Transport status read-back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferStatus: u32 {
        const PLAYING      = 1 << 0;
        const LOOPING      = 1 << 1;
        const LOC_HARDWARE = 1 << 2;
        const LOC_SOFTWARE = 1 << 3;
        const BUFFER_LOST  = 1 << 4;
    }
}

/// Voice handle plus the admission slot backing it. Holding this struct is
/// the invariant that a voice exists iff an admission is held.
#[derive(Debug, Clone, Copy)]
struct ActiveVoice {
    handle: VoiceHandle,
    class: Location,
}

pub(crate) struct BufferCore {
    pub(crate) shared: Arc<SharedAudioBuffer>,
    active: Option<ActiveVoice>,
    /// Shadow byte offset: where playback starts the next time a fresh voice
    /// plays, and the notification bookkeeping cursor.
    last_offset: u32,
    locked: Arc<AtomicBool>,
    volume_mb: i32,
    pan_mb: i32,
    frequency_hz: u32,
    looping: bool,
    lost: bool,
    params3d: BufferParams3D,
    deferred3d: BufferParams3D,
    dirty: DirtySet<BufferField>,
    notifies: Vec<NotifyPosition>,
}

impl BufferCore {
    pub(crate) fn new(shared: Arc<SharedAudioBuffer>) -> Self {
        Self {
            shared,
            active: None,
            last_offset: 0,
            locked: Arc::new(AtomicBool::new(false)),
            volume_mb: 0,
            pan_mb: 0,
            frequency_hz: FREQUENCY_ORIGINAL,
            looping: false,
            lost: false,
            params3d: BufferParams3D::default(),
            deferred3d: BufferParams3D::default(),
            dirty: DirtySet::new(),
            notifies: Vec::new(),
        }
    }

    /// New core playing from the same storage. Pan, frequency and 3D state
    /// carry over where the capability exists; volume never does.
    pub(crate) fn duplicate(&self) -> Self {
        let caps = self.shared.caps();
        let mut dup = Self::new(Arc::clone(&self.shared));
        if caps.contains(BufferCaps::CTRL_PAN) {
            dup.pan_mb = self.pan_mb;
        }
        if caps.contains(BufferCaps::CTRL_FREQUENCY) {
            dup.frequency_hz = self.frequency_hz;
        }
        if caps.contains(BufferCaps::CTRL_3D) {
            dup.params3d = self.params3d;
            dup.deferred3d = self.deferred3d;
        }
        dup
    }

    pub(crate) fn location(&self) -> Option<Location> {
        self.active.map(|a| a.class)
    }

    pub(crate) fn has_notifies(&self) -> bool {
        !self.notifies.is_empty()
    }

    pub(crate) fn mark_lost(&mut self, pool: &DevicePool) {
        self.lost = true;
        self.release_voice(pool);
    }

    pub(crate) fn restore(&mut self) {
        self.lost = false;
    }

    fn require_cap(&self, cap: BufferCaps) -> Result<()> {
        if self.shared.caps().contains(cap) {
            Ok(())
        } else {
            Err(DsError::ControlUnavailable)
        }
    }

    /// Location pinned by the creation caps, if any.
    pub(crate) fn pinned_request(&self) -> LocationRequest {
        let caps = self.shared.caps();
        if caps.contains(BufferCaps::LOC_HARDWARE) {
            LocationRequest::Hardware
        } else if caps.contains(BufferCaps::LOC_SOFTWARE) {
            LocationRequest::Software
        } else {
            LocationRequest::Any
        }
    }

    fn frequency_ratio(&self) -> f32 {
        if self.frequency_hz == FREQUENCY_ORIGINAL {
            1.0
        } else {
            self.frequency_hz as f32 / self.shared.format().samples_per_sec as f32
        }
    }

    /// The location-arbitration state machine.
    ///
    /// Same-state requests (and `Any` on an assigned buffer) are no-ops.
    /// Otherwise the held voice is released first; then hardware is tried
    /// unless software was requested, then software unless hardware was
    /// requested. Exhaustion leaves the buffer unassigned and retryable.
    pub(crate) fn set_location(
        &mut self,
        pool: &DevicePool,
        request: LocationRequest,
        listener_rolloff: f32,
    ) -> Result<()> {
        match (request, self.location()) {
            (LocationRequest::Hardware, Some(Location::Hardware))
            | (LocationRequest::Software, Some(Location::Software))
            | (LocationRequest::Any, Some(_)) => return Ok(()),
            _ => {}
        }

        if let Some(active) = self.active {
            {
                let backend = pool.backend();
                // A streaming voice must not be torn mid-playback.
                if backend.transport_state(active.handle) == TransportState::Playing {
                    return Err(DsError::InvalidCall("cannot relocate a playing voice"));
                }
                // Carry the read position across to the replacement voice.
                self.last_offset = backend.byte_offset(active.handle);
            }
            self.release_voice(pool);
        }

        let class = match request {
            LocationRequest::Hardware => pool
                .try_admit(Location::Hardware)
                .then_some(Location::Hardware),
            LocationRequest::Software => pool
                .try_admit(Location::Software)
                .then_some(Location::Software),
            LocationRequest::Any => {
                if pool.try_admit(Location::Hardware) {
                    Some(Location::Hardware)
                } else if pool.try_admit(Location::Software) {
                    Some(Location::Software)
                } else {
                    None
                }
            }
        };
        let Some(class) = class else {
            return Err(DsError::VoicesExhausted);
        };

        let mut backend = pool.backend();
        let handle = match backend.create_voice() {
            Ok(handle) => handle,
            Err(err) => {
                drop(backend);
                pool.release(class);
                return Err(err.into());
            }
        };
        backend.bind_buffer(handle, self.shared.backend_buffer());
        self.active = Some(ActiveVoice { handle, class });
        trace!(?class, "voice assigned");

        // A fresh voice knows nothing; re-apply the full buffer state.
        backend.set_gain(handle, millibels_to_gain(self.volume_mb));
        backend.set_pitch(handle, self.frequency_ratio());
        if self.shared.caps().contains(BufferCaps::CTRL_3D) {
            apply_buffer_fields(
                backend.as_mut(),
                handle,
                &self.params3d,
                listener_rolloff,
                BufferField::all(),
            );
        } else if backend.extensions().contains(BackendExtensions::PAN) {
            backend.set_pan(handle, pan_to_unit(self.pan_mb));
        }
        Ok(())
    }

    pub(crate) fn release_voice(&mut self, pool: &DevicePool) {
        if let Some(active) = self.active.take() {
            pool.backend().destroy_voice(active.handle);
            pool.release(active.class);
        }
    }

    /// Start (or restart) playback. Returns whether the buffer should be on
    /// the notification watch list.
    pub(crate) fn play(
        &mut self,
        pool: &DevicePool,
        flags: PlayFlags,
        listener_rolloff: f32,
    ) -> Result<bool> {
        if self.lost {
            return Err(DsError::BufferLost);
        }
        if flags.contains(PlayFlags::LOC_HARDWARE | PlayFlags::LOC_SOFTWARE) {
            return Err(DsError::InvalidParam("both play locations requested"));
        }
        let defer = self.shared.caps().contains(BufferCaps::LOC_DEFER);
        if !defer && flags.intersects(PlayFlags::LOC_HARDWARE | PlayFlags::LOC_SOFTWARE) {
            return Err(DsError::InvalidParam(
                "play location flags require a deferred-location buffer",
            ));
        }

        let request = if flags.contains(PlayFlags::LOC_HARDWARE) {
            LocationRequest::Hardware
        } else if flags.contains(PlayFlags::LOC_SOFTWARE) {
            LocationRequest::Software
        } else {
            self.pinned_request()
        };
        self.set_location(pool, request, listener_rolloff)?;

        let voice = self.active.map(|a| a.handle).ok_or(DsError::Generic)?;
        let mut backend = pool.backend();
        self.looping = flags.contains(PlayFlags::LOOPING);
        backend.set_looping(voice, self.looping);
        if backend.transport_state(voice) == TransportState::Initial {
            // Never-played voice: honor the shadow offset, wrapped and
            // block-aligned.
            let start = self
                .shared
                .format()
                .snap_to_block(self.last_offset % self.shared.len());
            backend.set_byte_offset(voice, start);
        }
        backend.play(voice);
        Ok(self.has_notifies())
    }

    /// Stop playback, keeping the read position. Every notification the voice
    /// crossed since the last poll plus the stop sentinel is returned for the
    /// caller to signal once the device lock is released. Stopping an already
    /// stopped buffer is a no-op and never re-fires the sentinel.
    pub(crate) fn stop(&mut self, pool: &DevicePool) -> Vec<Arc<dyn NotifyEvent>> {
        let Some(active) = self.active else {
            return Vec::new();
        };
        let voice = active.handle;
        let (state, offset) = {
            let mut backend = pool.backend();
            let state = backend.transport_state(voice);
            let offset = backend.byte_offset(voice);
            backend.pause(voice);
            (state, offset)
        };

        let len = self.shared.len();
        let offsets: Vec<u32> = self.notifies.iter().map(|n| n.offset).collect();
        let crossing = match state {
            TransportState::Playing => {
                // One last forward poll, then the sentinel on top.
                let mut crossing =
                    poll_crossing(&offsets, self.last_offset, offset, state, len);
                for (idx, &pos) in offsets.iter().enumerate() {
                    if pos == NOTIFY_AT_STOP && !crossing.fired.contains(&idx) {
                        crossing.fired.push(idx);
                    }
                }
                crossing
            }
            // Natural end not yet observed by a poll: flush the tail.
            TransportState::Stopped if self.last_offset < len => {
                poll_crossing(&offsets, self.last_offset, offset, state, len)
            }
            _ => return Vec::new(),
        };
        self.last_offset = crossing.last_offset;
        fired_events(&self.notifies, &crossing.fired)
    }

    /// Scheduler poll: check crossings against the live voice. Returns the
    /// events to signal (after the device lock is released) and whether the
    /// buffer should leave the watch list.
    pub(crate) fn poll_notifies(&mut self, pool: &DevicePool) -> (Vec<Arc<dyn NotifyEvent>>, bool) {
        let Some(active) = self.active else {
            return (Vec::new(), true);
        };
        let (state, offset) = {
            let backend = pool.backend();
            (
                backend.transport_state(active.handle),
                backend.byte_offset(active.handle),
            )
        };
        let offsets: Vec<u32> = self.notifies.iter().map(|n| n.offset).collect();
        let crossing = poll_crossing(&offsets, self.last_offset, offset, state, self.shared.len());
        self.last_offset = crossing.last_offset;
        (fired_events(&self.notifies, &crossing.fired), crossing.done)
    }

    pub(crate) fn set_current_position(&mut self, pool: &DevicePool, offset: u32) -> Result<()> {
        if offset >= self.shared.len() {
            return Err(DsError::InvalidParam("position past end of buffer"));
        }
        let snapped = self.shared.format().snap_to_block(offset);
        self.last_offset = snapped;
        if let Some(active) = self.active {
            pool.backend().set_byte_offset(active.handle, snapped);
        }
        Ok(())
    }

    /// (play cursor, write cursor) read-back. The write cursor tracks the
    /// play cursor in this layer.
    pub(crate) fn current_position(&self, pool: &DevicePool) -> (u32, u32) {
        let offset = match self.active {
            Some(active) => {
                let backend = pool.backend();
                match backend.transport_state(active.handle) {
                    TransportState::Stopped => self.shared.len(),
                    _ => backend.byte_offset(active.handle),
                }
            }
            None => self.last_offset,
        };
        (offset, offset)
    }

    pub(crate) fn status(&self, pool: &DevicePool) -> BufferStatus {
        let mut status = BufferStatus::empty();
        if self.lost {
            status |= BufferStatus::BUFFER_LOST;
        }
        match self.location() {
            Some(Location::Hardware) => status |= BufferStatus::LOC_HARDWARE,
            Some(Location::Software) => status |= BufferStatus::LOC_SOFTWARE,
            None => {}
        }
        if let Some(active) = self.active {
            if pool.backend().transport_state(active.handle) == TransportState::Playing {
                status |= BufferStatus::PLAYING;
                if self.looping {
                    status |= BufferStatus::LOOPING;
                }
            }
        }
        status
    }

    pub(crate) fn set_volume(&mut self, pool: &DevicePool, mb: i32) -> Result<()> {
        self.require_cap(BufferCaps::CTRL_VOLUME)?;
        self.volume_mb = validate_volume_mb(mb)?;
        if let Some(active) = self.active {
            pool.backend()
                .set_gain(active.handle, millibels_to_gain(self.volume_mb));
        }
        Ok(())
    }

    pub(crate) fn volume(&self) -> Result<i32> {
        self.require_cap(BufferCaps::CTRL_VOLUME)?;
        Ok(self.volume_mb)
    }

    pub(crate) fn set_pan(&mut self, pool: &DevicePool, mb: i32) -> Result<()> {
        self.require_cap(BufferCaps::CTRL_PAN)?;
        self.pan_mb = validate_pan_mb(mb)?;
        if let Some(active) = self.active {
            let mut backend = pool.backend();
            if backend.extensions().contains(BackendExtensions::PAN) {
                backend.set_pan(active.handle, pan_to_unit(self.pan_mb));
            }
        }
        Ok(())
    }

    pub(crate) fn pan(&self) -> Result<i32> {
        self.require_cap(BufferCaps::CTRL_PAN)?;
        Ok(self.pan_mb)
    }

    pub(crate) fn set_frequency(&mut self, pool: &DevicePool, hz: u32) -> Result<()> {
        self.require_cap(BufferCaps::CTRL_FREQUENCY)?;
        self.frequency_hz = validate_frequency_hz(hz)?;
        if let Some(active) = self.active {
            pool.backend()
                .set_pitch(active.handle, self.frequency_ratio());
        }
        Ok(())
    }

    pub(crate) fn frequency(&self) -> Result<u32> {
        self.require_cap(BufferCaps::CTRL_FREQUENCY)?;
        Ok(if self.frequency_hz == FREQUENCY_ORIGINAL {
            self.shared.format().samples_per_sec
        } else {
            self.frequency_hz
        })
    }

    pub(crate) fn set_notification_positions(
        &mut self,
        pool: &DevicePool,
        positions: Vec<NotifyPosition>,
    ) -> Result<()> {
        self.require_cap(BufferCaps::CTRL_POSITION_NOTIFY)?;
        if let Some(active) = self.active {
            // Replacing the set mid-play is rejected; a voice that already ran
            // to its natural end does not count as playing.
            if pool.backend().transport_state(active.handle) == TransportState::Playing {
                return Err(DsError::InvalidCall("notifications replaced while playing"));
            }
        }
        for position in &positions {
            if position.offset != NOTIFY_AT_STOP && position.offset >= self.shared.len() {
                return Err(DsError::InvalidParam("notification offset past end of buffer"));
            }
        }
        self.notifies = positions;
        self.notifies.sort_by_key(|n| n.offset);
        Ok(())
    }

    pub(crate) fn lock(&mut self, offset: u32, len: u32) -> Result<BufferLock> {
        let buffer_len = self.shared.len();
        if offset >= buffer_len || len == 0 || len > buffer_len {
            return Err(DsError::InvalidParam("lock region out of bounds"));
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DsError::InvalidCall("buffer is already locked"));
        }
        let first_len = len.min(buffer_len - offset);
        let second_len = len - first_len;
        Ok(BufferLock {
            storage: Arc::clone(self.shared.storage()),
            locked: Arc::clone(&self.locked),
            offset: offset as usize,
            first_len: first_len as usize,
            second_len: second_len as usize,
        })
    }

    // --- 3D state -----------------------------------------------------------

    pub(crate) fn params3d(&self) -> &BufferParams3D {
        &self.params3d
    }

    /// Route one field write through the immediate/deferred protocol.
    ///
    /// Immediate writes update both records so the shadow never goes stale;
    /// deferred writes only touch the shadow and the dirty set.
    pub(crate) fn write_3d(
        &mut self,
        pool: &DevicePool,
        field: BufferField,
        apply: Apply,
        listener_rolloff: f32,
        write: impl Fn(&mut BufferParams3D),
    ) {
        match apply {
            Apply::Deferred => {
                write(&mut self.deferred3d);
                self.dirty.mark(field);
            }
            Apply::Immediate => {
                write(&mut self.params3d);
                write(&mut self.deferred3d);
                if let Some(active) = self.active {
                    apply_buffer_fields(
                        pool.backend().as_mut(),
                        active.handle,
                        &self.params3d,
                        listener_rolloff,
                        field,
                    );
                }
            }
        }
    }

    /// Apply this buffer's pending deferred fields (listener-commit pass).
    pub(crate) fn commit_3d(&mut self, pool: &DevicePool, listener_rolloff: f32) {
        let taken = self.dirty.take();
        if taken.is_empty() {
            return;
        }
        merge_buffer_fields(&mut self.params3d, &self.deferred3d, taken);
        if let Some(active) = self.active {
            apply_buffer_fields(
                pool.backend().as_mut(),
                active.handle,
                &self.params3d,
                listener_rolloff,
                taken,
            );
        }
    }

    /// Push the listener's rolloff to the live voice (propagated on immediate
    /// listener rolloff writes).
    pub(crate) fn push_rolloff(&self, pool: &DevicePool, listener_rolloff: f32) {
        if let Some(active) = self.active {
            let rolloff = if self.params3d.mode == crate::spatial::Mode3D::Disabled {
                0.0
            } else {
                listener_rolloff
            };
            pool.backend().set_rolloff(active.handle, rolloff);
        }
    }
}

/// RAII region lock over the shared sample storage.
///
/// The storage is mapped into the backend buffer, so bytes written through
/// [`BufferLock::with_segments`] are what the mixer plays; dropping the guard
/// is the unlock and performs bookkeeping only.
pub struct BufferLock {
    storage: Arc<SampleStorage>,
    locked: Arc<AtomicBool>,
    offset: usize,
    first_len: usize,
    second_len: usize,
}

impl BufferLock {
    /// Byte lengths of the two mapped segments (the second is the wraparound
    /// tail and may be zero).
    pub fn segment_lens(&self) -> (usize, usize) {
        (self.first_len, self.second_len)
    }

    /// Access the locked region. Two slices when the region wraps the end of
    /// the buffer.
    pub fn with_segments<R>(&mut self, f: impl FnOnce(&mut [u8], Option<&mut [u8]>) -> R) -> R {
        let mut bytes = self.storage.lock_bytes();
        if self.second_len == 0 {
            f(&mut bytes[self.offset..self.offset + self.first_len], None)
        } else {
            let (head, tail) = bytes.split_at_mut(self.offset);
            f(
                &mut tail[..self.first_len],
                Some(&mut head[..self.second_len]),
            )
        }
    }
}

impl Drop for BufferLock {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Application-facing playback buffer handle.
///
/// Dropping the handle releases the voice admission, deregisters the buffer
/// everywhere, and destroys the backend buffer when this was the last
/// duplicate.
pub struct SecondaryBuffer {
    pub(crate) dev: Arc<DeviceShared>,
    pub(crate) slot: SlotId,
}

impl SecondaryBuffer {
    pub fn caps(&self) -> BufferCaps {
        let state = self.dev.state.lock().unwrap();
        state
            .buffers
            .get(self.slot)
            .map(|core| core.shared.caps())
            .unwrap_or(BufferCaps::empty())
    }

    /// Rounded byte length of the underlying storage.
    pub fn len(&self) -> u32 {
        let state = self.dev.state.lock().unwrap();
        state
            .buffers
            .get(self.slot)
            .map(|core| core.shared.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn play(&self, flags: PlayFlags) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let rolloff = state.listener.immediate.rolloff_factor;
        let core = state.core_mut(self.slot)?;
        let watch = core.play(&self.dev.pool, flags, rolloff)?;
        if watch {
            state.watch(self.slot);
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let events = {
            let mut state = self.dev.state.lock().unwrap();
            let core = state.core_mut(self.slot)?;
            let events = core.stop(&self.dev.pool);
            state.unwatch(self.slot);
            events
        };
        // Signaled unlocked; an event may call straight back into the API.
        for event in events {
            event.signal();
        }
        Ok(())
    }

    pub fn set_location(&self, request: LocationRequest) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let rolloff = state.listener.immediate.rolloff_factor;
        let core = state.core_mut(self.slot)?;
        core.set_location(&self.dev.pool, request, rolloff)
    }

    pub fn location(&self) -> Result<Option<Location>> {
        let state = self.dev.state.lock().unwrap();
        Ok(state.core(self.slot)?.location())
    }

    pub fn status(&self) -> Result<BufferStatus> {
        let state = self.dev.state.lock().unwrap();
        Ok(state.core(self.slot)?.status(&self.dev.pool))
    }

    pub fn set_current_position(&self, offset: u32) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.set_current_position(&self.dev.pool, offset)
    }

    pub fn current_position(&self) -> Result<(u32, u32)> {
        let state = self.dev.state.lock().unwrap();
        Ok(state.core(self.slot)?.current_position(&self.dev.pool))
    }

    pub fn set_volume(&self, mb: i32) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.set_volume(&self.dev.pool, mb)
    }

    pub fn volume(&self) -> Result<i32> {
        let state = self.dev.state.lock().unwrap();
        state.core(self.slot)?.volume()
    }

    pub fn set_pan(&self, mb: i32) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.set_pan(&self.dev.pool, mb)
    }

    pub fn pan(&self) -> Result<i32> {
        let state = self.dev.state.lock().unwrap();
        state.core(self.slot)?.pan()
    }

    pub fn set_frequency(&self, hz: u32) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.set_frequency(&self.dev.pool, hz)
    }

    pub fn frequency(&self) -> Result<u32> {
        let state = self.dev.state.lock().unwrap();
        state.core(self.slot)?.frequency()
    }

    pub fn set_notification_positions(&self, positions: Vec<NotifyPosition>) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.set_notification_positions(&self.dev.pool, positions)
    }

    /// Lock `len` bytes starting at `offset`, wrapping past the end of the
    /// buffer if needed. One outstanding lock per buffer.
    pub fn lock(&self, offset: u32, len: u32) -> Result<BufferLock> {
        let mut state = self.dev.state.lock().unwrap();
        let core = state.core_mut(self.slot)?;
        core.lock(offset, len)
    }

    /// Clear the sticky lost flag. Fails while the device-level loss
    /// condition still holds; the host signals recovery through
    /// [`crate::SoundDevice::handle_device_restored`].
    pub fn restore(&self) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        if state.device_lost {
            return Err(DsError::BufferLost);
        }
        let core = state.core_mut(self.slot)?;
        core.restore();
        Ok(())
    }

    /// The 3D control facet. Only available when the buffer was created with
    /// [`BufferCaps::CTRL_3D`].
    pub fn buffer3d(&self) -> Result<Buffer3D> {
        let state = self.dev.state.lock().unwrap();
        let core = state.core(self.slot)?;
        if !core.shared.caps().contains(BufferCaps::CTRL_3D) {
            return Err(DsError::ControlUnavailable);
        }
        Ok(Buffer3D {
            dev: Arc::clone(&self.dev),
            slot: self.slot,
        })
    }
}

impl Drop for SecondaryBuffer {
    fn drop(&mut self) {
        let mut state = self.dev.state.lock().unwrap();
        if let Some(mut core) = state.buffers.remove(self.slot) {
            core.release_voice(&self.dev.pool);
            state.unwatch(self.slot);
            state.three_d.retain(|s| *s != self.slot);
            let shared = Arc::clone(&core.shared);
            drop(core);
            // Last duplicate gone: the backend buffer goes with it.
            if let Ok(shared) = Arc::try_unwrap(shared) {
                self.dev.pool.backend().destroy_buffer(shared.backend_buffer());
            }
        }
    }
}

/// 3D control facet of a buffer: a back-reference, no state of its own.
pub struct Buffer3D {
    dev: Arc<DeviceShared>,
    slot: SlotId,
}

impl Buffer3D {
    fn write(
        &self,
        field: BufferField,
        apply: Apply,
        write: impl Fn(&mut BufferParams3D),
    ) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        let rolloff = state.listener.immediate.rolloff_factor;
        let core = state.core_mut(self.slot)?;
        core.write_3d(&self.dev.pool, field, apply, rolloff, write);
        Ok(())
    }

    pub fn all_parameters(&self) -> Result<BufferParams3D> {
        let state = self.dev.state.lock().unwrap();
        Ok(*state.core(self.slot)?.params3d())
    }

    /// Replace the whole record. Immediate application runs inside a backend
    /// suspend/resume bracket so the mixer never observes a half-updated
    /// record.
    pub fn set_all_parameters(&self, params: BufferParams3D, apply: Apply) -> Result<()> {
        params.validate()?;
        if apply == Apply::Immediate {
            self.dev.pool.backend().suspend();
        }
        let result = self.write(BufferField::all(), apply, move |p| *p = params);
        if apply == Apply::Immediate {
            self.dev.pool.backend().resume();
        }
        result
    }

    pub fn set_position(&self, position: [f32; 3], apply: Apply) -> Result<()> {
        self.write(BufferField::POSITION, apply, move |p| p.position = position)
    }

    pub fn set_velocity(&self, velocity: [f32; 3], apply: Apply) -> Result<()> {
        self.write(BufferField::VELOCITY, apply, move |p| p.velocity = velocity)
    }

    pub fn set_cone_angles(&self, inner: u32, outer: u32, apply: Apply) -> Result<()> {
        if inner > 360 || outer > 360 {
            return Err(DsError::InvalidParam("cone angle out of range"));
        }
        self.write(BufferField::CONE_ANGLES, apply, move |p| {
            p.cone_inner_angle = inner;
            p.cone_outer_angle = outer;
        })
    }

    pub fn set_cone_orientation(&self, orientation: [f32; 3], apply: Apply) -> Result<()> {
        self.write(BufferField::CONE_ORIENTATION, apply, move |p| {
            p.cone_orientation = orientation;
        })
    }

    pub fn set_cone_outside_volume(&self, mb: i32, apply: Apply) -> Result<()> {
        validate_volume_mb(mb)?;
        self.write(BufferField::CONE_OUTSIDE_VOLUME, apply, move |p| {
            p.cone_outside_volume_mb = mb;
        })
    }

    pub fn set_min_distance(&self, distance: f32, apply: Apply) -> Result<()> {
        if !distance.is_finite() || distance < 0.0 {
            return Err(DsError::InvalidParam("min distance out of range"));
        }
        self.write(BufferField::MIN_DISTANCE, apply, move |p| {
            p.min_distance = distance;
        })
    }

    pub fn set_max_distance(&self, distance: f32, apply: Apply) -> Result<()> {
        if !distance.is_finite() || distance < 0.0 {
            return Err(DsError::InvalidParam("max distance out of range"));
        }
        self.write(BufferField::MAX_DISTANCE, apply, move |p| {
            p.max_distance = distance;
        })
    }

    pub fn set_mode(&self, mode: crate::spatial::Mode3D, apply: Apply) -> Result<()> {
        self.write(BufferField::MODE, apply, move |p| p.mode = mode)
    }
}
