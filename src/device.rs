//! The top-level legacy device object.
//!
//! One [`SoundDevice`] corresponds to one legacy "sound object": it resolves a
//! [`DevicePool`] through the registry, owns the arena of playback-buffer
//! cores, the 3D listener state, and the notification watch list, all behind a
//! single mutex. Construction is two-phase (create, then initialize against a
//! device identity) to match the legacy status codes.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::arena::{Arena, SlotId};
use crate::backend::BackendExtensions;
use crate::buffer::{BufferCore, SecondaryBuffer};
use crate::error::{DsError, Result};
use crate::format::WaveFormat;
use crate::notify::NotifyEvent;
use crate::pool::{DevicePool, Location, PoolRegistry};
use crate::shared::{BufferCaps, BufferDescription, SharedAudioBuffer};
use crate::spatial::{
    apply_listener_fields, Apply, ListenerField, ListenerParams3D, ListenerState,
};
use crate::backend::DeviceIdentity;

/// Legacy cooperative level. Buffer creation requires one to be set; primary
/// format changes require at least [`CooperativeLevel::Priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CooperativeLevel {
    Normal,
    Priority,
    WritePrimary,
}

/// Pool/extension capability read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub max_hardware_voices: u32,
    pub free_hardware_voices: u32,
    pub max_software_voices: u32,
    pub free_software_voices: u32,
    pub extensions: BackendExtensions,
}

pub(crate) struct PrimaryState {
    pub format: WaveFormat,
    pub playing: bool,
    pub lost: bool,
}

/// Everything a device object owns, behind its one mutex.
pub(crate) struct DeviceState {
    pub buffers: Arena<BufferCore>,
    pub listener: ListenerState,
    /// Slots currently playing with notification registrations.
    pub watching: Vec<SlotId>,
    /// Slots created with 3D control (rolloff propagation, commit walk).
    pub three_d: Vec<SlotId>,
    pub cooperative: Option<CooperativeLevel>,
    pub primary: PrimaryState,
    /// The loss condition itself: set on loss, cleared when the host reports
    /// recovery. Buffers cannot be restored while it holds.
    pub device_lost: bool,
}

impl DeviceState {
    pub(crate) fn core(&self, slot: SlotId) -> Result<&BufferCore> {
        self.buffers.get(slot).ok_or(DsError::Generic)
    }

    pub(crate) fn core_mut(&mut self, slot: SlotId) -> Result<&mut BufferCore> {
        self.buffers.get_mut(slot).ok_or(DsError::Generic)
    }

    pub(crate) fn watch(&mut self, slot: SlotId) {
        if !self.watching.contains(&slot) {
            self.watching.push(slot);
        }
    }

    pub(crate) fn unwatch(&mut self, slot: SlotId) {
        self.watching.retain(|s| *s != slot);
    }
}

pub(crate) struct DeviceShared {
    pub pool: Arc<DevicePool>,
    pub state: Mutex<DeviceState>,
}

/// The legacy device object.
pub struct SoundDevice {
    registry: Arc<PoolRegistry>,
    shared: Mutex<Option<Arc<DeviceShared>>>,
}

impl SoundDevice {
    /// An uninitialized device object. Every operation except
    /// [`SoundDevice::initialize`] fails until a device identity is bound.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            shared: Mutex::new(None),
        }
    }

    /// Create and initialize in one step against `identity` (or the default
    /// output device).
    pub fn create(registry: Arc<PoolRegistry>, identity: Option<&DeviceIdentity>) -> Result<Self> {
        let device = Self::new(registry);
        device.initialize(identity)?;
        Ok(device)
    }

    /// Bind the object to a device, opening it through the registry if no
    /// live pool exists. Fails with already-initialized on a second call.
    pub fn initialize(&self, identity: Option<&DeviceIdentity>) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.is_some() {
            return Err(DsError::AlreadyInitialized);
        }
        let default = DeviceIdentity::default_output();
        let identity = identity.unwrap_or(&default);
        let pool = self.registry.get_or_open(identity)?;
        debug!(device = identity.name(), "sound device initialized");
        *shared = Some(Arc::new(DeviceShared {
            pool,
            state: Mutex::new(DeviceState {
                buffers: Arena::new(),
                listener: ListenerState::new(),
                watching: Vec::new(),
                three_d: Vec::new(),
                cooperative: None,
                primary: PrimaryState {
                    format: WaveFormat::pcm(2, 22_050, 8),
                    playing: false,
                    lost: false,
                },
                device_lost: false,
            }),
        }));
        Ok(())
    }

    fn shared(&self) -> Result<Arc<DeviceShared>> {
        self.shared
            .lock()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or(DsError::Uninitialized)
    }

    pub fn set_cooperative_level(&self, level: CooperativeLevel) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.state.lock().unwrap();
        state.cooperative = Some(level);
        Ok(())
    }

    pub fn caps(&self) -> Result<DeviceCaps> {
        let shared = self.shared()?;
        let pool = &shared.pool;
        let (max_hw, max_sw) = (
            pool.max_voices(Location::Hardware),
            pool.max_voices(Location::Software),
        );
        Ok(DeviceCaps {
            max_hardware_voices: max_hw,
            free_hardware_voices: max_hw - pool.live_voices(Location::Hardware),
            max_software_voices: max_sw,
            free_software_voices: max_sw - pool.live_voices(Location::Software),
            extensions: pool.extensions(),
        })
    }

    /// Create a secondary (streaming) buffer from a legacy description.
    ///
    /// Location arbitration runs immediately unless the description defers it
    /// to the first play; an arbitration failure tears the backend buffer back
    /// down and surfaces voices-exhausted.
    pub fn create_buffer(&self, desc: &BufferDescription) -> Result<SecondaryBuffer> {
        let shared = self.shared()?;
        let mut state = shared.state.lock().unwrap();
        if state.cooperative.is_none() {
            return Err(DsError::InvalidCall("cooperative level not set"));
        }
        if desc.caps.contains(BufferCaps::PRIMARY) {
            return Err(DsError::InvalidParam(
                "primary description on the secondary path",
            ));
        }
        let sab = {
            let mut backend = shared.pool.backend();
            SharedAudioBuffer::create(desc, backend.as_mut())?
        };
        let mut core = BufferCore::new(sab);
        if !desc.caps.contains(BufferCaps::LOC_DEFER) {
            let rolloff = state.listener.immediate.rolloff_factor;
            let request = core.pinned_request();
            if let Err(err) = core.set_location(&shared.pool, request, rolloff) {
                destroy_orphan(&shared.pool, core);
                return Err(err);
            }
        }
        let is_3d = desc.caps.contains(BufferCaps::CTRL_3D);
        let slot = state.buffers.insert(core);
        if is_3d {
            state.three_d.push(slot);
        }
        drop(state);
        Ok(SecondaryBuffer { dev: shared, slot })
    }

    /// New buffer instance playing from the same sample storage as `buffer`.
    pub fn duplicate_buffer(&self, buffer: &SecondaryBuffer) -> Result<SecondaryBuffer> {
        let shared = self.shared()?;
        if !Arc::ptr_eq(&shared, &buffer.dev) {
            return Err(DsError::InvalidParam("buffer belongs to another device"));
        }
        let mut state = shared.state.lock().unwrap();
        let rolloff = state.listener.immediate.rolloff_factor;
        let mut dup = state.core(buffer.slot)?.duplicate();
        let caps = dup.shared.caps();
        if !caps.contains(BufferCaps::LOC_DEFER) {
            let request = dup.pinned_request();
            // The storage stays referenced by the original; nothing to tear
            // down on failure.
            dup.set_location(&shared.pool, request, rolloff)?;
        }
        let slot = state.buffers.insert(dup);
        if caps.contains(BufferCaps::CTRL_3D) {
            state.three_d.push(slot);
        }
        drop(state);
        Ok(SecondaryBuffer { dev: shared, slot })
    }

    /// Primary-buffer facet (format control and mixer gating).
    pub fn primary_buffer(&self) -> Result<PrimaryBuffer> {
        Ok(PrimaryBuffer {
            dev: self.shared()?,
        })
    }

    /// The 3D listener facet.
    pub fn listener(&self) -> Result<Listener3D> {
        Ok(Listener3D {
            dev: self.shared()?,
        })
    }

    /// Entry point for the host's periodic driver: check every watched buffer
    /// for notification crossings and drop the ones that stopped.
    pub fn poll_notifications(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut fired: Vec<Arc<dyn NotifyEvent>> = Vec::new();
        {
            let mut state = shared.state.lock().unwrap();
            let watching = std::mem::take(&mut state.watching);
            let mut still = Vec::with_capacity(watching.len());
            for slot in watching {
                let done = match state.buffers.get_mut(slot) {
                    Some(core) => {
                        let (events, done) = core.poll_notifies(&shared.pool);
                        fired.extend(events);
                        done
                    }
                    None => true,
                };
                if !done {
                    still.push(slot);
                }
            }
            // Buffers that started playing during the poll were re-added by
            // `watch`; merge rather than overwrite.
            for slot in still {
                state.watch(slot);
            }
        }
        // Signaled with no lock held; an event may call back into the device.
        for event in fired {
            event.signal();
        }
        Ok(())
    }

    /// Host integration point for backend/device loss: every buffer becomes
    /// sticky-lost and releases its voice until individually restored.
    pub fn handle_device_loss(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.state.lock().unwrap();
        state.device_lost = true;
        state.primary.lost = true;
        let slots: Vec<SlotId> = state.buffers.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            if let Some(core) = state.buffers.get_mut(slot) {
                core.mark_lost(&shared.pool);
            }
        }
        state.watching.clear();
        debug!("device loss propagated to all buffers");
        Ok(())
    }

    /// Host integration point for recovery: the loss condition is over, so
    /// restore calls may succeed again. Buffers stay sticky-lost until each is
    /// restored individually.
    pub fn handle_device_restored(&self) -> Result<()> {
        let shared = self.shared()?;
        shared.state.lock().unwrap().device_lost = false;
        debug!("device loss condition cleared");
        Ok(())
    }
}

/// A core that never made it into the arena: drop its backend buffer now.
fn destroy_orphan(pool: &DevicePool, mut core: BufferCore) {
    core.release_voice(pool);
    let shared = Arc::clone(&core.shared);
    drop(core);
    if let Ok(shared) = Arc::try_unwrap(shared) {
        pool.backend().destroy_buffer(shared.backend_buffer());
    }
}

/// Primary-buffer facet. The primary buffer is the device's mix destination:
/// it has a format and a running flag but no application sample storage.
pub struct PrimaryBuffer {
    dev: Arc<DeviceShared>,
}

impl PrimaryBuffer {
    pub fn format(&self) -> WaveFormat {
        self.dev.state.lock().unwrap().primary.format
    }

    /// Change the device output format. Requires at least priority
    /// cooperative level.
    pub fn set_format(&self, format: &WaveFormat) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        if state.primary.lost {
            return Err(DsError::BufferLost);
        }
        match state.cooperative {
            Some(CooperativeLevel::Priority) | Some(CooperativeLevel::WritePrimary) => {}
            _ => return Err(DsError::PriorityLevelNeeded),
        }
        state.primary.format = format.validated()?;
        Ok(())
    }

    /// Keep the mixer running. Resumes the backend graph on the first call.
    pub fn play(&self) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        if state.primary.lost {
            return Err(DsError::BufferLost);
        }
        if !state.primary.playing {
            state.primary.playing = true;
            self.dev.pool.backend().resume();
        }
        Ok(())
    }

    /// Let the mixer idle when no secondary buffer needs it.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        if state.primary.playing {
            state.primary.playing = false;
            self.dev.pool.backend().suspend();
        }
        Ok(())
    }

    /// Clear the sticky lost flag. Fails while the device-level loss
    /// condition still holds.
    pub fn restore(&self) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        if state.device_lost {
            return Err(DsError::BufferLost);
        }
        state.primary.lost = false;
        Ok(())
    }
}

/// 3D listener facet: deferred-commit owner for the whole device.
pub struct Listener3D {
    dev: Arc<DeviceShared>,
}

impl Listener3D {
    pub fn all_parameters(&self) -> ListenerParams3D {
        self.dev.state.lock().unwrap().listener.immediate
    }

    fn write(
        &self,
        fields: ListenerField,
        apply: Apply,
        write: impl Fn(&mut ListenerParams3D),
    ) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        match apply {
            Apply::Deferred => {
                write(&mut state.listener.deferred);
                state.listener.dirty.mark(fields);
            }
            Apply::Immediate => {
                write(&mut state.listener.immediate);
                write(&mut state.listener.deferred);
                let params = state.listener.immediate;
                apply_listener_fields(self.dev.pool.backend().as_mut(), &params, fields);
                if fields.contains(ListenerField::ROLLOFF_FACTOR) {
                    propagate_rolloff(&self.dev, &mut state);
                }
            }
        }
        Ok(())
    }

    pub fn set_position(&self, position: [f32; 3], apply: Apply) -> Result<()> {
        self.write(ListenerField::POSITION, apply, move |p| {
            p.position = position;
        })
    }

    pub fn set_velocity(&self, velocity: [f32; 3], apply: Apply) -> Result<()> {
        self.write(ListenerField::VELOCITY, apply, move |p| {
            p.velocity = velocity;
        })
    }

    pub fn set_orientation(&self, front: [f32; 3], top: [f32; 3], apply: Apply) -> Result<()> {
        self.write(ListenerField::ORIENTATION, apply, move |p| {
            p.orient_front = front;
            p.orient_top = top;
        })
    }

    pub fn set_distance_factor(&self, factor: f32, apply: Apply) -> Result<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(DsError::InvalidParam("distance factor out of range"));
        }
        self.write(ListenerField::DISTANCE_FACTOR, apply, move |p| {
            p.distance_factor = factor;
        })
    }

    pub fn set_rolloff_factor(&self, factor: f32, apply: Apply) -> Result<()> {
        if !(crate::spatial::MIN_FACTOR..=crate::spatial::MAX_FACTOR).contains(&factor) {
            return Err(DsError::InvalidParam("rolloff factor out of range"));
        }
        self.write(ListenerField::ROLLOFF_FACTOR, apply, move |p| {
            p.rolloff_factor = factor;
        })
    }

    pub fn set_doppler_factor(&self, factor: f32, apply: Apply) -> Result<()> {
        if !(crate::spatial::MIN_FACTOR..=crate::spatial::MAX_FACTOR).contains(&factor) {
            return Err(DsError::InvalidParam("doppler factor out of range"));
        }
        self.write(ListenerField::DOPPLER_FACTOR, apply, move |p| {
            p.doppler_factor = factor;
        })
    }

    /// Replace the whole listener record. Immediate application runs under a
    /// suspend/resume bracket. Always reports success once validated.
    pub fn set_all_parameters(&self, params: ListenerParams3D, apply: Apply) -> Result<()> {
        params.validate()?;
        if apply == Apply::Immediate {
            self.dev.pool.backend().suspend();
        }
        let result = self.write(ListenerField::all(), apply, move |p| *p = params);
        if apply == Apply::Immediate {
            self.dev.pool.backend().resume();
        }
        result
    }

    /// Apply every deferred listener and buffer field in one pass.
    ///
    /// The dirty sets are swap-and-cleared first, so a deferred write racing
    /// this commit lands in the next one instead of being lost. The whole
    /// walk runs inside a backend suspend/resume bracket.
    pub fn commit_deferred_settings(&self) -> Result<()> {
        let mut state = self.dev.state.lock().unwrap();
        self.dev.pool.backend().suspend();

        let fields = state.listener.dirty.take();
        if !fields.is_empty() {
            state.listener.merge(fields);
            let params = state.listener.immediate;
            apply_listener_fields(self.dev.pool.backend().as_mut(), &params, fields);
            if fields.contains(ListenerField::ROLLOFF_FACTOR) {
                propagate_rolloff(&self.dev, &mut state);
            }
        }

        let rolloff = state.listener.immediate.rolloff_factor;
        let slots = state.three_d.clone();
        for slot in slots {
            if let Some(core) = state.buffers.get_mut(slot) {
                core.commit_3d(&self.dev.pool, rolloff);
            }
        }

        self.dev.pool.backend().resume();
        Ok(())
    }
}

/// Rolloff lives per-voice on the backend: push the listener's value to every
/// live 3D voice.
fn propagate_rolloff(dev: &Arc<DeviceShared>, state: &mut DeviceState) {
    let rolloff = state.listener.immediate.rolloff_factor;
    for &slot in &state.three_d {
        if let Some(core) = state.buffers.get(slot) {
            core.push_rolloff(&dev.pool, rolloff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDriver;
    use crate::buffer::PlayFlags;
    use crate::format::WaveFormat;
    use crate::shared::{BufferCaps, BufferDescription};

    fn device(voices: u32) -> SoundDevice {
        let registry = PoolRegistry::new(FakeDriver::new(voices));
        let device = SoundDevice::create(registry, None).unwrap();
        device
            .set_cooperative_level(CooperativeLevel::Priority)
            .unwrap();
        device
    }

    fn desc(caps: BufferCaps) -> BufferDescription {
        BufferDescription {
            caps,
            bytes: 1_000,
            format: WaveFormat::pcm(2, 44_100, 16),
        }
    }

    #[test]
    fn operations_require_initialization() {
        let registry = PoolRegistry::new(FakeDriver::new(8));
        let device = SoundDevice::new(registry);
        assert_eq!(device.caps().err().unwrap(), DsError::Uninitialized);
        assert_eq!(
            device
                .set_cooperative_level(CooperativeLevel::Normal)
                .err()
                .unwrap(),
            DsError::Uninitialized
        );
        device.initialize(None).unwrap();
        assert_eq!(
            device.initialize(None).err().unwrap(),
            DsError::AlreadyInitialized
        );
    }

    #[test]
    fn buffer_creation_requires_a_cooperative_level() {
        let registry = PoolRegistry::new(FakeDriver::new(8));
        let device = SoundDevice::create(registry, None).unwrap();
        let err = device.create_buffer(&desc(BufferCaps::empty())).err().unwrap();
        assert_eq!(err, DsError::InvalidCall("cooperative level not set"));
    }

    #[test]
    fn primary_descriptions_are_rejected_on_the_secondary_path() {
        let device = device(8);
        assert!(device.create_buffer(&desc(BufferCaps::PRIMARY)).is_err());
    }

    #[test]
    fn caps_report_pool_accounting() {
        let device = device(8);
        let before = device.caps().unwrap();
        assert_eq!(before.max_hardware_voices, 4);
        assert_eq!(before.free_hardware_voices, 4);

        let _buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
        let after = device.caps().unwrap();
        assert_eq!(after.free_hardware_voices, 3);
    }

    #[test]
    fn dropping_a_buffer_returns_its_admission() {
        let device = device(8);
        let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
        assert_eq!(device.caps().unwrap().free_hardware_voices, 3);
        drop(buffer);
        assert_eq!(device.caps().unwrap().free_hardware_voices, 4);
    }

    #[test]
    fn duplicates_inherit_pan_but_never_volume() {
        let device = device(16);
        let caps = BufferCaps::CTRL_VOLUME | BufferCaps::CTRL_PAN;
        let buffer = device.create_buffer(&desc(caps)).unwrap();
        buffer.set_volume(-600).unwrap();
        buffer.set_pan(2_500).unwrap();

        let dup = device.duplicate_buffer(&buffer).unwrap();
        assert_eq!(dup.volume().unwrap(), 0);
        assert_eq!(dup.pan().unwrap(), 2_500);
    }

    #[test]
    fn primary_format_requires_priority_level() {
        let registry = PoolRegistry::new(FakeDriver::new(8));
        let device = SoundDevice::create(registry, None).unwrap();
        device
            .set_cooperative_level(CooperativeLevel::Normal)
            .unwrap();
        let primary = device.primary_buffer().unwrap();
        assert_eq!(
            primary
                .set_format(&WaveFormat::pcm(2, 48_000, 16))
                .err()
                .unwrap(),
            DsError::PriorityLevelNeeded
        );

        device
            .set_cooperative_level(CooperativeLevel::Priority)
            .unwrap();
        primary.set_format(&WaveFormat::pcm(2, 48_000, 16)).unwrap();
        assert_eq!(primary.format().samples_per_sec, 48_000);
    }

    #[test]
    fn device_loss_is_sticky_until_restore() {
        let device = device(8);
        let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
        device.handle_device_loss().unwrap();

        assert_eq!(
            buffer.play(PlayFlags::empty()).err().unwrap(),
            DsError::BufferLost
        );
        // Loss released the admission.
        assert_eq!(device.caps().unwrap().free_hardware_voices, 4);

        device.handle_device_restored().unwrap();
        buffer.restore().unwrap();
        buffer.play(PlayFlags::empty()).unwrap();
        assert_eq!(device.caps().unwrap().free_hardware_voices, 3);
    }

    #[test]
    fn restore_fails_while_the_loss_condition_holds() {
        let device = device(8);
        let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
        let primary = device.primary_buffer().unwrap();
        device.handle_device_loss().unwrap();

        // The condition causing the loss has not cleared yet.
        assert_eq!(buffer.restore().err().unwrap(), DsError::BufferLost);
        assert_eq!(primary.restore().err().unwrap(), DsError::BufferLost);
        assert_eq!(
            buffer.play(PlayFlags::empty()).err().unwrap(),
            DsError::BufferLost
        );

        device.handle_device_restored().unwrap();
        buffer.restore().unwrap();
        primary.restore().unwrap();
        buffer.play(PlayFlags::empty()).unwrap();
    }
}
