//! The opaque streaming audio engine this layer sits on.
//!
//! Everything the compatibility layer needs from the modern audio API is
//! expressed here as two traits:
//!
//! - [`BackendDriver`]: opens a device by identity and yields a connection.
//! - [`StreamingBackend`]: one open device/context, covering voice lifecycle,
//!   scalar and vector voice/listener controls, transport, and the coarse
//!   suspend/resume bracket over the mixing graph.
//!
//! All control calls are assumed short and non-blocking; only [`BackendDriver::open`]
//! may be slow. The [`fake`] module provides a scriptable in-memory
//! implementation used throughout the test suite.

use std::sync::Arc;

use thiserror::Error;

use crate::format::WaveFormat;
use crate::shared::SampleStorage;

/// Failure reported by the backend, carried as text because backends differ in
/// how much structure they expose.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Identity of a physical output device, as reported by endpoint enumeration
/// (which is outside this crate's scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The system default output.
    pub fn default_output() -> Self {
        Self("default".to_owned())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceHandle(pub u64);

/// Transport state of one voice.
///
/// `Stopped` means the voice reached the end of a non-looping buffer on its
/// own. An explicit stop from this layer is a [`StreamingBackend::pause`] so
/// the read position survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created (or rewound) and never started since.
    Initial,
    Playing,
    Paused,
    /// Ran to the natural end of its buffer.
    Stopped,
}

bitflags::bitflags! {
    /// Optional backend capabilities, queried once per connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackendExtensions: u32 {
        /// Direct per-voice stereo panning.
        const PAN = 1 << 0;
        /// More than two output channels per buffer.
        const MULTI_CHANNEL = 1 << 1;
        /// 32-bit float sample data.
        const FLOAT32 = 1 << 2;
        /// Environmental-audio property forwarding.
        const EAX = 1 << 3;
    }
}

pub trait BackendDriver: Send + Sync {
    /// Open a device and create its playback context. May block; the caller
    /// guarantees no registry lock is held across this call.
    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn StreamingBackend>, BackendError>;
}

/// One open device connection. Voices and buffers are referred to by opaque
/// handles; every setter on a dead handle is a no-op rather than an error, the
/// way command-stream style backends behave.
pub trait StreamingBackend: Send {
    /// Total number of simultaneously creatable voices on this device.
    fn voice_capacity(&self) -> u32;

    fn extensions(&self) -> BackendExtensions;

    /// Bind shared sample storage to a backend buffer object. The storage is
    /// mapped, not copied: later writes through a region lock are visible to
    /// the mixer without another upload.
    fn create_buffer(
        &mut self,
        format: &WaveFormat,
        storage: Arc<SampleStorage>,
    ) -> Result<BufferHandle, BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_voice(&mut self) -> Result<VoiceHandle, BackendError>;
    fn destroy_voice(&mut self, voice: VoiceHandle);
    fn bind_buffer(&mut self, voice: VoiceHandle, buffer: BufferHandle);

    fn set_gain(&mut self, voice: VoiceHandle, gain: f32);
    fn set_pitch(&mut self, voice: VoiceHandle, pitch: f32);
    fn set_pan(&mut self, voice: VoiceHandle, pan: f32);
    fn set_position(&mut self, voice: VoiceHandle, pos: [f32; 3]);
    fn set_velocity(&mut self, voice: VoiceHandle, vel: [f32; 3]);
    fn set_direction(&mut self, voice: VoiceHandle, dir: [f32; 3]);
    fn set_cone_angles(&mut self, voice: VoiceHandle, inner_deg: u32, outer_deg: u32);
    fn set_cone_outer_gain(&mut self, voice: VoiceHandle, gain: f32);
    fn set_distances(&mut self, voice: VoiceHandle, reference: f32, max: f32);
    fn set_rolloff(&mut self, voice: VoiceHandle, rolloff: f32);
    fn set_relative(&mut self, voice: VoiceHandle, relative: bool);
    fn set_looping(&mut self, voice: VoiceHandle, looping: bool);
    fn set_byte_offset(&mut self, voice: VoiceHandle, offset: u32);

    fn play(&mut self, voice: VoiceHandle);
    fn pause(&mut self, voice: VoiceHandle);
    fn stop(&mut self, voice: VoiceHandle);
    fn transport_state(&self, voice: VoiceHandle) -> TransportState;
    fn byte_offset(&self, voice: VoiceHandle) -> u32;

    fn set_listener_position(&mut self, pos: [f32; 3]);
    fn set_listener_velocity(&mut self, vel: [f32; 3]);
    fn set_listener_orientation(&mut self, front: [f32; 3], top: [f32; 3]);
    fn set_doppler_factor(&mut self, factor: f32);
    /// Distance-unit scale (legacy "distance factor", meters per unit).
    fn set_distance_scale(&mut self, meters_per_unit: f32);

    /// Pause the mixing graph. Nestable; used to make multi-field immediate
    /// writes appear atomic to the mixer.
    fn suspend(&mut self);
    fn resume(&mut self);
}

pub mod fake {
    //! Scriptable in-memory backend.
    //!
    //! Tests drive transport state and read positions by hand
    //! ([`FakeDriver::set_transport`], [`FakeDriver::set_offset`]) and assert
    //! on the exact setter traffic via [`FakeDriver::take_calls`]. A single
    //! [`FakeDriver`] can open any number of identities; each open yields a
    //! backend view onto the same shared state so assertions survive the
    //! connection being boxed away inside a device pool.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// One recorded control call. Only the calls the test suite asserts on are
    /// recorded; plain transport calls are observable through voice state
    /// instead.
    #[derive(Debug, Clone, PartialEq)]
    pub enum FakeCall {
        Gain(VoiceHandle, f32),
        Pitch(VoiceHandle, f32),
        Pan(VoiceHandle, f32),
        Position(VoiceHandle, [f32; 3]),
        Velocity(VoiceHandle, [f32; 3]),
        Direction(VoiceHandle, [f32; 3]),
        ConeAngles(VoiceHandle, u32, u32),
        ConeOuterGain(VoiceHandle, f32),
        Distances(VoiceHandle, f32, f32),
        Rolloff(VoiceHandle, f32),
        Relative(VoiceHandle, bool),
        ListenerPosition([f32; 3]),
        ListenerVelocity([f32; 3]),
        ListenerOrientation([f32; 3], [f32; 3]),
        DopplerFactor(f32),
        DistanceScale(f32),
    }

    #[derive(Debug, Clone)]
    pub struct FakeVoice {
        pub bound: Option<BufferHandle>,
        pub gain: f32,
        pub pitch: f32,
        pub pan: f32,
        pub looping: bool,
        pub offset: u32,
        pub state: TransportState,
        pub relative: bool,
        pub rolloff: f32,
    }

    impl Default for FakeVoice {
        fn default() -> Self {
            Self {
                bound: None,
                gain: 1.0,
                pitch: 1.0,
                pan: 0.0,
                looping: false,
                offset: 0,
                state: TransportState::Initial,
                relative: false,
                rolloff: 1.0,
            }
        }
    }

    #[derive(Default)]
    struct FakeInner {
        next_handle: u64,
        voices: HashMap<VoiceHandle, FakeVoice>,
        buffers: HashMap<BufferHandle, Arc<SampleStorage>>,
        calls: Vec<FakeCall>,
        suspend_depth: u32,
        open_count: u32,
    }

    /// Driver + shared observation point for tests.
    pub struct FakeDriver {
        inner: Arc<Mutex<FakeInner>>,
        capacity: u32,
        extensions: BackendExtensions,
        fail_open: AtomicBool,
    }

    impl FakeDriver {
        pub fn new(voice_capacity: u32) -> Arc<Self> {
            Self::with_extensions(
                voice_capacity,
                BackendExtensions::PAN | BackendExtensions::MULTI_CHANNEL,
            )
        }

        /// A driver reporting exactly `extensions`, for capability-gating
        /// tests.
        pub fn with_extensions(voice_capacity: u32, extensions: BackendExtensions) -> Arc<Self> {
            Arc::new(Self {
                inner: Arc::new(Mutex::new(FakeInner::default())),
                capacity: voice_capacity,
                extensions,
                fail_open: AtomicBool::new(false),
            })
        }

        /// Make subsequent opens fail, for registry failure-path tests.
        pub fn fail_next_opens(&self, fail: bool) {
            self.fail_open.store(fail, Ordering::SeqCst);
        }

        pub fn open_count(&self) -> u32 {
            self.inner.lock().unwrap().open_count
        }

        pub fn voices_alive(&self) -> usize {
            self.inner.lock().unwrap().voices.len()
        }

        pub fn voice(&self, voice: VoiceHandle) -> Option<FakeVoice> {
            self.inner.lock().unwrap().voices.get(&voice).cloned()
        }

        /// Live voice handles in creation order.
        pub fn voice_handles(&self) -> Vec<VoiceHandle> {
            let mut handles: Vec<VoiceHandle> =
                self.inner.lock().unwrap().voices.keys().copied().collect();
            handles.sort_by_key(|h| h.0);
            handles
        }

        /// Live backend-buffer handles in creation order.
        pub fn buffer_handles(&self) -> Vec<BufferHandle> {
            let mut handles: Vec<BufferHandle> =
                self.inner.lock().unwrap().buffers.keys().copied().collect();
            handles.sort_by_key(|h| h.0);
            handles
        }

        /// Script the transport state a later poll will observe.
        pub fn set_transport(&self, voice: VoiceHandle, state: TransportState) {
            if let Some(v) = self.inner.lock().unwrap().voices.get_mut(&voice) {
                v.state = state;
            }
        }

        /// Script the byte offset a later poll will observe.
        pub fn set_offset(&self, voice: VoiceHandle, offset: u32) {
            if let Some(v) = self.inner.lock().unwrap().voices.get_mut(&voice) {
                v.offset = offset;
            }
        }

        pub fn take_calls(&self) -> Vec<FakeCall> {
            std::mem::take(&mut self.inner.lock().unwrap().calls)
        }

        pub fn suspend_depth(&self) -> u32 {
            self.inner.lock().unwrap().suspend_depth
        }

        /// Read the bytes currently bound to a backend buffer. Reads through
        /// the shared mapping, so lock-guard writes are visible here.
        pub fn buffer_bytes(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
            let inner = self.inner.lock().unwrap();
            inner.buffers.get(&buffer).map(|s| s.snapshot())
        }
    }

    impl BackendDriver for FakeDriver {
        fn open(
            &self,
            identity: &DeviceIdentity,
        ) -> Result<Box<dyn StreamingBackend>, BackendError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(BackendError(format!("no such device: {}", identity.name())));
            }
            self.inner.lock().unwrap().open_count += 1;
            Ok(Box::new(FakeBackend {
                inner: Arc::clone(&self.inner),
                capacity: self.capacity,
                extensions: self.extensions,
            }))
        }
    }

    pub struct FakeBackend {
        inner: Arc<Mutex<FakeInner>>,
        capacity: u32,
        extensions: BackendExtensions,
    }

    impl FakeBackend {
        fn with_voice(&self, voice: VoiceHandle, f: impl FnOnce(&mut FakeVoice)) {
            if let Some(v) = self.inner.lock().unwrap().voices.get_mut(&voice) {
                f(v);
            }
        }

        fn record(&self, call: FakeCall) {
            self.inner.lock().unwrap().calls.push(call);
        }
    }

    impl StreamingBackend for FakeBackend {
        fn voice_capacity(&self) -> u32 {
            self.capacity
        }

        fn extensions(&self) -> BackendExtensions {
            self.extensions
        }

        fn create_buffer(
            &mut self,
            _format: &WaveFormat,
            storage: Arc<SampleStorage>,
        ) -> Result<BufferHandle, BackendError> {
            let mut inner = self.inner.lock().unwrap();
            inner.next_handle += 1;
            let handle = BufferHandle(inner.next_handle);
            inner.buffers.insert(handle, storage);
            Ok(handle)
        }

        fn destroy_buffer(&mut self, buffer: BufferHandle) {
            self.inner.lock().unwrap().buffers.remove(&buffer);
        }

        fn create_voice(&mut self) -> Result<VoiceHandle, BackendError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.voices.len() as u32 >= self.capacity {
                return Err(BackendError("voice capacity exhausted".to_owned()));
            }
            inner.next_handle += 1;
            let handle = VoiceHandle(inner.next_handle);
            inner.voices.insert(handle, FakeVoice::default());
            Ok(handle)
        }

        fn destroy_voice(&mut self, voice: VoiceHandle) {
            self.inner.lock().unwrap().voices.remove(&voice);
        }

        fn bind_buffer(&mut self, voice: VoiceHandle, buffer: BufferHandle) {
            self.with_voice(voice, |v| v.bound = Some(buffer));
        }

        fn set_gain(&mut self, voice: VoiceHandle, gain: f32) {
            self.with_voice(voice, |v| v.gain = gain);
            self.record(FakeCall::Gain(voice, gain));
        }

        fn set_pitch(&mut self, voice: VoiceHandle, pitch: f32) {
            self.with_voice(voice, |v| v.pitch = pitch);
            self.record(FakeCall::Pitch(voice, pitch));
        }

        fn set_pan(&mut self, voice: VoiceHandle, pan: f32) {
            self.with_voice(voice, |v| v.pan = pan);
            self.record(FakeCall::Pan(voice, pan));
        }

        fn set_position(&mut self, voice: VoiceHandle, pos: [f32; 3]) {
            self.record(FakeCall::Position(voice, pos));
        }

        fn set_velocity(&mut self, voice: VoiceHandle, vel: [f32; 3]) {
            self.record(FakeCall::Velocity(voice, vel));
        }

        fn set_direction(&mut self, voice: VoiceHandle, dir: [f32; 3]) {
            self.record(FakeCall::Direction(voice, dir));
        }

        fn set_cone_angles(&mut self, voice: VoiceHandle, inner_deg: u32, outer_deg: u32) {
            self.record(FakeCall::ConeAngles(voice, inner_deg, outer_deg));
        }

        fn set_cone_outer_gain(&mut self, voice: VoiceHandle, gain: f32) {
            self.record(FakeCall::ConeOuterGain(voice, gain));
        }

        fn set_distances(&mut self, voice: VoiceHandle, reference: f32, max: f32) {
            self.record(FakeCall::Distances(voice, reference, max));
        }

        fn set_rolloff(&mut self, voice: VoiceHandle, rolloff: f32) {
            self.with_voice(voice, |v| v.rolloff = rolloff);
            self.record(FakeCall::Rolloff(voice, rolloff));
        }

        fn set_relative(&mut self, voice: VoiceHandle, relative: bool) {
            self.with_voice(voice, |v| v.relative = relative);
            self.record(FakeCall::Relative(voice, relative));
        }

        fn set_looping(&mut self, voice: VoiceHandle, looping: bool) {
            self.with_voice(voice, |v| v.looping = looping);
        }

        fn set_byte_offset(&mut self, voice: VoiceHandle, offset: u32) {
            self.with_voice(voice, |v| v.offset = offset);
        }

        fn play(&mut self, voice: VoiceHandle) {
            self.with_voice(voice, |v| v.state = TransportState::Playing);
        }

        fn pause(&mut self, voice: VoiceHandle) {
            self.with_voice(voice, |v| {
                if v.state == TransportState::Playing {
                    v.state = TransportState::Paused;
                }
            });
        }

        fn stop(&mut self, voice: VoiceHandle) {
            self.with_voice(voice, |v| {
                v.state = TransportState::Initial;
                v.offset = 0;
            });
        }

        fn transport_state(&self, voice: VoiceHandle) -> TransportState {
            self.inner
                .lock()
                .unwrap()
                .voices
                .get(&voice)
                .map(|v| v.state)
                .unwrap_or(TransportState::Initial)
        }

        fn byte_offset(&self, voice: VoiceHandle) -> u32 {
            self.inner
                .lock()
                .unwrap()
                .voices
                .get(&voice)
                .map(|v| v.offset)
                .unwrap_or(0)
        }

        fn set_listener_position(&mut self, pos: [f32; 3]) {
            self.record(FakeCall::ListenerPosition(pos));
        }

        fn set_listener_velocity(&mut self, vel: [f32; 3]) {
            self.record(FakeCall::ListenerVelocity(vel));
        }

        fn set_listener_orientation(&mut self, front: [f32; 3], top: [f32; 3]) {
            self.record(FakeCall::ListenerOrientation(front, top));
        }

        fn set_doppler_factor(&mut self, factor: f32) {
            self.record(FakeCall::DopplerFactor(factor));
        }

        fn set_distance_scale(&mut self, meters_per_unit: f32) {
            self.record(FakeCall::DistanceScale(meters_per_unit));
        }

        fn suspend(&mut self) {
            self.inner.lock().unwrap().suspend_depth += 1;
        }

        fn resume(&mut self) {
            let mut inner = self.inner.lock().unwrap();
            inner.suspend_depth = inner.suspend_depth.saturating_sub(1);
        }
    }
}
