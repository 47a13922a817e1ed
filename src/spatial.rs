//! 3D spatialization parameters and the deferred-commit protocol.
//!
//! Buffers and the listener each keep two copies of their 3D record: the
//! immediate copy (what the backend has been told) and a deferred shadow.
//! Setters take an [`Apply`] mode; deferred writes land in the shadow and mark
//! a dirty bit, and nothing reaches the backend until the listener's commit
//! walks every dirty field. The dirty set is an atomic swap-and-clear so a
//! write racing a commit is batched into the next commit instead of lost.
//!
//! Geometry convention: the legacy API is left-handed, the backend is
//! right-handed, so every Z component is negated at the boundary.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::backend::{StreamingBackend, VoiceHandle};
use crate::error::{DsError, Result};
use crate::format::{millibels_to_gain, VOLUME_MAX_MB, VOLUME_MIN_MB};

/// How a 3D setter takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    /// Push to the backend synchronously; the dirty set is not touched.
    Immediate,
    /// Write the shadow record and mark the field; applied on the next commit.
    Deferred,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferField: u32 {
        const POSITION            = 1 << 0;
        const VELOCITY            = 1 << 1;
        const CONE_ANGLES         = 1 << 2;
        const CONE_ORIENTATION    = 1 << 3;
        const CONE_OUTSIDE_VOLUME = 1 << 4;
        const MIN_DISTANCE        = 1 << 5;
        const MAX_DISTANCE        = 1 << 6;
        const MODE                = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenerField: u32 {
        const POSITION        = 1 << 0;
        const VELOCITY        = 1 << 1;
        const ORIENTATION     = 1 << 2;
        const DISTANCE_FACTOR = 1 << 3;
        const ROLLOFF_FACTOR  = 1 << 4;
        const DOPPLER_FACTOR  = 1 << 5;
    }
}

/// Fixed tagged set of deferred fields with an atomic swap-and-clear.
///
/// `take` is the commit primitive: it empties the set in one atomic step, so
/// deferred writes arriving after the swap belong to the next commit.
pub(crate) struct DirtySet<F> {
    bits: AtomicU32,
    _marker: PhantomData<F>,
}

impl<F: bitflags::Flags<Bits = u32>> DirtySet<F> {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            _marker: PhantomData,
        }
    }

    pub fn mark(&self, field: F) {
        self.bits.fetch_or(field.bits(), Ordering::AcqRel);
    }

    pub fn take(&self) -> F {
        F::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }

    pub fn is_empty(&self) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }
}

/// Processing mode of a 3D buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode3D {
    /// World coordinates.
    Normal,
    /// Coordinates are relative to the listener.
    HeadRelative,
    /// 3D processing off: the voice is pinned just in front of the listener
    /// with distance attenuation disabled.
    Disabled,
}

pub const MIN_FACTOR: f32 = 0.0;
pub const MAX_FACTOR: f32 = 10.0;
pub const DEFAULT_MIN_DISTANCE: f32 = 1.0;
pub const DEFAULT_MAX_DISTANCE: f32 = 1.0e9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferParams3D {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub cone_inner_angle: u32,
    pub cone_outer_angle: u32,
    pub cone_orientation: [f32; 3],
    pub cone_outside_volume_mb: i32,
    pub min_distance: f32,
    pub max_distance: f32,
    pub mode: Mode3D,
}

impl Default for BufferParams3D {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            velocity: [0.0; 3],
            cone_inner_angle: 360,
            cone_outer_angle: 360,
            cone_orientation: [0.0, 0.0, 1.0],
            cone_outside_volume_mb: 0,
            min_distance: DEFAULT_MIN_DISTANCE,
            max_distance: DEFAULT_MAX_DISTANCE,
            mode: Mode3D::Normal,
        }
    }
}

impl BufferParams3D {
    pub fn validate(&self) -> Result<()> {
        if self.cone_inner_angle > 360 || self.cone_outer_angle > 360 {
            return Err(DsError::InvalidParam("cone angle out of range"));
        }
        if !(VOLUME_MIN_MB..=VOLUME_MAX_MB).contains(&self.cone_outside_volume_mb) {
            return Err(DsError::InvalidParam("cone outside volume out of range"));
        }
        if !self.min_distance.is_finite() || self.min_distance < 0.0 {
            return Err(DsError::InvalidParam("min distance out of range"));
        }
        if !self.max_distance.is_finite() || self.max_distance < 0.0 {
            return Err(DsError::InvalidParam("max distance out of range"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerParams3D {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub orient_front: [f32; 3],
    pub orient_top: [f32; 3],
    /// Meters per legacy distance unit.
    pub distance_factor: f32,
    pub rolloff_factor: f32,
    pub doppler_factor: f32,
}

impl Default for ListenerParams3D {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            velocity: [0.0; 3],
            orient_front: [0.0, 0.0, 1.0],
            orient_top: [0.0, 1.0, 0.0],
            distance_factor: 1.0,
            rolloff_factor: 1.0,
            doppler_factor: 1.0,
        }
    }
}

impl ListenerParams3D {
    pub fn validate(&self) -> Result<()> {
        for factor in [self.rolloff_factor, self.doppler_factor] {
            if !(MIN_FACTOR..=MAX_FACTOR).contains(&factor) {
                return Err(DsError::InvalidParam("factor out of range"));
            }
        }
        if !self.distance_factor.is_finite() || self.distance_factor <= 0.0 {
            return Err(DsError::InvalidParam("distance factor out of range"));
        }
        Ok(())
    }
}

/// Immediate + deferred listener records with their dirty set.
pub(crate) struct ListenerState {
    pub immediate: ListenerParams3D,
    pub deferred: ListenerParams3D,
    pub dirty: DirtySet<ListenerField>,
}

impl ListenerState {
    pub fn new() -> Self {
        Self {
            immediate: ListenerParams3D::default(),
            deferred: ListenerParams3D::default(),
            dirty: DirtySet::new(),
        }
    }

    /// Copy the named deferred fields over the immediate record.
    pub fn merge(&mut self, fields: ListenerField) {
        let d = &self.deferred;
        let i = &mut self.immediate;
        if fields.contains(ListenerField::POSITION) {
            i.position = d.position;
        }
        if fields.contains(ListenerField::VELOCITY) {
            i.velocity = d.velocity;
        }
        if fields.contains(ListenerField::ORIENTATION) {
            i.orient_front = d.orient_front;
            i.orient_top = d.orient_top;
        }
        if fields.contains(ListenerField::DISTANCE_FACTOR) {
            i.distance_factor = d.distance_factor;
        }
        if fields.contains(ListenerField::ROLLOFF_FACTOR) {
            i.rolloff_factor = d.rolloff_factor;
        }
        if fields.contains(ListenerField::DOPPLER_FACTOR) {
            i.doppler_factor = d.doppler_factor;
        }
    }
}

/// Left-handed legacy coordinates to the backend's right-handed convention.
fn flip_z(v: [f32; 3]) -> [f32; 3] {
    [v[0], v[1], -v[2]]
}

/// Geometry pushed for a mode-disabled voice: parked just in front of the
/// listener, no distance attenuation, no cone.
const DISABLED_POSITION: [f32; 3] = [0.0, 0.0, -1.0];

/// Push the named buffer fields to the backend.
///
/// When `MODE` is among the fields the geometry-bearing fields are re-pushed
/// as well, because their backend translation depends on the mode. Each field
/// is pushed at most once per call.
pub(crate) fn apply_buffer_fields(
    backend: &mut dyn StreamingBackend,
    voice: VoiceHandle,
    params: &BufferParams3D,
    listener_rolloff: f32,
    fields: BufferField,
) {
    let mut fields = fields;
    if fields.contains(BufferField::MODE) {
        fields |= BufferField::POSITION | BufferField::VELOCITY | BufferField::CONE_ORIENTATION;
    }
    let disabled = params.mode == Mode3D::Disabled;

    if fields.contains(BufferField::MODE) {
        backend.set_relative(voice, params.mode != Mode3D::Normal);
        backend.set_rolloff(voice, if disabled { 0.0 } else { listener_rolloff });
    }
    if fields.contains(BufferField::POSITION) {
        let pos = if disabled { DISABLED_POSITION } else { flip_z(params.position) };
        backend.set_position(voice, pos);
    }
    if fields.contains(BufferField::VELOCITY) {
        let vel = if disabled { [0.0; 3] } else { flip_z(params.velocity) };
        backend.set_velocity(voice, vel);
    }
    if fields.contains(BufferField::CONE_ORIENTATION) {
        // Zero direction turns the cone off entirely.
        let dir = if disabled { [0.0; 3] } else { flip_z(params.cone_orientation) };
        backend.set_direction(voice, dir);
    }
    if fields.contains(BufferField::CONE_ANGLES) {
        backend.set_cone_angles(voice, params.cone_inner_angle, params.cone_outer_angle);
    }
    if fields.contains(BufferField::CONE_OUTSIDE_VOLUME) {
        backend.set_cone_outer_gain(voice, millibels_to_gain(params.cone_outside_volume_mb));
    }
    if fields.intersects(BufferField::MIN_DISTANCE | BufferField::MAX_DISTANCE) {
        backend.set_distances(voice, params.min_distance, params.max_distance);
    }
}

/// Push the named listener fields to the backend.
///
/// `ROLLOFF_FACTOR` deliberately pushes nothing here: rolloff lives per-voice
/// on the backend, so the caller propagates it to every registered 3D buffer.
pub(crate) fn apply_listener_fields(
    backend: &mut dyn StreamingBackend,
    params: &ListenerParams3D,
    fields: ListenerField,
) {
    if fields.contains(ListenerField::POSITION) {
        backend.set_listener_position(flip_z(params.position));
    }
    if fields.contains(ListenerField::VELOCITY) {
        backend.set_listener_velocity(flip_z(params.velocity));
    }
    if fields.contains(ListenerField::ORIENTATION) {
        backend.set_listener_orientation(flip_z(params.orient_front), flip_z(params.orient_top));
    }
    if fields.contains(ListenerField::DISTANCE_FACTOR) {
        backend.set_distance_scale(params.distance_factor);
    }
    if fields.contains(ListenerField::DOPPLER_FACTOR) {
        backend.set_doppler_factor(params.doppler_factor);
    }
}

/// Copy the named deferred buffer fields over the immediate record.
pub(crate) fn merge_buffer_fields(
    immediate: &mut BufferParams3D,
    deferred: &BufferParams3D,
    fields: BufferField,
) {
    if fields.contains(BufferField::POSITION) {
        immediate.position = deferred.position;
    }
    if fields.contains(BufferField::VELOCITY) {
        immediate.velocity = deferred.velocity;
    }
    if fields.contains(BufferField::CONE_ANGLES) {
        immediate.cone_inner_angle = deferred.cone_inner_angle;
        immediate.cone_outer_angle = deferred.cone_outer_angle;
    }
    if fields.contains(BufferField::CONE_ORIENTATION) {
        immediate.cone_orientation = deferred.cone_orientation;
    }
    if fields.contains(BufferField::CONE_OUTSIDE_VOLUME) {
        immediate.cone_outside_volume_mb = deferred.cone_outside_volume_mb;
    }
    if fields.contains(BufferField::MIN_DISTANCE) {
        immediate.min_distance = deferred.min_distance;
    }
    if fields.contains(BufferField::MAX_DISTANCE) {
        immediate.max_distance = deferred.max_distance;
    }
    if fields.contains(BufferField::MODE) {
        immediate.mode = deferred.mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeCall, FakeDriver};
    use crate::backend::BackendDriver;
    use crate::backend::DeviceIdentity;

    #[test]
    fn dirty_set_take_clears_and_preserves_later_marks() {
        let dirty: DirtySet<BufferField> = DirtySet::new();
        dirty.mark(BufferField::POSITION);
        dirty.mark(BufferField::MODE);
        let taken = dirty.take();
        assert_eq!(taken, BufferField::POSITION | BufferField::MODE);
        assert!(dirty.is_empty());

        // A mark after the swap belongs to the next take.
        dirty.mark(BufferField::VELOCITY);
        assert_eq!(dirty.take(), BufferField::VELOCITY);
    }

    #[test]
    fn disabled_mode_pushes_parked_geometry() {
        let driver = FakeDriver::new(8);
        let mut backend = driver.open(&DeviceIdentity::default_output()).unwrap();
        let voice = backend.create_voice().unwrap();
        driver.take_calls();

        let params = BufferParams3D {
            position: [5.0, 6.0, 7.0],
            velocity: [1.0, 1.0, 1.0],
            mode: Mode3D::Disabled,
            ..BufferParams3D::default()
        };
        apply_buffer_fields(
            backend.as_mut(),
            voice,
            &params,
            1.0,
            BufferField::POSITION | BufferField::MODE,
        );

        let calls = driver.take_calls();
        assert!(calls.contains(&FakeCall::Position(voice, [0.0, 0.0, -1.0])));
        assert!(calls.contains(&FakeCall::Velocity(voice, [0.0; 3])));
        assert!(calls.contains(&FakeCall::Rolloff(voice, 0.0)));
        assert!(calls.contains(&FakeCall::Relative(voice, true)));
        // Position pushed exactly once despite being both dirty and
        // mode-expanded.
        let position_pushes = calls
            .iter()
            .filter(|c| matches!(c, FakeCall::Position(..)))
            .count();
        assert_eq!(position_pushes, 1);
    }

    #[test]
    fn normal_mode_negates_z_and_uses_listener_rolloff() {
        let driver = FakeDriver::new(8);
        let mut backend = driver.open(&DeviceIdentity::default_output()).unwrap();
        let voice = backend.create_voice().unwrap();
        driver.take_calls();

        let params = BufferParams3D {
            position: [1.0, 2.0, 3.0],
            ..BufferParams3D::default()
        };
        apply_buffer_fields(
            backend.as_mut(),
            voice,
            &params,
            0.5,
            BufferField::POSITION | BufferField::MODE,
        );

        let calls = driver.take_calls();
        assert!(calls.contains(&FakeCall::Position(voice, [1.0, 2.0, -3.0])));
        assert!(calls.contains(&FakeCall::Rolloff(voice, 0.5)));
        assert!(calls.contains(&FakeCall::Relative(voice, false)));
    }

    #[test]
    fn listener_orientation_flips_both_vectors() {
        let driver = FakeDriver::new(8);
        let mut backend = driver.open(&DeviceIdentity::default_output()).unwrap();
        driver.take_calls();

        let params = ListenerParams3D::default();
        apply_listener_fields(backend.as_mut(), &params, ListenerField::ORIENTATION);
        let calls = driver.take_calls();
        assert_eq!(
            calls,
            vec![FakeCall::ListenerOrientation([0.0, 0.0, -1.0], [0.0, 1.0, 0.0])]
        );
    }

    #[test]
    fn rolloff_factor_alone_pushes_nothing_at_the_listener() {
        let driver = FakeDriver::new(8);
        let mut backend = driver.open(&DeviceIdentity::default_output()).unwrap();
        driver.take_calls();

        apply_listener_fields(
            backend.as_mut(),
            &ListenerParams3D::default(),
            ListenerField::ROLLOFF_FACTOR,
        );
        assert!(driver.take_calls().is_empty());
    }

    #[test]
    fn params_validation_rejects_out_of_range() {
        let mut p = BufferParams3D::default();
        p.cone_outer_angle = 400;
        assert!(p.validate().is_err());

        let mut l = ListenerParams3D::default();
        l.rolloff_factor = 11.0;
        assert!(l.validate().is_err());
        l.rolloff_factor = 1.0;
        l.distance_factor = 0.0;
        assert!(l.validate().is_err());
    }
}
