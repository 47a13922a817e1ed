//! Transport, cursor, lock-region, and scalar-control behavior.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use dsound_compat::backend::fake::FakeDriver;
use dsound_compat::backend::TransportState;
use dsound_compat::{
    BufferCaps, BufferDescription, BufferStatus, CooperativeLevel, DsError, PlayFlags,
    PoolRegistry, SecondaryBuffer, SoundDevice, WaveFormat,
};

fn device() -> (Arc<FakeDriver>, SoundDevice) {
    let driver = FakeDriver::new(8);
    let registry = PoolRegistry::new(Arc::clone(&driver) as _);
    let device = SoundDevice::create(registry, None).unwrap();
    device
        .set_cooperative_level(CooperativeLevel::Priority)
        .unwrap();
    (driver, device)
}

/// 1000-byte stereo 16-bit buffer (block align 4).
fn buffer(device: &SoundDevice, caps: BufferCaps) -> SecondaryBuffer {
    device
        .create_buffer(&BufferDescription {
            caps,
            bytes: 1_000,
            format: WaveFormat::pcm(2, 44_100, 16),
        })
        .unwrap()
}

#[test]
fn lock_writes_reach_the_backend_without_a_copy_step() {
    let (driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());
    let backend_buffer = driver.buffer_handles()[0];

    let mut guard = buffer.lock(8, 4).unwrap();
    guard.with_segments(|first, second| {
        assert!(second.is_none());
        first.copy_from_slice(&[1, 2, 3, 4]);
    });
    // Visible to the mixer before the guard is even dropped.
    let bytes = driver.buffer_bytes(backend_buffer).unwrap();
    assert_eq!(&bytes[8..12], &[1, 2, 3, 4]);
    drop(guard);
    let bytes = driver.buffer_bytes(backend_buffer).unwrap();
    assert_eq!(&bytes[8..12], &[1, 2, 3, 4]);
}

#[test]
fn wraparound_lock_splits_into_two_segments() {
    let (driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());
    let backend_buffer = driver.buffer_handles()[0];

    let mut guard = buffer.lock(996, 8).unwrap();
    assert_eq!(guard.segment_lens(), (4, 4));
    guard.with_segments(|first, second| {
        first.copy_from_slice(&[9; 4]);
        second.unwrap().copy_from_slice(&[7; 4]);
    });
    drop(guard);

    let bytes = driver.buffer_bytes(backend_buffer).unwrap();
    assert_eq!(&bytes[996..1_000], &[9; 4]);
    assert_eq!(&bytes[0..4], &[7; 4]);
}

#[test]
fn only_one_lock_may_be_outstanding() {
    let (_driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());

    let guard = buffer.lock(0, 100).unwrap();
    assert_eq!(
        buffer.lock(200, 4).err().unwrap(),
        DsError::InvalidCall("buffer is already locked")
    );
    drop(guard);
    assert!(buffer.lock(200, 4).is_ok());
}

#[test]
fn lock_validates_bounds() {
    let (_driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());
    assert!(buffer.lock(1_000, 4).is_err());
    assert!(buffer.lock(0, 0).is_err());
    assert!(buffer.lock(0, 1_001).is_err());
    // Full-length lock is fine.
    assert!(buffer.lock(0, 1_000).is_ok());
}

#[test]
fn play_honors_the_shadow_offset_only_from_initial() {
    let (driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());

    // 501 snaps down to the block boundary at 500.
    buffer.set_current_position(501).unwrap();
    assert_eq!(buffer.current_position().unwrap(), (500, 500));

    buffer.play(PlayFlags::empty()).unwrap();
    let voice = driver.voice_handles()[0];
    assert_eq!(driver.voice(voice).unwrap().offset, 500);

    // Paused voices resume where they were; the shadow is not re-applied.
    driver.set_offset(voice, 700);
    buffer.stop().unwrap();
    assert_eq!(driver.voice(voice).unwrap().state, TransportState::Paused);
    buffer.play(PlayFlags::empty()).unwrap();
    assert_eq!(driver.voice(voice).unwrap().offset, 700);
}

#[test]
fn set_current_position_rejects_out_of_range() {
    let (_driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());
    assert!(buffer.set_current_position(1_000).is_err());
    buffer.set_current_position(999).unwrap();
    assert_eq!(buffer.current_position().unwrap().0, 996);
}

#[test]
fn status_reflects_transport_and_location() {
    let (driver, device) = device();
    let buffer = buffer(&device, BufferCaps::empty());
    assert_eq!(buffer.status().unwrap(), BufferStatus::LOC_HARDWARE);

    buffer.play(PlayFlags::LOOPING).unwrap();
    assert_eq!(
        buffer.status().unwrap(),
        BufferStatus::PLAYING | BufferStatus::LOOPING | BufferStatus::LOC_HARDWARE
    );
    let voice = driver.voice_handles()[0];
    assert!(driver.voice(voice).unwrap().looping);

    buffer.stop().unwrap();
    assert_eq!(buffer.status().unwrap(), BufferStatus::LOC_HARDWARE);
}

#[test]
fn scalar_controls_are_gated_on_capabilities() {
    let (_driver, device) = device();
    let plain = buffer(&device, BufferCaps::empty());
    assert_eq!(plain.set_volume(-100).err().unwrap(), DsError::ControlUnavailable);
    assert_eq!(plain.set_pan(0).err().unwrap(), DsError::ControlUnavailable);
    assert_eq!(plain.set_frequency(0).err().unwrap(), DsError::ControlUnavailable);
}

#[test]
fn scalar_controls_validate_and_reach_the_voice() {
    let (driver, device) = device();
    let caps = BufferCaps::CTRL_VOLUME | BufferCaps::CTRL_PAN | BufferCaps::CTRL_FREQUENCY;
    let buffer = buffer(&device, caps);
    let voice = driver.voice_handles()[0];

    assert!(buffer.set_volume(1).is_err());
    assert!(buffer.set_volume(-10_001).is_err());
    buffer.set_volume(-2_000).unwrap();
    let gain = driver.voice(voice).unwrap().gain;
    assert!((gain - 0.1).abs() < 1e-4);

    buffer.set_pan(-10_000).unwrap();
    assert_eq!(driver.voice(voice).unwrap().pan, -1.0);

    assert!(buffer.set_frequency(99).is_err());
    buffer.set_frequency(88_200).unwrap();
    assert_eq!(driver.voice(voice).unwrap().pitch, 2.0);
    assert_eq!(buffer.frequency().unwrap(), 88_200);
    // Zero means the format's own rate.
    buffer.set_frequency(0).unwrap();
    assert_eq!(buffer.frequency().unwrap(), 44_100);
}
