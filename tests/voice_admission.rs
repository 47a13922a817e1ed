//! Voice admission and location arbitration against the fake backend.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use dsound_compat::backend::fake::FakeDriver;
use dsound_compat::{
    BufferCaps, BufferDescription, CooperativeLevel, DsError, Location, LocationRequest,
    PlayFlags, PoolRegistry, SoundDevice, WaveFormat,
};

fn device(voices: u32) -> (Arc<FakeDriver>, SoundDevice) {
    let driver = FakeDriver::new(voices);
    let registry = PoolRegistry::new(Arc::clone(&driver) as _);
    let device = SoundDevice::create(registry, None).unwrap();
    device
        .set_cooperative_level(CooperativeLevel::Priority)
        .unwrap();
    (driver, device)
}

fn desc(caps: BufferCaps) -> BufferDescription {
    BufferDescription {
        caps,
        bytes: 1_000,
        format: WaveFormat::pcm(2, 44_100, 16),
    }
}

#[test]
fn admission_spills_to_software_then_exhausts() {
    // 8 voices split 4 hardware / 4 software.
    let (_driver, device) = device(8);

    let mut buffers: Vec<_> = (0..8)
        .map(|_| device.create_buffer(&desc(BufferCaps::empty())).unwrap())
        .collect();
    let hardware = buffers
        .iter()
        .filter(|b| b.location().unwrap() == Some(Location::Hardware))
        .count();
    let software = buffers
        .iter()
        .filter(|b| b.location().unwrap() == Some(Location::Software))
        .count();
    assert_eq!((hardware, software), (4, 4));

    assert_eq!(
        device.create_buffer(&desc(BufferCaps::empty())).err().unwrap(),
        DsError::VoicesExhausted
    );

    // Releasing any one admission makes the next creation succeed.
    drop(buffers.pop());
    assert!(device.create_buffer(&desc(BufferCaps::empty())).is_ok());
}

#[test]
fn pinned_hardware_never_falls_over_to_software() {
    let (_driver, device) = device(8);
    let _held: Vec<_> = (0..4)
        .map(|_| device.create_buffer(&desc(BufferCaps::LOC_HARDWARE)).unwrap())
        .collect();

    // Software budget is untouched, but the pinned request must not use it.
    assert_eq!(device.caps().unwrap().free_software_voices, 4);
    assert_eq!(
        device
            .create_buffer(&desc(BufferCaps::LOC_HARDWARE))
            .err()
            .unwrap(),
        DsError::VoicesExhausted
    );
    assert!(device.create_buffer(&desc(BufferCaps::LOC_SOFTWARE)).is_ok());
}

#[test]
fn deferred_buffers_admit_on_first_play() {
    let (driver, device) = device(8);
    let buffer = device.create_buffer(&desc(BufferCaps::LOC_DEFER)).unwrap();

    assert_eq!(buffer.location().unwrap(), None);
    assert_eq!(driver.voices_alive(), 0);

    buffer.play(PlayFlags::LOC_SOFTWARE).unwrap();
    assert_eq!(buffer.location().unwrap(), Some(Location::Software));
    assert_eq!(driver.voices_alive(), 1);
}

#[test]
fn play_location_flags_require_a_deferred_buffer() {
    let (_driver, device) = device(8);
    let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
    assert!(buffer.play(PlayFlags::LOC_SOFTWARE).is_err());
    assert!(buffer
        .play(PlayFlags::LOC_HARDWARE | PlayFlags::LOC_SOFTWARE)
        .is_err());
}

#[test]
fn relocation_moves_the_admission_between_budgets() {
    let (driver, device) = device(8);
    let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
    assert_eq!(buffer.location().unwrap(), Some(Location::Hardware));
    assert_eq!(device.caps().unwrap().free_hardware_voices, 3);

    buffer.set_location(LocationRequest::Software).unwrap();
    assert_eq!(buffer.location().unwrap(), Some(Location::Software));
    let caps = device.caps().unwrap();
    assert_eq!(caps.free_hardware_voices, 4);
    assert_eq!(caps.free_software_voices, 3);
    // Old voice torn down, new one created.
    assert_eq!(driver.voices_alive(), 1);

    // Same-state and `Any` requests are no-ops.
    buffer.set_location(LocationRequest::Software).unwrap();
    buffer.set_location(LocationRequest::Any).unwrap();
    assert_eq!(buffer.location().unwrap(), Some(Location::Software));
}

#[test]
fn relocating_a_playing_voice_is_rejected() {
    let (_driver, device) = device(8);
    let buffer = device.create_buffer(&desc(BufferCaps::empty())).unwrap();
    buffer.play(PlayFlags::LOOPING).unwrap();

    assert_eq!(
        buffer.set_location(LocationRequest::Software).err().unwrap(),
        DsError::InvalidCall("cannot relocate a playing voice")
    );
    // Still on its original voice.
    assert_eq!(buffer.location().unwrap(), Some(Location::Hardware));
}

#[test]
fn failed_arbitration_leaves_a_deferred_buffer_retryable() {
    let (_driver, device) = device(8);
    let _held: Vec<_> = (0..8)
        .map(|_| device.create_buffer(&desc(BufferCaps::empty())).unwrap())
        .collect();

    let deferred = device.create_buffer(&desc(BufferCaps::LOC_DEFER)).unwrap();
    assert_eq!(
        deferred.play(PlayFlags::empty()).err().unwrap(),
        DsError::VoicesExhausted
    );
    assert_eq!(deferred.location().unwrap(), None);

    drop(_held);
    deferred.play(PlayFlags::empty()).unwrap();
    assert!(deferred.location().unwrap().is_some());
}
