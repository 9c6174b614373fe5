use std::sync::Arc;

use overlay_pipeline::buffer::SlotState;
use overlay_pipeline::capture::PixelFormat;
use overlay_pipeline::device::{DeviceOp, MemoryMode, Rect, VirtualDevice};
use overlay_pipeline::overlay::{OutputRing, OverlayControl, SharedControlBlock, StreamState};
use overlay_pipeline::Error;

struct Overlay {
    device: Arc<VirtualDevice>,
    control: OverlayControl,
    output: OutputRing,
}

fn overlay(width: u32, height: u32) -> Overlay {
    let device = Arc::new(VirtualDevice::output(width, height, PixelFormat::Uyvy));
    let mut control = OverlayControl::with_device(device.clone(), MemoryMode::Mmap);
    let handle = control.create_overlay(width, height, None).unwrap();
    let output = OutputRing::initialize(device.clone(), &handle, MemoryMode::Mmap).unwrap();
    Overlay {
        device,
        control,
        output,
    }
}

fn state(control: &OverlayControl) -> StreamState {
    StreamState::from(control.shared().unwrap().snapshot().unwrap())
}

#[test]
fn three_buffer_queue_and_dequeue() {
    let mut o = overlay(640, 480);
    o.control.commit().unwrap();
    assert_eq!(o.output.buffer_count(), 3);

    for i in 0..3 {
        let slot = o.output.slot(i).unwrap();
        assert_eq!(o.output.queue_buffer(slot).unwrap(), i + 1);
    }
    assert_eq!(o.output.in_flight(), 3);

    let slot = o.output.dequeue_buffer().unwrap();
    assert_eq!(o.output.in_flight(), 2);
    assert_eq!(
        o.output.buffer(slot).unwrap().state(),
        SlotState::OwnedByApplication
    );
}

#[test]
fn user_pointer_overlay_cycles() {
    let device = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
    let mut control = OverlayControl::with_device(device.clone(), MemoryMode::UserPtr);
    let handle = control.create_overlay(640, 480, None).unwrap();
    let mut output = OutputRing::initialize(device.clone(), &handle, MemoryMode::UserPtr).unwrap();
    control.commit().unwrap();

    for i in 0..3 {
        let slot = output.slot(i).unwrap();
        output.buffer_mut(slot).unwrap().fill(0x80);
        assert_eq!(output.queue_buffer(slot).unwrap(), i + 1);
    }
    assert_eq!(output.in_flight(), 3);
    assert!(device.is_streaming());

    output.dequeue_buffer().unwrap();
    assert_eq!(output.in_flight(), 2);
    assert_eq!(device.count(DeviceOp::MapBuffer), 0);
}

#[test]
fn resize_only_before_first_queue() {
    let mut o = overlay(640, 480);
    o.output.resize_input(320, 240).unwrap();
    assert_eq!((o.output.width(), o.output.height()), (320, 240));
    // nothing was streaming, so nothing had to be stopped
    assert_eq!(o.device.count(DeviceOp::StreamOff), 0);

    let slot = o.output.slot(0).unwrap();
    o.output.queue_buffer(slot).unwrap();
    assert!(matches!(
        o.output.resize_input(160, 120),
        Err(Error::GeometryLocked)
    ));
}

#[test]
fn stream_waits_for_both_sides() {
    let mut o = overlay(640, 480);

    // Frame side goes ready first
    o.output.set_crop(Rect::new(0, 0, 320, 240)).unwrap();
    assert_eq!(state(&o.control), StreamState::DataReady);
    assert_eq!(o.device.count(DeviceOp::StreamOn), 0);
    assert!(matches!(o.output.dequeue_buffer(), Err(Error::WouldBlock)));

    o.control.commit().unwrap();
    assert_eq!(state(&o.control), StreamState::Streaming);
    assert_eq!(o.device.count(DeviceOp::StreamOn), 1);
}

#[test]
fn geometry_change_flushes_exactly_once() {
    let mut o = overlay(640, 480);
    o.control.commit().unwrap();
    let first = o.output.slot(0).unwrap();
    let second = o.output.slot(1).unwrap();
    o.output.queue_buffer(first).unwrap();
    assert!(o.device.is_streaming());

    o.control.set_position(0, 0, 200, 100).unwrap();
    o.control.commit().unwrap();
    assert_eq!(state(&o.control), StreamState::ControlReady);
    assert!(!o.device.is_streaming());

    assert!(matches!(
        o.output.queue_buffer(second),
        Err(Error::StreamFlushed)
    ));
    assert_eq!(o.output.in_flight(), 0);

    // Bookkeeping restarted: the lost slot can be queued again
    assert_eq!(o.output.queue_buffer(first).unwrap(), 1);
    assert!(o.device.is_streaming());
    assert_eq!(state(&o.control), StreamState::Streaming);
}

#[test]
fn dequeue_sees_the_flush_too() {
    let mut o = overlay(640, 480);
    o.control.commit().unwrap();
    let slot = o.output.slot(0).unwrap();
    o.output.queue_buffer(slot).unwrap();

    o.control.set_rotation(0).unwrap();
    o.control.commit().unwrap();

    assert!(matches!(o.output.dequeue_buffer(), Err(Error::StreamFlushed)));
    assert!(matches!(o.output.dequeue_buffer(), Err(Error::WouldBlock)));
    assert_eq!(o.output.available_slots().len(), 3);
}

#[test]
fn stream_calls_are_idempotent() {
    let mut o = overlay(640, 480);
    o.control.commit().unwrap();
    for i in 0..3 {
        let slot = o.output.slot(i).unwrap();
        o.output.queue_buffer(slot).unwrap();
    }
    o.control.commit().unwrap();
    assert_eq!(o.device.count(DeviceOp::StreamOn), 1);

    o.control.destroy_overlay().unwrap();
    o.control.destroy_overlay().unwrap();
    assert_eq!(o.device.count(DeviceOp::StreamOff), 1);
}

#[test]
fn same_crop_twice_touches_device_once() {
    let mut o = overlay(640, 480);
    o.device.clear_calls();
    let rect = Rect::new(8, 8, 320, 240);
    o.output.set_crop(rect).unwrap();
    o.output.set_crop(rect).unwrap();
    assert_eq!(o.device.count(DeviceOp::SetCrop), 1);
}

#[test]
fn failed_crop_is_not_remembered() {
    let mut o = overlay(640, 480);
    let rect = Rect::new(0, 0, 100, 100);
    o.device.fail_next(DeviceOp::SetCrop);
    assert!(o.output.set_crop(rect).is_err());
    o.output.set_crop(rect).unwrap();
    assert_eq!(o.output.get_crop().unwrap(), rect);
}

#[test]
fn shared_block_outlives_the_creator() {
    let o = overlay(640, 480);
    let Overlay {
        control, output, ..
    } = o;
    let fd = control.shared().unwrap().try_clone_fd().unwrap();
    let size = control.handle().unwrap().shared_size;
    drop(control);

    // the frame side still holds a reference
    let again = SharedControlBlock::open(fd, size).unwrap();
    assert_eq!(again.ref_count(), 2);
    drop(output);
    assert_eq!(again.ref_count(), 1);
}

#[test]
fn rejected_format_is_reported() {
    let device = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
    let mut control = OverlayControl::with_device(device.clone(), MemoryMode::Mmap);
    device.fail_next(DeviceOp::SetFormat);
    assert!(matches!(
        control.create_overlay(640, 480, None),
        Err(Error::Config(_))
    ));
    assert!(control.handle().is_none());
}
