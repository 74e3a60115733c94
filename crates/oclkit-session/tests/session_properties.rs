//! Property and end-to-end tests for the compute session running on the
//! reference driver.
//!
//! - **Device selection** picks the first matching device or reports
//!   `NoDeviceFound`.
//! - **Buffers** reject read-only allocations without host data and round
//!   trip arbitrary bit patterns.
//! - **Launch geometry** rejects local sizes that do not divide the global
//!   size.
//! - **Teardown** releases each driver object exactly once.
//! - **Pipelines** produce the expected vector sum and rotated image.

use oclkit_session::driver::ResourceKind;
use oclkit_session::{
    AccessMode, Arg, BufferError, CompileError, DeviceType, DiscoveryError, DispatchError, HostBuffer, NdRange,
    ReferenceDriver, RotateParams, Session, SessionConfig, SessionError, SessionState, kernels, pipeline,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

// ── Helpers ──────────────────────────────────────────────────────────

fn session() -> (Arc<ReferenceDriver>, Session) {
    let driver = Arc::new(ReferenceDriver::new());
    let session = Session::new(driver.clone(), SessionConfig::default());
    (driver, session)
}

/// Session with a device, context and queue but no program.
fn ready_session() -> (Arc<ReferenceDriver>, Session) {
    let (driver, mut s) = session();
    s.select_configured_device().unwrap();
    s.create_context().unwrap();
    s.create_queue().unwrap();
    (driver, s)
}

fn arb_mask() -> impl Strategy<Value = DeviceType> {
    (1_u64..32).prop_map(DeviceType::from_bits_truncate)
}

// ── Device selection ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn device_filter_selects_first_match(mask in arb_mask()) {
        let (_driver, mut s) = session();
        let expected = if mask.intersects(DeviceType::GPU | DeviceType::DEFAULT) {
            Some("Reference GPU")
        } else if mask.intersects(DeviceType::CPU) {
            Some("Reference CPU")
        } else {
            None
        };
        match (s.select_device(mask), expected) {
            (Ok(device), Some(name)) => {
                prop_assert_eq!(device.name.as_str(), name);
                prop_assert!(device.matches(mask));
                prop_assert_eq!(s.state(), SessionState::DeviceSelected);
            }
            (Err(SessionError::Discovery(DiscoveryError::NoDeviceFound { filter })), None) => {
                prop_assert_eq!(filter, mask);
                prop_assert!(s.is_torn_down());
            }
            (other, _) => prop_assert!(false, "mask {} gave {:?}", mask, other.map(|d| d.name)),
        }
    }
}

#[test]
fn platform_index_out_of_range() {
    let config = SessionConfig { platform_index: Some(4), ..SessionConfig::default() };
    let mut s = Session::new(Arc::new(ReferenceDriver::new()), config);
    let err = s.select_configured_device().unwrap_err();
    assert!(matches!(err, SessionError::Discovery(DiscoveryError::PlatformIndexOutOfRange { index: 4, count: 1 })));
}

// ── Buffers ──────────────────────────────────────────────────────────

#[test]
fn read_only_buffer_requires_host_data() {
    let (_driver, mut s) = ready_session();
    let err = s.create_buffer(AccessMode::ReadOnly, 64, None).unwrap_err();
    assert!(matches!(err, SessionError::Buffer(BufferError::InvalidBufferSpec { .. })), "{err}");
    assert!(s.is_torn_down());
}

#[test]
fn host_data_length_must_match() {
    let (_driver, mut s) = ready_session();
    let err = s.create_buffer(AccessMode::ReadWrite, 8, Some(&[0u8; 4][..])).unwrap_err();
    assert!(matches!(err, SessionError::Buffer(BufferError::SizeMismatch { expected: 8, actual: 4 })));
}

proptest! {
    #[test]
    fn write_then_read_is_bit_identical(bits in prop::collection::vec(any::<u32>(), 1..64)) {
        let (_driver, mut s) = ready_session();
        let values: Vec<f32> = bits.iter().copied().map(f32::from_bits).collect();
        let buf = s.buffer_uninit::<f32>(AccessMode::ReadWrite, values.len()).unwrap();
        s.write_buffer(buf, &values, true).unwrap();
        let back = s.read_vec::<f32>(buf).unwrap();
        let back_bits: Vec<u32> = back.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(back_bits, bits);
    }
}

#[test]
fn nan_payloads_survive_round_trip() {
    let (_driver, mut s) = ready_session();
    let payloads = [0x7fc0_0001_u32, 0xffc1_2345, 0x7f80_0001, 0x7fff_ffff];
    let values: Vec<f32> = payloads.iter().copied().map(f32::from_bits).collect();
    let buf = s.buffer_from_slice(AccessMode::ReadWrite, &values).unwrap();
    let host = HostBuffer::<f32>::zeroed(values.len());
    s.read_buffer(buf, &host, true).unwrap();
    let bits: Vec<u32> = host.snapshot().iter().map(|v| v.to_bits()).collect();
    assert_eq!(bits, payloads);
    assert_eq!(s.state(), SessionState::ResultsRetrieved);
}

// ── Launch geometry ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn non_dividing_local_size_is_rejected(global in 2_usize..4096, local in 2_usize..256) {
        prop_assume!(global % local != 0);
        let err = NdRange::new(&[global], Some(&[local][..])).unwrap_err();
        prop_assert!(matches!(err, DispatchError::InvalidWorkGroupSize { .. }), "unexpected error: {err}");
    }

    #[test]
    fn dividing_local_size_is_accepted(groups in 1_usize..64, local in 1_usize..64) {
        let range = NdRange::new(&[groups * local], Some(&[local][..])).unwrap();
        prop_assert_eq!(range.global_items(), groups * local);
    }
}

#[test]
fn session_dispatch_rejects_non_dividing_local_size() {
    let (_driver, mut s) = ready_session();
    s.build_program(kernels::VECTOR_ADD_SRC).unwrap();
    let k = s.create_kernel(kernels::VECTOR_ADD).unwrap();
    let a = s.buffer_from_slice(AccessMode::ReadOnly, &[1.0f32; 10]).unwrap();
    let out = s.buffer_uninit::<f32>(AccessMode::WriteOnly, 10).unwrap();
    s.set_args(k, &[Arg::Buffer(a), Arg::Buffer(a), Arg::Buffer(out)]).unwrap();
    let err = s.dispatch(k, &[10], Some(&[3][..])).unwrap_err();
    assert!(matches!(err, SessionError::Dispatch(DispatchError::InvalidWorkGroupSize { .. })), "{err}");
    assert!(s.is_torn_down());
}

#[test]
fn dispatch_with_unbound_argument_fails() {
    let (_driver, mut s) = ready_session();
    s.build_program(kernels::VECTOR_ADD_SRC).unwrap();
    let k = s.create_kernel(kernels::VECTOR_ADD).unwrap();
    let a = s.buffer_from_slice(AccessMode::ReadOnly, &[1.0f32; 4]).unwrap();
    s.set_arg(k, 0, a).unwrap();
    let err = s.dispatch(k, &[4], None).unwrap_err();
    assert!(matches!(err, SessionError::Dispatch(DispatchError::UnboundArgument { index: 1, .. })), "{err}");
}

// ── Teardown ─────────────────────────────────────────────────────────

#[test]
fn double_teardown_releases_each_object_once() {
    let (driver, mut s) = ready_session();
    s.build_program(kernels::VECTOR_ADD_SRC).unwrap();
    s.create_kernel(kernels::VECTOR_ADD).unwrap();
    s.buffer_uninit::<f32>(AccessMode::ReadWrite, 16).unwrap();
    s.buffer_uninit::<f32>(AccessMode::WriteOnly, 16).unwrap();

    s.teardown();
    let log = driver.release_log();
    s.teardown();
    drop(s);

    assert_eq!(driver.release_log(), log);
    assert_eq!(driver.live_objects(), 0);
    let kinds: Vec<ResourceKind> = log.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Kernel,
            ResourceKind::Buffer,
            ResourceKind::Buffer,
            ResourceKind::Program,
            ResourceKind::Queue,
            ResourceKind::Context,
        ]
    );
    let unique: HashSet<_> = log.iter().copied().collect();
    assert_eq!(unique.len(), log.len());
}

#[test]
fn operations_after_teardown_are_refused() {
    let (_driver, mut s) = ready_session();
    s.teardown();
    assert_eq!(s.state(), SessionState::TornDown);
    assert!(matches!(s.build_program(kernels::VECTOR_ADD_SRC), Err(SessionError::TornDown { .. })));
    assert!(matches!(s.finish(), Err(SessionError::TornDown { .. })));
}

// ── Compile failures ─────────────────────────────────────────────────

#[test]
fn failing_source_tears_down_without_kernels() {
    let (driver, mut s) = ready_session();
    let err = s.build_program("__kernel void vector_add(__global float *a) { a[0] = ; ").unwrap_err();
    match &err {
        SessionError::Compile(CompileError::BuildFailed { log, .. }) => assert!(!log.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(s.is_torn_down());
    assert!(s.kernel_names().is_empty());
    assert!(driver.release_log().iter().all(|(kind, _)| *kind != ResourceKind::Kernel));
    assert_eq!(driver.live_objects(), 0);
}

#[test]
fn missing_entry_point_is_reported() {
    let (_driver, mut s) = ready_session();
    s.build_program(kernels::VECTOR_ADD_SRC).unwrap();
    let err = s.create_kernel("vector_sub").unwrap_err();
    match err {
        SessionError::Compile(CompileError::EntryPointNotFound { name, available }) => {
            assert_eq!(name, "vector_sub");
            assert!(available.contains("vector_add"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ── Pipelines ────────────────────────────────────────────────────────

#[test]
fn vector_add_with_unit_work_groups() {
    let (driver, mut s) = session();
    let n = 1000;
    let out = pipeline::vector_add(&mut s, kernels::VECTOR_ADD_SRC, n, Some(1)).unwrap();
    assert_eq!(out.len(), n);
    assert!(out.iter().all(|&v| v == n as f32));
    assert!(s.is_torn_down());
    assert_eq!(driver.live_objects(), 0);
}

#[test]
fn vector_add_with_driver_chosen_work_groups() {
    let (_driver, mut s) = session();
    let out = pipeline::vector_add(&mut s, kernels::VECTOR_ADD_SRC, 777, None).unwrap();
    assert!(out.iter().all(|&v| v == 777.0));
}

#[test]
fn hello_kernel_alias_is_accepted() {
    let (_driver, mut s) = session();
    let src = kernels::VECTOR_ADD_SRC.replace("vector_add", kernels::HELLO_KERNEL);
    let out = pipeline::vector_add(&mut s, &src, 64, Some(8)).unwrap();
    assert_eq!(out, vec![64.0; 64]);
}

#[test]
fn quarter_turn_of_six_by_six_grid() {
    let (_driver, mut s) = session();
    let params = RotateParams { width: 6, height: 6, sin: 1.0, cos: 0.0 };
    let out = pipeline::image_rotate(&mut s, kernels::IMAGE_ROTATE_SRC, &params).unwrap();
    let rows: Vec<&[i32]> = out.chunks(6).collect();
    assert_eq!(
        rows,
        vec![
            &[0, 30, 24, 18, 12, 6][..],
            &[0, 31, 25, 19, 13, 7][..],
            &[0, 32, 26, 20, 14, 8][..],
            &[0, 33, 27, 21, 15, 9][..],
            &[0, 34, 28, 22, 16, 10][..],
            &[0, 35, 29, 23, 17, 11][..],
        ]
    );
}

#[test]
fn rotation_matches_host_reference() {
    let (_driver, mut s) = session();
    let params = RotateParams::from_degrees(9, 7, 30.0);
    let out = pipeline::image_rotate(&mut s, kernels::IMAGE_ROTATE_SRC, &params).unwrap();
    let expected =
        oclkit_session::reference_kernels::ref_image_rotate(&params.ramp(), 9, 7, params.sin, params.cos);
    assert_eq!(out, expected);
}
