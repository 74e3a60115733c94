//! End-to-end jobs built on [`Session`]: the vector add and image rotation
//! programs.
//!
//! Each pipeline drives a fresh session through every stage and tears it
//! down before returning. Any stage failure is returned as-is; the session
//! has already been torn down by then.

use crate::buffer::AccessMode;
use crate::error::{DispatchError, Result};
use crate::kernels;
use crate::session::{Arg, Session};
use tracing::info;

/// Entry point to use: the first preferred name the program defines, else
/// the first preferred name so kernel creation reports the miss.
fn pick_entry(session: &Session, preferred: &[&str]) -> String {
    let names = session.kernel_names();
    preferred
        .iter()
        .find(|p| names.iter().any(|n| n == *p))
        .or_else(|| preferred.first())
        .map(|p| p.to_string())
        .unwrap_or_default()
}

fn prepare(session: &mut Session, source: &str) -> Result<()> {
    session.select_configured_device()?;
    session.create_context()?;
    session.create_queue()?;
    session.build_program(source)
}

/// Add `a[i] = i` and `b[i] = n - i` on the device, returning `n` sums.
///
/// `local` is the work-group size; `None` lets the driver choose.
pub fn vector_add(session: &mut Session, source: &str, n: usize, local: Option<usize>) -> Result<Vec<f32>> {
    prepare(session, source)?;
    let entry = pick_entry(session, &[kernels::VECTOR_ADD, kernels::HELLO_KERNEL]);
    let kernel = session.create_kernel(&entry)?;

    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..n).map(|i| (n - i) as f32).collect();
    let buf_a = session.buffer_from_slice(AccessMode::ReadOnly, &a)?;
    let buf_b = session.buffer_from_slice(AccessMode::ReadOnly, &b)?;
    let buf_out = session.buffer_uninit::<f32>(AccessMode::ReadWrite, n)?;

    session.set_args(kernel, &[Arg::Buffer(buf_a), Arg::Buffer(buf_b), Arg::Buffer(buf_out)])?;
    let local = local.map(|l| [l]);
    session.dispatch(kernel, &[n], local.as_ref().map(|l| &l[..]))?;
    let result = session.read_vec::<f32>(buf_out)?;
    info!(kernel = %entry, n, "vector add complete");
    session.teardown();
    Ok(result)
}

/// Geometry and angle of an image rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotateParams {
    pub width: usize,
    pub height: usize,
    pub sin: f32,
    pub cos: f32,
}

impl RotateParams {
    /// Rotation by `degrees`. Multiples of 90° get exact sine and cosine,
    /// since the kernel truncates target coordinates.
    pub fn from_degrees(width: usize, height: usize, degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self { width, height, sin: snap(sin), cos: snap(cos) }
    }

    /// The input image used by [`image_rotate`]: pixel `i` holds `i`.
    pub fn ramp(&self) -> Vec<i32> {
        (0..(self.width * self.height) as i32).collect()
    }
}

fn snap(v: f32) -> f32 {
    [-1.0, 0.0, 1.0].into_iter().find(|t: &f32| (v - t).abs() < 1e-6).unwrap_or(v)
}

/// Rotate the ramp image described by `params` on the device.
pub fn image_rotate(session: &mut Session, source: &str, params: &RotateParams) -> Result<Vec<i32>> {
    image_rotate_image(session, source, params, &params.ramp())
}

/// Rotate `image` (row-major, `params.width × params.height`) on the device.
///
/// Pixels nothing rotates onto keep the destination's initial contents,
/// which the reference driver zero-fills.
pub fn image_rotate_image(
    session: &mut Session,
    source: &str,
    params: &RotateParams,
    image: &[i32],
) -> Result<Vec<i32>> {
    let (width, height) = match (i32::try_from(params.width), i32::try_from(params.height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(DispatchError::InvalidGlobalWorkSize { global: vec![params.width, params.height] }.into()),
    };
    prepare(session, source)?;
    let entry = pick_entry(session, &[kernels::IMAGE_ROTATE]);
    let kernel = session.create_kernel(&entry)?;

    let src = session.buffer_from_slice(AccessMode::ReadOnly, image)?;
    let dst = session.buffer_uninit::<i32>(AccessMode::ReadWrite, image.len())?;
    session.set_args(
        kernel,
        &[
            Arg::Buffer(src),
            Arg::Buffer(dst),
            Arg::from(width),
            Arg::from(height),
            Arg::from(params.sin),
            Arg::from(params.cos),
        ],
    )?;
    session.dispatch(kernel, &[params.width, params.height], Some(&[1, 1][..]))?;
    let result = session.read_vec::<i32>(dst)?;
    info!(width, height, sin = params.sin, cos = params.cos, "image rotation complete");
    session.teardown();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::driver::{KernelArgs, KernelFault, ReferenceDriver, WorkItem};
    use crate::error::{CompileError, SessionError};
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(Arc::new(ReferenceDriver::new()), SessionConfig::default())
    }

    #[test]
    fn pick_entry_prefers_named_kernel() {
        let mut s = session();
        prepare(&mut s, kernels::VECTOR_ADD_SRC).unwrap();
        assert_eq!(pick_entry(&s, &["missing", kernels::VECTOR_ADD]), "vector_add");
        assert_eq!(pick_entry(&s, &["missing"]), "missing");
    }

    #[test]
    fn foreign_entry_point_is_not_run_as_vector_add() {
        let driver = ReferenceDriver::builder()
            .host_kernel("mul", |_: &WorkItem, _: &mut KernelArgs| Ok::<(), KernelFault>(()))
            .build();
        let mut s = Session::new(Arc::new(driver), SessionConfig::default());
        let src = "__kernel void mul(__global float *a, __global float *b, __global float *c) { }";
        let err = vector_add(&mut s, src, 4, None).unwrap_err();
        assert!(
            matches!(&err, SessionError::Compile(CompileError::EntryPointNotFound { name, .. }) if name == "vector_add"),
            "{err}"
        );
        assert!(s.is_torn_down());
    }

    #[test]
    fn from_degrees_quarter_turn() {
        let p = RotateParams::from_degrees(6, 6, 90.0);
        assert_eq!((p.sin, p.cos), (1.0, 0.0));
        let p = RotateParams::from_degrees(6, 6, 30.0);
        assert!((p.sin - 0.5).abs() < 1e-6);
    }

    #[test]
    fn vector_add_small() {
        let mut s = session();
        let out = vector_add(&mut s, kernels::VECTOR_ADD_SRC, 8, Some(2)).unwrap();
        assert_eq!(out, vec![8.0; 8]);
        assert!(s.is_torn_down());
    }
}
