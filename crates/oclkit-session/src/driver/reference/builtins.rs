//! Host implementations of the bundled kernels.

use super::exec::{HostKernel, KernelArgs, KernelFault, WorkItem};
use std::collections::HashMap;
use std::sync::Arc;

/// `c[i] = a[i] + b[i]` over `float` buffers.
fn vector_add(item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
    let i = item.global_id(0);
    let a: f32 = args.load(0, i)?;
    let b: f32 = args.load(1, i)?;
    args.store(2, i, a + b)
}

/// Rotate an `int` image about its centre.
///
/// Arguments: `src`, `dst`, `W`, `H`, `sin`, `cos`. Dimension 0 is the
/// column, dimension 1 the row. Pixels that land outside the image are
/// dropped, and destination pixels nothing maps to are left untouched.
fn image_rotate(item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
    let ix = item.global_id(0) as i32;
    let iy = item.global_id(1) as i32;
    let width: i32 = args.scalar(2)?;
    let height: i32 = args.scalar(3)?;
    let sin: f32 = args.scalar(4)?;
    let cos: f32 = args.scalar(5)?;

    let xc = (width / 2) as f32;
    let yc = (height / 2) as f32;
    let dx = ix as f32 - xc;
    let dy = iy as f32 - yc;
    // float to int conversion truncates toward zero, as in the kernel language
    let xpos = (dx * cos - dy * sin + xc) as i32;
    let ypos = (dx * sin + dy * cos + yc) as i32;

    if (0..width).contains(&xpos) && (0..height).contains(&ypos) {
        let value: i32 = args.load(0, (iy * width + ix) as usize)?;
        args.store(1, (ypos * width + xpos) as usize, value)?;
    }
    Ok(())
}

pub(super) fn all() -> HashMap<String, Arc<dyn HostKernel>> {
    let mut kernels: HashMap<String, Arc<dyn HostKernel>> = HashMap::new();
    kernels.insert("vector_add".into(), Arc::new(vector_add));
    kernels.insert("hello_kernel".into(), Arc::new(vector_add));
    kernels.insert("image_rotate".into(), Arc::new(image_rotate));
    kernels
}
