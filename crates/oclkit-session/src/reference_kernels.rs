//! Host ground truth for the bundled kernels.

/// `a[i] + b[i]` for every index of the shorter input.
pub fn ref_vector_add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Rotate a row-major `width × height` image about `(width/2, height/2)`.
///
/// Target coordinates are truncated toward zero; pixels that land outside
/// the image are dropped and untouched destination pixels stay 0.
pub fn ref_image_rotate(src: &[i32], width: usize, height: usize, sin: f32, cos: f32) -> Vec<i32> {
    let mut dst = vec![0; width * height];
    let xc = (width / 2) as f32;
    let yc = (height / 2) as f32;
    for iy in 0..height {
        for ix in 0..width {
            let dx = ix as f32 - xc;
            let dy = iy as f32 - yc;
            let xpos = (dx * cos - dy * sin + xc) as i64;
            let ypos = (dx * sin + dy * cos + yc) as i64;
            if (0..width as i64).contains(&xpos) && (0..height as i64).contains(&ypos) {
                dst[ypos as usize * width + xpos as usize] = src[iy * width + ix];
            }
        }
    }
    dst
}
