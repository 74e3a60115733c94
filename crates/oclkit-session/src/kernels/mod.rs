//! Kernel sources bundled with the crate.

/// Entry point of [`VECTOR_ADD_SRC`].
pub const VECTOR_ADD: &str = "vector_add";

/// Alternate name of the vector add entry point, accepted by the add
/// pipeline and the reference driver.
pub const HELLO_KERNEL: &str = "hello_kernel";

/// Entry point of [`IMAGE_ROTATE_SRC`].
pub const IMAGE_ROTATE: &str = "image_rotate";

/// `result[i] = a[i] + b[i]` over `float` buffers.
pub const VECTOR_ADD_SRC: &str = include_str!("vector_add.cl");

/// Rotation of an `int` image by a sine/cosine pair.
pub const IMAGE_ROTATE_SRC: &str = include_str!("image_rotate.cl");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::signature::{self, ParamKind, ScalarType};

    #[test]
    fn bundled_sources_pass_the_front_end() {
        for (src, entry, arity) in [(VECTOR_ADD_SRC, VECTOR_ADD, 3), (IMAGE_ROTATE_SRC, IMAGE_ROTATE, 6)] {
            let fe = signature::analyze(src, "");
            assert!(fe.is_ok(), "{entry}: {}", fe.log());
            assert_eq!(fe.kernels.len(), 1);
            assert_eq!(fe.kernels[0].name, entry);
            assert_eq!(fe.kernels[0].arity(), arity);
        }
    }

    #[test]
    fn rotate_scalars_are_typed() {
        let sig = &signature::parse(IMAGE_ROTATE_SRC, "")[0];
        let kinds: Vec<_> = sig.params[2..].iter().map(|p| p.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                ParamKind::Scalar(ScalarType::Int),
                ParamKind::Scalar(ScalarType::Int),
                ParamKind::Scalar(ScalarType::Float),
                ParamKind::Scalar(ScalarType::Float),
            ]
        );
    }
}
