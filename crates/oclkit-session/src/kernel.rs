//! Kernels and positional argument binding.

use crate::buffer::Buffer;
use crate::driver::{RawArg, RawHandle};
use crate::error::DispatchError;
use crate::program::signature::{KernelSignature, ParamKind, ScalarType};
use crate::resource::Owned;
use crate::status;
use std::fmt;
use tracing::debug;

/// Typed scalar kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Kernel-language type this value binds to.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::I8(_) => ScalarType::Char,
            Self::U8(_) => ScalarType::UChar,
            Self::I16(_) => ScalarType::Short,
            Self::U16(_) => ScalarType::UShort,
            Self::I32(_) => ScalarType::Int,
            Self::U32(_) => ScalarType::UInt,
            Self::I64(_) => ScalarType::Long,
            Self::U64(_) => ScalarType::ULong,
            Self::F32(_) => ScalarType::Float,
            Self::F64(_) => ScalarType::Double,
        }
    }

    /// Native-endian bytes as the device sees them.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match *self {
            Self::I8(v) => v.to_ne_bytes().to_vec(),
            Self::U8(v) => v.to_ne_bytes().to_vec(),
            Self::I16(v) => v.to_ne_bytes().to_vec(),
            Self::U16(v) => v.to_ne_bytes().to_vec(),
            Self::I32(v) => v.to_ne_bytes().to_vec(),
            Self::U32(v) => v.to_ne_bytes().to_vec(),
            Self::I64(v) => v.to_ne_bytes().to_vec(),
            Self::U64(v) => v.to_ne_bytes().to_vec(),
            Self::F32(v) => v.to_ne_bytes().to_vec(),
            Self::F64(v) => v.to_ne_bytes().to_vec(),
        }
    }

    /// Whether this value may be bound to a parameter declared as `ty`.
    ///
    /// `size_t` takes a `u64` and `half` takes its `u16` bit pattern.
    pub fn fits(&self, ty: ScalarType) -> bool {
        match (ty, self) {
            (ScalarType::SizeT, Self::U64(_)) => true,
            (ScalarType::Half, Self::U16(_)) => true,
            _ => self.scalar_type() == ty,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Scalar {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

scalar_from!(i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64);

/// Value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(&'a Buffer),
    Scalar(Scalar),
    /// Local memory of the given byte size.
    Local(usize),
}

impl KernelArg<'_> {
    fn describe(&self) -> String {
        match self {
            Self::Buffer(_) => "buffer".to_string(),
            Self::Scalar(s) => format!("scalar {}", s.scalar_type()),
            Self::Local(size) => format!("local allocation of {size} bytes"),
        }
    }
}

impl From<Scalar> for KernelArg<'_> {
    fn from(s: Scalar) -> Self {
        Self::Scalar(s)
    }
}

impl<'a> From<&'a Buffer> for KernelArg<'a> {
    fn from(b: &'a Buffer) -> Self {
        Self::Buffer(b)
    }
}

/// A named entry point of a built program with its argument slots.
#[derive(Debug)]
pub struct Kernel {
    inner: Owned,
    signature: KernelSignature,
    bound: Vec<bool>,
}

impl Kernel {
    pub(crate) fn new(inner: Owned, signature: KernelSignature) -> Self {
        let bound = vec![false; signature.arity()];
        Self { inner, signature, bound }
    }

    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    pub fn is_bound(&self, index: u32) -> bool {
        self.bound.get(index as usize).copied().unwrap_or(false)
    }

    /// First declared slot without a bound value.
    pub fn first_unbound(&self) -> Option<u32> {
        self.bound.iter().position(|b| !b).map(|i| i as u32)
    }

    pub(crate) fn raw(&self) -> Result<RawHandle, DispatchError> {
        self.inner.handle().ok_or(DispatchError::Released { what: "kernel" })
    }

    /// Bind `arg` to positional slot `index`.
    pub fn set_arg<'a>(&mut self, index: u32, arg: impl Into<KernelArg<'a>>) -> Result<(), DispatchError> {
        let arg = arg.into();
        let kernel = self.signature.name.clone();
        let param = self.signature.params.get(index as usize).ok_or_else(|| DispatchError::ArgumentIndexOutOfRange {
            kernel: kernel.clone(),
            index,
            arity: self.signature.arity(),
        })?;

        let accepted = match (&param.kind, &arg) {
            (ParamKind::Buffer { .. }, KernelArg::Buffer(_)) => true,
            (ParamKind::Local { .. }, KernelArg::Local(size)) => *size > 0,
            (ParamKind::Scalar(ty), KernelArg::Scalar(s)) => s.fits(*ty),
            (ParamKind::Opaque { .. }, _) => true,
            _ => false,
        };
        if !accepted {
            return Err(DispatchError::ArgumentTypeMismatch {
                kernel,
                index,
                expected: param.kind.to_string(),
                actual: arg.describe(),
            });
        }

        let raw_arg = match arg {
            KernelArg::Buffer(buffer) => {
                RawArg::Buffer(buffer.raw().map_err(|_| DispatchError::Released { what: "buffer" })?)
            }
            KernelArg::Scalar(s) => RawArg::Scalar(s),
            KernelArg::Local(size) => RawArg::Local(size),
        };
        let handle = self.raw()?;
        self.inner.driver().set_kernel_arg(handle, index, raw_arg).map_err(|e| match e.status {
            status::INVALID_ARG_INDEX => DispatchError::ArgumentIndexOutOfRange {
                kernel: kernel.clone(),
                index,
                arity: self.signature.arity(),
            },
            status::INVALID_ARG_SIZE | status::INVALID_ARG_VALUE | status::INVALID_MEM_OBJECT => {
                DispatchError::ArgumentTypeMismatch {
                    kernel: kernel.clone(),
                    index,
                    expected: param.kind.to_string(),
                    actual: e.to_string(),
                }
            }
            _ => DispatchError::EnqueueFailed { status: e.status, message: e.message },
        })?;

        debug!(kernel = %kernel, index, arg = %arg.describe(), "argument bound");
        self.bound[index as usize] = true;
        Ok(())
    }

    /// Release the driver kernel. Idempotent.
    pub fn release(&mut self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}
