//! Program compilation and kernel creation.
//!
//! Compilation is two-phase: the source text is loaded into a program object,
//! then built for a device set. A failed build is not an error of
//! [`compile`] itself; the returned [`Program`] is in the
//! [`ProgramState::Failed`] state and carries the driver's build log verbatim.

pub mod signature;

use crate::context::ComputeContext;
use crate::driver::{RawHandle, ResourceKind};
use crate::error::CompileError;
use crate::kernel::Kernel;
use crate::platform::Device;
use crate::resource::Owned;
use crate::status::{self, Status};
use signature::KernelSignature;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a program object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramState {
    Source,
    Compiling,
    Built,
    Failed,
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Compiling => write!(f, "compiling"),
            Self::Built => write!(f, "built"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A program object created from kernel source.
#[derive(Debug)]
pub struct Program {
    inner: Owned,
    state: ProgramState,
    build_status: Status,
    build_log: String,
    kernel_names: Vec<String>,
    signatures: Vec<KernelSignature>,
    source: String,
}

/// Load and build `source` for `devices`.
pub fn compile(context: &ComputeContext, devices: &[Device], source: &str) -> Result<Program, CompileError> {
    compile_with_options(context, devices, source, "")
}

/// [`compile`] with a build option string (`-D NAME=VALUE`, `-cl-std=...`).
pub fn compile_with_options(
    context: &ComputeContext,
    devices: &[Device],
    source: &str,
    options: &str,
) -> Result<Program, CompileError> {
    let mut program = Program::load(context, source)?;
    program.build(devices, options);
    Ok(program)
}

impl Program {
    /// Phase one: wrap `source` into a program object.
    pub fn load(context: &ComputeContext, source: &str) -> Result<Self, CompileError> {
        if source.trim().is_empty() {
            return Err(CompileError::SourceEmpty);
        }
        let ctx = context.raw().map_err(|_| CompileError::ProgramCreationFailed {
            status: status::INVALID_CONTEXT,
            message: "context has been released".into(),
        })?;
        let driver = context.driver();
        let handle = driver
            .create_program(ctx, source)
            .map_err(|e| CompileError::ProgramCreationFailed { status: e.status, message: e.message })?;
        debug!(bytes = source.len(), "program loaded");
        Ok(Self {
            inner: Owned::new(Arc::clone(driver), ResourceKind::Program, handle),
            state: ProgramState::Source,
            build_status: status::SUCCESS,
            build_log: String::new(),
            kernel_names: Vec::new(),
            signatures: Vec::new(),
            source: source.to_string(),
        })
    }

    /// Phase two: build for `devices`. Leaves the program `Built` or `Failed`.
    pub fn build(&mut self, devices: &[Device], options: &str) {
        let Some(handle) = self.inner.handle() else {
            self.fail(status::INVALID_PROGRAM, "program has been released".into());
            return;
        };
        self.state = ProgramState::Compiling;
        let ids: Vec<_> = devices.iter().map(|d| d.id).collect();
        let driver = Arc::clone(self.inner.driver());
        let outcome = driver.build_program(handle, &ids, options);
        if !outcome.is_success() {
            self.fail(outcome.status, outcome.log);
            return;
        }
        match driver.kernel_names(handle) {
            Ok(names) => {
                self.state = ProgramState::Built;
                self.build_log = outcome.log;
                self.kernel_names = names;
                self.signatures = signature::parse(&self.source, options);
                info!(kernels = %self.kernel_names.join(", "), "program built");
            }
            Err(e) => self.fail(e.status, e.to_string()),
        }
    }

    fn fail(&mut self, status: Status, log: String) {
        warn!(status = status::name(status), "program build failed");
        self.state = ProgramState::Failed;
        self.build_status = status;
        self.build_log = log;
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn is_built(&self) -> bool {
        self.state == ProgramState::Built
    }

    /// Driver build log. For a failed build this is the only diagnostic.
    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    pub fn build_status(&self) -> Status {
        self.build_status
    }

    /// Build failure as an error value, if the program failed.
    pub fn build_error(&self) -> Option<CompileError> {
        (self.state == ProgramState::Failed)
            .then(|| CompileError::BuildFailed { status: self.build_status, log: self.build_log.clone() })
    }

    /// Entry points of the built program.
    pub fn kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    /// Declared signature of `name` as parsed from the source.
    pub fn signature(&self, name: &str) -> Option<&KernelSignature> {
        self.signatures.iter().find(|s| s.name == name)
    }

    pub fn create_kernel(&self, name: &str) -> Result<Kernel, CompileError> {
        if self.state != ProgramState::Built {
            return Err(CompileError::ProgramNotBuilt { state: self.state });
        }
        let handle = self.raw()?;
        if !self.kernel_names.iter().any(|k| k == name) {
            return Err(self.entry_point_not_found(name));
        }
        let driver = self.inner.driver();
        let kernel = driver.create_kernel(handle, name).map_err(|e| match e.status {
            status::INVALID_KERNEL_NAME => self.entry_point_not_found(name),
            _ => CompileError::KernelCreationFailed { name: name.to_string(), status: e.status, message: e.message },
        })?;
        let owned = Owned::new(Arc::clone(driver), ResourceKind::Kernel, kernel);

        let arity = driver.kernel_arity(kernel).map_err(|e| CompileError::KernelCreationFailed {
            name: name.to_string(),
            status: e.status,
            message: e.message,
        })?;
        let signature = reconcile(name, self.signature(name), arity);
        debug!(kernel = name, arity = signature.arity(), "kernel created");
        Ok(Kernel::new(owned, signature))
    }

    fn entry_point_not_found(&self, name: &str) -> CompileError {
        CompileError::EntryPointNotFound { name: name.to_string(), available: self.kernel_names.join(", ") }
    }

    pub(crate) fn raw(&self) -> Result<RawHandle, CompileError> {
        self.inner.handle().ok_or(CompileError::Released)
    }

    /// Release the program. Kernels created from it become invalid.
    pub fn release(&mut self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

/// Signature to bind against. The driver's arity is authoritative; a parsed
/// signature that disagrees with it is replaced by an untyped one.
fn reconcile(name: &str, parsed: Option<&KernelSignature>, arity: usize) -> KernelSignature {
    match parsed {
        Some(sig) if sig.arity() == arity => sig.clone(),
        Some(sig) => {
            warn!(kernel = name, parsed = sig.arity(), driver = arity, "parsed arity differs from driver, binding untyped");
            KernelSignature::opaque(name, arity)
        }
        None => {
            debug!(kernel = name, arity, "no parsed signature, binding untyped");
            KernelSignature::opaque(name, arity)
        }
    }
}
