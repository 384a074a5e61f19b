//! Plan materialization and execution.
//!
//! Heuristic rankings are advisory: a configuration may be impossible to
//! compile for the exact shapes, strides and alignments at hand, or may fail
//! once dispatched. [`execute_first_viable`] walks the filtered candidates in
//! rank order, and for each one
//!
//! 1. compiles an [`ExecutionPlan`] (failure: next candidate),
//! 2. allocates a [`Workspace`] of exactly the plan's size,
//! 3. binds a [`VariantPack`] from the call's operand [`Bindings`],
//! 4. executes (engine failure: next candidate, anything else: abort).
//!
//! The first candidate that executes wins; nothing is compared or timed.

use crate::descriptor::OperandRole;
use crate::engine::EngineConfig;
use crate::error::{ConvError, EngineCompileError, EngineExecError, ExecFailure};
use crate::graph::OperationGraph;
use crate::tensor::Storage;
use std::collections::BTreeMap;

/// A compiled, runnable strategy derived from one [`EngineConfig`].
pub trait ExecutionPlan {
    /// The configuration the plan was compiled from.
    fn engine(&self) -> &EngineConfig;

    /// Scratch bytes the plan needs at execution time.
    fn workspace_size(&self) -> usize;
}

/// The compile and execute capabilities the selection loop depends on.
pub trait PlanBackend {
    /// Device execution context shared by every call on a device/thread.
    type Context: Send + Sync;
    type Plan: ExecutionPlan;

    /// Builds a plan for `config`, or explains why that is impossible.
    fn compile(
        &self,
        graph: &OperationGraph<Self::Context>,
        config: &EngineConfig,
    ) -> Result<Self::Plan, EngineCompileError>;

    /// Scratch memory for one execution.
    fn allocate_workspace(&self, bytes: usize) -> Workspace {
        Workspace::zeroed(bytes)
    }

    /// Runs `plan` against the operands bound in `pack`.
    fn execute(
        &self,
        graph: &OperationGraph<Self::Context>,
        plan: &Self::Plan,
        pack: VariantPack<'_>,
    ) -> Result<(), ExecFailure>;
}

/// Zero-initialized scratch memory.
///
/// Backed by 8-byte words so engines can view it as any float slice; the
/// byte length is exactly what was requested, zero included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    words: Vec<u64>,
    len: usize,
}

impl Workspace {
    pub fn zeroed(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(8)], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    /// The workspace as a slice of `T`, truncated to whole elements.
    pub fn typed_mut<T: bytemuck::Pod>(&mut self) -> Option<&mut [T]> {
        let size = size_of::<T>();
        if size == 0 {
            return None;
        }
        let usable = self.len - self.len % size;
        let bytes = &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..usable];
        bytemuck::try_cast_slice_mut(bytes).ok()
    }
}

/// An operand buffer bound into a variant pack.
#[derive(Debug)]
pub enum DataPtr<'a> {
    Read(&'a Storage),
    Write(&'a mut Storage),
}

impl DataPtr<'_> {
    pub fn storage(&self) -> &Storage {
        match self {
            Self::Read(s) => s,
            Self::Write(s) => s,
        }
    }

    pub fn address(&self) -> usize {
        self.storage().address()
    }
}

/// Removes the buffer bound under `uid` for reading.
pub fn take_read<'a>(pointers: &mut BTreeMap<i64, DataPtr<'a>>, uid: i64) -> Result<&'a Storage, ConvError> {
    match pointers.remove(&uid) {
        Some(DataPtr::Read(s)) => Ok(s),
        Some(DataPtr::Write(s)) => Ok(&*s),
        None => Err(ConvError::Internal(format!("no buffer bound under uid {uid}"))),
    }
}

/// Removes the buffer bound under `uid` for writing.
pub fn take_write<'a>(pointers: &mut BTreeMap<i64, DataPtr<'a>>, uid: i64) -> Result<&'a mut Storage, ConvError> {
    match pointers.remove(&uid) {
        Some(DataPtr::Write(s)) => Ok(s),
        Some(DataPtr::Read(_)) => Err(ConvError::Internal(format!("uid {uid} is bound read-only"))),
        None => Err(ConvError::Internal(format!("no buffer bound under uid {uid}"))),
    }
}

/// Workspace plus operand buffers keyed by uid, consumed by one execution.
#[derive(Debug)]
pub struct VariantPack<'a> {
    workspace: &'a mut Workspace,
    pointers: BTreeMap<i64, DataPtr<'a>>,
}

impl<'a> VariantPack<'a> {
    pub fn builder() -> VariantPackBuilder<'a> {
        VariantPackBuilder { workspace: None, pointers: Vec::new() }
    }

    pub fn workspace_len(&self) -> usize {
        self.workspace.len()
    }

    pub fn uids(&self) -> impl Iterator<Item = i64> + '_ {
        self.pointers.keys().copied()
    }

    pub fn get(&self, uid: i64) -> Option<&DataPtr<'a>> {
        self.pointers.get(&uid)
    }

    /// Hands out the workspace and the uid map.
    pub fn into_parts(self) -> (&'a mut Workspace, BTreeMap<i64, DataPtr<'a>>) {
        (self.workspace, self.pointers)
    }
}

/// Builder for [`VariantPack`].
pub struct VariantPackBuilder<'a> {
    workspace: Option<&'a mut Workspace>,
    pointers: Vec<(i64, DataPtr<'a>)>,
}

impl<'a> VariantPackBuilder<'a> {
    #[must_use]
    pub fn workspace(mut self, workspace: &'a mut Workspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    #[must_use]
    pub fn read(mut self, uid: i64, storage: &'a Storage) -> Self {
        self.pointers.push((uid, DataPtr::Read(storage)));
        self
    }

    #[must_use]
    pub fn write(mut self, uid: i64, storage: &'a mut Storage) -> Self {
        self.pointers.push((uid, DataPtr::Write(storage)));
        self
    }

    pub fn build(self) -> Result<VariantPack<'a>, ConvError> {
        let workspace = self
            .workspace
            .ok_or_else(|| ConvError::Internal("variant pack has no workspace".into()))?;
        let mut pointers = BTreeMap::new();
        for (uid, ptr) in self.pointers {
            if pointers.insert(uid, ptr).is_some() {
                return Err(ConvError::Internal(format!("uid {uid} bound twice in variant pack")));
            }
        }
        Ok(VariantPack { workspace, pointers })
    }
}

/// The call's operand buffers, rebound into a fresh pack per candidate.
#[derive(Debug, Default)]
pub struct Bindings<'b> {
    reads: Vec<(OperandRole, &'b Storage)>,
    writes: Vec<(OperandRole, &'b mut Storage)>,
}

impl<'b> Bindings<'b> {
    pub fn new() -> Self {
        Self { reads: Vec::new(), writes: Vec::new() }
    }

    #[must_use]
    pub fn read(mut self, role: OperandRole, storage: &'b Storage) -> Self {
        self.reads.push((role, storage));
        self
    }

    #[must_use]
    pub fn write(mut self, role: OperandRole, storage: &'b mut Storage) -> Self {
        self.writes.push((role, storage));
        self
    }

    /// A pack borrowing every binding plus `workspace`.
    pub fn pack<'s>(&'s mut self, workspace: &'s mut Workspace) -> Result<VariantPack<'s>, ConvError> {
        let mut builder = VariantPack::builder().workspace(workspace);
        for (role, storage) in &self.reads {
            builder = builder.read(role.uid(), storage);
        }
        for (role, storage) in &mut self.writes {
            builder = builder.write(role.uid(), storage);
        }
        builder.build()
    }
}

/// The candidate that produced the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub engine: EngineConfig,
    pub workspace_size: usize,
    /// Candidates tried, the winner included.
    pub attempts: usize,
}

enum Attempt {
    CompileFailed(EngineCompileError),
    ExecFailed(EngineExecError),
    Succeeded { workspace_size: usize },
}

fn try_candidate<B: PlanBackend + ?Sized>(
    backend: &B,
    graph: &OperationGraph<B::Context>,
    config: &EngineConfig,
    bindings: &mut Bindings<'_>,
) -> Result<Attempt, ConvError> {
    let plan = match backend.compile(graph, config) {
        Ok(plan) => plan,
        Err(e) => return Ok(Attempt::CompileFailed(e)),
    };

    let workspace_size = plan.workspace_size();
    let mut workspace = backend.allocate_workspace(workspace_size);
    let pack = bindings.pack(&mut workspace)?;

    match backend.execute(graph, &plan, pack) {
        Ok(()) => Ok(Attempt::Succeeded { workspace_size }),
        Err(ExecFailure::Engine(e)) => Ok(Attempt::ExecFailed(e)),
        Err(ExecFailure::Fatal(e)) => Err(e),
    }
}

/// Executes the first candidate that both compiles and runs.
///
/// # Errors
/// - [`ConvError::NoViableEngine`] when every candidate fails (or there are none)
/// - any fatal error raised while executing a candidate
pub fn execute_first_viable<B: PlanBackend + ?Sized>(
    backend: &B,
    graph: &OperationGraph<B::Context>,
    configs: &[EngineConfig],
    bindings: &mut Bindings<'_>,
) -> Result<Selection, ConvError> {
    for (i, config) in configs.iter().enumerate() {
        match try_candidate(backend, graph, config, bindings)? {
            Attempt::Succeeded { workspace_size } => {
                log::debug!("executed {config} with {workspace_size} workspace bytes");
                return Ok(Selection { engine: config.clone(), workspace_size, attempts: i + 1 });
            }
            Attempt::CompileFailed(e) => log::debug!("discarding candidate: {e}"),
            Attempt::ExecFailed(e) => log::debug!("discarding candidate: {e}"),
        }
    }
    Err(ConvError::NoViableEngine { candidates: configs.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_exactly_sized() {
        let mut ws = Workspace::zeroed(13);
        assert_eq!(ws.len(), 13);
        assert_eq!(ws.as_bytes().len(), 13);
        assert_eq!(ws.typed_mut::<f32>().map(|s| s.len()), Some(3));
        assert_eq!(ws.typed_mut::<f64>().map(|s| s.len()), Some(1));
        assert!(Workspace::zeroed(0).is_empty());
        assert_eq!(Workspace::zeroed(0).typed_mut::<f64>().map(|s| s.len()), Some(0));
    }

    #[test]
    fn pack_rejects_duplicate_uids() {
        let a = Storage::from(vec![0.0f32]);
        let mut ws = Workspace::zeroed(0);
        let err = VariantPack::builder().workspace(&mut ws).read(1, &a).read(1, &a).build().unwrap_err();
        assert!(matches!(err, ConvError::Internal(_)));
        assert!(VariantPack::builder().read(1, &a).build().is_err());
    }

    #[test]
    fn bindings_rebind_per_pack() {
        let x = Storage::from(vec![1.0f32]);
        let mut y = Storage::from(vec![0.0f32]);
        let mut bindings = Bindings::new().read(OperandRole::Input, &x).write(OperandRole::Output, &mut y);
        for _ in 0..2 {
            let mut ws = Workspace::zeroed(4);
            let pack = bindings.pack(&mut ws).unwrap();
            assert_eq!(pack.uids().collect::<Vec<_>>(), vec![OperandRole::Input.uid(), OperandRole::Output.uid()]);
            let (_, mut map) = pack.into_parts();
            if let Some(DataPtr::Write(out)) = map.remove(&OperandRole::Output.uid()) {
                out.as_mut_slice::<f32>().unwrap()[0] += 1.0;
            }
        }
        drop(bindings);
        assert_eq!(y.get_f64(0), Some(2.0));
    }
}
