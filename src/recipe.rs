//! The recipe AST: the immutable, cloneable description of a task tree.
//!
//! A `RecipeNode` tree is pure data — no runtime state lives here. The
//! same recipe value can be compiled into many independent runtimes (see
//! [`crate::compile`]). Handlers are stored as `Arc<dyn Fn>` so cloning a
//! subtree is cheap and preserves sharing where the caller intends it.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::TaskAdapter;
use crate::ctx::HandlerCtx;

/// Terminal outcome observed by a handler, and emitted at the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneWith {
    Success,
    Error,
    Cancel,
}

/// The value a setup handler returns to route its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupResult {
    Continue,
    StopWithSuccess,
    StopWithError,
}

/// The value a done handler returns; may rewrite the node's natural outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneResult {
    Success,
    Error,
}

impl DoneResult {
    pub(crate) fn as_done_with(self) -> DoneWith {
        match self {
            DoneResult::Success => DoneWith::Success,
            DoneResult::Error => DoneWith::Error,
        }
    }
}

/// Controls whether a task's done handler runs at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneFilter {
    Always,
    OnSuccess,
    OnError,
}

impl Default for DoneFilter {
    fn default() -> Self {
        DoneFilter::Always
    }
}

/// Execution mode of a `Group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Sequential,
    Parallel,
    ParallelLimit(usize),
}

impl GroupMode {
    pub(crate) fn effective_limit(self) -> usize {
        match self {
            GroupMode::Sequential => 1,
            GroupMode::Parallel => usize::MAX,
            GroupMode::ParallelLimit(0) => {
                tracing::warn!("ParallelLimit(0) is invalid, treating as ParallelLimit(1)");
                1
            }
            GroupMode::ParallelLimit(k) => k,
        }
    }
}

/// A group's workflow policy: how children's outcomes become the group's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPolicy {
    StopOnError,
    ContinueOnError,
    StopOnSuccess,
    ContinueOnSuccess,
    StopOnSuccessOrError,
    FinishAllAndSuccess,
    FinishAllAndError,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        WorkflowPolicy::StopOnError
    }
}

/// Fresh, process-wide-unique identity tokens for storage and barrier
/// declarations. Not `NodeId`s — those are assigned at compile time.
fn fresh_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageKey(pub(crate) u64);

/// Declares a storage slot of type `T`, rooted at whichever group first
/// declares it on a given path. Cloning preserves identity: two clones of
/// the same `StorageDecl` resolve to the same active instance.
pub struct StorageDecl<T> {
    key: StorageKey,
    default_ctor: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> Clone for StorageDecl<T> {
    fn clone(&self) -> Self {
        StorageDecl {
            key: self.key,
            default_ctor: self.default_ctor.clone(),
        }
    }
}

impl<T> PartialEq for StorageDecl<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: Send + 'static> StorageDecl<T> {
    pub fn new(default_ctor: impl Fn() -> T + Send + Sync + 'static) -> Self {
        StorageDecl {
            key: StorageKey(fresh_id()),
            default_ctor: Arc::new(default_ctor),
        }
    }

    pub fn key(&self) -> StorageKey {
        self.key
    }

    pub(crate) fn erase(&self) -> ErasedStorageDecl {
        let ctor = self.default_ctor.clone();
        ErasedStorageDecl {
            key: self.key,
            // Boxed value's concrete type is `RefCell<T>`, not bare `T`, so
            // `StorageRegistry::active::<T>` can downcast straight through.
            make: Arc::new(move || {
                Box::new(std::cell::RefCell::new((ctor)())) as Box<dyn Any + Send>
            }),
        }
    }
}

/// Type-erased form of a `StorageDecl`, held by `GroupDef` so a group can
/// carry a heterogeneous set of declarations.
#[derive(Clone)]
pub(crate) struct ErasedStorageDecl {
    pub(crate) key: StorageKey,
    pub(crate) make: Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierKey(pub(crate) u64);

/// Declares a barrier requiring `required_advances` calls to `advance()`
/// before registered waiters complete. Cloning preserves identity.
#[derive(Clone, Copy, Debug)]
pub struct BarrierDecl {
    key: BarrierKey,
    required_advances: usize,
}

impl BarrierDecl {
    pub fn new(required_advances: usize) -> Self {
        let required_advances = if required_advances == 0 {
            tracing::warn!("Barrier required_advances(0) is invalid, treating as 1");
            1
        } else {
            required_advances
        };
        BarrierDecl {
            key: BarrierKey(fresh_id()),
            required_advances,
        }
    }

    pub fn key(&self) -> BarrierKey {
        self.key
    }

    pub fn required_advances(&self) -> usize {
        self.required_advances
    }
}

pub(crate) type GroupSetupHandler = Arc<dyn Fn(&HandlerCtx) -> SetupResult + Send + Sync>;
pub(crate) type GroupDoneHandler = Arc<dyn Fn(&HandlerCtx, DoneWith) -> DoneResult + Send + Sync>;
pub(crate) type TaskSetupHandler =
    Arc<dyn Fn(&HandlerCtx, &mut dyn TaskAdapter) -> SetupResult + Send + Sync>;
pub(crate) type TaskDoneHandler =
    Arc<dyn Fn(&HandlerCtx, &dyn TaskAdapter, DoneWith) -> DoneResult + Send + Sync>;
pub(crate) type SyncFn = Arc<dyn Fn(&HandlerCtx) -> DoneResult + Send + Sync>;
pub(crate) type TimeoutHandler = Arc<dyn Fn(&HandlerCtx) + Send + Sync>;
pub(crate) type AdapterFactory = Arc<dyn Fn() -> Box<dyn TaskAdapter> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct TimeoutSpec {
    pub(crate) duration: Duration,
    pub(crate) on_timeout: Option<TimeoutHandler>,
}

/// A node of the recipe tree. Immutable once constructed; see
/// [`crate::recipe::builder`] for the fluent construction surface.
#[derive(Clone)]
pub enum RecipeNode {
    Group(GroupDef),
    Task(TaskDef),
    Sync(SyncDef),
    WaitForBarrier(WaitForBarrierDef),
    BarrierAdvance(BarrierAdvanceDef),
}

#[derive(Clone)]
pub struct GroupDef {
    pub(crate) mode: GroupMode,
    pub(crate) policy: WorkflowPolicy,
    pub(crate) setup_handler: Option<GroupSetupHandler>,
    pub(crate) done_handler: Option<GroupDoneHandler>,
    pub(crate) storages: Vec<ErasedStorageDecl>,
    pub(crate) timeout: Option<TimeoutSpec>,
    pub(crate) children: Vec<RecipeNode>,
    /// Caller-assigned debug label, surfaced in `ScheduleLog` entries in
    /// place of the internal `NodeId` when present (e.g. the `0` in
    /// `onGroupDone(0)`). Purely cosmetic — never consulted by scheduling.
    pub(crate) label: Option<i64>,
}

#[derive(Clone)]
pub struct TaskDef {
    pub(crate) setup_handler: Option<TaskSetupHandler>,
    pub(crate) done_handler: Option<TaskDoneHandler>,
    pub(crate) done_filter: DoneFilter,
    pub(crate) timeout: Option<TimeoutSpec>,
    pub(crate) adapter_factory: AdapterFactory,
    pub(crate) label: Option<i64>,
}

#[derive(Clone)]
pub struct SyncDef {
    pub(crate) func: SyncFn,
}

#[derive(Clone)]
pub struct WaitForBarrierDef {
    pub(crate) barrier: BarrierDecl,
}

#[derive(Clone)]
pub struct BarrierAdvanceDef {
    pub(crate) barrier: BarrierDecl,
    pub(crate) by: usize,
}

pub mod builder {
    //! Fluent construction surface over the recipe AST. Grounded on
    //! `bpmn-lite-core`'s authoring layer and `ob-workflow`'s
    //! `WorkflowLoader` static constructors, reimagined as in-process
    //! builder methods since recipes here are never serialized.

    use super::*;

    /// Internal placeholder used only while `compile::build_node` reserves
    /// a node slot before its children (and thus its final `GroupDef`) are
    /// known. Never observed outside of compilation.
    pub(crate) fn empty_group_def() -> GroupDef {
        GroupDef::new(GroupMode::Sequential)
    }

    impl GroupDef {
        fn new(mode: GroupMode) -> Self {
            GroupDef {
                mode,
                policy: WorkflowPolicy::default(),
                setup_handler: None,
                done_handler: None,
                storages: Vec::new(),
                timeout: None,
                children: Vec::new(),
                label: None,
            }
        }

        pub fn sequential() -> Self {
            Self::new(GroupMode::Sequential)
        }

        pub fn parallel() -> Self {
            Self::new(GroupMode::Parallel)
        }

        pub fn parallel_limit(k: usize) -> Self {
            Self::new(GroupMode::ParallelLimit(k))
        }

        pub fn workflow_policy(mut self, policy: WorkflowPolicy) -> Self {
            self.policy = policy;
            self
        }

        /// Full-signature setup handler, given a `HandlerCtx` for storage access.
        pub fn on_setup(
            mut self,
            f: impl Fn(&HandlerCtx) -> SetupResult + Send + Sync + 'static,
        ) -> Self {
            self.setup_handler = Some(Arc::new(f));
            self
        }

        /// Zero-argument sugar over [`Self::on_setup`].
        pub fn on_setup_fn(self, f: impl Fn() -> SetupResult + Send + Sync + 'static) -> Self {
            self.on_setup(move |_ctx| f())
        }

        /// Full-signature done handler.
        pub fn on_done(
            mut self,
            f: impl Fn(&HandlerCtx, DoneWith) -> DoneResult + Send + Sync + 'static,
        ) -> Self {
            self.done_handler = Some(Arc::new(f));
            self
        }

        /// One-argument sugar over [`Self::on_done`] (ignores ctx).
        pub fn on_done_fn(
            self,
            f: impl Fn(DoneWith) -> DoneResult + Send + Sync + 'static,
        ) -> Self {
            self.on_done(move |_ctx, d| f(d))
        }

        pub fn declare_storage<T: Send + 'static>(mut self, decl: &StorageDecl<T>) -> Self {
            self.storages.push(decl.erase());
            self
        }

        pub fn with_timeout(
            mut self,
            duration: Duration,
            on_timeout: Option<impl Fn(&HandlerCtx) + Send + Sync + 'static>,
        ) -> Self {
            self.timeout = Some(TimeoutSpec {
                duration,
                on_timeout: on_timeout.map(|f| Arc::new(f) as TimeoutHandler),
            });
            self
        }

        pub fn child(mut self, node: impl Into<RecipeNode>) -> Self {
            self.children.push(node.into());
            self
        }

        pub fn children(mut self, nodes: impl IntoIterator<Item = RecipeNode>) -> Self {
            self.children.extend(nodes);
            self
        }

        pub fn label(mut self, label: i64) -> Self {
            self.label = Some(label);
            self
        }
    }

    impl From<GroupDef> for RecipeNode {
        fn from(g: GroupDef) -> Self {
            RecipeNode::Group(g)
        }
    }

    impl TaskDef {
        pub fn new(
            adapter_factory: impl Fn() -> Box<dyn TaskAdapter> + Send + Sync + 'static,
        ) -> Self {
            TaskDef {
                setup_handler: None,
                done_handler: None,
                done_filter: DoneFilter::default(),
                timeout: None,
                adapter_factory: Arc::new(adapter_factory),
                label: None,
            }
        }

        pub fn label(mut self, label: i64) -> Self {
            self.label = Some(label);
            self
        }

        pub fn on_setup(
            mut self,
            f: impl Fn(&HandlerCtx, &mut dyn TaskAdapter) -> SetupResult + Send + Sync + 'static,
        ) -> Self {
            self.setup_handler = Some(Arc::new(f));
            self
        }

        pub fn on_done(
            mut self,
            f: impl Fn(&HandlerCtx, &dyn TaskAdapter, DoneWith) -> DoneResult + Send + Sync + 'static,
        ) -> Self {
            self.done_handler = Some(Arc::new(f));
            self
        }

        /// Two-argument sugar over [`Self::on_done`] (ignores ctx).
        pub fn on_done_fn(
            self,
            f: impl Fn(&dyn TaskAdapter, DoneWith) -> DoneResult + Send + Sync + 'static,
        ) -> Self {
            self.on_done(move |_ctx, a, d| f(a, d))
        }

        pub fn done_filter(mut self, filter: DoneFilter) -> Self {
            self.done_filter = filter;
            self
        }

        pub fn with_timeout(
            mut self,
            duration: Duration,
            on_timeout: Option<impl Fn(&HandlerCtx) + Send + Sync + 'static>,
        ) -> Self {
            self.timeout = Some(TimeoutSpec {
                duration,
                on_timeout: on_timeout.map(|f| Arc::new(f) as TimeoutHandler),
            });
            self
        }
    }

    impl From<TaskDef> for RecipeNode {
        fn from(t: TaskDef) -> Self {
            RecipeNode::Task(t)
        }
    }

    impl SyncDef {
        pub fn new(f: impl Fn(&HandlerCtx) -> DoneResult + Send + Sync + 'static) -> Self {
            SyncDef { func: Arc::new(f) }
        }

        /// Zero-argument sugar.
        pub fn from_fn(f: impl Fn() -> DoneResult + Send + Sync + 'static) -> Self {
            Self::new(move |_ctx| f())
        }
    }

    impl From<SyncDef> for RecipeNode {
        fn from(s: SyncDef) -> Self {
            RecipeNode::Sync(s)
        }
    }

    impl WaitForBarrierDef {
        pub fn new(barrier: BarrierDecl) -> Self {
            WaitForBarrierDef { barrier }
        }
    }

    impl From<WaitForBarrierDef> for RecipeNode {
        fn from(w: WaitForBarrierDef) -> Self {
            RecipeNode::WaitForBarrier(w)
        }
    }

    impl BarrierAdvanceDef {
        pub fn new(barrier: BarrierDecl, by: usize) -> Self {
            BarrierAdvanceDef { barrier, by }
        }
    }

    impl From<BarrierAdvanceDef> for RecipeNode {
        fn from(b: BarrierAdvanceDef) -> Self {
            RecipeNode::BarrierAdvance(b)
        }
    }
}
