//! The driver loop: the scheduling algorithm that walks the
//! runtime tree, launches ready children respecting parallel limits,
//! applies the outcome propagator on every completion, and
//! services barrier/timeout side effects. Everything here runs on the
//! single driver context; the only cross-thread surface is [`DriverEvent`]
//! arriving from adapters and timers.

use std::panic::AssertUnwindSafe;

use tokio::sync::mpsc::UnboundedSender;

use crate::capability::{AdapterHandle, AdapterOutcome, TaskAdapter};
use crate::config::EngineConfig;
use crate::ctx::HandlerCtx;
use crate::recipe::{
    DoneFilter, DoneResult, DoneWith, GroupDoneHandler, GroupSetupHandler, SetupResult, SyncFn,
    TaskDoneHandler, TaskSetupHandler, TimeoutHandler, WorkflowPolicy,
};
use crate::runtime::{NodeId, NodeState, Runtime, RuntimeNodeKind};

#[derive(Debug)]
pub(crate) enum DriverEvent {
    TaskDone {
        node: NodeId,
        outcome: AdapterOutcome,
    },
    TimerFired {
        node: NodeId,
    },
}

/// Owns the compiled runtime and the event channel adapters/timers post
/// back to. All mutation goes through the free functions below so the
/// borrow checker never has to reconcile `&mut self` with `&self.tx`.
pub(crate) struct Driver {
    pub(crate) rt: Runtime,
    pub(crate) tx: UnboundedSender<DriverEvent>,
    config: EngineConfig,
    steps: usize,
}

impl Driver {
    pub(crate) fn new(rt: Runtime, tx: UnboundedSender<DriverEvent>, config: EngineConfig) -> Self {
        Driver {
            rt,
            tx,
            config,
            steps: 0,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.rt.node(self.rt.root).state.is_terminal()
    }

    pub(crate) fn top_outcome(&self) -> Option<DoneWith> {
        match self.rt.node(self.rt.root).state {
            NodeState::Succeeded => Some(DoneWith::Success),
            NodeState::Failed => Some(DoneWith::Error),
            NodeState::Canceled => Some(DoneWith::Cancel),
            _ => None,
        }
    }

    pub(crate) fn start(&mut self) {
        let root = self.rt.root;
        start_node(&mut self.rt, &self.tx, root);
    }

    pub(crate) fn cancel(&mut self) {
        let root = self.rt.root;
        cancel_node(&mut self.rt, &self.tx, root);
    }

    /// Processes one `DriverEvent` and enforces the `max_scheduling_steps`
    /// runaway guard: a misbehaving adapter that never reports
    /// `done` would otherwise leave the run stuck forever rather than
    /// surfacing as a terminal outcome.
    pub(crate) fn handle_event(&mut self, event: DriverEvent) {
        self.steps += 1;
        if self.steps > self.config.max_scheduling_steps && !self.is_terminal() {
            tracing::error!(
                steps = self.steps,
                limit = self.config.max_scheduling_steps,
                "exceeded max_scheduling_steps, force-cancelling root"
            );
            self.cancel();
        }
        match event {
            DriverEvent::TaskDone { node, outcome } => {
                on_task_done(&mut self.rt, &self.tx, node, outcome)
            }
            DriverEvent::TimerFired { node } => on_timer_fired(&mut self.rt, &self.tx, node),
        }
    }
}

enum KindTag {
    Group,
    Task,
    Sync,
    WaitForBarrier,
    BarrierAdvance,
}

fn kind_tag(rt: &Runtime, id: NodeId) -> KindTag {
    match &rt.node(id).kind {
        RuntimeNodeKind::Group(_) => KindTag::Group,
        RuntimeNodeKind::Task(_) => KindTag::Task,
        RuntimeNodeKind::Sync(_) => KindTag::Sync,
        RuntimeNodeKind::WaitForBarrier(_) => KindTag::WaitForBarrier,
        RuntimeNodeKind::BarrierAdvance(_) => KindTag::BarrierAdvance,
    }
}

// ---------------------------------------------------------------------
// Starting nodes
// ---------------------------------------------------------------------

fn start_node(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    if rt.node(id).state.is_terminal() {
        return;
    }
    match kind_tag(rt, id) {
        KindTag::Group => start_group(rt, tx, id),
        KindTag::Task => start_task(rt, tx, id),
        KindTag::Sync => start_sync(rt, tx, id),
        KindTag::WaitForBarrier => start_wait_for_barrier(rt, tx, id),
        KindTag::BarrierAdvance => start_barrier_advance(rt, tx, id),
    }
}

fn start_group(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    rt.node_mut(id).state = NodeState::Running;

    let setup = rt.group(id).def.setup_handler.clone();
    let result = match setup {
        Some(h) => {
            let chain = rt.ancestor_chain(id);
            let ctx = HandlerCtx::new(&rt.storage, id, chain);
            invoke_group_setup(&h, &ctx)
        }
        None => SetupResult::Continue,
    };

    match result {
        SetupResult::Continue => {
            instantiate_storage(rt, id);
            arm_timeout(rt, tx, id);
            fill_children(rt, tx, id);
            maybe_finish_group(rt, tx, id);
        }
        SetupResult::StopWithSuccess => finalize_node(rt, tx, id, DoneResult::Success, false),
        SetupResult::StopWithError => finalize_node(rt, tx, id, DoneResult::Error, false),
    }
}

fn instantiate_storage(rt: &mut Runtime, id: NodeId) {
    let decls = rt.group(id).def.storages.clone();
    for decl in &decls {
        let boxed = (decl.make)();
        rt.storage.push(id, decl.key, boxed);
    }
    rt.group_mut(id).storage_instantiated = true;

    if id == rt.root {
        for decl in &decls {
            if let Some(hooks) = rt.storage_setup_hooks.remove(&decl.key) {
                for hook in hooks {
                    hook(&rt.storage);
                }
            }
        }
    }
}

fn teardown_storage(rt: &mut Runtime, id: NodeId) {
    if !rt.group(id).storage_instantiated {
        return;
    }
    let keys: Vec<_> = rt.group(id).def.storages.iter().map(|d| d.key).collect();
    // Reverse creation order.
    for key in keys.into_iter().rev() {
        rt.storage.pop(id, key);
    }
}

/// Runs any `Controller::on_storage_done` hooks for the root's own declared
/// keys, while those instances are still active. Only called for
/// `id == rt.root`, and only on a natural terminal transition reached
/// through `finalize_node` — a dropped-while-running controller aborts its
/// driver task first and never reaches this call.
fn run_storage_done_hooks(rt: &mut Runtime, id: NodeId) {
    if !rt.group(id).storage_instantiated {
        return;
    }
    let keys: Vec<_> = rt.group(id).def.storages.iter().map(|d| d.key).collect();
    for key in keys {
        if let Some(hooks) = rt.storage_done_hooks.remove(&key) {
            for hook in hooks {
                hook(&rt.storage);
            }
        }
    }
}

fn start_task(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    rt.node_mut(id).state = NodeState::Running;

    let factory = match &rt.node(id).kind {
        RuntimeNodeKind::Task(t) => t.def.adapter_factory.clone(),
        _ => unreachable!(),
    };
    let mut adapter = (factory)();

    let setup = match &rt.node(id).kind {
        RuntimeNodeKind::Task(t) => t.def.setup_handler.clone(),
        _ => unreachable!(),
    };
    let result = match setup {
        Some(h) => {
            let chain = rt.ancestor_chain(id);
            let ctx = HandlerCtx::new(&rt.storage, id, chain);
            invoke_task_setup(&h, &ctx, adapter.as_mut())
        }
        None => SetupResult::Continue,
    };

    // Store the adapter regardless of `result`: a done handler with the
    // default `DoneFilter::Always` runs even when setup rejected the task
    // (§4.7 — a refused start still reaches the done handler), and
    // `finalize_node` expects `t.adapter` to be populated by then.
    if let RuntimeNodeKind::Task(t) = &mut rt.node_mut(id).kind {
        t.adapter = Some(adapter);
    }

    match result {
        SetupResult::Continue => {
            let handle = AdapterHandle {
                node: id,
                sender: tx.clone(),
            };
            let adapter = match &mut rt.node_mut(id).kind {
                RuntimeNodeKind::Task(t) => t.adapter.as_mut().expect("just stored above"),
                _ => unreachable!(),
            };
            adapter.start(handle);
            arm_timeout(rt, tx, id);
        }
        SetupResult::StopWithSuccess => finalize_node(rt, tx, id, DoneResult::Success, false),
        SetupResult::StopWithError => finalize_node(rt, tx, id, DoneResult::Error, false),
    }
}

fn start_sync(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    rt.node_mut(id).state = NodeState::Running;
    let func = match &rt.node(id).kind {
        RuntimeNodeKind::Sync(s) => s.func.clone(),
        _ => unreachable!(),
    };
    let chain = rt.ancestor_chain(id);
    let ctx = HandlerCtx::new(&rt.storage, id, chain);
    let outcome = invoke_sync(&func, &ctx);
    finalize_node(rt, tx, id, outcome, false);
}

fn start_wait_for_barrier(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    rt.node_mut(id).state = NodeState::Running;
    let key = match &rt.node(id).kind {
        RuntimeNodeKind::WaitForBarrier(k) => *k,
        _ => unreachable!(),
    };
    let satisfied = rt.barriers.get(&key).map(|b| b.satisfied()).unwrap_or(false);
    if satisfied {
        finalize_node(rt, tx, id, DoneResult::Success, false);
    } else if let Some(b) = rt.barriers.get_mut(&key) {
        b.waiters.insert(id);
    }
}

fn start_barrier_advance(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    rt.node_mut(id).state = NodeState::Running;
    let (key, by) = match &rt.node(id).kind {
        RuntimeNodeKind::BarrierAdvance(a) => (a.barrier.key(), a.by),
        _ => unreachable!(),
    };
    advance_barrier(rt, tx, key, by);
    finalize_node(rt, tx, id, DoneResult::Success, false);
}

/// `current ≥ required` transitions every registered waiter to `Succeeded`
/// within this same call.
fn advance_barrier(
    rt: &mut Runtime,
    tx: &UnboundedSender<DriverEvent>,
    key: crate::recipe::BarrierKey,
    by: usize,
) {
    let newly_satisfied = {
        let b = rt.barriers.get_mut(&key).expect("barrier not found");
        let was_satisfied = b.satisfied();
        b.current = b.current.saturating_add(by);
        !was_satisfied && b.satisfied()
    };
    if newly_satisfied {
        let waiters: Vec<NodeId> = rt
            .barriers
            .get_mut(&key)
            .map(|b| b.waiters.drain().collect())
            .unwrap_or_default();
        for w in waiters {
            if !rt.node(w).state.is_terminal() {
                finalize_node(rt, tx, w, DoneResult::Success, false);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Filling a group's running set
// ---------------------------------------------------------------------

fn fill_children(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    loop {
        let grp = rt.group(id);
        if grp.stopping {
            break;
        }
        let limit = grp.def.mode.effective_limit();
        if grp.running.len() >= limit {
            break;
        }
        let next_idx = grp.next_to_start;
        if next_idx >= grp.children.len() {
            break;
        }
        let child = grp.children[next_idx];
        rt.group_mut(id).next_to_start += 1;
        rt.group_mut(id).running.insert(child);
        start_node(rt, tx, child);
        // `start_node` may have completed the child synchronously
        // (Sync, an already-satisfied WaitForBarrier, an immediately
        // rejected setup, ...), in which case `complete_child` already ran
        // and `running`/`next_to_start` reflect that. Either way, loop
        // back around to consider starting more.
    }
}

// ---------------------------------------------------------------------
// Completion: children reporting back to their parent group
// ---------------------------------------------------------------------

fn complete_child(
    rt: &mut Runtime,
    tx: &UnboundedSender<DriverEvent>,
    parent: NodeId,
    child: NodeId,
    effective: DoneResult,
) {
    {
        let grp = rt.group_mut(parent);
        grp.running.remove(&child);
        grp.finished_children += 1;
        match effective {
            DoneResult::Success => grp.any_success = true,
            DoneResult::Error => grp.any_error = true,
        }
        if grp.first_finished.is_none() {
            grp.first_finished = Some(effective.as_done_with());
        }
    }

    let policy = rt.group(parent).def.policy;
    let should_stop = match (policy, effective) {
        (WorkflowPolicy::StopOnError, DoneResult::Error) => true,
        (WorkflowPolicy::StopOnSuccess, DoneResult::Success) => true,
        (WorkflowPolicy::StopOnSuccessOrError, _) => true,
        _ => false,
    };

    if should_stop && !rt.group(parent).stopping {
        rt.group_mut(parent).stopping = true;
        let still_running: Vec<NodeId> = rt.group(parent).running.iter().copied().collect();
        for rid in still_running {
            cancel_node(rt, tx, rid);
        }
    }

    if !rt.group(parent).stopping {
        fill_children(rt, tx, parent);
    }

    maybe_finish_group(rt, tx, parent);
}

fn decide_policy_outcome(policy: WorkflowPolicy, any_success: bool, any_error: bool, first: Option<DoneWith>, finished: usize) -> DoneResult {
    if finished == 0 {
        return empty_default_outcome(policy);
    }
    match policy {
        WorkflowPolicy::StopOnError | WorkflowPolicy::ContinueOnError => {
            if any_error { DoneResult::Error } else { DoneResult::Success }
        }
        WorkflowPolicy::StopOnSuccess | WorkflowPolicy::ContinueOnSuccess => {
            if any_success { DoneResult::Success } else { DoneResult::Error }
        }
        WorkflowPolicy::StopOnSuccessOrError => match first {
            Some(DoneWith::Success) => DoneResult::Success,
            _ => DoneResult::Error,
        },
        WorkflowPolicy::FinishAllAndSuccess => DoneResult::Success,
        WorkflowPolicy::FinishAllAndError => DoneResult::Error,
    }
}

fn empty_default_outcome(policy: WorkflowPolicy) -> DoneResult {
    match policy {
        WorkflowPolicy::StopOnError | WorkflowPolicy::ContinueOnError => DoneResult::Success,
        WorkflowPolicy::StopOnSuccess | WorkflowPolicy::ContinueOnSuccess => DoneResult::Error,
        WorkflowPolicy::StopOnSuccessOrError => DoneResult::Error,
        WorkflowPolicy::FinishAllAndSuccess => DoneResult::Success,
        WorkflowPolicy::FinishAllAndError => DoneResult::Error,
    }
}

fn maybe_finish_group(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    let grp = rt.group(id);
    if !grp.running.is_empty() {
        return;
    }
    if !grp.stopping && grp.next_to_start < grp.children.len() {
        return;
    }
    if rt.node(id).state.is_terminal() {
        return;
    }
    if rt.group(id).force_cancel {
        finalize_node(rt, tx, id, DoneResult::Error, true);
    } else {
        let grp = rt.group(id);
        let natural = decide_policy_outcome(
            grp.def.policy,
            grp.any_success,
            grp.any_error,
            grp.first_finished,
            grp.finished_children,
        );
        finalize_node(rt, tx, id, natural, false);
    }
}

// ---------------------------------------------------------------------
// Finalizing any node (Task, Group, Sync, WaitForBarrier, BarrierAdvance)
// ---------------------------------------------------------------------

/// Applies the cancellation-observation rule uniformly across node kinds: a cancelled node
/// always observes `DoneWith::Cancel` from inside its done handler (if it
/// has one subject to an "error-side" filter), and the handler's rewrite
/// becomes the *effective* outcome handed to the parent while the node's
/// own sticky state is always `Canceled` when `was_cancelled` is set.
fn finalize_node(
    rt: &mut Runtime,
    tx: &UnboundedSender<DriverEvent>,
    id: NodeId,
    natural: DoneResult,
    was_cancelled: bool,
) {
    if rt.node(id).state.is_terminal() {
        return;
    }

    let observed = if was_cancelled {
        DoneWith::Cancel
    } else {
        natural.as_done_with()
    };

    let effective = match kind_tag(rt, id) {
        KindTag::Group => {
            abort_timer_group(rt, id);
            let done = rt.group(id).def.done_handler.clone();
            let effective = match done {
                Some(h) => {
                    let chain = rt.ancestor_chain(id);
                    let ctx = HandlerCtx::new(&rt.storage, id, chain);
                    invoke_group_done(&h, &ctx, observed)
                }
                None => {
                    if was_cancelled {
                        DoneResult::Error
                    } else {
                        natural
                    }
                }
            };
            if id == rt.root {
                run_storage_done_hooks(rt, id);
            }
            teardown_storage(rt, id);
            effective
        }
        KindTag::Task => {
            abort_timer_task(rt, id);
            let (done, filter) = match &rt.node(id).kind {
                RuntimeNodeKind::Task(t) => (t.def.done_handler.clone(), t.def.done_filter),
                _ => unreachable!(),
            };
            let runs = matches!(
                (filter, was_cancelled, natural),
                (DoneFilter::Always, _, _)
                    | (DoneFilter::OnError, true, _)
                    | (DoneFilter::OnError, false, DoneResult::Error)
                    | (DoneFilter::OnSuccess, false, DoneResult::Success)
            );
            if runs {
                if let Some(h) = done {
                    let adapter_ref: &dyn crate::capability::TaskAdapter = match &rt.node(id).kind {
                        RuntimeNodeKind::Task(t) => t
                            .adapter
                            .as_deref()
                            .expect("task adapter missing at done time"),
                        _ => unreachable!(),
                    };
                    let chain = rt.ancestor_chain(id);
                    let ctx = HandlerCtx::new(&rt.storage, id, chain);
                    invoke_task_done(&h, &ctx, adapter_ref, observed)
                } else if was_cancelled {
                    DoneResult::Error
                } else {
                    natural
                }
            } else if was_cancelled {
                DoneResult::Error
            } else {
                natural
            }
        }
        _ => {
            if was_cancelled {
                DoneResult::Error
            } else {
                natural
            }
        }
    };

    let state = if was_cancelled {
        NodeState::Canceled
    } else if effective == DoneResult::Success {
        NodeState::Succeeded
    } else {
        NodeState::Failed
    };
    rt.node_mut(id).state = state;

    if matches!(kind_tag(rt, id), KindTag::Task | KindTag::WaitForBarrier) {
        rt.progress.advance();
    }

    match rt.node(id).parent {
        Some(parent) => complete_child(rt, tx, parent, id, effective),
        None => {
            // Root finished; nothing further to bubble.
            close_out_progress(rt);
        }
    }
}

/// Forces `progress.current` to `progress.maximum` once the root reaches a
/// terminal state. `progress.advance()` only fires for `Task`/`WaitForBarrier`
/// nodes that actually run to a finalization; a child skipped because its
/// group stopped early (left `NotStarted` forever) or cancelled via one of
/// `cancel_node`'s `NotStarted` fast paths never passes through it, so
/// `current` can otherwise under-count relative to the `progress_maximum`
/// fixed at compile time. Invariant 4 requires the two to be equal exactly at
/// the terminal event, so the root settling is the one place to true them up.
fn close_out_progress(rt: &mut Runtime) {
    rt.progress.current = rt.progress.maximum;
}

// ---------------------------------------------------------------------
// Cancellation (leaf-first)
// ---------------------------------------------------------------------

fn cancel_node(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    if rt.node(id).state.is_terminal() {
        return;
    }
    match kind_tag(rt, id) {
        KindTag::Group => {
            if rt.node(id).state == NodeState::NotStarted {
                rt.node_mut(id).state = NodeState::Canceled;
                match rt.node(id).parent {
                    Some(parent) => complete_child(rt, tx, parent, id, DoneResult::Error),
                    None => close_out_progress(rt),
                }
                return;
            }
            if rt.group(id).force_cancel {
                return;
            }
            rt.group_mut(id).force_cancel = true;
            rt.group_mut(id).stopping = true;
            let running: Vec<NodeId> = rt.group(id).running.iter().copied().collect();
            for rid in running {
                cancel_node(rt, tx, rid);
            }
            maybe_finish_group(rt, tx, id);
        }
        KindTag::Task => {
            if rt.node(id).state == NodeState::NotStarted {
                rt.node_mut(id).state = NodeState::Canceled;
                match rt.node(id).parent {
                    Some(parent) => complete_child(rt, tx, parent, id, DoneResult::Error),
                    None => close_out_progress(rt),
                }
                return;
            }
            let already_requested = match &rt.node(id).kind {
                RuntimeNodeKind::Task(t) => t.cancel_requested,
                _ => unreachable!(),
            };
            if already_requested {
                return;
            }
            if let RuntimeNodeKind::Task(t) = &mut rt.node_mut(id).kind {
                t.cancel_requested = true;
                if let Some(adapter) = t.adapter.as_mut() {
                    adapter.request_cancel();
                }
            }
            abort_timer_task(rt, id);
            // Stays `Running` until the adapter's `done` arrives and is
            // honored as the cancellation acknowledgement in `on_task_done`.
        }
        KindTag::WaitForBarrier => {
            let key = match &rt.node(id).kind {
                RuntimeNodeKind::WaitForBarrier(k) => *k,
                _ => unreachable!(),
            };
            if let Some(b) = rt.barriers.get_mut(&key) {
                b.waiters.remove(&id);
            }
            finalize_node(rt, tx, id, DoneResult::Error, true);
        }
        KindTag::Sync | KindTag::BarrierAdvance => {
            // Both run to completion synchronously the instant they are
            // started, so they can only be cancelled while `NotStarted`.
            rt.node_mut(id).state = NodeState::Canceled;
            match rt.node(id).parent {
                Some(parent) => complete_child(rt, tx, parent, id, DoneResult::Error),
                None => close_out_progress(rt),
            }
        }
    }
}

// ---------------------------------------------------------------------
// External events
// ---------------------------------------------------------------------

fn on_task_done(
    rt: &mut Runtime,
    tx: &UnboundedSender<DriverEvent>,
    node: NodeId,
    outcome: AdapterOutcome,
) {
    if rt.node(node).state.is_terminal() {
        // Stale/duplicate emission after the node already finished; ignore.
        return;
    }
    let was_cancelled = match &rt.node(node).kind {
        RuntimeNodeKind::Task(t) => t.cancel_requested,
        _ => false,
    };
    let natural = match outcome {
        AdapterOutcome::Success => DoneResult::Success,
        AdapterOutcome::Error => DoneResult::Error,
    };
    finalize_node(rt, tx, node, natural, was_cancelled);
}

fn on_timer_fired(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, node: NodeId) {
    if rt.node(node).state.is_terminal() {
        return;
    }
    let handler = match kind_tag(rt, node) {
        KindTag::Group => rt.group(node).def.timeout.as_ref().and_then(|t| t.on_timeout.clone()),
        KindTag::Task => match &rt.node(node).kind {
            RuntimeNodeKind::Task(t) => t.def.timeout.as_ref().and_then(|t| t.on_timeout.clone()),
            _ => None,
        },
        _ => None,
    };
    if let Some(h) = handler {
        let chain = rt.ancestor_chain(node);
        let ctx = HandlerCtx::new(&rt.storage, node, chain);
        invoke_timeout(&h, &ctx);
    }
    cancel_node(rt, tx, node);
}

// ---------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------

fn arm_timeout(rt: &mut Runtime, tx: &UnboundedSender<DriverEvent>, id: NodeId) {
    let explicit = match kind_tag(rt, id) {
        KindTag::Group => rt.group(id).def.timeout.as_ref().map(|t| t.duration),
        KindTag::Task => match &rt.node(id).kind {
            RuntimeNodeKind::Task(t) => t.def.timeout.as_ref().map(|t| t.duration),
            _ => None,
        },
        _ => None,
    };
    let duration = explicit.or(rt.default_timeout);
    let Some(duration) = duration else { return };
    let tx = tx.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = tx.send(DriverEvent::TimerFired { node: id });
    });
    match kind_tag(rt, id) {
        KindTag::Group => rt.group_mut(id).timer = Some(handle),
        KindTag::Task => {
            if let RuntimeNodeKind::Task(t) = &mut rt.node_mut(id).kind {
                t.timer = Some(handle);
            }
        }
        _ => {}
    }
}

fn abort_timer_group(rt: &mut Runtime, id: NodeId) {
    if let Some(h) = rt.group_mut(id).timer.take() {
        h.abort();
    }
}

fn abort_timer_task(rt: &mut Runtime, id: NodeId) {
    if let RuntimeNodeKind::Task(t) = &mut rt.node_mut(id).kind {
        if let Some(h) = t.timer.take() {
            h.abort();
        }
    }
}

// ---------------------------------------------------------------------
// Panic containment: handler panics are
// caught at this single boundary and mapped to the enclosing node's
// Error outcome. Nothing escapes the engine.
// ---------------------------------------------------------------------

fn invoke_group_setup(h: &GroupSetupHandler, ctx: &HandlerCtx) -> SetupResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| h(ctx))) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("group setup handler panicked");
            SetupResult::StopWithError
        }
    }
}

fn invoke_group_done(h: &GroupDoneHandler, ctx: &HandlerCtx, observed: DoneWith) -> DoneResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| h(ctx, observed))) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("group done handler panicked");
            DoneResult::Error
        }
    }
}

fn invoke_task_setup(
    h: &TaskSetupHandler,
    ctx: &HandlerCtx,
    adapter: &mut dyn TaskAdapter,
) -> SetupResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| h(ctx, adapter))) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("task setup handler panicked");
            SetupResult::StopWithError
        }
    }
}

fn invoke_task_done(
    h: &TaskDoneHandler,
    ctx: &HandlerCtx,
    adapter: &dyn TaskAdapter,
    observed: DoneWith,
) -> DoneResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| h(ctx, adapter, observed))) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("task done handler panicked");
            DoneResult::Error
        }
    }
}

fn invoke_sync(f: &SyncFn, ctx: &HandlerCtx) -> DoneResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("sync leaf panicked");
            DoneResult::Error
        }
    }
}

fn invoke_timeout(h: &TimeoutHandler, ctx: &HandlerCtx) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| h(ctx))).is_err() {
        tracing::error!("on_timeout handler panicked");
    }
}
