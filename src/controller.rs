//! The top-level controller: the public entry point that compiles a recipe, seeds
//! storage, drives the driver context, and reports the terminal outcome.
//!
//! Grounded on `BpmnLiteEngine`'s role as the facade gRPC handlers delegate
//! to (`bpmn_lite_core::engine`) and on `WorkflowEngine::start_workflow`'s
//! façade shape in `ob_workflow::engine` — adapted from an async,
//! RPC/database-backed facade to an in-process, event-driven one, since
//! there is no wire protocol or persistence here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::compile;
use crate::config::EngineConfig;
use crate::error::TaskTreeError;
use crate::recipe::{DoneWith, RecipeNode, StorageDecl};
use crate::runtime::StorageHook;
use crate::scheduler::{Driver, DriverEvent};
use crate::storage::StorageRegistry;

type DoneHook = Box<dyn FnOnce(DoneWith) + Send>;
type ProgressHook = Box<dyn Fn(usize) + Send>;

/// Compiles a recipe into a runtime tree and drives it to completion.
///
/// One `Controller` corresponds to one run of one recipe. It owns the
/// compiled [`crate::runtime::Runtime`] behind a driver lock.
pub struct Controller {
    driver: Arc<Mutex<Driver>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    done_hooks: Arc<Mutex<Vec<DoneHook>>>,
    progress_hooks: Arc<Mutex<Vec<ProgressHook>>>,
}

impl Controller {
    /// Compiles `recipe` with the default [`EngineConfig`].
    pub fn new(recipe: RecipeNode) -> Self {
        Self::with_config(recipe, EngineConfig::default())
    }

    /// Compiles `recipe` with an explicit [`EngineConfig`].
    pub fn with_config(recipe: RecipeNode, config: EngineConfig) -> Self {
        let mut rt = compile::compile(recipe);
        rt.default_timeout = config.default_timeout;
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::new(rt, tx, config);
        Controller {
            driver: Arc::new(Mutex::new(driver)),
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
            done_hooks: Arc::new(Mutex::new(Vec::new())),
            progress_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of asynchronous leaves (`Task`s and `WaitForBarrier`s) in the
    /// compiled recipe — fixed at compile time, equal to
    /// [`Self::progress_maximum`].
    pub fn task_count(&self) -> usize {
        self.driver.lock().expect("driver lock poisoned").rt.progress.maximum
    }

    /// Current progress count. Errs with [`TaskTreeError::NotStarted`] if
    /// queried before [`Self::start`] or [`Self::run_blocking`].
    pub fn progress_value(&self) -> Result<usize, TaskTreeError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TaskTreeError::NotStarted);
        }
        Ok(self.driver.lock().expect("driver lock poisoned").rt.progress.current)
    }

    /// The fixed progress ceiling, equal to [`Self::task_count`].
    pub fn progress_maximum(&self) -> usize {
        self.task_count()
    }

    /// Registers a callback invoked immediately after the root group
    /// instantiates its own instance of `decl`. Must be called before [`Self::start`]/
    /// [`Self::run_blocking`]. Errs if `decl` is not declared directly on
    /// the recipe's root group.
    pub fn on_storage_setup<T: Send + 'static>(
        &self,
        decl: &StorageDecl<T>,
        f: impl FnOnce(&mut T) + Send + 'static,
    ) -> Result<(), TaskTreeError> {
        let key = decl.key();
        let mut d = self.driver.lock().expect("driver lock poisoned");
        if !d.rt.root_storage_keys().contains(&key) {
            return Err(TaskTreeError::UnknownStorageKey);
        }
        let root = d.rt.root;
        let hook: StorageHook = Box::new(move |reg: &StorageRegistry| {
            f(&mut reg.active::<T>(&[root], key).borrow_mut());
        });
        d.rt.storage_setup_hooks.entry(key).or_default().push(hook);
        Ok(())
    }

    /// Registers a callback invoked on the root's instance of `decl` just
    /// before it is torn down at root exit, on a natural terminal
    /// transition only — never if the controller is dropped mid-run. Must be called before [`Self::start`]/[`Self::run_blocking`].
    pub fn on_storage_done<T: Send + 'static>(
        &self,
        decl: &StorageDecl<T>,
        f: impl FnOnce(&T) + Send + 'static,
    ) -> Result<(), TaskTreeError> {
        let key = decl.key();
        let mut d = self.driver.lock().expect("driver lock poisoned");
        if !d.rt.root_storage_keys().contains(&key) {
            return Err(TaskTreeError::UnknownStorageKey);
        }
        let root = d.rt.root;
        let hook: StorageHook = Box::new(move |reg: &StorageRegistry| {
            f(&reg.active::<T>(&[root], key).borrow());
        });
        d.rt.storage_done_hooks.entry(key).or_default().push(hook);
        Ok(())
    }

    /// Registers a callback invoked after every progress advance, with the
    /// new `progress_value`.
    pub fn on_progress(&self, f: impl Fn(usize) + Send + 'static) {
        self.progress_hooks.lock().expect("progress hooks poisoned").push(Box::new(f));
    }

    /// Registers a callback invoked exactly once with the top-level
    /// terminal outcome.
    pub fn on_done(&self, f: impl FnOnce(DoneWith) + Send + 'static) {
        self.done_hooks.lock().expect("done hooks poisoned").push(Box::new(f));
    }

    /// Non-blocking: compiles and kicks off the initial scheduling pass
    /// synchronously, then spawns a background task on the ambient tokio
    /// runtime to drain subsequent adapter/timer events and drive the tree
    /// to completion. Returns immediately.
    pub fn start(&self) -> Result<(), TaskTreeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TaskTreeError::AlreadyStarted);
        }
        let mut rx = self
            .rx
            .lock()
            .expect("rx lock poisoned")
            .take()
            .expect("rx taken exactly once, guarded by `started`");

        {
            let mut d = self.driver.lock().expect("driver lock poisoned");
            d.start();
        }

        let driver = self.driver.clone();
        let done_hooks = self.done_hooks.clone();
        let progress_hooks = self.progress_hooks.clone();

        let handle = tokio::spawn(async move {
            loop {
                let outcome = driver.lock().expect("driver lock poisoned").top_outcome();
                if let Some(outcome) = outcome {
                    dispatch_done(&done_hooks, outcome);
                    return;
                }
                match rx.recv().await {
                    Some(event) => {
                        let progress = {
                            let mut d = driver.lock().expect("driver lock poisoned");
                            d.handle_event(event);
                            d.rt.progress.current
                        };
                        for hook in progress_hooks.lock().expect("progress hooks poisoned").iter() {
                            hook(progress);
                        }
                    }
                    None => {
                        // Channel closed with no more events and no
                        // terminal state reached — every sender lives in
                        // `driver` or an adapter/timer it owns, so this
                        // can only happen after `Drop` has already aborted
                        // this very task; unreachable in practice.
                        return;
                    }
                }
            }
        });
        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Requests cancellation of the running tree. Idempotent:
    /// repeated calls have the same observable effect as one.
    pub fn cancel(&self) {
        self.driver.lock().expect("driver lock poisoned").cancel();
    }

    /// Drives the context to completion and returns the terminal outcome,
    /// optionally aborting early if `cancel` resolves first. Offered
    /// mainly for tests: unlike [`Self::start`], this awaits the run
    /// inline on the caller rather than handing it off to a background
    /// task.
    pub async fn run_blocking(&self, cancel: Option<oneshot::Receiver<()>>) -> DoneWith {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.wait_for_outcome().await;
        }

        let mut rx = self
            .rx
            .lock()
            .expect("rx lock poisoned")
            .take()
            .expect("rx taken exactly once, guarded by `started`");

        {
            let mut d = self.driver.lock().expect("driver lock poisoned");
            d.start();
        }

        let mut cancel = cancel;
        loop {
            if let Some(outcome) = self.driver.lock().expect("driver lock poisoned").top_outcome() {
                dispatch_done(&self.done_hooks, outcome);
                return outcome;
            }
            let wait_cancel = async {
                match cancel.as_mut() {
                    Some(c) => {
                        let _ = c.await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            let progress = {
                                let mut d = self.driver.lock().expect("driver lock poisoned");
                                d.handle_event(event);
                                d.rt.progress.current
                            };
                            for hook in self.progress_hooks.lock().expect("progress hooks poisoned").iter() {
                                hook(progress);
                            }
                        }
                        None => {
                            let outcome = self
                                .driver
                                .lock()
                                .expect("driver lock poisoned")
                                .top_outcome()
                                .unwrap_or(DoneWith::Cancel);
                            dispatch_done(&self.done_hooks, outcome);
                            return outcome;
                        }
                    }
                }
                _ = wait_cancel => {
                    self.driver.lock().expect("driver lock poisoned").cancel();
                }
            }
        }
    }

    /// Best-effort wait used when `run_blocking` is called after the run
    /// is already being driven elsewhere (by `start()`'s background task,
    /// or a prior `run_blocking` call) — misuse the engine tolerates
    /// rather than panics on.
    async fn wait_for_outcome(&self) -> DoneWith {
        loop {
            if let Some(outcome) = self.driver.lock().expect("driver lock poisoned").top_outcome() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

fn dispatch_done(hooks: &Arc<Mutex<Vec<DoneHook>>>, outcome: DoneWith) {
    let hooks = std::mem::take(&mut *hooks.lock().expect("done hooks poisoned"));
    for hook in hooks {
        hook(outcome);
    }
}

impl Drop for Controller {
    /// Dropping a running controller cancels the tree and abandons the
    /// driver loop immediately, so `on_storage_done`/`on_done` callbacks
    /// are not invoked — distinct from [`Self::cancel`], which lets
    /// the tree run its cancellation to a natural terminal state.
    fn drop(&mut self) {
        if let Ok(mut d) = self.driver.lock() {
            if !d.is_terminal() {
                d.cancel();
            }
        }
        if let Some(handle) = self.handle.lock().expect("handle lock poisoned").take() {
            handle.abort();
        }
    }
}
