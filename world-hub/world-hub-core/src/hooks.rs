//! Publish/subscribe registry for lifecycle and application hooks.
//!
//! Pre hooks (`preCreateActor`) are consulted with [`Hooks::call`] and may veto
//! the operation by returning [`Flow::Stop`]. On hooks (`createActor`) are
//! dispatched with [`Hooks::call_all`] once the authority has acknowledged.

use crate::document::{Document, DocumentKind};
use crate::error::HookError;
use crate::permissions::UserId;
use crate::transport::OperationOptions;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreCreate,
    PreUpdate,
    PreDelete,
    Create,
    Update,
    Delete,
}

impl HookEvent {
    fn prefix(self) -> &'static str {
        match self {
            HookEvent::PreCreate => "preCreate",
            HookEvent::PreUpdate => "preUpdate",
            HookEvent::PreDelete => "preDelete",
            HookEvent::Create => "create",
            HookEvent::Update => "update",
            HookEvent::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    Lifecycle(HookEvent, DocumentKind),
    Named(Cow<'static, str>),
}

impl Hook {
    pub fn pre_create(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::PreCreate, kind)
    }

    pub fn pre_update(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::PreUpdate, kind)
    }

    pub fn pre_delete(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::PreDelete, kind)
    }

    pub fn create(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::Create, kind)
    }

    pub fn update(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::Update, kind)
    }

    pub fn delete(kind: DocumentKind) -> Self {
        Hook::Lifecycle(HookEvent::Delete, kind)
    }

    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Hook::Named(name.into())
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Lifecycle(event, kind) => write!(f, "{}{}", event.prefix(), kind),
            Hook::Named(name) => f.write_str(name),
        }
    }
}

/// What a handler asks the dispatcher to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Arguments of a lifecycle hook.
pub struct HookContext<'a> {
    pub document: &'a Document,
    /// Candidate data for pre hooks, the acknowledged diff for update hooks.
    pub changes: Option<&'a Map<String, Value>>,
    pub options: &'a OperationOptions,
    pub user_id: &'a UserId,
}

pub enum HookArgs<'a> {
    Document(HookContext<'a>),
    Value(&'a Value),
}

impl<'a> HookArgs<'a> {
    pub fn document(&self) -> Option<&'a Document> {
        match self {
            HookArgs::Document(ctx) => Some(ctx.document),
            HookArgs::Value(_) => None,
        }
    }

    pub fn context(&self) -> Option<&HookContext<'a>> {
        match self {
            HookArgs::Document(ctx) => Some(ctx),
            HookArgs::Value(_) => None,
        }
    }
}

pub type HookHandler = Arc<dyn Fn(&HookArgs<'_>) -> anyhow::Result<Flow> + Send + Sync>;

/// Identifies a registration for [`Hooks::off`].
pub enum HookRef {
    Id(HookId),
    Handler(HookHandler),
}

impl From<HookId> for HookRef {
    fn from(id: HookId) -> Self {
        HookRef::Id(id)
    }
}

impl From<HookHandler> for HookRef {
    fn from(handler: HookHandler) -> Self {
        HookRef::Handler(handler)
    }
}

impl From<&HookHandler> for HookRef {
    fn from(handler: &HookHandler) -> Self {
        HookRef::Handler(handler.clone())
    }
}

#[derive(Clone)]
struct Registration {
    id: HookId,
    handler: HookHandler,
    once: bool,
}

#[derive(Default)]
pub struct Hooks {
    handlers: Mutex<HashMap<Hook, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock();
        f.debug_map()
            .entries(handlers.iter().map(|(hook, regs)| (hook.to_string(), regs.len())))
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, hook: Hook, handler: F) -> HookId
    where
        F: Fn(&HookArgs<'_>) -> anyhow::Result<Flow> + Send + Sync + 'static,
    {
        self.register(hook, Arc::new(handler), false)
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once<F>(&self, hook: Hook, handler: F) -> HookId
    where
        F: Fn(&HookArgs<'_>) -> anyhow::Result<Flow> + Send + Sync + 'static,
    {
        self.register(hook, Arc::new(handler), true)
    }

    pub fn on_handler(&self, hook: Hook, handler: HookHandler) -> HookId {
        self.register(hook, handler, false)
    }

    fn register(&self, hook: Hook, handler: HookHandler, once: bool) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%hook, ?id, once, "registered hook");
        self.handlers
            .lock()
            .entry(hook)
            .or_default()
            .push(Registration { id, handler, once });
        id
    }

    /// Remove a registration. Returns whether anything was removed.
    pub fn off(&self, hook: &Hook, target: impl Into<HookRef>) -> bool {
        let target = target.into();
        let mut handlers = self.handlers.lock();
        let Some(regs) = handlers.get_mut(hook) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|reg| match &target {
            HookRef::Id(id) => reg.id != *id,
            HookRef::Handler(handler) => !Arc::ptr_eq(&reg.handler, handler),
        });
        let removed = regs.len() != before;
        if regs.is_empty() {
            handlers.remove(hook);
        }
        removed
    }

    pub fn count(&self, hook: &Hook) -> usize {
        self.handlers.lock().get(hook).map_or(0, Vec::len)
    }

    /// Snapshot the handlers for `hook` so none run under the lock. Once
    /// handlers are taken out here.
    fn take(&self, hook: &Hook) -> Vec<Registration> {
        let mut handlers = self.handlers.lock();
        let Some(regs) = handlers.get_mut(hook) else {
            return Vec::new();
        };
        let snapshot = regs.clone();
        regs.retain(|reg| !reg.once);
        if regs.is_empty() {
            handlers.remove(hook);
        }
        snapshot
    }

    /// Run every handler in registration order. Failures are logged and the
    /// remaining handlers still run.
    pub fn call_all(&self, hook: &Hook, args: &HookArgs<'_>) {
        for reg in self.take(hook) {
            if let Err(err) = (reg.handler)(args) {
                tracing::warn!(%hook, id = ?reg.id, error = %err, "hook handler failed");
            }
        }
    }

    /// Run handlers until one returns [`Flow::Stop`]. Returns `Ok(false)` when
    /// the hook was suppressed.
    pub fn call(&self, hook: &Hook, args: &HookArgs<'_>) -> Result<bool, HookError> {
        let regs = self.take(hook);
        let mut consumed = 0;
        let mut outcome = Ok(true);
        for reg in &regs {
            consumed += 1;
            match (reg.handler)(args) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    tracing::debug!(%hook, id = ?reg.id, "hook suppressed");
                    outcome = Ok(false);
                    break;
                }
                Err(err) => {
                    outcome = Err(HookError {
                        hook: hook.to_string(),
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
        // Once handlers that never ran stay registered.
        self.restore_unrun(hook, &regs[consumed..]);
        outcome
    }

    fn restore_unrun(&self, hook: &Hook, unrun: &[Registration]) {
        let pending: Vec<_> = unrun.iter().filter(|r| r.once).cloned().collect();
        if pending.is_empty() {
            return;
        }
        let mut handlers = self.handlers.lock();
        let regs = handlers.entry(hook.clone()).or_default();
        regs.extend(pending);
        regs.sort_by_key(|r| r.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn value_args(value: &Value) -> HookArgs<'_> {
        HookArgs::Value(value)
    }

    #[test]
    fn lifecycle_hooks_display_like_event_names() {
        assert_eq!(Hook::pre_create(DocumentKind::ACTOR).to_string(), "preCreateActor");
        assert_eq!(Hook::update(DocumentKind::ITEM).to_string(), "updateItem");
        assert_eq!(Hook::named("ready").to_string(), "ready");
    }

    #[test]
    fn call_stops_at_first_veto() {
        let hooks = Hooks::new();
        let hook = Hook::named("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (n, flow) in [(1, Flow::Continue), (2, Flow::Stop), (3, Flow::Continue)] {
            let seen = seen.clone();
            hooks.on(hook.clone(), move |_| {
                seen.lock().push(n);
                Ok(flow)
            });
        }
        let value = Value::Null;
        assert_eq!(hooks.call(&hook, &value_args(&value)), Ok(false));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn call_all_skips_failing_handlers() {
        let hooks = Hooks::new();
        let hook = Hook::named("test");
        let count = Arc::new(AtomicUsize::new(0));
        hooks.on(hook.clone(), |_| anyhow::bail!("boom"));
        let c = count.clone();
        hooks.on(hook.clone(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Stop)
        });
        let c = count.clone();
        hooks.on(hook.clone(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        });
        hooks.call_all(&hook, &value_args(&Value::Null));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn call_reports_handler_errors() {
        let hooks = Hooks::new();
        let hook = Hook::pre_delete(DocumentKind::ACTOR);
        hooks.on(hook.clone(), |_| anyhow::bail!("nope"));
        let err = hooks.call(&hook, &value_args(&Value::Null)).unwrap_err();
        assert_eq!(err.hook, "preDeleteActor");
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn once_handlers_run_once_and_off_removes() {
        let hooks = Hooks::new();
        let hook = Hook::named("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hooks.once(hook.clone(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        });
        hooks.call_all(&hook, &value_args(&Value::Null));
        hooks.call_all(&hook, &value_args(&Value::Null));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let id = hooks.on(hook.clone(), |_| Ok(Flow::Continue));
        let handler: HookHandler =
            Arc::new(|_: &HookArgs<'_>| -> anyhow::Result<Flow> { Ok(Flow::Continue) });
        hooks.on_handler(hook.clone(), handler.clone());
        assert_eq!(hooks.count(&hook), 2);
        assert!(hooks.off(&hook, id));
        assert!(hooks.off(&hook, &handler));
        assert!(!hooks.off(&hook, id));
        assert_eq!(hooks.count(&hook), 0);
    }

    #[test]
    fn vetoed_call_keeps_unrun_once_handlers() {
        let hooks = Hooks::new();
        let hook = Hook::named("test");
        hooks.on(hook.clone(), |_| Ok(Flow::Stop));
        hooks.once(hook.clone(), |_| Ok(Flow::Continue));
        assert_eq!(hooks.call(&hook, &value_args(&Value::Null)), Ok(false));
        assert_eq!(hooks.count(&hook), 2);
    }
}
