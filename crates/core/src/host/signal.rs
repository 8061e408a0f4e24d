use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

type AbortHook = Box<dyn FnOnce()>;

#[derive(Default)]
struct AbortInner {
    aborted: Cell<bool>,
    hooks: RefCell<Vec<AbortHook>>,
}

/// Cancellation token shared between a registration and the platform.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<AbortInner>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Runs `hook` once the signal aborts, or immediately if it already has.
    pub fn on_abort(&self, hook: impl FnOnce() + 'static) {
        if self.aborted() {
            hook();
            return;
        }
        self.inner.hooks.borrow_mut().push(Box::new(hook));
    }

    pub fn same_as(&self, other: &AbortSignal) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn abort(&self) {
        if self.signal.inner.aborted.replace(true) {
            return;
        }
        // Hooks may touch the registry, so none of our borrows can be live.
        let hooks = std::mem::take(&mut *self.signal.inner.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }
}
