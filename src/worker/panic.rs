//! Panic capture for job handlers.
//!
//! The handler task runs inside a task-local slot. A process-wide panic
//! hook, installed once, writes the panic message and a backtrace into the
//! slot of whichever handler task is panicking. Panics outside a handler
//! task go to the previously installed hook unchanged.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::sync::{Arc, Mutex, Once};

use tokio::task::futures::TaskLocalFuture;

type Slot = Arc<Mutex<Option<String>>>;

tokio::task_local! {
    static PANIC_SLOT: Slot;
}

static INSTALL_HOOK: Once = Once::new();

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let captured = PANIC_SLOT
                .try_with(|slot| {
                    let trace = format!("{info}\n{}", Backtrace::force_capture());
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(trace);
                    }
                })
                .is_ok();
            if !captured {
                previous(info);
            }
        }));
    });
}

/// Collects the backtrace of a panic raised inside [`PanicCapture::scope`].
#[derive(Clone, Default)]
pub(crate) struct PanicCapture {
    slot: Slot,
}

impl PanicCapture {
    pub(crate) fn new() -> Self {
        install_hook();
        Self::default()
    }

    /// Run `fut` with this capture as the active slot.
    pub(crate) fn scope<F: Future>(&self, fut: F) -> TaskLocalFuture<Slot, F> {
        PANIC_SLOT.scope(Arc::clone(&self.slot), fut)
    }

    /// Take the captured trace, if the scoped future panicked.
    pub(crate) fn take(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Render a panic payload as text.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
