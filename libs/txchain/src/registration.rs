//! Disposable registration handles

use parking_lot::Mutex;
use std::fmt;

type Callback = Box<dyn FnOnce() + Send>;

/// Handle whose release runs a teardown callback exactly once.
///
/// `close` may be called any number of times from any thread; only the
/// first call runs the callback.
pub struct Registration {
    callback: Mutex<Option<Callback>>,
}

impl Registration {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Registration with nothing to tear down
    pub fn noop() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    /// Run the callback if it has not run yet; returns true for the call that ran it
    pub fn close(&self) -> bool {
        // take under the lock, run outside it
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.callback.lock().is_none()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("closed", &self.is_closed())
            .finish()
    }
}
