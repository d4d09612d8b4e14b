use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 進行中フラグ。ドロップで下ろす
#[derive(Debug)]
pub(crate) struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    /// 既に立っていれば `None`
    pub(crate) fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag.clone()))
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
