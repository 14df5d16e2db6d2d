//! Scripted fault injection for [`super::MemoryStore`]

use crate::error::StoreError;
use parking_lot::Mutex;

/// Store operation a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Insert,
    Replace,
    Remove,
}

/// A scripted failure
///
/// By default a fault matches any operation on any key and fires once.
#[derive(Debug, Clone)]
pub struct Fault {
    op: Option<StoreOp>,
    key_prefix: Option<String>,
    error: StoreError,
    skip: usize,
    times: usize,
    apply_first: bool,
}

impl Fault {
    pub fn new(error: StoreError) -> Self {
        Self {
            op: None,
            key_prefix: None,
            error,
            skip: 0,
            times: 1,
            apply_first: false,
        }
    }

    /// Only match this operation
    pub fn on(mut self, op: StoreOp) -> Self {
        self.op = Some(op);
        self
    }

    /// Only match keys starting with `prefix`
    pub fn key(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Let the first `n` matching operations through before firing
    pub fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Fire this many times (`usize::MAX` for every match, `0` never)
    pub fn times(mut self, n: usize) -> Self {
        self.times = n;
        self
    }

    /// Apply the mutation, then report the error (an ambiguous outcome)
    pub fn after_applying(mut self) -> Self {
        self.apply_first = true;
        self
    }

    fn matches(&self, op: StoreOp, key: &str) -> bool {
        self.op.is_none_or(|o| o == op)
            && self
                .key_prefix
                .as_deref()
                .is_none_or(|prefix| key.starts_with(prefix))
    }
}

/// A fault that fired for one operation
#[derive(Debug)]
pub(crate) struct Triggered {
    pub error: StoreError,
    pub apply_first: bool,
}

#[derive(Default)]
pub(crate) struct FaultInjector {
    faults: Mutex<Vec<Fault>>,
}

impl FaultInjector {
    pub fn push(&self, fault: Fault) {
        if fault.times == 0 {
            return;
        }
        self.faults.lock().push(fault);
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Consume the first fault matching this operation, if any
    pub fn check(&self, op: StoreOp, key: &str) -> Option<Triggered> {
        let mut faults = self.faults.lock();
        let index = faults.iter().position(|f| f.matches(op, key))?;

        let fault = &mut faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }

        let triggered = Triggered {
            error: fault.error.clone(),
            apply_first: fault.apply_first,
        };

        if fault.times != usize::MAX {
            fault.times -= 1;
            if fault.times == 0 {
                faults.remove(index);
            }
        }

        Some(triggered)
    }
}
