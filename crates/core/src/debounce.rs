/// Trailing-edge debouncer: a pending deadline plus the latest payload.
///
/// Every `schedule` replaces the payload and pushes the deadline out to
/// `now + window`; `poll` hands the payload back once the deadline passes.
/// Nothing is ever cancelled, a later call simply supersedes an earlier one.
#[derive(Debug)]
pub struct Debouncer<T> {
    window_ms: i64,
    pending: Option<Pending<T>>,
}

#[derive(Debug)]
struct Pending<T> {
    deadline: i64,
    payload: T,
}

impl<T> Debouncer<T> {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            pending: None,
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn schedule(&mut self, now: i64, payload: T) {
        self.pending = Some(Pending {
            deadline: now + self.window_ms,
            payload,
        });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<i64> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Takes the payload if its deadline has been reached.
    pub fn poll(&mut self, now: i64) -> Option<T> {
        match &self.pending {
            Some(pending) if now >= pending.deadline => self.pending.take().map(|p| p.payload),
            _ => None,
        }
    }

    /// Takes the payload regardless of the deadline.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|p| p.payload)
    }
}
