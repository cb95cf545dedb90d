use std::sync::atomic::{AtomicBool, Ordering};

/// Transaction and write state of one connection.
#[derive(Debug, Default)]
pub struct Operator {
    in_transaction: AtomicBool,
    writing: AtomicBool,
}

impl Operator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.in_transaction.store(true, Ordering::Release);
    }

    pub fn end(&self) {
        self.in_transaction.store(false, Ordering::Release);
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Record that a statement wrote to the database.
    pub fn mark_writing(&self) {
        self.writing.store(true, Ordering::Release);
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Clear the writing flag, returning whether it was set.
    pub fn take_writing(&self) -> bool {
        self.writing.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_writing_clears() {
        let op = Operator::new();
        assert!(!op.take_writing());
        op.mark_writing();
        assert!(op.is_writing());
        assert!(op.take_writing());
        assert!(!op.is_writing());
    }

    #[test]
    fn test_transaction_flag() {
        let op = Operator::new();
        op.begin();
        assert!(op.in_transaction());
        op.end();
        assert!(!op.in_transaction());
    }
}
