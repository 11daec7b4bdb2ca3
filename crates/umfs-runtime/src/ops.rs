//! Operation table
//!
//! A filesystem implementation registers one [`Handler`] per operation it
//! supports. Any subset may be present; for the rest the [`DefaultPolicy`]
//! decides what the kernel is told.

use std::collections::HashMap;

use nix::errno::Errno;
use umfs_core::request::{AdminOp, CacheOp, Operation, VfsOp, VnOp};

use crate::dispatcher::OpContext;

/// Outcome of a handler; the errno goes verbatim into the reply
pub type HandlerResult = Result<(), Errno>;

/// One filesystem capability
///
/// Handlers take `&self`: several continuations may be suspended inside
/// the same handler at once.
pub trait Handler {
    fn call(&self, ctx: &mut OpContext<'_>) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut OpContext<'_>) -> HandlerResult,
{
    fn call(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        self(ctx)
    }
}

/// Answer for an operation without a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Report success with an empty payload
    Succeed,
    /// Report this errno
    Fail(Errno),
}

impl Fallback {
    pub fn into_result(self) -> HandlerResult {
        match self {
            Fallback::Succeed => Ok(()),
            Fallback::Fail(e) => Err(e),
        }
    }
}

/// Per-operation answers for missing handlers
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    table: HashMap<Operation, Fallback>,
    otherwise: Fallback,
}

impl DefaultPolicy {
    /// Succeed for lifecycle and hint operations that need no work,
    /// `EOPNOTSUPP` for everything else
    pub fn standard() -> Self {
        let benign = [
            Operation::Vfs(VfsOp::Unmount),
            Operation::Vfs(VfsOp::Sync),
            Operation::Vfs(VfsOp::Suspend),
            Operation::Vn(VnOp::Open),
            Operation::Vn(VnOp::Close),
            Operation::Vn(VnOp::Access),
            Operation::Vn(VnOp::Seek),
            Operation::Vn(VnOp::Fsync),
            Operation::Vn(VnOp::Inactive),
            Operation::Vn(VnOp::Reclaim),
            Operation::Vn(VnOp::Abortop),
            Operation::Vn(VnOp::Print),
            Operation::Cache(CacheOp::Write),
            Operation::Admin(AdminOp::Error),
        ];
        let mut table: HashMap<_, _> = benign.into_iter().map(|op| (op, Fallback::Succeed)).collect();
        table.insert(Operation::Vn(VnOp::Pathconf), Fallback::Fail(Errno::EINVAL));
        Self {
            table,
            otherwise: Fallback::Fail(Errno::EOPNOTSUPP),
        }
    }

    /// Override the answer for one operation
    pub fn set(&mut self, op: Operation, fallback: Fallback) -> &mut Self {
        self.table.insert(op, fallback);
        self
    }

    /// Answer for operations not listed
    pub fn otherwise(&mut self, fallback: Fallback) -> &mut Self {
        self.otherwise = fallback;
        self
    }

    pub fn fallback(&self, op: Operation) -> Fallback {
        self.table.get(&op).copied().unwrap_or(self.otherwise)
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Registered handlers plus the policy for the missing ones
#[derive(Default)]
pub struct OperationTable {
    handlers: HashMap<Operation, Box<dyn Handler>>,
    policy: DefaultPolicy,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `op`, replacing any previous one
    pub fn set(&mut self, op: Operation, handler: impl Handler + 'static) {
        self.handlers.insert(op, Box::new(handler));
    }

    /// Register a closure for `op`
    pub fn on<F>(&mut self, op: Operation, f: F)
    where
        F: Fn(&mut OpContext<'_>) -> HandlerResult + 'static,
    {
        self.set(op, f);
    }

    pub fn get(&self, op: Operation) -> Option<&dyn Handler> {
        self.handlers.get(&op).map(|h| h.as_ref())
    }

    pub fn contains(&self, op: Operation) -> bool {
        self.handlers.contains_key(&op)
    }

    pub fn policy(&self) -> &DefaultPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut DefaultPolicy {
        &mut self.policy
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ops: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        ops.sort();
        f.debug_struct("OperationTable")
            .field("handlers", &ops)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_policy() {
        let p = DefaultPolicy::standard();
        assert_eq!(p.fallback(Operation::Vn(VnOp::Reclaim)), Fallback::Succeed);
        assert_eq!(
            p.fallback(Operation::Vn(VnOp::Read)),
            Fallback::Fail(Errno::EOPNOTSUPP)
        );
        assert_eq!(
            p.fallback(Operation::Vn(VnOp::Pathconf)),
            Fallback::Fail(Errno::EINVAL)
        );
    }

    #[test]
    fn test_policy_overrides() {
        let mut p = DefaultPolicy::standard();
        p.set(Operation::Vn(VnOp::Read), Fallback::Fail(Errno::EIO))
            .otherwise(Fallback::Succeed);
        assert_eq!(
            p.fallback(Operation::Vn(VnOp::Read)),
            Fallback::Fail(Errno::EIO)
        );
        assert_eq!(p.fallback(Operation::Vn(VnOp::Write)), Fallback::Succeed);
        assert_eq!(Fallback::Fail(Errno::EIO).into_result(), Err(Errno::EIO));
    }

    #[test]
    fn test_table_lookup() {
        let mut table = OperationTable::new();
        assert!(table.is_empty());
        table.on(Operation::Vn(VnOp::Getattr), |_ctx| Ok(()));
        assert!(table.contains(Operation::Vn(VnOp::Getattr)));
        assert!(table.get(Operation::Vn(VnOp::Lookup)).is_none());
        assert_eq!(table.len(), 1);
    }
}
