//! Contract with the transaction service and an in-process implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    None,
    /// Session transaction started by the client; the request never ends it.
    Local,
    /// Wraps a single request; the request commits or rolls it back.
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub session_id: String,
    pub transaction_id: Option<String>,
    pub scope: TransactionScope,
}

impl TransactionContext {
    pub fn is_transactional(&self) -> bool {
        self.scope != TransactionScope::None
    }
}

pub trait TransactionService: Send + Sync {
    fn get_or_create_context(&self, session_id: &str) -> Result<TransactionContext>;

    fn begin(&self, context: &mut TransactionContext, scope: TransactionScope) -> Result<()>;

    fn commit(&self, context: &TransactionContext) -> Result<()>;

    fn rollback(&self, context: &TransactionContext) -> Result<()>;

    fn suspend(&self, context: &TransactionContext) -> Result<()>;

    fn resume(&self, context: &TransactionContext) -> Result<()>;

    /// Marks the transaction rollback-only. Must not block.
    fn cancel(&self, context: &TransactionContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOp {
    Begin,
    Commit,
    Rollback,
    Suspend,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub op: TransactionOp,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct LocalState {
    /// Session id to its open local transaction.
    sessions: HashMap<String, String>,
    active: HashSet<String>,
    rollback_only: HashSet<String>,
    events: Vec<TransactionEvent>,
}

/// In-memory transaction service that records every operation.
#[derive(Default)]
pub struct LocalTransactionService {
    next_id: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalTransactionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a client-driven transaction on `session_id`.
    pub fn begin_local(&self, session_id: &str) -> String {
        let id = self.next_transaction_id();
        let mut state = self.state.lock();
        state.sessions.insert(session_id.to_string(), id.clone());
        state.active.insert(id.clone());
        record(&mut state, &id, TransactionOp::Begin);
        id
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.state.lock().events.clone()
    }

    pub fn ops_for(&self, transaction_id: &str) -> Vec<TransactionOp> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .map(|e| e.op)
            .collect()
    }

    pub fn is_active(&self, transaction_id: &str) -> bool {
        self.state.lock().active.contains(transaction_id)
    }

    fn next_transaction_id(&self) -> String {
        format!("tx-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn record(state: &mut LocalState, transaction_id: &str, op: TransactionOp) {
    state.events.push(TransactionEvent {
        transaction_id: transaction_id.to_string(),
        op,
        at: Utc::now(),
    });
}

fn transaction_error(transaction_id: &str, op: TransactionOp, message: String) -> SluiceError {
    SluiceError::new(ErrorCode::TransactionFailed, message).with_context(
        ErrorContext::Transaction {
            transaction_id: transaction_id.to_string(),
            operation: format!("{:?}", op).to_lowercase(),
        },
    )
}

impl LocalTransactionService {
    /// Applies `op` to the context's transaction, if it has one.
    fn apply(&self, context: &TransactionContext, op: TransactionOp) -> Result<()> {
        let Some(id) = context.transaction_id.as_deref() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if !state.active.contains(id) {
            return Err(transaction_error(
                id,
                op,
                format!("Transaction {} is not active", id),
            ));
        }
        match op {
            TransactionOp::Commit if state.rollback_only.contains(id) => {
                state.active.remove(id);
                state.rollback_only.remove(id);
                record(&mut state, id, TransactionOp::Rollback);
                return Err(transaction_error(
                    id,
                    op,
                    format!("Transaction {} was marked rollback-only", id),
                ));
            }
            TransactionOp::Commit | TransactionOp::Rollback => {
                state.active.remove(id);
                state.rollback_only.remove(id);
                state.sessions.retain(|_, tx| tx.as_str() != id);
            }
            TransactionOp::Cancel => {
                state.rollback_only.insert(id.to_string());
            }
            _ => {}
        }
        record(&mut state, id, op);
        debug!(target: "request", transaction_id = id, op = ?op, "Transaction operation");
        Ok(())
    }
}

impl TransactionService for LocalTransactionService {
    fn get_or_create_context(&self, session_id: &str) -> Result<TransactionContext> {
        let state = self.state.lock();
        Ok(match state.sessions.get(session_id) {
            Some(id) => TransactionContext {
                session_id: session_id.to_string(),
                transaction_id: Some(id.clone()),
                scope: TransactionScope::Local,
            },
            None => TransactionContext {
                session_id: session_id.to_string(),
                transaction_id: None,
                scope: TransactionScope::None,
            },
        })
    }

    fn begin(&self, context: &mut TransactionContext, scope: TransactionScope) -> Result<()> {
        if context.is_transactional() {
            return Err(SluiceError::new(
                ErrorCode::TransactionFailed,
                format!(
                    "Session {} already has a transaction in scope {:?}",
                    context.session_id, context.scope
                ),
            ));
        }
        let id = self.next_transaction_id();
        let mut state = self.state.lock();
        state.active.insert(id.clone());
        record(&mut state, &id, TransactionOp::Begin);
        drop(state);

        debug!(target: "request", transaction_id = %id, scope = ?scope, "Transaction started");
        context.transaction_id = Some(id);
        context.scope = scope;
        Ok(())
    }

    fn commit(&self, context: &TransactionContext) -> Result<()> {
        self.apply(context, TransactionOp::Commit)
    }

    fn rollback(&self, context: &TransactionContext) -> Result<()> {
        self.apply(context, TransactionOp::Rollback)
    }

    fn suspend(&self, context: &TransactionContext) -> Result<()> {
        self.apply(context, TransactionOp::Suspend)
    }

    fn resume(&self, context: &TransactionContext) -> Result<()> {
        self.apply(context, TransactionOp::Resume)
    }

    fn cancel(&self, context: &TransactionContext) -> Result<()> {
        self.apply(context, TransactionOp::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_scope_lifecycle() {
        let service = LocalTransactionService::new();
        let mut ctx = service.get_or_create_context("s1").unwrap();
        assert_eq!(ctx.scope, TransactionScope::None);

        service.begin(&mut ctx, TransactionScope::Request).unwrap();
        let id = ctx.transaction_id.clone().unwrap();
        service.suspend(&ctx).unwrap();
        service.resume(&ctx).unwrap();
        service.commit(&ctx).unwrap();

        assert!(!service.is_active(&id));
        assert_eq!(
            service.ops_for(&id),
            vec![
                TransactionOp::Begin,
                TransactionOp::Suspend,
                TransactionOp::Resume,
                TransactionOp::Commit
            ]
        );
        let err = service.commit(&ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::TransactionFailed);
    }

    #[test]
    fn test_cancelled_transaction_cannot_commit() {
        let service = LocalTransactionService::new();
        let mut ctx = service.get_or_create_context("s1").unwrap();
        service.begin(&mut ctx, TransactionScope::Request).unwrap();
        service.cancel(&ctx).unwrap();

        assert!(service.commit(&ctx).is_err());
        let id = ctx.transaction_id.unwrap();
        assert_eq!(service.ops_for(&id).last(), Some(&TransactionOp::Rollback));
    }

    #[test]
    fn test_session_transaction_is_local_scope() {
        let service = LocalTransactionService::new();
        let id = service.begin_local("s1");
        let mut ctx = service.get_or_create_context("s1").unwrap();
        assert_eq!(ctx.scope, TransactionScope::Local);
        assert_eq!(ctx.transaction_id.as_deref(), Some(id.as_str()));
        assert!(service.begin(&mut ctx, TransactionScope::Request).is_err());
        assert_eq!(
            service.get_or_create_context("s2").unwrap().scope,
            TransactionScope::None
        );
    }
}
