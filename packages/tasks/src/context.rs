//! Store access handed to task handlers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::models::TaskId;

pub(crate) type SharedTransaction = Arc<Mutex<Transaction<'static, Postgres>>>;

/// Execution context passed to every handler call.
///
/// For atomic tasks every connection handed out is the task's transaction, so
/// the handler's writes commit or roll back together with its outcome.
#[derive(Clone)]
pub struct TaskContext {
    pool: PgPool,
    transaction: Option<SharedTransaction>,
    task_id: Option<TaskId>,
}

impl TaskContext {
    pub(crate) fn new(pool: PgPool, task_id: Option<TaskId>) -> Self {
        Self {
            pool,
            transaction: None,
            task_id,
        }
    }

    pub(crate) fn with_transaction(mut self, transaction: SharedTransaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// The pool. Writes through it bypass the task transaction.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The queued task being executed, `None` when run inline.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn is_atomic(&self) -> bool {
        self.transaction.is_some()
    }

    /// A connection for the handler's store work.
    ///
    /// Atomic tasks get the shared transaction; hold the returned guard only
    /// as long as needed.
    pub async fn connection(&self) -> Result<TaskConnection<'_>> {
        match &self.transaction {
            Some(transaction) => Ok(TaskConnection::Transaction(transaction.lock().await)),
            None => Ok(TaskConnection::Pooled(self.pool.acquire().await?)),
        }
    }
}

/// Either the task transaction or a pooled connection.
pub enum TaskConnection<'a> {
    Transaction(MutexGuard<'a, Transaction<'static, Postgres>>),
    Pooled(PoolConnection<Postgres>),
}

impl Deref for TaskConnection<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            TaskConnection::Transaction(tx) => &***tx,
            TaskConnection::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for TaskConnection<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            TaskConnection::Transaction(tx) => &mut ***tx,
            TaskConnection::Pooled(conn) => &mut **conn,
        }
    }
}
