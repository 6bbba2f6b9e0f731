use std::future::Future;
use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tokio::task::JoinSet;

use crate::models::audit::AuditEvent;

/// Append-only audit sink. Logging never fails the operation that caused it.
pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Background writes that a short-lived process must wait for before its
/// runtime shuts down.
#[derive(Clone, Default)]
pub struct PendingWrites {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl PendingWrites {
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut tasks) = self.tasks.lock() {
            // reap finished writes so a long-running server does not accumulate handles
            while tasks.try_join_next().is_some() {}
            tasks.spawn(fut);
        }
    }

    /// Wait for every write spawned so far.
    pub async fn flush(&self) {
        let mut drained = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        while let Some(res) = drained.join_next().await {
            if let Err(e) = res {
                tracing::error!("audit write task failed: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Async audit log writer. Fires off a Tokio task to insert
/// the audit event into PG without blocking the response path.
/// Call [`PgAuditSink::flush`] before exiting a one-shot command.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
    pending: PendingWrites,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pending: PendingWrites::default(),
        }
    }

    pub async fn flush(&self) {
        self.pending.flush().await;
    }
}

impl AuditSink for PgAuditSink {
    fn log(&self, event: AuditEvent) {
        let pool = self.pool.clone();
        self.pending.spawn(async move {
            if let Err(e) = insert_audit_event(&pool, &event).await {
                tracing::error!(event_id = %event.id, action = event.action.as_str(), "failed to write audit event: {}", e);
            } else {
                tracing::debug!(event_id = %event.id, action = event.action.as_str(), "audit event recorded");
            }
        });
    }
}

async fn insert_audit_event(pool: &PgPool, event: &AuditEvent) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_events (
            id, created_at, entity_type, entity_id, action, actor, summary, metadata, tags
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.id)
    .bind(event.timestamp)
    .bind(event.entity_type)
    .bind(&event.entity_id)
    .bind(event.action.as_str())
    .bind(&event.actor)
    .bind(&event.summary)
    .bind(&event.metadata)
    .bind(&event.tags)
    .execute(pool)
    .await?;

    Ok(())
}

/// Keeps events in memory. Used by tests and `serve --memory`.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, event: AuditEvent) {
        tracing::debug!(action = event.action.as_str(), summary = %event.summary, "audit");
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_flush_waits_for_spawned_writes() {
        let pending = PendingWrites::default();
        let written = Arc::new(AtomicUsize::new(0));
        for i in 0..5u64 {
            let written = written.clone();
            pending.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                written.fetch_add(1, Ordering::SeqCst);
            });
        }

        pending.flush().await;
        assert_eq!(written.load(Ordering::SeqCst), 5);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_flush_on_clone_sees_writes_from_original() {
        let pending = PendingWrites::default();
        let handle = pending.clone();
        let written = Arc::new(AtomicUsize::new(0));
        let w = written.clone();
        pending.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            w.fetch_add(1, Ordering::SeqCst);
        });

        handle.flush().await;
        assert_eq!(written.load(Ordering::SeqCst), 1);
    }
}
