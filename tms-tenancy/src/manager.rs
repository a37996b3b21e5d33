//! Per-request tenant session manager.
//!
//! A [`TenantSessionManager`] is created for every request from the request's
//! [`RequestTenantContext`]. It owns at most one pooled session for the
//! lifetime of that request:
//!
//! - the session is acquired lazily on first data access
//! - right after acquisition the session's `search_path` is pinned to the
//!   request's partition, before any caller-visible statement runs
//! - every later data access in the same request reuses that session
//! - [`TenantSessionManager::release`] returns it to the pool exactly once;
//!   after that every data access fails with [`TenancyError::SessionReleased`]
//!
//! Calls are serialized through an async mutex, so statements run in the
//! order the request issues them.

use std::sync::Arc;

use tms_core::{PartitionKey, RequestTenantContext};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::entity::{DataHandle, EntityKind};
use crate::error::{TenancyError, TenancyResult};
use crate::session::{PooledSession, Row, SessionPool, SqlValue};

/// The statement that pins a session to a partition.
///
/// Tenant partitions keep `public` as a fallback so shared types stay visible;
/// the shared partition gets `public` alone.
pub fn isolation_directive(partition: &PartitionKey) -> String {
    if partition.is_public() {
        "SET search_path TO public".to_string()
    } else {
        format!("SET search_path TO {}, public", partition.quoted())
    }
}

/// Rejects statements that would move the session out of its partition.
///
/// Matching runs on the statement's structure only: comments and string
/// literals are blanked and quoted identifiers unquoted first. Dollar-quoted
/// bodies are scanned as code.
pub(crate) fn guard_search_path(sql: &str) -> TenancyResult<()> {
    let text = structural_text(sql).to_lowercase();

    for statement in text.split(';') {
        let tokens: Vec<&str> = statement
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();

        if changes_scope(&tokens) {
            return Err(TenancyError::IsolationViolation);
        }
    }
    Ok(())
}

fn changes_scope(tokens: &[&str]) -> bool {
    if tokens.contains(&"set_config") {
        return true;
    }

    for (i, pair) in tokens.windows(2).enumerate() {
        match (pair[0], pair[1]) {
            ("set", "search_path")
            | ("reset", "search_path")
            | ("reset", "all")
            | ("discard", "all") => return true,
            ("set", "session" | "local") => match tokens.get(i + 2) {
                Some(&"search_path") => return true,
                Some(&"schema") if !after_ddl(&tokens[..i]) => return true,
                _ => {}
            },
            // `ALTER ... SET SCHEMA` moves an object and `UPDATE ... SET schema` writes a column.
            ("set", "schema") if !after_ddl(&tokens[..i]) => return true,
            _ => {}
        }
    }
    false
}

fn after_ddl(preceding: &[&str]) -> bool {
    preceding.iter().any(|t| matches!(*t, "alter" | "update"))
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// `sql` with comments and string literals replaced by a space and quoted
/// identifiers reduced to their name.
fn structural_text(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
            }
            '/' if next == Some('*') => {
                let mut depth = 0usize;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
                out.push(' ');
            }
            '\'' => {
                let backslash_escapes = i > 0
                    && matches!(chars[i - 1], 'e' | 'E')
                    && (i < 2 || !is_word(chars[i - 2]));
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if backslash_escapes => i += 2,
                        '\'' if chars.get(i + 1) == Some(&'\'') => i += 2,
                        '\'' => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                out.push(' ');
            }
            '"' => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == '"' {
                        if chars.get(i + 1) == Some(&'"') {
                            out.push('"');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '$' if i == 0 || !is_word(chars[i - 1]) => match dollar_tag(&chars, i) {
                Some(tag_len) => {
                    let tag = &chars[i..i + tag_len];
                    let body_start = i + tag_len;
                    let body_end = (body_start..chars.len())
                        .find(|&j| chars[j..].starts_with(tag))
                        .unwrap_or(chars.len());
                    let body: String = chars[body_start..body_end].iter().collect();
                    out.push(' ');
                    out.push_str(&structural_text(&body));
                    out.push(' ');
                    i = (body_end + tag_len).min(chars.len());
                }
                None => {
                    out.push(c);
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Length of the `$tag$` opening at `start`, if there is one. `$1` is a parameter.
fn dollar_tag(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if let Some(&first) = chars.get(j) {
        if first.is_alphabetic() || first == '_' {
            while chars.get(j).is_some_and(|&c| c.is_alphanumeric() || c == '_') {
                j += 1;
            }
        }
    }
    (chars.get(j) == Some(&'$')).then_some(j + 1 - start)
}

enum SessionSlot {
    Vacant,
    Active(Box<dyn PooledSession>),
    Released,
}

pub struct TenantSessionManager {
    context: RequestTenantContext,
    pool: Arc<dyn SessionPool>,
    slot: Mutex<SessionSlot>,
}

impl TenantSessionManager {
    pub fn new(context: RequestTenantContext, pool: Arc<dyn SessionPool>) -> Arc<Self> {
        Arc::new(Self {
            context,
            pool,
            slot: Mutex::new(SessionSlot::Vacant),
        })
    }

    pub fn context(&self) -> &RequestTenantContext {
        &self.context
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.context.partition_key
    }

    /// Handle to one entity table. Acquires the request's session if this is
    /// the first data access.
    pub async fn data_handle(self: &Arc<Self>, kind: EntityKind) -> TenancyResult<DataHandle> {
        {
            let mut slot = self.slot.lock().await;
            self.ensure_session(&mut slot).await?;
        }
        Ok(DataHandle::new(Arc::clone(self), kind))
    }

    pub async fn raw_query(&self, sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>> {
        guard_search_path(sql)?;
        let mut slot = self.slot.lock().await;
        let session = self.ensure_session(&mut slot).await?;
        session.fetch(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> TenancyResult<u64> {
        guard_search_path(sql)?;
        let mut slot = self.slot.lock().await;
        let session = self.ensure_session(&mut slot).await?;
        session.execute(sql, params).await
    }

    /// Multi-statement scripts, for migrations and transaction control.
    pub(crate) async fn batch(&self, script: &str) -> TenancyResult<()> {
        guard_search_path(script)?;
        let mut slot = self.slot.lock().await;
        let session = self.ensure_session(&mut slot).await?;
        session.batch(script).await
    }

    /// Return the session to the pool. Safe to call any number of times.
    pub async fn release(&self) {
        let previous = {
            let mut slot = self.slot.lock().await;
            std::mem::replace(&mut *slot, SessionSlot::Released)
        };

        if let SessionSlot::Active(session) = previous {
            session.release().await;
            debug!(partition = %self.partition_key(), "tenant session released");
        }
    }

    /// Whether a session is currently held.
    pub async fn is_active(&self) -> bool {
        matches!(*self.slot.lock().await, SessionSlot::Active(_))
    }

    pub async fn is_released(&self) -> bool {
        matches!(*self.slot.lock().await, SessionSlot::Released)
    }

    async fn ensure_session<'s>(
        &self,
        slot: &'s mut SessionSlot,
    ) -> TenancyResult<&'s mut Box<dyn PooledSession>> {
        if matches!(slot, SessionSlot::Vacant) {
            let session = self.open_session().await?;
            *slot = SessionSlot::Active(session);
        }

        match slot {
            SessionSlot::Active(session) => Ok(session),
            SessionSlot::Released => Err(TenancyError::SessionReleased),
            SessionSlot::Vacant => Err(TenancyError::Internal(
                "tenant session slot still vacant after acquisition".to_string(),
            )),
        }
    }

    async fn open_session(&self) -> TenancyResult<Box<dyn PooledSession>> {
        let partition = self.partition_key();
        let mut session = self.pool.acquire().await?;

        if let Err(err) = session.batch(&isolation_directive(partition)).await {
            warn!(partition = %partition, error = %err, "isolation directive failed, discarding session");
            session.discard().await;
            return Err(TenancyError::Isolation {
                partition: partition.to_string(),
                reason: err.to_string(),
            });
        }

        debug!(partition = %partition, "tenant session acquired");
        Ok(session)
    }
}

impl Drop for TenantSessionManager {
    fn drop(&mut self) {
        let slot = std::mem::replace(self.slot.get_mut(), SessionSlot::Released);
        let SessionSlot::Active(session) = slot else {
            return;
        };

        warn!(partition = %self.context.partition_key, "tenant session dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(session.release());
            }
            // Without a runtime the session is dropped in place; pools return
            // dropped connections on their own.
            Err(_) => drop(session),
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryPool;
    use crate::migrate::MigrationSet;
    use tms_core::Role;

    fn ctx(key: &str) -> RequestTenantContext {
        RequestTenantContext {
            partition_key: PartitionKey::parse(key).unwrap(),
            caller_id: Some("user-1".to_string()),
            caller_role: Some(Role::Operator),
            tenant_uuid: None,
        }
    }

    fn manager(pool: &MemoryPool, key: &str) -> Arc<TenantSessionManager> {
        TenantSessionManager::new(ctx(key), Arc::new(pool.clone()))
    }

    #[test]
    fn directive_quotes_the_partition() {
        let key = PartitionKey::parse("tenant_a").unwrap();
        assert_eq!(isolation_directive(&key), "SET search_path TO \"tenant_a\", public");
        assert_eq!(isolation_directive(&PartitionKey::public()), "SET search_path TO public");
    }

    #[test]
    fn guard_rejects_scope_changes() {
        for sql in [
            "SET search_path TO other",
            "set  SESSION search_path = other",
            "SET LOCAL search_path TO x",
            "RESET search_path",
            "RESET ALL",
            "DISCARD ALL",
            "SELECT set_config('search_path', 'x', false)",
            "select set_config( 'search_path','x',true)",
            "SET SCHEMA 'tenant_b'",
            "set local schema 'tenant_b'",
            "SELECT set_config($1, $2, false)",
            "SELECT pg_catalog.set_config($1, $2, false)",
            "SET \"search_path\" TO tenant_b",
            "/* scope */ SET search_path TO tenant_b",
            "SELECT 1; SET SCHEMA 'tenant_b'",
            "ALTER ROLE app SET search_path TO tenant_b",
            "DO $$ BEGIN PERFORM set_config('search_path', 'tenant_b', false); END $$",
            "DO $body$ BEGIN SET search_path TO tenant_b; END $body$",
        ] {
            assert!(
                matches!(guard_search_path(sql), Err(TenancyError::IsolationViolation)),
                "{sql} should be rejected"
            );
        }
    }

    #[test]
    fn guard_accepts_ordinary_statements() {
        for sql in [
            "SELECT * FROM orders WHERE status = $1",
            "SELECT * FROM \"orders\" WHERE \"loadDetails\" LIKE '%preset all%'",
            "SELECT 'SET search_path TO x' AS hint",
            "SELECT 1 AS one -- reset all later",
            "UPDATE \"tenant\" SET \"schema\" = $1 WHERE \"id\" = $2",
            "SELECT E'it\\'s set_config' AS quote",
            "SELECT $1::text, $2::int",
        ] {
            assert!(guard_search_path(sql).is_ok(), "{sql} should be accepted");
        }

        for migration in MigrationSet::shared()
            .migrations()
            .iter()
            .chain(MigrationSet::tenant().migrations())
        {
            assert!(guard_search_path(&migration.sql).is_ok(), "{}", migration.label());
        }
    }

    #[tokio::test]
    async fn no_data_access_means_no_session() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");
        m.release().await;

        assert_eq!(pool.acquired(), 0);
        assert_eq!(pool.released(), 0);
    }

    #[tokio::test]
    async fn one_session_per_request() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");

        let orders = m.data_handle(EntityKind::Order).await.unwrap();
        let drivers = m.data_handle(EntityKind::Driver).await.unwrap();
        orders.find(10, 0).await.unwrap();
        drivers.count().await.unwrap();
        m.raw_query("SELECT 1", &[]).await.unwrap();

        assert_eq!(pool.acquired(), 1);

        let log = pool.statements_for(0);
        assert_eq!(log[0].sql, "SET search_path TO \"tenant_a\", public");
        assert_eq!(
            log.iter().filter(|s| s.sql.starts_with("SET search_path")).count(),
            1
        );
        assert!(log.iter().skip(1).all(|s| s.scope.as_deref() == Some("tenant_a")));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");
        m.execute("DELETE FROM orders", &[]).await.unwrap();

        m.release().await;
        m.release().await;
        m.release().await;

        assert_eq!(pool.released(), 1);
        assert_eq!(pool.open_sessions(), 0);
        assert!(m.is_released().await);
    }

    #[tokio::test]
    async fn access_after_release_fails() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");
        m.release().await;

        let err = m.raw_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, TenancyError::SessionReleased));
        assert!(matches!(
            m.data_handle(EntityKind::Order).await,
            Err(TenancyError::SessionReleased)
        ));
        assert_eq!(pool.acquired(), 0);
    }

    #[tokio::test]
    async fn acquisition_failure_propagates() {
        let pool = MemoryPool::new();
        pool.fail_acquire(true);
        let m = manager(&pool, "tenant_a");

        let err = m.raw_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, TenancyError::Acquisition(_)));
        assert!(!m.is_active().await);
    }

    #[tokio::test]
    async fn directive_failure_discards_the_session() {
        let pool = MemoryPool::new();
        pool.fail_on("SET search_path");
        let m = manager(&pool, "tenant_a");

        let err = m.raw_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, TenancyError::Isolation { .. }));
        assert_eq!(pool.discarded(), 1);
        assert_eq!(pool.released(), 0);
        assert!(!m.is_active().await);
    }

    #[tokio::test]
    async fn scope_change_is_rejected_before_reaching_the_session() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");

        let err = m.execute("SET search_path TO tenant_b", &[]).await.unwrap_err();
        assert!(matches!(err, TenancyError::IsolationViolation));
        assert_eq!(pool.acquired(), 0);
    }

    #[tokio::test]
    async fn dropping_an_active_manager_releases() {
        let pool = MemoryPool::new();
        {
            let m = manager(&pool, "tenant_a");
            m.raw_query("SELECT 1", &[]).await.unwrap();
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.released(), 1);
        assert_eq!(pool.open_sessions(), 0);
    }

    #[test]
    fn drop_outside_a_runtime_frees_the_session() {
        let pool = MemoryPool::new();
        let m = manager(&pool, "tenant_a");
        tokio_test::block_on(m.raw_query("SELECT 1", &[])).unwrap();

        drop(m);
        assert_eq!(pool.released(), 1);
    }
}
