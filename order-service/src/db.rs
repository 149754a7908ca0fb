use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use thiserror::Error;
use tracing::{info, warn};

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;
type PoolBuilder = bb8::Builder<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Upper bound on a single connection attempt before it counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id SERIAL PRIMARY KEY,
    user_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    status VARCHAR(50) DEFAULT 'pending',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    /// Connections kept warm; idle connections beyond this are reaped by the pool.
    pub max_idle: u32,
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    /// `n` attempts have failed and another one is due.
    Retrying(u32),
    Connected,
    Fatal,
}

impl ConnectState {
    pub fn failed_attempts(self) -> u32 {
        match self {
            ConnectState::Retrying(n) => n,
            _ => 0,
        }
    }
}

impl RetryPolicy {
    /// Pure transition function for the startup connection loop.
    pub fn advance(&self, state: ConnectState, attempt_succeeded: bool) -> ConnectState {
        match state {
            ConnectState::Connected | ConnectState::Fatal => state,
            _ if attempt_succeeded => ConnectState::Connected,
            _ => {
                let failed = state.failed_attempts() + 1;
                if failed >= self.max_attempts.max(1) {
                    ConnectState::Fatal
                } else {
                    ConnectState::Retrying(failed)
                }
            }
        }
    }

    /// How long to wait before the attempt due in `state`.
    pub fn delay_before(&self, state: ConnectState) -> Option<Duration> {
        match state {
            ConnectState::Retrying(_) => Some(self.delay),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to database after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("failed to create orders table: {0}")]
    Schema(String),
}

/// Runs `attempt` until it succeeds or `policy` gives up.
///
/// Blocks the caller for the whole retry window; this is meant to run before
/// the server starts accepting traffic.
pub async fn connect_with_retry<T, E, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, ConnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut state = ConnectState::Disconnected;

    loop {
        if let Some(delay) = policy.delay_before(state) {
            tokio::time::sleep(delay).await;
        }
        let ordinal = state.failed_attempts() + 1;

        match attempt().await {
            Ok(connection) => {
                state = policy.advance(state, true);
                info!(?state, "Database connection established on attempt {}/{}", ordinal, max_attempts);
                return Ok(connection);
            }
            Err(e) => {
                warn!("Attempt {}/{}: Failed to connect to database: {}", ordinal, max_attempts, e);
                state = policy.advance(state, false);
                if state == ConnectState::Fatal {
                    return Err(ConnectError::Exhausted {
                        attempts: ordinal,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Builds the pool, waiting out an unreachable database, then bootstraps the schema.
pub async fn connect(database_url: &str, settings: PoolSettings, policy: RetryPolicy) -> Result<DbPool, ConnectError> {
    let pool = connect_with_retry(policy, || open_pool(database_url, settings)).await?;

    ensure_schema(&pool)
        .await
        .map_err(|e| ConnectError::Schema(format!("{e:#}")))?;

    info!("Database initialized successfully");
    Ok(pool)
}

async fn open_pool(database_url: &str, settings: PoolSettings) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = pool_builder(settings).build(manager).await?;

    ping(&pool).await?;
    Ok(pool)
}

/// Applies `settings` within the bounds bb8 accepts.
fn pool_builder(settings: PoolSettings) -> PoolBuilder {
    let max_open = settings.max_open.max(1);

    bb8::Pool::builder()
        .max_size(max_open)
        .min_idle(Some(settings.max_idle.min(max_open)))
        .max_lifetime(lifetime_limit(settings.max_lifetime))
        .connection_timeout(CONNECT_TIMEOUT)
}

/// A zero lifetime means connections are never recycled for age.
fn lifetime_limit(max_lifetime: Duration) -> Option<Duration> {
    (!max_lifetime.is_zero()).then_some(max_lifetime)
}

pub async fn ping(pool: &DbPool) -> Result<()> {
    use diesel_async::RunQueryDsl;

    let mut conn = pool.get().await?;
    diesel::sql_query("SELECT 1").execute(&mut conn).await?;
    Ok(())
}

async fn ensure_schema(pool: &DbPool) -> Result<()> {
    use diesel_async::RunQueryDsl;

    let mut conn = pool.get().await?;
    diesel::sql_query(CREATE_ORDERS_TABLE).execute(&mut conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn success_connects_from_any_live_state() {
        let policy = policy(3);

        assert_eq!(policy.advance(ConnectState::Disconnected, true), ConnectState::Connected);
        assert_eq!(policy.advance(ConnectState::Retrying(2), true), ConnectState::Connected);
    }

    #[test]
    fn failures_count_up_then_turn_fatal() {
        let policy = policy(3);

        let state = policy.advance(ConnectState::Disconnected, false);
        assert_eq!(state, ConnectState::Retrying(1));
        let state = policy.advance(state, false);
        assert_eq!(state, ConnectState::Retrying(2));
        let state = policy.advance(state, false);
        assert_eq!(state, ConnectState::Fatal);
    }

    #[test]
    fn terminal_states_stay_put() {
        let policy = policy(3);

        assert_eq!(policy.advance(ConnectState::Fatal, true), ConnectState::Fatal);
        assert_eq!(policy.advance(ConnectState::Connected, false), ConnectState::Connected);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(policy(0).advance(ConnectState::Disconnected, false), ConnectState::Fatal);
    }

    #[test]
    fn only_retries_wait() {
        let policy = policy(3);

        assert_eq!(policy.delay_before(ConnectState::Disconnected), None);
        assert_eq!(policy.delay_before(ConnectState::Retrying(1)), Some(Duration::from_millis(1)));
    }

    #[test]
    fn zero_lifetime_means_unlimited() {
        assert_eq!(lifetime_limit(Duration::ZERO), None);
        assert_eq!(lifetime_limit(Duration::from_secs(300)), Some(Duration::from_secs(300)));
    }

    #[test]
    fn out_of_range_pool_settings_are_clamped() {
        // bb8 asserts on each of these when passed through unchanged.
        pool_builder(PoolSettings {
            max_open: 0,
            max_idle: 10,
            max_lifetime: Duration::ZERO,
        });
    }

    #[tokio::test]
    #[ignore = "needs a live Postgres at DATABASE_URL"]
    async fn connects_and_bootstraps_a_live_database() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let settings = PoolSettings {
            max_open: 4,
            max_idle: 2,
            max_lifetime: Duration::from_secs(60),
        };

        let pool = connect(&url, settings, policy(3)).await.unwrap();

        ping(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        assert!(pool.state().connections <= settings.max_open);
    }

    #[tokio::test]
    async fn retries_until_the_database_answers() {
        let calls = AtomicU32::new(0);

        let result = connect_with_retry(policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), ConnectError> = connect_with_retry(policy(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await;

        match result {
            Err(ConnectError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
