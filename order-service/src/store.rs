use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::QueryResult;
use diesel_async::RunQueryDsl;
use futures::StreamExt;
use tracing::{instrument, warn};

use crate::db::{self, DbPool};
use crate::models::{NewOrder, Order};
use crate::schema::orders;

pub const LIST_LIMIT: i64 = 100;

/// Typed access to the orders table. Orders are only ever inserted and read.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Most recent first, at most `limit` rows.
    async fn list_recent(&self, limit: i64) -> Result<Vec<Order>>;

    /// Inserts the order and returns the id the database assigned to it.
    async fn create(&self, new_order: NewOrder) -> Result<i32>;
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn ping(&self) -> Result<()> {
        db::ping(&self.pool).await
    }

    #[instrument(name = "get_orders", skip(self))]
    async fn list_recent(&self, limit: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<QueryResult<Order>> = orders::table
            .select(Order::as_select())
            .order(orders::created_at.desc())
            .limit(limit)
            .load_stream::<Order>(&mut conn)
            .await?
            .collect()
            .await;

        Ok(keep_decoded(rows))
    }

    #[instrument(name = "create_order", skip(self))]
    async fn create(&self, new_order: NewOrder) -> Result<i32> {
        let mut conn = self.pool.get().await?;

        let id = diesel::insert_into(orders::table)
            .values(&new_order)
            .returning(orders::id)
            .get_result::<i32>(&mut conn)
            .await?;

        Ok(id)
    }
}

/// Drops rows that failed to load, logging each, so one bad row never hides the rest.
fn keep_decoded(rows: Vec<QueryResult<Order>>) -> Vec<Order> {
    rows.into_iter()
        .filter_map(|row| match row {
            Ok(order) => Some(order),
            Err(e) => {
                warn!("Failed to scan order: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use diesel::result::Error as DieselError;

    use super::*;

    fn order(id: i32) -> Order {
        NewOrder::pending(1, 42, 2).into_order(id, Utc::now().naive_utc())
    }

    #[test]
    fn undecodable_rows_are_skipped() {
        let rows = vec![
            Ok(order(3)),
            Err(DieselError::DeserializationError("unexpected null for status".into())),
            Ok(order(1)),
        ];

        let kept = keep_decoded(rows);

        assert_eq!(kept.iter().map(|o| o.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[tokio::test]
    #[ignore = "needs a live Postgres at DATABASE_URL"]
    async fn created_orders_come_back_newest_first() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let settings = db::PoolSettings {
            max_open: 2,
            max_idle: 1,
            max_lifetime: std::time::Duration::from_secs(60),
        };
        let policy = db::RetryPolicy {
            max_attempts: 3,
            delay: std::time::Duration::from_millis(100),
        };
        let store = PgOrderStore::new(db::connect(&url, settings, policy).await.unwrap());

        store.ping().await.unwrap();
        let first = store.create(NewOrder::pending(1, 42, 3)).await.unwrap();
        let second = store.create(NewOrder::pending(1, 43, 1)).await.unwrap();
        assert_ne!(first, second);

        let listed = store.list_recent(LIST_LIMIT).await.unwrap();
        assert!(listed.len() <= LIST_LIMIT as usize);
        assert!(listed.windows(2).all(|pair| pair[0].created_at >= pair[1].created_at));
        let mine = listed.iter().find(|order| order.id == second).expect("new order listed");
        assert_eq!(mine.status, "pending");
        assert_eq!(mine.product_id, 43);
    }

    #[test]
    fn all_bad_rows_yield_an_empty_listing() {
        let rows = vec![Err(DieselError::DeserializationError("bad timestamp".into()))];

        assert!(keep_decoded(rows).is_empty());
    }
}
