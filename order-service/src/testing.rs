//! In-process doubles for the datastore and the background queue.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::api::AppState;
use crate::config::ServiceIdentity;
use crate::models::{NewOrder, Order};
use crate::store::OrderStore;
use crate::tasks::{InventoryCheck, TaskDispatch};
use crate::telemetry::Metrics;

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<Vec<Order>>,
    last_id: AtomicI32,
    unavailable: AtomicBool,
}

impl MemoryOrderStore {
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Inserts a fully-formed row, bypassing id generation.
    pub fn seed(&self, order: Order) {
        self.last_id.fetch_max(order.id, Ordering::SeqCst);
        self.orders.lock().unwrap().push(order);
    }

    pub fn len(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Order>> {
        self.check_available()?;
        let mut orders = self.orders.lock().unwrap().clone();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn create(&self, new_order: NewOrder) -> Result<i32> {
        self.check_available()?;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.orders
            .lock()
            .unwrap()
            .push(new_order.into_order(id, Utc::now().naive_utc()));
        Ok(id)
    }
}

#[derive(Default)]
pub struct RecordingDispatch {
    jobs: Mutex<Vec<InventoryCheck>>,
}

impl RecordingDispatch {
    pub fn jobs(&self) -> Vec<InventoryCheck> {
        self.jobs.lock().unwrap().clone()
    }
}

impl TaskDispatch for RecordingDispatch {
    fn dispatch(&self, job: InventoryCheck) -> bool {
        self.jobs.lock().unwrap().push(job);
        true
    }
}

pub fn test_state() -> (AppState, Arc<MemoryOrderStore>, Arc<RecordingDispatch>) {
    let store = Arc::new(MemoryOrderStore::default());
    let tasks = Arc::new(RecordingDispatch::default());

    let state = AppState {
        store: store.clone(),
        tasks: tasks.clone(),
        metrics: Metrics::new().expect("metrics registry"),
        identity: ServiceIdentity {
            pod_name: "order-service-test".to_string(),
            version: "v1.0.0-test".to_string(),
        },
    };

    (state, store, tasks)
}
