use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i32,
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
}

impl NewOrder {
    pub fn pending(user_id: i32, product_id: i32, quantity: i32) -> Self {
        Self {
            user_id,
            product_id,
            quantity,
            status: STATUS_PENDING.to_string(),
        }
    }

    /// The in-memory copy handed back to callers once the store assigned an id.
    pub fn into_order(self, id: i32, created_at: NaiveDateTime) -> Order {
        Order {
            id,
            user_id: self.user_id,
            product_id: self.product_id,
            quantity: self.quantity,
            status: self.status,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
}

impl CreateOrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id == 0 {
            return Err("user_id is required".to_string());
        }
        if self.product_id == 0 {
            return Err("product_id is required".to_string());
        }
        if self.quantity < 1 {
            return Err(format!("quantity must be at least 1, got {}", self.quantity));
        }
        Ok(())
    }
}

impl From<&CreateOrderRequest> for NewOrder {
    fn from(request: &CreateOrderRequest) -> Self {
        NewOrder::pending(request.user_id, request.product_id, request.quantity)
    }
}
