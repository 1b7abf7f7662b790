//! Checkout events raised by the funnel itself.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::registry::{AppInfo, Registry, Trigger};
use crate::schema::FieldSchema;

pub const APP: AppInfo = AppInfo {
    key: "checkout",
    name: "Checkout",
    requires_auth: false,
};

pub fn register(registry: &mut Registry) {
    registry.register_trigger(APP, PurchaseCompleted);
    registry.register_trigger(APP, RefundIssued);
}

fn funnel_filter() -> FieldSchema {
    FieldSchema::text("funnel_id", "Funnel").with_help("Only fire for this funnel")
}

/// Keep events whose `funnel_id` matches the configured one, if any.
fn funnel_matches(config: &Map<String, Value>, event_data: &Value) -> bool {
    match config.get("funnel_id").and_then(Value::as_str) {
        Some(wanted) if !wanted.is_empty() => {
            event_data.get("funnel_id").and_then(Value::as_str) == Some(wanted)
        }
        _ => true,
    }
}

pub struct PurchaseCompleted;

#[async_trait]
impl Trigger for PurchaseCompleted {
    fn key(&self) -> &'static str {
        "purchase_completed"
    }

    fn label(&self) -> &'static str {
        "Purchase completed"
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![funnel_filter()]
    }

    fn sample(&self) -> Value {
        json!({
            "order_id": "ord_1001",
            "funnel_id": "fn_main",
            "member_email": "jane@example.com",
            "member_name": "Jane Doe",
            "amount": 4900,
            "currency": "USD",
            "product": {"id": "prod_course", "name": "Launch Course"},
            "line_items": [{"sku": "course", "quantity": 1}]
        })
    }

    fn matches(&self, config: &Map<String, Value>, event_data: &Value) -> bool {
        funnel_matches(config, event_data)
    }
}

pub struct RefundIssued;

#[async_trait]
impl Trigger for RefundIssued {
    fn key(&self) -> &'static str {
        "refund_issued"
    }

    fn label(&self) -> &'static str {
        "Refund issued"
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn props(&self) -> Vec<FieldSchema> {
        vec![funnel_filter()]
    }

    fn sample(&self) -> Value {
        json!({
            "order_id": "ord_1001",
            "funnel_id": "fn_main",
            "member_email": "jane@example.com",
            "amount": 4900,
            "currency": "USD",
            "reason": "requested_by_customer"
        })
    }

    fn matches(&self, config: &Map<String, Value>, event_data: &Value) -> bool {
        funnel_matches(config, event_data)
    }
}
