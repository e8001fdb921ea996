use anyhow::{Context, Result};
use async_trait::async_trait;
use capflow_bus::EventBus;
use capflow_core::events::OrderPlan;
use capflow_core::keys::PAPER_FILLS_STREAM;
use capflow_core::traits::ExecutionGateway;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_ATTEMPTS: usize = 3;

/// Simulated execution: accepted plans become entries on the paper fills
/// stream. Honors the idempotent-submit contract in-process, the same
/// guarantee a live gateway provides via client order ids.
pub struct PaperGateway<B: EventBus> {
    bus: Arc<B>,
    submitted_keys: Mutex<std::collections::HashSet<String>>,
}

impl<B: EventBus> PaperGateway<B> {
    #[must_use]
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            submitted_keys: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn fill_fields(plan: &OrderPlan, idempotency_key: &str) -> HashMap<String, String> {
        HashMap::from([
            ("fill_id".to_string(), uuid::Uuid::new_v4().to_string()),
            ("idempotency_key".to_string(), idempotency_key.to_string()),
            ("symbol".to_string(), plan.symbol.clone()),
            ("side".to_string(), plan.side.as_str().to_string()),
            ("qty".to_string(), plan.qty.to_string()),
            ("entry_price".to_string(), plan.entry_price.to_string()),
            ("sl_price".to_string(), plan.sl_price.to_string()),
            ("tp_price".to_string(), plan.tp_price.to_string()),
        ])
    }
}

#[async_trait]
impl<B: EventBus> ExecutionGateway for PaperGateway<B> {
    async fn submit(&self, plan: &OrderPlan, idempotency_key: &str) -> Result<()> {
        {
            let mut seen = self.submitted_keys.lock().expect("gateway lock poisoned");
            if !seen.insert(idempotency_key.to_string()) {
                tracing::info!(idempotency_key, "duplicate submit suppressed");
                return Ok(());
            }
        }

        let fields = Self::fill_fields(plan, idempotency_key);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .bus
                .publish(PAPER_FILLS_STREAM, fields.clone(), None)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        symbol = %plan.symbol,
                        qty = plan.qty,
                        entry = plan.entry_price,
                        "paper fill recorded"
                    );
                    return Ok(());
                }
                Err(err) if attempts < MAX_ATTEMPTS => {
                    tracing::warn!(error = %err, attempts, "paper submit retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempts as u64)).await;
                }
                Err(err) => {
                    // Nothing was published; forget the key so a retry
                    // after redelivery is not treated as a duplicate.
                    self.submitted_keys
                        .lock()
                        .expect("gateway lock poisoned")
                        .remove(idempotency_key);
                    return Err(err).context("paper submit failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capflow_bus::MemoryBus;
    use capflow_core::events::Side;

    fn plan() -> OrderPlan {
        OrderPlan {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: 10.0,
            entry_price: 100.0,
            sl_price: 90.0,
            tp_price: 130.0,
        }
    }

    #[tokio::test]
    async fn submit_appends_a_paper_fill() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = PaperGateway::new(Arc::clone(&bus));
        gateway.submit(&plan(), "metrics-1-0").await.unwrap();
        assert_eq!(bus.stream_len(PAPER_FILLS_STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_submits_once() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = PaperGateway::new(Arc::clone(&bus));
        gateway.submit(&plan(), "metrics-1-0").await.unwrap();
        gateway.submit(&plan(), "metrics-1-0").await.unwrap();
        gateway.submit(&plan(), "metrics-2-0").await.unwrap();
        assert_eq!(bus.stream_len(PAPER_FILLS_STREAM).await.unwrap(), 2);
    }
}
