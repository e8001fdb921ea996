use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry on the raw market stream, as published by the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMarketEvent {
    /// Event timestamp in epoch milliseconds.
    pub ts: i64,
    pub symbol: String,
    /// Feed discriminator; the metric engine only consumes `"kline"`.
    pub feed: String,
    pub payload: RawPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<KlineBar>,
}

/// Kline payload carried under `payload.k`. Fields the feed may omit
/// default to zero so a thin feed never fabricates values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineBar {
    /// Bar open time, epoch milliseconds.
    #[serde(rename = "t")]
    pub open_time: i64,
    /// Close price.
    #[serde(rename = "c")]
    pub close: f64,
    /// Base-asset volume.
    #[serde(rename = "v")]
    pub volume: f64,
    /// True once the bar has closed.
    #[serde(rename = "x")]
    pub closed: bool,
    #[serde(rename = "oi", default)]
    pub open_interest: f64,
    #[serde(rename = "fr", default)]
    pub funding_rate: f64,
    /// Liquidation notional attributed to this bar.
    #[serde(rename = "l", default)]
    pub liquidation_notional: f64,
}

/// Closed-bar indicator bundle, one per (symbol, minute).
///
/// Published to the metrics stream as a flat field-per-key record so
/// consumer-group clients can read individual fields without parsing
/// nested JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ts: i64,
    pub symbol: String,
    pub price: f64,
    pub pdd: f64,
    pub vsr: f64,
    pub ois: f64,
    pub frd: f64,
    pub atr: f64,
    pub ll: f64,
    pub lva: f64,
    pub lsi: f64,
    pub lcf: f64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::with_capacity(12);
        fields.insert("ts".to_string(), self.ts.to_string());
        fields.insert("symbol".to_string(), self.symbol.clone());
        for (name, value) in [
            ("price", self.price),
            ("pdd", self.pdd),
            ("vsr", self.vsr),
            ("ois", self.ois),
            ("frd", self.frd),
            ("atr", self.atr),
            ("ll", self.ll),
            ("lva", self.lva),
            ("lsi", self.lsi),
            ("lcf", self.lcf),
        ] {
            fields.insert(name.to_string(), value.to_string());
        }
        fields
    }

    /// Reconstructs a snapshot from a flat field map.
    ///
    /// # Errors
    /// Returns an error if any field is missing or fails to parse.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        fn num(fields: &HashMap<String, String>, name: &str) -> Result<f64> {
            fields
                .get(name)
                .ok_or_else(|| anyhow!("missing field: {name}"))?
                .parse::<f64>()
                .with_context(|| format!("invalid field: {name}"))
        }

        let ts = fields
            .get("ts")
            .ok_or_else(|| anyhow!("missing field: ts"))?
            .parse::<i64>()
            .context("invalid field: ts")?;
        let symbol = fields
            .get("symbol")
            .ok_or_else(|| anyhow!("missing field: symbol"))?
            .clone();

        Ok(Self {
            ts,
            symbol,
            price: num(fields, "price")?,
            pdd: num(fields, "pdd")?,
            vsr: num(fields, "vsr")?,
            ois: num(fields, "ois")?,
            frd: num(fields, "frd")?,
            atr: num(fields, "atr")?,
            ll: num(fields, "ll")?,
            lva: num(fields, "lva")?,
            lsi: num(fields, "lsi")?,
            lcf: num(fields, "lcf")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            other => Err(anyhow!("unknown side: {other}")),
        }
    }
}

/// Trade candidate derived deterministically from a metrics snapshot.
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
    pub p_hit_rate_est: f64,
    pub r_multiple: f64,
}

/// Fully sized, risk-approved order ready for the execution gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
}

/// Append-only ledger row recording a dispatched plan. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTrade {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
}

impl PlannedTrade {
    #[must_use]
    pub fn from_plan(plan: &OrderPlan, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            symbol: plan.symbol.clone(),
            side: plan.side,
            qty: plan.qty,
            entry_price: plan.entry_price,
            sl_price: plan.sl_price,
            tp_price: plan.tp_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            ts: 1_700_000_040_000,
            symbol: "BTCUSDT".to_string(),
            price: 42_000.5,
            pdd: -0.21,
            vsr: 4.5,
            ois: 0.18,
            frd: -0.025,
            atr: 120.0,
            ll: 40.0,
            lva: 3.2,
            lsi: 2.4,
            lcf: 250_000.0,
        }
    }

    #[test]
    fn snapshot_field_roundtrip() {
        let original = snapshot();
        let decoded = MetricsSnapshot::from_fields(&original.to_fields()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn snapshot_rejects_missing_field() {
        let mut fields = snapshot().to_fields();
        fields.remove("vsr");
        assert!(MetricsSnapshot::from_fields(&fields).is_err());
    }

    #[test]
    fn kline_decode_defaults_optional_fields() {
        let raw: RawMarketEvent = serde_json::from_str(
            r#"{"ts":1700000040000,"symbol":"BTCUSDT","feed":"kline",
                "payload":{"k":{"t":1700000040000,"c":42000.5,"v":12.5,"x":true}}}"#,
        )
        .unwrap();
        let bar = raw.payload.k.unwrap();
        assert!(bar.closed);
        assert_eq!(bar.open_interest, 0.0);
        assert_eq!(bar.funding_rate, 0.0);
        assert_eq!(bar.liquidation_notional, 0.0);
    }
}
