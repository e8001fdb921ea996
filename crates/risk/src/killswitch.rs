use capflow_bus::{BusError, EventBus};
use capflow_core::account::AccountState;
use capflow_core::config::{KillSwitchConfig, RiskConfig};
use capflow_core::keys::{BUS_LAG_KEY, KILLSWITCH_KEY, KILLSWITCH_REASON_KEY};
use capflow_core::traits::AlertSink;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error("unhalt passphrase rejected")]
    Unauthorized,
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Binary safety state machine over the shared halt flag.
///
/// The flag lives on the bus so every orchestrator instance observes the
/// same state; the transition to halted goes through the bus's atomic
/// set-if-absent, which also gates the alert to exactly one emission per
/// transition. The only path back to active is an authenticated unhalt.
pub struct KillSwitch<B: EventBus> {
    bus: Arc<B>,
    alerts: Arc<dyn AlertSink>,
    daily_loss_cap: f64,
    max_dd_pct: f64,
    lag_threshold_ms: i64,
    unhalt_passphrase: String,
}

impl<B: EventBus> KillSwitch<B> {
    #[must_use]
    pub fn new(
        bus: Arc<B>,
        alerts: Arc<dyn AlertSink>,
        cfg: &KillSwitchConfig,
        risk: &RiskConfig,
    ) -> Self {
        Self {
            bus,
            alerts,
            daily_loss_cap: risk.daily_loss_cap,
            max_dd_pct: risk.max_dd_pct,
            lag_threshold_ms: cfg.lag_threshold_ms,
            unhalt_passphrase: cfg.unhalt_passphrase.clone(),
        }
    }

    /// Runs the trip checks once. No-op while already halted.
    ///
    /// # Errors
    /// Returns an error on bus failures.
    pub async fn monitor(&self, account: &AccountState) -> Result<(), KillSwitchError> {
        if self.is_halted().await? {
            return Ok(());
        }

        let lag_ms = self
            .bus
            .get_key(BUS_LAG_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if lag_ms > self.lag_threshold_ms {
            return self.halt("bus_lag").await;
        }

        if account.daily_pnl <= -self.daily_loss_cap * account.start_equity {
            return self.halt("daily_loss_cap").await;
        }

        if account.drawdown_pct() >= self.max_dd_pct {
            return self.halt("drawdown_limit").await;
        }

        Ok(())
    }

    /// Flips the shared flag to halted and records the reason.
    ///
    /// Safe to call from any owner (the monitor or the orchestrator's
    /// fatal-halt path); only the call that wins the compare-and-set
    /// persists the reason, logs, and alerts.
    ///
    /// # Errors
    /// Returns an error on bus failures.
    pub async fn halt(&self, reason: &str) -> Result<(), KillSwitchError> {
        let transitioned = self.bus.set_key_if_absent(KILLSWITCH_KEY, "1").await?;
        if !transitioned {
            return Ok(());
        }
        self.bus.set_key(KILLSWITCH_REASON_KEY, reason, None).await?;
        tracing::error!(reason, "kill switch engaged");
        if let Err(err) = self
            .alerts
            .send("KILL-SWITCH ENGAGED", &format!("reason={reason}"))
            .await
        {
            tracing::warn!(error = %err, "kill-switch alert delivery failed");
        }
        Ok(())
    }

    /// Clears the halt flag after passphrase verification.
    ///
    /// # Errors
    /// [`KillSwitchError::Unauthorized`] on mismatch, with no state
    /// change. An empty configured passphrase rejects every attempt.
    pub async fn unhalt(&self, passphrase: &str) -> Result<(), KillSwitchError> {
        if self.unhalt_passphrase.is_empty() || passphrase != self.unhalt_passphrase {
            tracing::warn!("unhalt rejected: bad passphrase");
            return Err(KillSwitchError::Unauthorized);
        }
        self.bus.delete_key(KILLSWITCH_KEY).await?;
        self.bus.delete_key(KILLSWITCH_REASON_KEY).await?;
        tracing::info!("kill switch cleared");
        Ok(())
    }

    /// Side-effect-free read of the shared flag.
    ///
    /// # Errors
    /// Returns an error on bus failures.
    pub async fn is_halted(&self) -> Result<bool, KillSwitchError> {
        Ok(self.bus.get_key(KILLSWITCH_KEY).await?.as_deref() == Some("1"))
    }

    /// Advisory reason recorded at the last transition, if any.
    ///
    /// # Errors
    /// Returns an error on bus failures.
    pub async fn halt_reason(&self) -> Result<Option<String>, KillSwitchError> {
        Ok(self.bus.get_key(KILLSWITCH_REASON_KEY).await?)
    }
}
