//! Exit-condition evaluator: a fixed-priority chain of independent
//! triggers, first match wins, at most one exit request per ticker per
//! evaluation cycle.

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Kolkata;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::models::{
    round_down_to_tick, Candle, ExitPrice, ExitReason, ExitRequest, MomentumState, StopState,
    TrackedPosition, TrancheKind,
};

/// What the evaluator decided for one ticker this cycle.
#[derive(Debug, Clone)]
pub enum ExitDecision {
    Hold,
    Exit(ExitRequest),
    /// The brokerage no longer reports the position: drop it locally,
    /// do not sell.
    Remove,
}

/// Evaluation result plus the flags the caller must persist.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: ExitDecision,
    /// The one-shot trend check ran this cycle.
    pub trend_checked: bool,
}

pub struct ExitConditionEvaluator {
    config: EngineConfig,
}

impl ExitConditionEvaluator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run the trigger chain for one ticker.
    ///
    /// `broker_quantity` is the venue's view from this cycle's snapshot
    /// (`None` when the venue no longer lists the ticker). `intraday` is the
    /// latest completed intraday candle, when one could be fetched; the
    /// checks that need it are skipped without it, never tripped.
    pub fn evaluate(
        &self,
        position: &TrackedPosition,
        stop: Option<&StopState>,
        momentum: &mut MomentumState,
        price: Decimal,
        broker_quantity: Option<i64>,
        intraday: Option<&Candle>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let mut trend_checked = false;

        // 1. Never stack orders: skip while one is outstanding or within
        //    the post-order cool-down.
        if position.blocks_new_exit(now, self.config.pending_cooldown()) {
            debug!(ticker = %position.ticker, "Exit suppressed: pending or cooling down");
            return Evaluation {
                decision: ExitDecision::Hold,
                trend_checked,
            };
        }

        // 2. The venue is authoritative: a position it no longer reports is
        //    removed, not sold.
        match broker_quantity {
            Some(qty) if qty > 0 => {}
            _ => {
                info!(ticker = %position.ticker, "Position absent at broker, requesting removal");
                return Evaluation {
                    decision: ExitDecision::Remove,
                    trend_checked,
                };
            }
        }

        // 3. Momentum decay, throttled to the configured interval.
        if let Some(request) = self.check_momentum(position, momentum, intraday, now) {
            return Evaluation {
                decision: ExitDecision::Exit(request),
                trend_checked,
            };
        }

        // 4. Hard loss threshold from entry.
        let pnl_pct = position.pnl_pct(price);
        if pnl_pct <= -self.config.loss_threshold_pct {
            warn!(
                ticker = %position.ticker,
                pnl_pct = %pnl_pct,
                threshold = %self.config.loss_threshold_pct,
                "Loss threshold breached"
            );
            return Evaluation {
                decision: ExitDecision::Exit(self.full_exit(position, ExitReason::LossThreshold)),
                trend_checked,
            };
        }

        // 5. Abnormal candle length: exhaustion-range bar relative to ATR.
        if let (Some(candle), Some(stop)) = (intraday, stop) {
            let limit = stop.atr * self.config.candle_length_atr_mult;
            if candle.range() > limit {
                warn!(
                    ticker = %position.ticker,
                    range = %candle.range(),
                    limit = %limit,
                    "Abnormal candle length"
                );
                return Evaluation {
                    decision: ExitDecision::Exit(
                        self.full_exit(position, ExitReason::AbnormalCandle),
                    ),
                    trend_checked,
                };
            }
        }

        // 6. Time-boxed trend violation: once per position, for same-session
        //    entries, after the grace window.
        if !position.trend_checked
            && entered_today(position, now)
            && position.age(now) >= self.config.trend_check_delay()
        {
            trend_checked = true;
            if price <= position.entry_price {
                info!(
                    ticker = %position.ticker,
                    price = %price,
                    entry = %position.entry_price,
                    "Trend violation after grace window"
                );
                return Evaluation {
                    decision: ExitDecision::Exit(self.full_exit(position, ExitReason::TrendViolation)),
                    trend_checked,
                };
            }
        }

        // 7. Trailing-stop breach.
        if let Some(stop) = stop {
            if price <= stop.stop_price {
                return Evaluation {
                    decision: ExitDecision::Exit(self.stop_breach_exit(position, stop)),
                    trend_checked,
                };
            }
        }

        // 8. Profit-target tranches, higher target first.
        if self.config.tranches_enabled && price > position.entry_price {
            if let Some(stop) = stop {
                for kind in [TrancheKind::Target2, TrancheKind::Target1] {
                    if let Some(request) = self.check_target(position, stop, price, kind) {
                        return Evaluation {
                            decision: ExitDecision::Exit(request),
                            trend_checked,
                        };
                    }
                }
            }
        }

        Evaluation {
            decision: ExitDecision::Hold,
            trend_checked,
        }
    }

    fn check_momentum(
        &self,
        position: &TrackedPosition,
        momentum: &mut MomentumState,
        intraday: Option<&Candle>,
        now: DateTime<Utc>,
    ) -> Option<ExitRequest> {
        if !momentum.is_due(now, self.config.vsr_check_interval()) {
            return None;
        }
        let vsr = intraday.and_then(Candle::volume_range_ratio)?;
        momentum.last_check = Some(now);

        match momentum.baseline {
            None => {
                momentum.baseline = Some(vsr);
                debug!(ticker = %position.ticker, vsr = %vsr, "Momentum baseline recorded");
                None
            }
            Some(baseline) => {
                let floor = baseline * self.config.vsr_decay_fraction;
                if vsr < floor {
                    warn!(
                        ticker = %position.ticker,
                        vsr = %vsr,
                        baseline = %baseline,
                        "Momentum decayed below baseline"
                    );
                    Some(self.full_exit(position, ExitReason::MomentumDecay))
                } else {
                    None
                }
            }
        }
    }

    fn stop_breach_exit(&self, position: &TrackedPosition, stop: &StopState) -> ExitRequest {
        // Price a touch under the stop so the limit is marketable, rounded
        // to the instrument tick.
        let limit = round_down_to_tick(stop.stop_price * dec!(0.995), self.config.tick_size);

        let (quantity, tranche) = if !self.config.tranches_enabled {
            (position.quantity, None)
        } else if !position.tranches.has_fired(TrancheKind::Stop) {
            (
                self.config.tranche.quantity_for(
                    TrancheKind::Stop,
                    position.original_quantity,
                    position.quantity,
                ),
                Some(TrancheKind::Stop),
            )
        } else {
            // Stop tranche already used: flush what remains.
            (position.quantity, None)
        };

        warn!(
            ticker = %position.ticker,
            stop = %stop.stop_price,
            limit = %limit,
            quantity,
            tranche = ?tranche,
            "Stop breach"
        );

        ExitRequest {
            ticker: position.ticker.clone(),
            quantity,
            price: ExitPrice::Limit(limit),
            reason: ExitReason::StopBreach,
            tranche,
        }
    }

    fn check_target(
        &self,
        position: &TrackedPosition,
        stop: &StopState,
        price: Decimal,
        kind: TrancheKind,
    ) -> Option<ExitRequest> {
        if position.tranches.has_fired(kind) {
            return None;
        }
        let multiple = self.config.tranche.target_multiple(kind)?;
        let trigger = position.entry_price + stop.atr * multiple;
        if price < trigger {
            return None;
        }

        let quantity = self.config.tranche.quantity_for(
            kind,
            position.original_quantity,
            position.quantity,
        );
        info!(
            ticker = %position.ticker,
            target = kind.as_str(),
            trigger = %trigger,
            price = %price,
            quantity,
            "Profit target reached"
        );
        Some(ExitRequest {
            ticker: position.ticker.clone(),
            quantity,
            price: ExitPrice::Market,
            reason: ExitReason::ProfitTarget,
            tranche: Some(kind),
        })
    }

    fn full_exit(&self, position: &TrackedPosition, reason: ExitReason) -> ExitRequest {
        ExitRequest {
            ticker: position.ticker.clone(),
            quantity: position.quantity,
            price: ExitPrice::Market,
            reason,
            tranche: None,
        }
    }
}

/// Whether the position was entered during the current exchange-local
/// session day.
fn entered_today(position: &TrackedPosition, now: DateTime<Utc>) -> bool {
    position.entry_time.with_timezone(&Kolkata).date_naive()
        == now.with_timezone(&Kolkata).date_naive()
}
