// =============================================================================
// TRADE LIFECYCLE STATE MACHINE
// Owns the single position slot and every transition on it:
// Idle -> EntryPending -> Open -> ExitPending -> Closed -> Idle.
// =============================================================================

use crate::types::{Direction, ExitReason, OutcomeRecord, Position, SignalKind};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// What the engine committed to at gate acceptance, carried through
/// the pending states so the outcome record can attribute the trade.
#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub direction: Direction,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub confidence: f64,
    pub signal_kind: Option<SignalKind>,
}

#[derive(Debug, Clone)]
pub enum TradeState {
    Idle,
    EntryPending {
        intent: EntryIntent,
    },
    Open {
        position: Position,
        intent: EntryIntent,
    },
    ExitPending {
        position: Position,
        intent: EntryIntent,
        reason: ExitReason,
        close_attempts: u32,
    },
}

impl TradeState {
    pub fn name(&self) -> &'static str {
        match self {
            TradeState::Idle => "idle",
            TradeState::EntryPending { .. } => "entry_pending",
            TradeState::Open { .. } => "open",
            TradeState::ExitPending { .. } => "exit_pending",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransitionError {
    /// A transition was requested from a state that does not allow it.
    /// The single-position invariant makes most of these fatal logic
    /// errors rather than recoverable conditions.
    InvalidFrom(&'static str),
}

pub struct TradeLifecycle {
    state: TradeState,
    max_close_retries: u32,
}

impl TradeLifecycle {
    pub fn new(max_close_retries: u32) -> Self {
        Self {
            state: TradeState::Idle,
            max_close_retries,
        }
    }

    pub fn state(&self) -> &TradeState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TradeState::Idle)
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            TradeState::Open { position, .. } | TradeState::ExitPending { position, .. } => {
                Some(position)
            }
            _ => None,
        }
    }

    /// Idle -> EntryPending. Only reachable after the scheduler opened
    /// an evaluation window and the quality gate accepted.
    pub fn begin_entry(&mut self, intent: EntryIntent) -> Result<(), TransitionError> {
        match self.state {
            TradeState::Idle => {
                self.state = TradeState::EntryPending { intent };
                Ok(())
            }
            _ => Err(TransitionError::InvalidFrom(self.state.name())),
        }
    }

    /// EntryPending -> Open on order fill.
    pub fn confirm_open(
        &mut self,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
        min_hold_secs: i64,
    ) -> Result<&Position, TransitionError> {
        match std::mem::replace(&mut self.state, TradeState::Idle) {
            TradeState::EntryPending { intent } => {
                let position = Position {
                    id: Uuid::new_v4(),
                    direction: intent.direction,
                    entry_price,
                    stop_loss: intent.stop_loss,
                    take_profit: intent.take_profit,
                    opened_at,
                    min_hold_deadline: opened_at + Duration::seconds(min_hold_secs),
                };
                self.state = TradeState::Open { position, intent };
                match &self.state {
                    TradeState::Open { position, .. } => Ok(position),
                    _ => unreachable!(),
                }
            }
            other => {
                self.state = other;
                Err(TransitionError::InvalidFrom(self.state.name()))
            }
        }
    }

    /// EntryPending -> Idle when order placement failed. No trade
    /// occurred, so the caller must not arm the cooldown.
    pub fn fail_entry(&mut self) -> Result<(), TransitionError> {
        match self.state {
            TradeState::EntryPending { .. } => {
                self.state = TradeState::Idle;
                Ok(())
            }
            _ => Err(TransitionError::InvalidFrom(self.state.name())),
        }
    }

    /// Exit trigger check for an open position. Rules in order:
    /// stop-loss and take-profit are honored at any time; a ribbon
    /// reversal is suppressed entirely before the minimum-hold
    /// deadline; the maximum hold forces an exit unconditionally.
    pub fn check_exit(
        &self,
        price: Decimal,
        ribbon_reversed_against: bool,
        now: DateTime<Utc>,
        max_hold_secs: i64,
    ) -> Option<ExitReason> {
        let position = match &self.state {
            TradeState::Open { position, .. } => position,
            _ => return None,
        };

        let sl_hit = match position.direction {
            Direction::Long => price <= position.stop_loss,
            Direction::Short => price >= position.stop_loss,
        };
        if sl_hit {
            return Some(ExitReason::StopLoss);
        }

        let tp_hit = match position.direction {
            Direction::Long => price >= position.take_profit,
            Direction::Short => price <= position.take_profit,
        };
        if tp_hit {
            return Some(ExitReason::TakeProfit);
        }

        if ribbon_reversed_against && now >= position.min_hold_deadline {
            return Some(ExitReason::RibbonReversal);
        }

        if now >= position.opened_at + Duration::seconds(max_hold_secs) {
            return Some(ExitReason::MaxHold);
        }

        None
    }

    /// Open -> ExitPending.
    pub fn begin_exit(&mut self, reason: ExitReason) -> Result<(), TransitionError> {
        match std::mem::replace(&mut self.state, TradeState::Idle) {
            TradeState::Open { position, intent } => {
                self.state = TradeState::ExitPending {
                    position,
                    intent,
                    reason,
                    close_attempts: 0,
                };
                Ok(())
            }
            other => {
                self.state = other;
                Err(TransitionError::InvalidFrom(self.state.name()))
            }
        }
    }

    /// ExitPending -> Closed -> Idle on fill confirmation. Returns the
    /// archived outcome; the caller arms the cooldown and appends it.
    pub fn confirm_close(
        &mut self,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<OutcomeRecord, TransitionError> {
        match std::mem::replace(&mut self.state, TradeState::Idle) {
            TradeState::ExitPending {
                position,
                intent,
                reason,
                ..
            } => {
                let record = OutcomeRecord {
                    position_id: position.id,
                    direction: position.direction,
                    entry_price: position.entry_price,
                    exit_price,
                    pnl: position.pnl(exit_price),
                    duration_secs: closed_at
                        .signed_duration_since(position.opened_at)
                        .num_seconds(),
                    exit_reason: reason,
                    signal_kind_at_entry: intent.signal_kind,
                    confidence_at_entry: intent.confidence,
                    closed_at,
                };
                self.state = TradeState::Idle;
                Ok(record)
            }
            other => {
                self.state = other;
                Err(TransitionError::InvalidFrom(self.state.name()))
            }
        }
    }

    /// Record a failed close attempt while staying in ExitPending (the
    /// position is still economically open). Returns true when the
    /// bounded retries are exhausted and the operator must be alerted.
    pub fn record_close_failure(&mut self) -> bool {
        match &mut self.state {
            TradeState::ExitPending { close_attempts, .. } => {
                *close_attempts += 1;
                *close_attempts >= self.max_close_retries
            }
            _ => false,
        }
    }
}
