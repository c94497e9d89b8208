//! Breakeven and trailing-stop rules as pure state transitions.
//!
//! Every proposed stop strictly tightens the current one, so a position's
//! stop-loss never loosens regardless of tick timing or rejected updates.

use rust_decimal::Decimal;

use crate::models::{Direction, Signal, StopState, TrackedPosition};

use super::config::{BreakevenTrigger, StopMode, TradingConfig};

/// Outcome of evaluating one price against a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    /// State to keep if no stop change is made or the change is rejected
    pub observed: StopState,
    /// State once `new_stop` is confirmed by the gateway
    pub applied: StopState,
    pub new_stop: Option<Decimal>,
}

impl StopDecision {
    fn hold(state: StopState) -> Self {
        Self {
            observed: state,
            applied: state,
            new_stop: None,
        }
    }
}

/// Evaluate the configured rule for `position` at `price`.
pub fn evaluate(position: &TrackedPosition, price: Decimal, config: &TradingConfig) -> StopDecision {
    match position.state {
        StopState::Fixed if position.runner => StopDecision::hold(StopState::Fixed),
        StopState::Fixed => match config.stop_mode {
            StopMode::Breakeven => breakeven(position, price, config),
            StopMode::Trailing => {
                let excursion = position.direction.excursion(position.open_price, price);
                if excursion >= config.trailing.activation {
                    trail(position, StopState::TrailingEligible { best: price }, price, config)
                } else {
                    StopDecision::hold(StopState::Fixed)
                }
            }
            StopMode::Fixed => StopDecision::hold(StopState::Fixed),
        },
        StopState::BreakevenApplied => StopDecision::hold(StopState::BreakevenApplied),
        state @ (StopState::TrailingEligible { .. } | StopState::TrailingActive { .. }) => {
            trail(position, state, price, config)
        }
    }
}

fn breakeven(position: &TrackedPosition, price: Decimal, config: &TradingConfig) -> StopDecision {
    let direction = position.direction;
    let trigger = direction.ahead(position.breakeven_trigger, config.breakeven.trigger_offset);
    let lock = direction.ahead(position.open_price, config.breakeven.lock_offset);

    // The lock level must also be behind price for the venue to accept it.
    if !direction.reached(price, trigger) || !direction.improves(price, lock) {
        return StopDecision::hold(StopState::Fixed);
    }

    if position.tightens(lock) {
        StopDecision {
            observed: StopState::Fixed,
            applied: StopState::BreakevenApplied,
            new_stop: Some(lock),
        }
    } else {
        StopDecision::hold(StopState::BreakevenApplied)
    }
}

fn trail(
    position: &TrackedPosition,
    state: StopState,
    price: Decimal,
    config: &TradingConfig,
) -> StopDecision {
    let direction = position.direction;
    let best = match state.best() {
        Some(best) => direction.best(best, price),
        None => price,
    };
    let observed = match state {
        StopState::TrailingActive { .. } => StopState::TrailingActive { best },
        _ => StopState::TrailingEligible { best },
    };

    let candidate = direction.behind(best, config.trailing.distance);
    if position.tightens(candidate) && direction.improves(price, candidate) {
        StopDecision {
            observed,
            applied: StopState::TrailingActive { best },
            new_stop: Some(candidate),
        }
    } else {
        StopDecision::hold(observed)
    }
}

/// Switch a runner to trailing, seeding the mark with the activation price.
pub fn activate_runner(price: Decimal) -> StopState {
    StopState::TrailingEligible { best: price }
}

/// Price level that arms breakeven for positions of `signal`.
pub fn breakeven_trigger(signal: &Signal, config: &TradingConfig) -> Decimal {
    match config.breakeven.trigger {
        BreakevenTrigger::MiddleEntry => signal.middle(),
        BreakevenTrigger::LastEntry => signal.last_entry(),
    }
}

/// Infer the stop state of a position adopted from the venue, e.g. after a
/// restart. A stop at or beyond the open price means a rule already fired.
pub fn restored_state(
    direction: Direction,
    open_price: Decimal,
    stop_loss: Option<Decimal>,
    price: Decimal,
    runner: bool,
    final_target_hit: bool,
    config: &TradingConfig,
) -> StopState {
    let locked = stop_loss.filter(|&sl| !direction.improves(open_price, sl));

    if runner {
        return match (final_target_hit, locked) {
            (false, _) => StopState::Fixed,
            (true, Some(sl)) => StopState::TrailingActive {
                best: direction.best(price, direction.ahead(sl, config.trailing.distance)),
            },
            (true, None) => activate_runner(price),
        };
    }

    match (locked, config.stop_mode) {
        (Some(sl), StopMode::Trailing) => StopState::TrailingActive {
            best: direction.best(price, direction.ahead(sl, config.trailing.distance)),
        },
        (Some(_), StopMode::Breakeven) => StopState::BreakevenApplied,
        _ => StopState::Fixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fingerprint;
    use rust_decimal_macros::dec;

    fn trailing_config(activation: Decimal, distance: Decimal) -> TradingConfig {
        let mut config = TradingConfig {
            stop_mode: StopMode::Trailing,
            ..TradingConfig::default()
        };
        config.trailing.activation = activation;
        config.trailing.distance = distance;
        config
    }

    fn make_position(direction: Direction, open: Decimal, stop: Decimal) -> TrackedPosition {
        TrackedPosition {
            ticket: 1,
            fingerprint: Fingerprint::from("f00d"),
            leg: 1,
            symbol: "XAUUSD".to_string(),
            direction,
            open_price: open,
            stop_loss: Some(stop),
            take_profit: None,
            breakeven_trigger: open,
            runner: false,
            state: StopState::Fixed,
            last_price: None,
        }
    }

    /// Drive a path through the rules, confirming every proposed stop.
    fn run_path(
        position: &mut TrackedPosition,
        path: &[Decimal],
        config: &TradingConfig,
    ) -> Vec<Decimal> {
        let mut stops = Vec::new();
        for &price in path {
            let decision = evaluate(position, price, config);
            match decision.new_stop {
                Some(stop) => {
                    position.stop_loss = Some(stop);
                    position.state = decision.applied;
                    stops.push(stop);
                }
                None => position.state = decision.observed,
            }
        }
        stops
    }

    #[test]
    fn test_trailing_ratchet_records_only_maxima() {
        let config = trailing_config(dec!(5), dec!(3));
        let mut position = make_position(Direction::Buy, dec!(100), dec!(90));
        let path = [dec!(100), dec!(110), dec!(105), dec!(115), dec!(108)];

        let stops = run_path(&mut position, &path, &config);
        assert_eq!(stops, vec![dec!(107), dec!(112)]);
        assert_eq!(position.state, StopState::TrailingActive { best: dec!(115) });
    }

    #[test]
    fn test_trailing_waits_for_activation() {
        let config = trailing_config(dec!(10), dec!(3));
        let mut position = make_position(Direction::Buy, dec!(100), dec!(90));

        let stops = run_path(&mut position, &[dec!(104), dec!(109.9)], &config);
        assert!(stops.is_empty());
        assert_eq!(position.state, StopState::Fixed);

        let stops = run_path(&mut position, &[dec!(110), dec!(101)], &config);
        assert_eq!(stops, vec![dec!(107)]);
        // Eligibility is permanent even after price falls back.
        assert!(position.trailing_active());
    }

    #[test]
    fn test_sell_trailing_moves_down_only() {
        let config = trailing_config(dec!(2), dec!(1));
        let mut position = make_position(Direction::Sell, dec!(50), dec!(55));
        let path = [dec!(48), dec!(49), dec!(46), dec!(47.5), dec!(45.5)];

        let stops = run_path(&mut position, &path, &config);
        assert_eq!(stops, vec![dec!(49), dec!(47), dec!(46.5)]);
        assert!(stops.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_breakeven_fires_once() {
        let mut config = TradingConfig::default();
        config.breakeven.trigger_offset = dec!(0.5);
        config.breakeven.lock_offset = dec!(0.1);
        let mut position = make_position(Direction::Buy, dec!(2650.50), dec!(2645.00));
        position.breakeven_trigger = dec!(2649.35);

        // Oscillate around the trigger; price must also clear open + lock.
        let path = [
            dec!(2649.00),
            dec!(2650.55),
            dec!(2651.00),
            dec!(2649.00),
            dec!(2652.00),
            dec!(2650.00),
            dec!(2653.00),
        ];
        let stops = run_path(&mut position, &path, &config);
        assert_eq!(stops, vec![dec!(2650.60)]);
        assert!(position.breakeven_applied());
    }

    #[test]
    fn test_breakeven_rejection_retries_next_tick() {
        let config = TradingConfig::default();
        let mut position = make_position(Direction::Sell, dec!(100), dec!(104));
        position.breakeven_trigger = dec!(101);

        let first = evaluate(&position, dec!(99), &config);
        assert_eq!(first.new_stop, Some(dec!(99.9)));
        // Gateway refused: keep the observed state.
        position.state = first.observed;

        let second = evaluate(&position, dec!(98), &config);
        assert_eq!(second.new_stop, Some(dec!(99.9)));
        assert_eq!(second.applied, StopState::BreakevenApplied);
    }

    #[test]
    fn test_breakeven_never_loosens() {
        let config = TradingConfig::default();
        let mut position = make_position(Direction::Buy, dec!(100), dec!(100.5));
        position.breakeven_trigger = dec!(99);

        let decision = evaluate(&position, dec!(101), &config);
        assert_eq!(decision.new_stop, None);
        assert_eq!(decision.observed, StopState::BreakevenApplied);
    }

    #[test]
    fn test_runner_holds_until_activated() {
        let config = trailing_config(dec!(1), dec!(2));
        let mut position = make_position(Direction::Buy, dec!(100), dec!(95));
        position.runner = true;

        assert_eq!(evaluate(&position, dec!(120), &config).new_stop, None);

        position.state = activate_runner(dec!(120));
        let decision = evaluate(&position, dec!(120), &config);
        assert_eq!(decision.new_stop, Some(dec!(118)));
        assert_eq!(decision.applied, StopState::TrailingActive { best: dec!(120) });
    }

    #[test]
    fn test_runner_trails_even_in_breakeven_mode() {
        let config = TradingConfig::default();
        let mut position = make_position(Direction::Buy, dec!(100), dec!(95));
        position.runner = true;
        position.state = activate_runner(dec!(110));

        let decision = evaluate(&position, dec!(111), &config);
        assert_eq!(decision.new_stop, Some(dec!(110.5)));
    }

    #[test]
    fn test_restored_state_detects_locked_stop() {
        let breakeven = TradingConfig::default();
        assert_eq!(
            restored_state(Direction::Buy, dec!(100), Some(dec!(100.1)), dec!(103), false, false, &breakeven),
            StopState::BreakevenApplied
        );
        assert_eq!(
            restored_state(Direction::Buy, dec!(100), Some(dec!(95)), dec!(103), false, false, &breakeven),
            StopState::Fixed
        );

        let trailing = trailing_config(dec!(1), dec!(2));
        assert_eq!(
            restored_state(Direction::Sell, dec!(100), Some(dec!(98)), dec!(97), false, false, &trailing),
            StopState::TrailingActive { best: dec!(96) }
        );
        assert_eq!(
            restored_state(Direction::Buy, dec!(100), Some(dec!(95)), dec!(103), true, true, &trailing),
            StopState::TrailingEligible { best: dec!(103) }
        );
        assert_eq!(
            restored_state(Direction::Buy, dec!(100), Some(dec!(95)), dec!(103), true, false, &trailing),
            StopState::Fixed
        );
    }
}
