//! Translation of strategy decisions into order drafts.
//!
//! Buy/Sell against an opposite position become a two-step turnaround: the
//! closing order carries the follow-up open, executed when the close fills.

use kestrel_core::{
    FollowUpAction, OrderAuthor, OrderDraft, OrderOp, Price, Quantity, Side, SystemAction,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use kestrel_strategy::Decision;

/// Build the order draft (if any) for a decision given the current signed
/// position for the instrument.
#[must_use]
pub fn translate_decision(
    decision: &Decision,
    instrument: &str,
    position: Quantity,
    strategy_id: Uuid,
) -> Option<OrderDraft> {
    if !decision.action.creates_order() {
        return None;
    }
    match decision.action {
        SystemAction::Buy => Some(entry_draft(
            Side::Buy,
            decision.quantity,
            decision.stop_price,
            instrument,
            position,
            strategy_id,
            None,
        )),
        SystemAction::Sell => Some(entry_draft(
            Side::Sell,
            decision.quantity,
            decision.stop_price,
            instrument,
            position,
            strategy_id,
            None,
        )),
        SystemAction::BuySell => Some(entry_draft(
            Side::Buy,
            decision.quantity,
            decision.stop_price,
            instrument,
            position,
            strategy_id,
            Some(FollowUpAction {
                action: SystemAction::Sell,
                quantity: decision.quantity,
                stop_price: None,
            }),
        )),
        SystemAction::Flat => flat_draft(decision.quantity, instrument, position, strategy_id),
        SystemAction::Stpr => {
            if position.is_zero() {
                return None;
            }
            Some(OrderDraft {
                instrument: instrument.to_string(),
                side: if position > Decimal::ZERO {
                    Side::Buy
                } else {
                    Side::Sell
                },
                op: OrderOp::UpdateStop,
                quantity: position.abs(),
                stop_price: decision.stop_price,
                limit_price: None,
                author: OrderAuthor::System,
                strategy_id: Some(strategy_id),
                on_filled: None,
            })
        }
        _ => None,
    }
}

/// Entry orders open in the requested direction when the position agrees;
/// against an opposite position they close first and carry the open as the
/// follow-up.
fn entry_draft(
    side: Side,
    quantity: Quantity,
    stop_price: Option<Price>,
    instrument: &str,
    position: Quantity,
    strategy_id: Uuid,
    on_filled: Option<FollowUpAction>,
) -> OrderDraft {
    let opposing = match side {
        Side::Buy => position < Decimal::ZERO,
        Side::Sell => position > Decimal::ZERO,
    };
    if opposing {
        OrderDraft {
            instrument: instrument.to_string(),
            side,
            op: OrderOp::Close,
            quantity: position.abs(),
            stop_price: None,
            limit_price: None,
            author: OrderAuthor::System,
            strategy_id: Some(strategy_id),
            on_filled: Some(FollowUpAction {
                action: match side {
                    Side::Buy => SystemAction::Buy,
                    Side::Sell => SystemAction::Sell,
                },
                quantity,
                stop_price,
            }),
        }
    } else {
        OrderDraft {
            instrument: instrument.to_string(),
            side,
            op: OrderOp::Open,
            quantity,
            stop_price,
            limit_price: None,
            author: OrderAuthor::System,
            strategy_id: Some(strategy_id),
            on_filled,
        }
    }
}

/// Flat closes the whole position, or reduces it down to `keep` when the
/// decision quantity names a smaller remainder to keep.
fn flat_draft(
    keep: Quantity,
    instrument: &str,
    position: Quantity,
    strategy_id: Uuid,
) -> Option<OrderDraft> {
    if position.is_zero() {
        return None;
    }
    let magnitude = position.abs();
    let close_qty = if keep > Decimal::ZERO && keep < magnitude {
        magnitude - keep
    } else {
        magnitude
    };
    Some(OrderDraft {
        instrument: instrument.to_string(),
        side: if position > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        },
        op: OrderOp::Close,
        quantity: close_qty,
        stop_price: None,
        limit_price: None,
        author: OrderAuthor::System,
        strategy_id: Some(strategy_id),
        on_filled: None,
    })
}

/// Translate a follow-up carried on a filled closing order.
#[must_use]
pub fn translate_follow_up(
    follow_up: &FollowUpAction,
    instrument: &str,
    strategy_id: Option<Uuid>,
) -> Option<OrderDraft> {
    let side = match follow_up.action {
        SystemAction::Buy => Side::Buy,
        SystemAction::Sell => Side::Sell,
        _ => return None,
    };
    if follow_up.quantity <= Decimal::ZERO {
        return None;
    }
    Some(OrderDraft {
        instrument: instrument.to_string(),
        side,
        op: OrderOp::Open,
        quantity: follow_up.quantity,
        stop_price: follow_up.stop_price,
        limit_price: None,
        author: OrderAuthor::System,
        strategy_id,
        on_filled: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn decision(action: SystemAction, qty: Decimal, stop: Option<Decimal>) -> Decision {
        Decision::new(action, qty, stop)
    }

    #[test]
    fn buy_with_flat_position_opens_long() {
        let draft = translate_decision(
            &decision(SystemAction::Buy, dec!(100), Some(dec!(13.72))),
            "FTSE",
            Decimal::ZERO,
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(draft.side, Side::Buy);
        assert_eq!(draft.op, OrderOp::Open);
        assert_eq!(draft.quantity, dec!(100));
        assert_eq!(draft.stop_price, Some(dec!(13.72)));
        assert!(draft.on_filled.is_none());
    }

    #[test]
    fn buy_against_short_closes_first_with_follow_up() {
        let draft = translate_decision(
            &decision(SystemAction::Buy, dec!(100), Some(dec!(9.8))),
            "FTSE",
            dec!(-40),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(draft.op, OrderOp::Close);
        assert_eq!(draft.quantity, dec!(40));
        let follow_up = draft.on_filled.unwrap();
        assert_eq!(follow_up.action, SystemAction::Buy);
        assert_eq!(follow_up.quantity, dec!(100));
        assert_eq!(follow_up.stop_price, Some(dec!(9.8)));
    }

    #[test]
    fn flat_closes_everything_or_down_to_the_remainder() {
        let all = translate_decision(
            &decision(SystemAction::Flat, Decimal::ZERO, None),
            "FTSE",
            dec!(100),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(all.quantity, dec!(100));
        assert_eq!(all.side, Side::Sell);
        assert_eq!(all.op, OrderOp::Close);

        let partial = translate_decision(
            &decision(SystemAction::Flat, dec!(30), None),
            "FTSE",
            dec!(100),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(partial.quantity, dec!(70));

        assert!(translate_decision(
            &decision(SystemAction::Flat, Decimal::ZERO, None),
            "FTSE",
            Decimal::ZERO,
            Uuid::new_v4(),
        )
        .is_none());
    }

    #[test]
    fn flat_on_short_position_buys_back() {
        let draft = translate_decision(
            &decision(SystemAction::Flat, Decimal::ZERO, None),
            "FTSE",
            dec!(-25),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(draft.side, Side::Buy);
        assert_eq!(draft.quantity, dec!(25));
    }

    #[test]
    fn reporting_actions_produce_no_order() {
        for action in [
            SystemAction::NoAction,
            SystemAction::Delay,
            SystemAction::PreBuy,
            SystemAction::PreSell,
            SystemAction::BuyLost,
            SystemAction::SellLost,
            SystemAction::Hold,
        ] {
            assert!(translate_decision(
                &decision(action, dec!(10), None),
                "FTSE",
                Decimal::ZERO,
                Uuid::new_v4(),
            )
            .is_none());
        }
    }

    #[test]
    fn stop_update_requires_a_position() {
        assert!(translate_decision(
            &decision(SystemAction::Stpr, Decimal::ZERO, Some(dec!(10))),
            "FTSE",
            Decimal::ZERO,
            Uuid::new_v4(),
        )
        .is_none());
        let draft = translate_decision(
            &decision(SystemAction::Stpr, Decimal::ZERO, Some(dec!(10))),
            "FTSE",
            dec!(50),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(draft.op, OrderOp::UpdateStop);
        assert_eq!(draft.stop_price, Some(dec!(10)));
    }

    #[test]
    fn follow_up_translates_to_an_open() {
        let follow_up = FollowUpAction {
            action: SystemAction::Sell,
            quantity: dec!(20),
            stop_price: Some(dec!(11)),
        };
        let draft = translate_follow_up(&follow_up, "FTSE", None).unwrap();
        assert_eq!(draft.side, Side::Sell);
        assert_eq!(draft.op, OrderOp::Open);
        assert_eq!(draft.quantity, dec!(20));
    }
}
