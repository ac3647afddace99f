mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{config, engine, engine_with, local_hour, provider};
use flowscout::paper::ledger::replay;
use flowscout::storage::Store;
use flowscout::types::OrderSide;

#[tokio::test]
async fn test_entries_debit_cash_with_costs() {
    let (store, engine) = engine().await;

    let report = engine.run_hourly(local_hour(10)).await.unwrap();
    let paper = report.paper.expect("paper trading is on by default");
    assert_eq!(paper.entries.len(), 3);
    assert!(paper.exits.is_empty());
    assert!(paper.entries.iter().all(|o| o.side == OrderSide::Buy && o.quantity > 0));
    assert!(paper.entries.iter().all(|o| o.timestamp == local_hour(10)));

    // 1.5 bps fee plus 3 bps slippage on every buy
    let spent: Decimal = paper
        .entries
        .iter()
        .map(|o| o.price * Decimal::from(o.quantity) * dec!(1.00045))
        .sum();
    let account = store.load_account().await.unwrap();
    assert_eq!(account.cash, dec!(1000000) - spent);
    assert!(account.cash >= Decimal::ZERO);
    assert_eq!(store.open_positions().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_held_positions_are_not_rebought() {
    let (store, engine) = engine().await;
    engine.run_hourly(local_hour(10)).await.unwrap();

    let second = engine.run_hourly(local_hour(11)).await.unwrap();
    let paper = second.paper.unwrap();
    assert!(paper.entries.is_empty());
    assert!(paper.exits.is_empty());
    assert_eq!(paper.open_positions, 3);

    let orders = store.all_orders().await.unwrap();
    assert_eq!(orders.len(), 3);
    let rebuilt = replay(&orders);
    let positions = store.open_positions().await.unwrap();
    assert_eq!(rebuilt.positions.len(), positions.len());
    for p in &positions {
        assert_eq!(rebuilt.positions[&p.instrument_id].quantity, p.quantity);
    }

    // marked up at the second cycle's prices
    assert!(paper.account.nav > paper.account.cash);
}

#[tokio::test]
async fn test_paper_trading_can_be_disabled() {
    let store = Store::in_memory().await.unwrap();
    let mut cfg = config();
    cfg.paper.enabled = false;
    let engine = engine_with(store.clone(), provider(), cfg);

    let report = engine.run_hourly(local_hour(10)).await.unwrap();
    assert!(report.paper.is_none());
    assert!(store.all_orders().await.unwrap().is_empty());
}
