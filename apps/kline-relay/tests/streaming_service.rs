//! Streaming Service Integration Tests
//!
//! Drives the full live path (polling, reconciliation, fan-in queue) over a
//! simulated market.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use kline_relay::{
    EventKind, KlineEvent, MarketError, RetryConfig, ServiceError, SimulatedMarket,
    Step, StreamSettings, StreamingService, Symbol, Timeframe, TopicHub, WatchOptions,
};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(100);

fn sym(raw: &str) -> Symbol {
    raw.parse().unwrap()
}

fn settings(queue_capacity: usize) -> StreamSettings {
    StreamSettings {
        queue_capacity,
        watch: WatchOptions {
            poll_interval: POLL,
            lookback: 2,
            retry: RetryConfig {
                jitter_factor: 0.0,
                ..RetryConfig::default().unlimited()
            },
        },
        ..StreamSettings::default()
    }
}

async fn collect(rx: &mut mpsc::Receiver<KlineEvent>, n: usize) -> Vec<KlineEvent> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        let event = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event within deadline")
            .expect("queue open");
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn reconciles_each_symbol_independently() {
    let market = Arc::new(SimulatedMarket::new());
    let cu = sym("SHFE.cu2401");
    let m = sym("DCE.m2405");
    market.script(
        &cu,
        vec![
            Step::bars(&[(1, 10), (2, 20)]),
            Step::bars(&[(1, 10), (2, 20)]),
            Step::bars(&[(2, 20), (3, 30)]),
        ],
    );
    market.script(
        &m,
        vec![
            Step::bars(&[(1, 1), (2, 2)]),
            Step::bars(&[(1, 1), (2, 3)]),
            Step::bars(&[(2, 4), (3, 5)]),
        ],
    );

    let service = StreamingService::new(market.clone(), vec![cu.clone(), m.clone()], settings(16));
    let mut rx = service.start().await.unwrap();
    let events = collect(&mut rx, 6).await;
    service.stop().await;

    let mut by_symbol: HashMap<Symbol, Vec<(i64, i64)>> = HashMap::new();
    for event in &events {
        assert_eq!(event.kind, EventKind::OnKline);
        by_symbol
            .entry(event.symbol.clone())
            .or_default()
            .push((event.payload.timestamp / 60_000, event.payload.volume));
    }

    assert_eq!(by_symbol[&cu], vec![(2, 20), (3, 30)]);
    // revision, finalization, new bar
    assert_eq!(by_symbol[&m], vec![(2, 2), (2, 3), (2, 4), (3, 5)]);
    assert!(!market.is_connected());
}

#[tokio::test(start_paused = true)]
async fn stop_with_full_queue_leaves_events_drainable() {
    let symbols = vec![sym("SHFE.cu2401"), sym("SHFE.al2401"), sym("DCE.m2405")];
    let market = Arc::new(SimulatedMarket::generated(
        &symbols,
        Timeframe::M1,
        10,
        1,
        6_000_000,
    ));
    let service = StreamingService::new(market.clone(), symbols, settings(50));
    let rx = service.start().await.unwrap();

    // Every poll closes a bar, so three symbols fill fifty slots quickly.
    tokio::time::sleep(POLL * 40).await;
    assert_eq!(service.live_tasks(), 3);

    timeout(POLL, service.stop())
        .await
        .expect("tasks stop within one poll interval");
    assert!(!service.is_running());
    assert_eq!(service.live_tasks(), 0);
    assert_eq!(market.disconnect_count(), 1);

    let mut rx = rx;
    let mut drained = 0;
    while let Some(event) = rx.recv().await {
        assert!(event.payload.timestamp > 0);
        drained += 1;
    }
    assert_eq!(drained, 50);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_ends_only_that_symbol() {
    let market = Arc::new(SimulatedMarket::new());
    let good = sym("SHFE.cu2401");
    let bad = sym("SHFE.zn2401");
    market.script(&good, vec![Step::bars(&[(1, 1), (2, 2)])]);
    market.script(
        &bad,
        vec![Step::Fail(MarketError::Protocol {
            message: "garbled".into(),
        })],
    );

    let service = StreamingService::new(market, vec![good.clone(), bad], settings(8));
    let mut rx = service.start().await.unwrap();

    let events = collect(&mut rx, 1).await;
    assert_eq!(events[0].symbol, good);

    tokio::time::sleep(POLL * 5).await;
    assert_eq!(service.live_tasks(), 1);
    assert!(service.is_running());
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_do_not_interrupt_stream() {
    let market = Arc::new(SimulatedMarket::new());
    let cu = sym("SHFE.cu2401");
    market.script(
        &cu,
        vec![
            Step::bars(&[(1, 1), (2, 2)]),
            Step::Fail(MarketError::transient("timeout")),
            Step::Fail(MarketError::transient("timeout")),
            Step::bars(&[(2, 2), (3, 3)]),
        ],
    );

    let service = StreamingService::new(market, vec![cu], settings(8));
    let mut rx = service.start().await.unwrap();
    let events = collect(&mut rx, 2).await;
    service.stop().await;

    let minutes: Vec<i64> = events.iter().map(|e| e.payload.timestamp / 60_000).collect();
    assert_eq!(minutes, vec![2, 3]);
}

#[tokio::test]
async fn rejected_connect_starts_nothing() {
    let market = Arc::new(SimulatedMarket::rejecting("gateway down"));
    let service = StreamingService::new(market.clone(), vec![sym("SHFE.cu2401")], settings(8));

    let err = service.start().await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Market(MarketError::Connection { .. })
    ));
    assert!(!service.is_running());
    assert_eq!(service.live_tasks(), 0);
    assert_eq!(market.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn publisher_delivers_to_topic_subscribers() {
    let market = Arc::new(SimulatedMarket::new());
    let cu = sym("SHFE.cu2401");
    market.script(
        &cu,
        vec![Step::bars(&[(1, 1), (2, 2)]), Step::bars(&[(2, 2), (3, 3)])],
    );

    let hub = Arc::new(TopicHub::new(16));
    let mut topic = hub.subscribe(&cu);

    let service = StreamingService::new(market, vec![cu], settings(8));
    let queue = service.start().await.unwrap();
    let publisher_hub = Arc::clone(&hub);
    let publisher = tokio::spawn(async move {
        publisher_hub
            .run_publisher(queue, CancellationToken::new())
            .await
    });

    let first = topic.recv().await.unwrap();
    let second = topic.recv().await.unwrap();
    assert_eq!(first.payload.timestamp, 2 * 60_000);
    assert_eq!(second.payload.timestamp, 3 * 60_000);

    service.stop().await;
    assert_eq!(publisher.await.unwrap(), 2);
}
