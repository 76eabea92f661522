use market_stream::{BackoffPolicy, Interval, MarketError, SnapshotLoader};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        jitter: Duration::ZERO,
        max_attempts: 3,
    }
}

fn loader(base_url: &str) -> SnapshotLoader {
    SnapshotLoader::with_client(Client::new(), base_url, fast_retry())
}

fn kline_row(open_time: i64, close: &str) -> Value {
    json!([
        open_time,
        "100.0",
        "110.0",
        "95.0",
        close,
        "10.5",
        open_time + 3_599_999,
        "1050.0",
        42,
        "5.0",
        "500.0",
        "0"
    ])
}

#[tokio::test]
async fn history_request_clamps_limit_and_orders_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("interval", "1h"))
        .and(query_param("limit", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            kline_row(7_200_000, "102.0"),
            kline_row(3_600_000, "101.0"),
            kline_row(7_200_000, "102.0"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let candles = loader(&server.uri())
        .load_history("btcusdt", Interval::H1, 2_000)
        .await
        .expect("history should load");

    let starts: Vec<i64> = candles.iter().map(|candle| candle.period_start).collect();
    assert_eq!(starts, vec![3_600_000, 7_200_000]);
    assert_eq!(candles[0].close, 101.0);
    assert_eq!(candles[0].volume, 10.5);
}

#[tokio::test]
async fn transient_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([kline_row(0, "100.5")])))
        .expect(1)
        .mount(&server)
        .await;

    let candles = loader(&server.uri())
        .load_history("BTCUSDT", Interval::M1, 1)
        .await
        .expect("second attempt should succeed");

    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].close, 100.5);
}

#[tokio::test]
async fn invalid_symbol_is_rejected_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"code": -1121, "msg": "Invalid symbol."})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let error = loader(&server.uri())
        .load_summary("NOPEUSDT")
        .await
        .expect_err("invalid symbol should fail");

    let rest = match error {
        MarketError::Rejected(rest) => rest,
        other => panic!("expected a rejected request, got {other:?}"),
    };
    assert_eq!(rest.status, Some(400));
    assert_eq!(rest.code, -1121);
    assert_eq!(rest.message, "Invalid symbol.");
    assert!(rest.timestamp > 0);
}

#[tokio::test]
async fn rate_limit_exhausts_bounded_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_json(json!({"code": -1003, "msg": "Too many requests."})),
        )
        .expect(4)
        .mount(&server)
        .await;

    let error = loader(&server.uri())
        .load_history("BTCUSDT", Interval::M1, 10)
        .await
        .expect_err("rate limit should exhaust retries");

    assert!(error.is_retryable());
    let rest = match error {
        MarketError::Exhausted(rest) => rest,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(rest.status, Some(429));
    assert_eq!(rest.code, -1003);
}

#[tokio::test]
async fn unreachable_host_surfaces_network_error_after_retries() {
    let error = loader("http://127.0.0.1:1")
        .load_summary("BTCUSDT")
        .await
        .expect_err("closed port should fail");

    let rest = match error {
        MarketError::Exhausted(rest) => rest,
        other => panic!("expected exhausted retries, got {other:?}"),
    };
    assert_eq!(rest.status, None);
    assert_eq!(rest.code, -1);
}

#[tokio::test]
async fn summary_is_parsed_from_rolling_statistics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .and(query_param("symbol", "ETHUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "ETHUSDT",
            "priceChange": "-25.50",
            "priceChangePercent": "-0.810",
            "weightedAvgPrice": "3140.2",
            "lastPrice": "3120.00",
            "openPrice": "3145.50",
            "highPrice": "3190.00",
            "lowPrice": "3100.10",
            "volume": "152340.1",
            "quoteVolume": "478364132.7",
            "openTime": 1_700_000_000_000_i64,
            "closeTime": 1_700_086_399_999_i64,
            "firstId": 1,
            "lastId": 1001,
            "count": 1001
        })))
        .mount(&server)
        .await;

    let summary = loader(&server.uri())
        .load_summary("ethusdt")
        .await
        .expect("summary should load");

    assert_eq!(summary.symbol, "ETHUSDT");
    assert_eq!(summary.price_change, -25.5);
    assert_eq!(summary.price_change_percent, -0.81);
    assert_eq!(summary.last_price, 3120.0);
    assert_eq!(summary.trade_count, 1001);
}

#[tokio::test]
async fn spot_symbols_keep_only_trading_pairs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .and(query_param("permissions", "SPOT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {"symbol": "ETHUSDT", "status": "TRADING", "isSpotTradingAllowed": true},
                {"symbol": "BTCUSDT", "status": "TRADING", "isSpotTradingAllowed": true},
                {"symbol": "LUNAUSDT", "status": "BREAK", "isSpotTradingAllowed": true},
                {"symbol": "XYZUSDT", "status": "TRADING", "isSpotTradingAllowed": false},
                {"symbol": "BTCUSDT", "status": "TRADING", "isSpotTradingAllowed": true}
            ]
        })))
        .mount(&server)
        .await;

    let symbols = loader(&server.uri())
        .load_spot_symbols()
        .await
        .expect("symbols should load");

    assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
}
