//! scanflow-core
//!
//! Core building blocks for the scan pipeline: a four-stage chain over a durable broker,
//! reward granting with background persistence, and the live progress bridge.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, context, message, events, reward, topology, errors）
//! - **ports**: 抽象化レイヤー（Broker, EventSource, OutboxStore, OwnershipStore, RewardRpc, など）
//! - **app**: アプリケーションロジック（builder, executor, worker_loop, publisher_loop, dlq_loop, reward, bridge）
//! - **impls**: 実装（InMemoryBroker など開発用）
//! - **config**: 環境変数からの設定読み込み
//! - **observability**: tracing の初期化と queue stats

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
