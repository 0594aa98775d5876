//! scanflow デモ
//!
//! in-memory adapter だけでパイプライン全体を 1 run 分動かし、
//! progress stream の SSE frame を標準出力に流します。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use ulid::Ulid;

use scanflow_core::app::bridge::ProgressBridge;
use scanflow_core::app::reward::{
    CollectionSyncSink, EvaluatorRegistry, PersistExecutor, RewardDispatcher, RewardStage,
    classification_result,
};
use scanflow_core::app::{
    DlqReprocessor, OutboxRelay, PipelineBuilder, ReliablePublisher, ResilientRewardClient,
    ScanInput, Services, WorkerGroup,
};
use scanflow_core::config::Config;
use scanflow_core::domain::{
    CatalogItem, Chain, OwnerId, RunContext, StageError, StageId, StageOutput, Topology,
};
use scanflow_core::impls::{
    InMemoryBroker, InMemoryEventBus, InMemoryGrantLedger, InMemoryOutbox,
    InMemoryOwnershipStore, StaticCatalog,
};
use scanflow_core::observability::{LogFormat, init_logging};
use scanflow_core::ports::{
    GrantSink, RewardRpc, RpcStatus, StageHandler, SyncRequest, SyncResponse, SystemClock,
    UlidGenerator,
};

#[derive(Debug, Parser)]
#[command(name = "scanflow", about = "Run one scan through the in-memory pipeline")]
struct Args {
    /// Overrides SCANFLOW_LOG_FORMAT.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Make this stage fail permanently.
    #[arg(long)]
    fail_stage: Option<StageId>,

    /// Owner of the reward. Random when omitted.
    #[arg(long)]
    owner: Option<OwnerId>,

    #[arg(long, default_value = "https://example.com/scans/bottle.jpg")]
    image_url: String,

    #[arg(long)]
    user_input: Option<String>,

    /// Submit while the broker refuses publishes, then recover through the outbox.
    #[arg(long)]
    broker_outage: bool,
}

/// 固定の出力を返すデモ用ステージ
struct DemoStage {
    stage: StageId,
    latency: Duration,
    output: Value,
    fail: bool,
}

#[async_trait]
impl StageHandler for DemoStage {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(StageError::permanent(format!("{} rejected the input", self.stage)));
        }
        info!(run_id = %ctx.run_id(), stage = %self.stage, "demo stage done");
        match &self.output {
            Value::Object(map) => Ok(map.clone()),
            _ => Ok(StageOutput::new()),
        }
    }
}

/// コレクション側のデモ RPC（常に成功）
struct DemoCollectionRpc;

#[async_trait]
impl RewardRpc for DemoCollectionRpc {
    async fn sync_grant(&self, request: &SyncRequest) -> Result<SyncResponse, RpcStatus> {
        info!(owner_id = %request.owner_id, item = %request.item_code, "collection synced");
        Ok(SyncResponse {
            success: true,
            already_owned: false,
        })
    }
}

fn demo_catalog() -> StaticCatalog {
    StaticCatalog::new(vec![
        CatalogItem {
            code: "char-pet".into(),
            name: "Petty".into(),
            dialog: "Thanks for taking my cap off!".into(),
            item_type: Some("bottle".into()),
            match_label: Some("pet_bottle".into()),
        },
        CatalogItem {
            code: "char-can".into(),
            name: "Clank".into(),
            dialog: "Crush me flat, please.".into(),
            item_type: Some("can".into()),
            match_label: Some("aluminum_can".into()),
        },
    ])
}

fn demo_stages(fail: Option<StageId>) -> Vec<DemoStage> {
    let outputs = [
        (
            StageId::Vision,
            json!({"classification_result": classification_result("recyclable", "pet_bottle", Some("clear"))}),
        ),
        (
            StageId::Rule,
            json!({"disposal_rules": {"steps": ["remove the cap", "rinse", "crush"], "day": "wednesday"}}),
        ),
        (
            StageId::Answer,
            json!({"final_answer": {"text": "Rinse it and put it out on Wednesday.", "insufficiencies": []}}),
        ),
    ];
    outputs
        .into_iter()
        .map(|(stage, output)| DemoStage {
            stage,
            latency: Duration::from_millis(150),
            output,
            fail: fail == Some(stage),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    init_logging(config.log_format);

    // (A) adapter の用意（デモなので retry 間隔は短くする）
    let chain = Chain::standard().map_stages(|d| d.retry_delay = Duration::from_millis(200));
    let topology = Topology::standard(&chain);
    let broker = Arc::new(InMemoryBroker::new(&topology));
    let bus = Arc::new(InMemoryEventBus::new());
    let outbox = Arc::new(InMemoryOutbox::new());
    let ownership = Arc::new(InMemoryOwnershipStore::new());
    let ledger = Arc::new(InMemoryGrantLedger::new());

    let services = Services {
        broker: broker.clone(),
        events: bus.clone(),
        outbox: outbox.clone(),
        ids: Arc::new(UlidGenerator::new(SystemClock)),
        clock: Arc::new(SystemClock),
        outbox_key: config.outbox.category_key.clone(),
    };

    // (B) ハンドラ登録とパイプライン構築
    let dispatcher = Arc::new(RewardDispatcher::new(
        ownership.clone(),
        Arc::new(ReliablePublisher::new(
            broker.clone(),
            outbox.clone(),
            config.outbox.category_key.clone(),
        )),
        Arc::new(SystemClock),
    ));
    let reward_handler: Arc<dyn StageHandler> = if args.fail_stage == Some(StageId::Reward) {
        Arc::new(DemoStage {
            stage: StageId::Reward,
            latency: Duration::ZERO,
            output: Value::Null,
            fail: true,
        })
    } else {
        Arc::new(RewardStage::new(
            EvaluatorRegistry::standard(&config.reward),
            Arc::new(demo_catalog()),
            dispatcher,
        ))
    };

    let mut builder = PipelineBuilder::new(chain, services).register(reward_handler)?;
    for stage in demo_stages(args.fail_stage) {
        builder = builder.register(Arc::new(stage))?;
    }
    let pipeline = builder.build()?;

    // (C) 永続化 worker（reward.persist / my.sync）
    let client = Arc::new(ResilientRewardClient::new(Arc::new(DemoCollectionRpc), &config.rpc));
    let sinks: [Arc<dyn GrantSink>; 2] = [ledger.clone(), Arc::new(CollectionSyncSink::new(client))];
    let mut groups: Vec<WorkerGroup> = sinks
        .into_iter()
        .map(|sink| {
            let executor = Arc::new(PersistExecutor::new(sink, &config.reward));
            WorkerGroup::spawn(
                format!("persist-{}", executor.target()),
                1,
                executor.queue(),
                broker.clone(),
                executor,
                config.pipeline.consume_wait,
            )
        })
        .collect();

    // (D) run の投入。broker 障害時は outbox に退避され、relay で回収される
    let relay = OutboxRelay::new(outbox.clone(), broker.clone(), config.outbox.clone());
    broker.set_publish_down(args.broker_outage);
    let run_id = pipeline
        .submit(ScanInput {
            owner_id: args.owner.unwrap_or_else(|| OwnerId::from_ulid(Ulid::new())),
            image_url: args.image_url,
            user_input: args.user_input,
        })
        .await?;
    println!("submitted run {run_id}");
    if args.broker_outage {
        broker.set_publish_down(false);
        let stats = relay.run_once().await?;
        println!("outbox relay: {stats:?}");
    }

    // (E) stream を bind してから stage worker を起動する
    let bridge = ProgressBridge::new(bus.clone(), config.bridge.clone());
    let mut stream = bridge.open(run_id, None);
    let mut started = false;
    while let Some(frame) = stream.next_frame().await {
        print!("{}", frame.to_sse());
        if !started {
            groups.extend(pipeline.spawn_workers(&config.pipeline));
            started = true;
        }
    }
    println!("stream finished: {}", stream.state().as_str());

    // (F) 後片付け。永続化 queue が空になるのを少し待ってから止める
    tokio::time::sleep(Duration::from_millis(300)).await;
    for group in groups {
        group.shutdown_and_join().await;
    }

    let relay_stats = relay.run_once().await?;
    println!("outbox relay: {relay_stats:?}");
    let reprocessor = DlqReprocessor::new(broker.clone(), topology.dlq_routes(), config.dlq.clone());
    println!("dlq sweep: {:?}", reprocessor.run_once().await);

    for spec in topology.queues() {
        let stats = broker.stats(&spec.name).await;
        if stats != Default::default() {
            println!("{:<24} {stats:?}", spec.name);
        }
    }
    println!("ownership rows: {}, ledger rows: {}", ownership.count().await, ledger.len().await);
    Ok(())
}
