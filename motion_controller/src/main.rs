use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use canbus::{GatewayBus, NodeId};
use tokio::sync::Mutex;
use tracing::{error, info};

use motion_controller::{
    config, logging, messenger::Messenger, models::SharedState, state_monitor,
    tool_detection::ToolDetector,
};

const BUS_QUEUE: usize = 256;

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    if should_create_config() {
        config::save_default_config()?;
    }

    let config = config::load_config()?;

    info!("connecting to CAN gateway at {}", config.gateway_addr());
    let bus = Arc::new(GatewayBus::connect(config.gateway_addr(), BUS_QUEUE).await?);
    let messenger = Arc::new(Messenger::new(bus, NodeId::Host));

    let (detector, mut tool_events) = ToolDetector::new(messenger.clone());
    let retry_count = config.tool_retry_count;
    let ready_wait = config.tool_ready_wait();
    tokio::spawn(async move {
        if let Err(e) = detector.run(retry_count, ready_wait).await {
            error!("tool detection stopped: {}", e);
        }
    });
    tokio::spawn(async move {
        while let Some(tools) = tool_events.recv().await {
            info!("attached tools: {:?}", tools);
        }
    });

    let shared_state = Arc::new(Mutex::new(SharedState::default()));
    let nodes = HashSet::from([
        NodeId::GantryX,
        NodeId::GantryY,
        NodeId::Head,
        NodeId::PipetteLeft,
        NodeId::PipetteRight,
    ]);

    state_monitor::run_state_monitor(
        messenger,
        shared_state,
        nodes,
        config.monitor_period(),
        config.response_timeout(),
    )
    .await
}
