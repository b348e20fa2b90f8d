use anyhow::Result;
use std::sync::Arc;
use tabpilot::{
    ChannelStatusSink, ChromiumConfig, ChromiumTabs, Controller, ControllerConfig, GeminiClient,
    GeminiConfig, MemoryRunStore, StartReply, StatusEvent,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let goal = args
        .next()
        .unwrap_or_else(|| "Open the settings page".to_string());
    let start_url = args.next().unwrap_or_else(|| "https://example.com".to_string());

    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY missing"))?;

    let tabs = ChromiumTabs::launch(ChromiumConfig { headless: false, user_agent: None }).await?;
    tabs.open(&start_url).await?;

    let (sink, mut events) = ChannelStatusSink::channel();
    let ctrl = Controller::new(
        tabs,
        GeminiClient::new(GeminiConfig::default()),
        MemoryRunStore::with_api_key(api_key),
        Arc::new(sink),
        ControllerConfig::default(),
    );

    match ctrl.start_goal(&goal).await? {
        StartReply::Accepted => {}
        StartReply::Busy => anyhow::bail!("a run is already active"),
    }

    while let Some(event) = events.recv().await {
        match event {
            StatusEvent::Status(text) => println!("[status] {text}"),
            StatusEvent::LogLine(text) => println!("         {text}"),
            StatusEvent::InterventionNeeded(text) => println!("[intervention] {text}"),
            StatusEvent::Response(text) => {
                println!("[done] {text}");
                break;
            }
        }
    }

    Ok(())
}
