#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use asr_scheduler::config::Settings;
use asr_scheduler::schedule::scheduler::VERSION;
use asr_scheduler::utils::logger;
use asr_scheduler::{build_context, web};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env();

    // 初始化日志系统
    let _guard = logger::init(&settings.server.log_dir)?;
    info!("Starting ASR scheduler {}...", VERSION);

    let addr = settings.server.bind_addr;
    let ctx = Arc::new(build_context(settings).await?);

    // 启动 HTTP 服务器，ctrl-c 时优雅退出
    let served = web::start_server(ctx.clone(), addr).await;
    match &served {
        Ok(()) => info!("Server stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }

    info!("Shutting down...");
    let aborted = ctx.scheduler.shutdown();
    if aborted > 0 {
        info!("Aborted {} in-flight job(s)", aborted);
    }

    served
}
