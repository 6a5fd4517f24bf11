//! B 站足迹清理 CLI
//!
//! 非交互式 CLI，用于测试和展示核心能力：
//! fetch 全量抓取（带断点自动续传）、sync 水位线增量补数、stats 本地统计

use anyhow::{Context, Result};
use bili_clean_core::bili::database::{Database, IncrementalFetcher, SyncManager};
use bili_clean_core::bili::fetch::{fetch, FetchOutcome, FetchPolicies, FetchProgressState};
use bili_clean_core::bili::types::{Progress, ProgressCallback};
use bili_clean_core::{ApiService, BiliApi};
use clap::{Parser, Subcommand};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// B 站足迹清理 CLI
#[derive(Parser, Debug)]
#[command(name = "bili-clean-cli")]
#[command(about = "B 站足迹清理 CLI - 抓取、同步与统计", long_about = None)]
struct Args {
    /// 完整 cookie 字符串（也可用环境变量 BILI_COOKIE）
    #[arg(long, env = "BILI_COOKIE")]
    cookie: String,

    /// 本地数据库地址
    #[arg(long, default_value = "sqlite://bili_clean.db?mode=rwc")]
    db: String,

    /// 日志级别（默认: info,bili_clean_core=debug）
    #[arg(long, default_value = "info,bili_clean_core=debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 全量抓取六个数据源并保存快照，断点自动续传
    Fetch {
        /// 同时抓取 AICU 存档数据
        #[arg(long)]
        aicu: bool,
    },
    /// 水位线增量补数：只取比本地更新的数据
    Sync {
        /// 同时补 AICU 存档数据
        #[arg(long)]
        aicu: bool,
    },
    /// 展示本地数据统计
    Stats,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|p| match p {
        Progress::Status(s) => info!("[CLI] {s}"),
        Progress::Activity(a) => info!("[CLI] {a}"),
    })
}

/// 断点暂停后自动重试的最大轮数
const MAX_FETCH_ROUNDS: u32 = 5;
/// 两轮之间的冷却时间，给风控留出退避余地
const ROUND_COOLDOWN: Duration = Duration::from_secs(30);

async fn run_fetch(api: &ApiService, db: Database, aicu: bool) -> Result<()> {
    let callback = progress_printer();
    let stop = AtomicBool::new(false);
    let policies = FetchPolicies::default();
    let mut state = FetchProgressState::default();

    for round in 1..=MAX_FETCH_ROUNDS {
        match fetch(api, &mut state, aicu, &policies, &stop, &callback).await? {
            FetchOutcome::Complete(data) => {
                info!(
                    "[CLI] ✅ 抓取完成: 通知 {} 条, 评论 {} 条, 弹幕 {} 条",
                    data.notifies.len(),
                    data.comments.len(),
                    data.danmus.len()
                );
                let uid = api.get_uid().await.context("获取 uid 失败，无法保存快照")?;
                let manager = SyncManager::new(db);
                manager.save_snapshot(uid, &data).await?;
                return Ok(());
            }
            FetchOutcome::Paused => {
                warn!(
                    "[CLI] 抓取在断点处暂停 ({round}/{MAX_FETCH_ROUNDS})，{}s 后自动续传",
                    ROUND_COOLDOWN.as_secs()
                );
                sleep(ROUND_COOLDOWN).await;
            }
        }
    }
    anyhow::bail!("连续 {MAX_FETCH_ROUNDS} 轮都未能完成抓取，请稍后再试")
}

async fn run_sync(api: &ApiService, db: Database, aicu: bool) -> Result<()> {
    let uid = api.get_uid().await.context("获取 uid 失败")?;
    let fetcher = IncrementalFetcher::new(db);
    let report = fetcher.sync_all(api, uid, aicu, &progress_printer()).await?;
    info!(
        "[CLI] ✅ 增量同步完成: 通知 +{}, 评论 +{}, 弹幕 +{}",
        report.new_notifies, report.new_comments, report.new_danmus
    );
    Ok(())
}

async fn run_stats(api: &ApiService, db: Database) -> Result<()> {
    let uid = api.get_uid().await.context("获取 uid 失败")?;
    let stats = db.get_stats(uid).await?;
    info!(
        "[CLI] 评论 {} 条（已删 {}），弹幕 {} 条（已删 {}），通知 {} 条（已删 {}）",
        stats.total_comments,
        stats.deleted_comments,
        stats.total_danmus,
        stats.deleted_danmus,
        stats.total_notifies,
        stats.deleted_notifies,
    );
    for (data_type, last_sync) in &stats.last_sync_times {
        info!("[CLI] {data_type} 上次同步时间: {last_sync}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level);

    let api = ApiService::new(&args.cookie)?;
    let db = Database::connect(&args.db).await?;

    match args.command {
        Command::Fetch { aicu } => run_fetch(&api, db, aicu).await,
        Command::Sync { aicu } => run_sync(&api, db, aicu).await,
        Command::Stats => run_stats(&api, db).await,
    }
}
