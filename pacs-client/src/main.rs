//! PACS网络客户端命令行程序

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pacs_admin::ConfigManager;
use pacs_core::{
    fields, Authentication, Destination, OperationStatus, PacsConnection, Protocol, QueryLevel,
    RequestPriority,
};
use pacs_network::{PacsEvent, PacsNetworkService};
use pacs_storage::CacheName;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

/// PACS客户端命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-client")]
#[command(about = "PACS 网络客户端：连接测试、查询与检索")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 测试连接 (C-ECHO 或 HTTP 探测)
    Echo {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// 查询远端档案
    Query {
        #[command(flatten)]
        target: TargetArgs,

        /// 查询层级: patient, study, series, image
        #[arg(long, default_value = "study")]
        level: QueryLevel,

        /// 查询条件，格式 `Key=Value`，可重复
        #[arg(short = 'q', long = "criterion", value_parser = parse_criterion)]
        criteria: Vec<(String, String)>,
    },
    /// 检索一个序列的全部实例
    Retrieve {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        study: String,

        #[arg(long)]
        series: String,

        /// 将检索到的对象写入该目录
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 调度优先级: urgent, high, normal, low
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: RequestPriority,
    },
}

/// 目标连接：已保存的连接ID或临时给出的地址
#[derive(Args, Debug)]
struct TargetArgs {
    /// 已注册连接的ID
    #[arg(long, conflicts_with = "host")]
    connection: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value = "8042")]
    port: u16,

    /// 协议: dicomweb, wado, dimse
    #[arg(long, default_value = "dicomweb")]
    protocol: Protocol,

    /// 使用 HTTPS
    #[arg(long)]
    secure: bool,

    /// 路径前缀，例如 /dicom-web
    #[arg(long)]
    path_prefix: Option<String>,

    #[arg(long, default_value = "PACS_CLIENT")]
    calling_ae: String,

    #[arg(long, default_value = "ANY-SCP")]
    called_ae: String,

    /// Bearer 令牌
    #[arg(long, conflicts_with = "username")]
    token: Option<String>,

    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// 退出时保留临时注册的连接
    #[arg(long)]
    save: bool,
}

impl TargetArgs {
    fn connection(&self, host: &str) -> PacsConnection {
        let auth = match (&self.token, &self.username, &self.password) {
            (Some(token), _, _) => Authentication::Bearer { token: token.clone() },
            (None, Some(username), Some(password)) => Authentication::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Authentication::None,
        };
        let mut conn = PacsConnection::new(host, host, self.port, self.protocol)
            .with_ae_titles(&self.calling_ae, &self.called_ae)
            .with_auth(auth)
            .with_secure(self.secure);
        if let Some(prefix) = &self.path_prefix {
            conn = conn.with_path_prefix(prefix);
        }
        conn
    }
}

/// 解析后的目标连接，临时连接在退出时移除
struct Target {
    id: String,
    ephemeral: bool,
}

async fn resolve_target(service: &PacsNetworkService, args: &TargetArgs) -> Result<Target> {
    if let Some(id) = &args.connection {
        if service.registry().get(id).await.is_none() {
            bail!("连接 {} 不存在", id);
        }
        return Ok(Target {
            id: id.clone(),
            ephemeral: false,
        });
    }

    let Some(host) = &args.host else {
        bail!("需要 --connection 或 --host");
    };
    let id = service
        .registry()
        .add(args.connection(host))
        .await
        .context("注册连接失败")?;
    Ok(Target {
        id,
        ephemeral: !args.save,
    })
}

fn parse_criterion(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("条件格式应为 Key=Value: {}", s))?;
    if key.trim().is_empty() {
        return Err(format!("条件缺少属性名: {}", s));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn parse_priority(s: &str) -> std::result::Result<RequestPriority, String> {
    match s.to_ascii_lowercase().as_str() {
        "urgent" => Ok(RequestPriority::Urgent),
        "high" => Ok(RequestPriority::High),
        "normal" => Ok(RequestPriority::Normal),
        "low" => Ok(RequestPriority::Low),
        _ => Err(format!("未知优先级: {}", s)),
    }
}

async fn echo(service: &PacsNetworkService, target: &Target) -> Result<()> {
    let ok = service.registry().test_connection(&target.id).await;
    let conn = service
        .registry()
        .get(&target.id)
        .await
        .context("连接在测试过程中被移除")?;

    if ok {
        info!(
            "连接 {} 可用，响应时间 {:.1} ms",
            conn.base_url(),
            conn.statistics.average_response_time_ms
        );
        Ok(())
    } else {
        bail!(
            "连接 {} 不可用: {}",
            conn.base_url(),
            conn.statistics.last_error.unwrap_or_default()
        )
    }
}

async fn query(
    service: &PacsNetworkService,
    target: &Target,
    level: QueryLevel,
    criteria: Vec<(String, String)>,
) -> Result<()> {
    let criteria: BTreeMap<String, String> = criteria.into_iter().collect();
    let query = service.queries().execute(level, criteria, &target.id).await?;

    if query.status != OperationStatus::Completed {
        bail!("查询失败: {}", query.error.unwrap_or_default());
    }
    info!("查询完成，{} 条结果", query.results.len());
    for result in &query.results {
        println!("{}", serde_json::to_string(&result.data)?);
    }
    Ok(())
}

async fn retrieve(
    service: &PacsNetworkService,
    target: &Target,
    study: String,
    series: String,
    output: Option<PathBuf>,
    priority: RequestPriority,
) -> Result<()> {
    let criteria = BTreeMap::from([
        (fields::STUDY_INSTANCE_UID.to_string(), study),
        (fields::SERIES_INSTANCE_UID.to_string(), series),
    ]);
    let query = service
        .queries()
        .execute(QueryLevel::Image, criteria, &target.id)
        .await?;
    if query.status != OperationStatus::Completed {
        bail!("实例查询失败: {}", query.error.unwrap_or_default());
    }
    if query.results.is_empty() {
        warn!("序列中没有实例");
        return Ok(());
    }

    // 先订阅再启动，避免漏掉进度事件
    let mut events = service.subscribe();
    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, priority)
        .await?;
    info!("检索任务 {} 已启动，共 {} 个实例", job.id, job.progress.total);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消检索");
                service.retrieval().cancel(job.id).await;
                break;
            }
            event = events.recv() => match event {
                Ok(PacsEvent::JobProgress { job_id, progress }) if job_id == job.id => {
                    info!(
                        "进度 {:.1}% ({} 成功, {} 失败, {:.2} MB/s)",
                        progress.percentage,
                        progress.completed,
                        progress.failed,
                        progress.speed / 1_000_000.0
                    );
                }
                Ok(PacsEvent::JobCompleted { job: done }) if done.id == job.id => break,
                Ok(PacsEvent::JobCancelled { job_id }) if job_id == job.id => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("跳过了 {} 个事件", skipped);
                    // 结束事件可能就在被跳过的事件里
                    if job_finished(service, job.id).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let job = service
        .retrieval()
        .get_job(job.id)
        .await
        .context("检索任务已丢失")?;
    info!(
        "检索结束: 状态 {:?}, 成功 {}, 失败 {}, 共 {} 字节",
        job.status, job.progress.completed, job.progress.failed, job.progress.bytes_transferred
    );

    if let Some(dir) = output {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("无法创建目录 {}", dir.display()))?;
        let mut written = 0;
        for item in &query.results {
            let key = pacs_network::delivery::cache_key(item);
            let Some(data) = service.memory().get(CacheName::Image, key).await else {
                continue;
            };
            let path = dir.join(format!("{}.dcm", key));
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("写入 {} 失败", path.display()))?;
            written += 1;
        }
        info!("已写入 {} 个文件到 {}", written, dir.display());
    }

    if job.status != OperationStatus::Completed {
        bail!("检索未完成: {:?}", job.status);
    }
    Ok(())
}

/// 任务已结束或已丢失
async fn job_finished(service: &PacsNetworkService, job_id: Uuid) -> bool {
    service
        .retrieval()
        .get_job(job_id)
        .await
        .map_or(true, |job| job.status.is_terminal())
}

impl Command {
    fn target(&self) -> &TargetArgs {
        match self {
            Self::Echo { target } | Self::Query { target, .. } | Self::Retrieve { target, .. } => target,
        }
    }
}

async fn run(service: &PacsNetworkService, command: Command) -> Result<()> {
    let target = resolve_target(service, command.target()).await?;

    let result = match command {
        Command::Echo { .. } => echo(service, &target).await,
        Command::Query { level, criteria, .. } => query(service, &target, level, criteria).await,
        Command::Retrieve {
            study,
            series,
            output,
            priority,
            ..
        } => retrieve(service, &target, study, series, output, priority).await,
    };

    if target.ephemeral {
        service.registry().remove(&target.id).await;
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    let manager = ConfigManager::new(cli.config.as_deref()).context("加载配置失败")?;
    let config = manager.get_config().await;
    info!(
        "已启用协议: {:?}, 最大并发 {}",
        config.enabled_protocols(),
        config.max_concurrent_connections
    );

    let service = PacsNetworkService::new(config).context("创建网络服务失败")?;
    service.start().await.context("启动网络服务失败")?;

    let result = run(&service, cli.command).await;

    if let Err(e) = service.shutdown().await {
        error!("关闭网络服务失败: {}", e);
    }
    result
}
