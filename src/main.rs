use anyhow::Result;
use clap::Parser;
use host_metrics_sse::{Config, StatusServer, create_publisher, create_sampler};
use log::info;

/// 主机资源采样服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 服务器绑定地址 (默认: ::，支持 IPv4 和 IPv6)
    #[arg(short, long, env = "HOST_METRICS_ADDRESS", default_value = "::")]
    address: String,

    /// 服务器端口 (默认: 8080)
    #[arg(short, long, env = "HOST_METRICS_PORT", default_value_t = 8080)]
    port: u16,

    /// 统计磁盘占用的挂载点 (默认: /)
    #[arg(short, long, env = "HOST_METRICS_MOUNT", default_value = "/")]
    mount: String,

    /// 推送间隔毫秒数 (默认: 1000)
    #[arg(
        short,
        long,
        env = "HOST_METRICS_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_ms: u64,

    /// 单项读取超时毫秒数 (默认: 2000)
    #[arg(
        short,
        long,
        env = "HOST_METRICS_TIMEOUT_MS",
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_ms: u64,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, env = "HOST_METRICS_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            bind_address: self.address.clone(),
            port: self.port,
            mount_point: self.mount.clone(),
            interval_ms: self.interval_ms,
            reading_timeout_ms: self.timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志系统
    init_logger(&args.log_level);

    info!("资源采样服务启动中...");

    let config = args.config();
    info!(
        "配置信息 - 地址: {}, 端口: {}, 挂载点: {}, 推送间隔: {} 毫秒, 读取超时: {} 毫秒",
        config.bind_address,
        config.port,
        config.mount_point,
        config.interval_ms,
        config.reading_timeout_ms
    );

    let addr = config.address()?;

    let sampler = create_sampler(config.sampler_config());
    let publisher = create_publisher(sampler.clone(), config.interval());
    info!("采样器与推送发布器初始化完成");

    let server = StatusServer::new(sampler, publisher);
    info!("服务器将在 {addr} 启动");

    server.run(addr).await?;

    Ok(())
}

/// 初始化日志系统
fn init_logger(level: &str) {
    match env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .try_init()
    {
        Ok(()) => info!("日志系统初始化成功，级别: {level}"),
        Err(e) => eprintln!("日志系统初始化失败: {e}"),
    }
}
