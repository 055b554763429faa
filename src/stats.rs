use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// CPU 时间统计（/proc/stat 聚合行，单位为 jiffies）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// 空闲时间 = idle + iowait
    #[inline]
    pub fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// 全部字段之和
    pub fn total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
            self.guest,
            self.guest_nice,
        ]
        .iter()
        .fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

/// CPU 基线：上一次读取到的 (total, idle) 计数
///
/// 每个采样器持有自己的基线，读改写在同一把锁内完成，避免并发采样产生错乱的增量。
#[derive(Debug, Default)]
pub struct CpuBaseline {
    prev: Mutex<Option<(u64, u64)>>,
}

impl CpuBaseline {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已经建立基线
    pub fn is_primed(&self) -> bool {
        self.prev
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 用当前计数推进基线并返回使用率百分比 (0.0-100.0)
    ///
    /// 第一次调用没有基线，返回 0；总时间增量不为正（计数器重置等）时同样返回 0。
    /// 无论返回什么，基线都会被更新为当前计数。
    pub fn advance(&self, current: &CpuTimes) -> f64 {
        let total = current.total();
        let idle = current.idle_total();

        let previous = self
            .prev
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((total, idle));

        let Some((prev_total, prev_idle)) = previous else {
            return 0.0;
        };

        if total <= prev_total {
            return 0.0;
        }

        let total_diff = total - prev_total;
        let idle_diff = idle.saturating_sub(prev_idle);

        // 使用率：1 - (空闲时间增量 / 总时间增量)
        let usage = (1.0 - idle_diff as f64 / total_diff as f64) * 100.0;
        usage.clamp(0.0, 100.0)
    }
}

/// CPU 占用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub usage: f64,
}

/// 内存占用（字节）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    /// 可用内存（MemAvailable），而不是 MemFree
    pub free: u64,
    pub usage: f64,
}

/// 磁盘占用（字节）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
    pub mount: String,
}

/// 一次采样的快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// 毫秒级 Unix 时间戳
    pub timestamp: u64,
    pub cpu: CpuUsage,
    pub mem: MemoryUsage,
    pub disk: DiskUsage,
}

/// 系统资源获取错误类型
#[derive(Debug)]
pub enum StatsError {
    IoError(std::io::Error),
    ParseError(String),
    CommandFailed(String),
    Timeout(&'static str),
}

impl From<std::io::Error> for StatsError {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        StatsError::IoError(error)
    }
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::IoError(e) => write!(f, "IO 错误: {e}"),
            StatsError::ParseError(s) => write!(f, "解析错误: {s}"),
            StatsError::CommandFailed(s) => write!(f, "命令执行失败: {s}"),
            StatsError::Timeout(reading) => write!(f, "读取超时: {reading}"),
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;

/// 统一的百分比收尾：非有限值记为 0，截断到 [0, 100]，保留一位小数
#[inline]
pub fn clamp_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// part / whole 的百分比，whole 为 0 时返回 0
#[inline]
fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

/// 当前毫秒级 Unix 时间戳
#[inline]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 解析 /proc/stat 中的聚合 CPU 行
///
/// 缺失或无法解析的字段按 0 处理；找不到 `cpu ` 行时返回解析错误。
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| StatsError::ParseError("/proc/stat 中没有聚合 cpu 行".to_string()))?;

    let mut parts = line
        .split_whitespace()
        .skip(1) // 跳过 "cpu"
        .map(|v| v.parse::<u64>().unwrap_or(0));
    let mut next = || parts.next().unwrap_or(0);

    Ok(CpuTimes {
        user: next(),
        nice: next(),
        system: next(),
        idle: next(),
        iowait: next(),
        irq: next(),
        softirq: next(),
        steal: next(),
        guest: next(),
        guest_nice: next(),
    })
}

/// 解析 /proc/meminfo（数值单位为 KiB，返回字节）
///
/// 旧内核没有 MemAvailable 时，以 MemFree + Buffers + Cached 估算。
pub fn parse_meminfo(content: &str) -> Result<MemoryUsage> {
    let mut total = None;
    let mut available = None;
    let mut free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };

        match key {
            "MemTotal:" => total = Some(value),
            "MemAvailable:" => available = Some(value),
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    let total_kb =
        total.ok_or_else(|| StatsError::ParseError("/proc/meminfo 缺少 MemTotal".to_string()))?;
    let available_kb = available
        .unwrap_or_else(|| free.saturating_add(buffers).saturating_add(cached));

    // 已用内存 = 总内存 - 可用内存
    let used_kb = total_kb.saturating_sub(available_kb);

    Ok(MemoryUsage {
        total: total_kb.saturating_mul(1024),
        used: used_kb.saturating_mul(1024),
        free: available_kb.saturating_mul(1024),
        usage: ratio_percent(used_kb, total_kb),
    })
}

/// 解析 POSIX 格式 `df -P -B1` 的输出，取最后一行数据
pub fn parse_df_output(output: &str, mount: &str) -> Result<DiskUsage> {
    let line = output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| StatsError::ParseError("df 输出为空".to_string()))?;

    // Filesystem Size Used Avail Use% Mounted on
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(StatsError::ParseError(format!("df 输出列数不足: {line}")));
    }

    let column = |idx: usize, name: &str| {
        fields[idx].parse::<u64>().map_err(|_| {
            StatsError::ParseError(format!("无法解析 df 的 {name} 列: {}", fields[idx]))
        })
    };

    let total = column(1, "total")?;
    let used = column(2, "used")?;
    let free = column(3, "available")?;

    Ok(DiskUsage {
        total,
        used,
        free,
        usage: ratio_percent(used, total),
        mount: mount.to_string(),
    })
}

/// 采样器配置
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub proc_stat: PathBuf,
    pub proc_meminfo: PathBuf,
    /// 统计磁盘占用的挂载点
    pub mount_point: String,
    /// 磁盘查询命令，`--` 与挂载点依次追加在最后
    pub disk_command: Vec<String>,
    /// 单项读取的超时时间
    pub reading_timeout: Duration,
}

impl Default for SamplerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            proc_stat: PathBuf::from("/proc/stat"),
            proc_meminfo: PathBuf::from("/proc/meminfo"),
            mount_point: "/".to_string(),
            disk_command: vec!["df".to_string(), "-P".to_string(), "-B1".to_string()],
            reading_timeout: Duration::from_secs(2),
        }
    }
}

/// 主机资源采样器
#[derive(Debug)]
pub struct Sampler {
    config: SamplerConfig,
    baseline: Arc<CpuBaseline>,
}

/// 采样器引用类型别名
pub type SamplerRef = Arc<Sampler>;

impl Sampler {
    /// 使用全新的 CPU 基线创建采样器
    #[inline]
    pub fn new(config: SamplerConfig) -> Self {
        Self::with_baseline(config, Arc::new(CpuBaseline::new()))
    }

    /// 使用外部传入的 CPU 基线创建采样器
    #[inline]
    pub fn with_baseline(config: SamplerConfig, baseline: Arc<CpuBaseline>) -> Self {
        Self { config, baseline }
    }

    #[inline]
    pub fn baseline(&self) -> &Arc<CpuBaseline> {
        &self.baseline
    }

    /// 读取 CPU 使用率（增量算法），成功读取后推进基线
    pub async fn read_cpu_usage(&self) -> Result<f64> {
        let content = read_host_file(&self.config.proc_stat).await?;
        let times = parse_cpu_times(&content)?;
        Ok(self.baseline.advance(&times))
    }

    /// 读取内存占用
    pub async fn read_memory_usage(&self) -> Result<MemoryUsage> {
        let content = read_host_file(&self.config.proc_meminfo).await?;
        parse_meminfo(&content)
    }

    /// 通过外部命令读取挂载点的磁盘占用
    pub async fn read_disk_usage(&self) -> Result<DiskUsage> {
        let (program, args) = self
            .config
            .disk_command
            .split_first()
            .ok_or_else(|| StatsError::CommandFailed("磁盘查询命令为空".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .arg("--")
            .arg(&self.config.mount_point)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StatsError::CommandFailed(format!(
                "{program} ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_df_output(&stdout, &self.config.mount_point)
    }

    /// 并发读取三项指标并生成快照
    pub async fn sample(&self) -> Result<Sample> {
        let (cpu, mem, disk) = tokio::try_join!(
            self.bounded("cpu", self.read_cpu_usage()),
            self.bounded("memory", self.read_memory_usage()),
            self.bounded("disk", self.read_disk_usage()),
        )?;

        Ok(Sample {
            timestamp: now_millis(),
            cpu: CpuUsage {
                usage: clamp_percent(cpu),
            },
            mem: MemoryUsage {
                usage: clamp_percent(mem.usage),
                ..mem
            },
            disk: DiskUsage {
                usage: clamp_percent(disk.usage),
                ..disk
            },
        })
    }

    async fn bounded<T>(
        &self,
        reading: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.reading_timeout, fut)
            .await
            .unwrap_or(Err(StatsError::Timeout(reading)))
    }
}

/// 创建采样器实例的便捷函数
#[inline]
pub fn create_sampler(config: SamplerConfig) -> SamplerRef {
    Arc::new(Sampler::new(config))
}

async fn read_host_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        StatsError::IoError(std::io::Error::new(
            e.kind(),
            format!("{}: {e}", path.display()),
        ))
    })
}
