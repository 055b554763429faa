use crate::stats::{SamplerConfig, SamplerRef};
use crate::stream::{DEFAULT_INTERVAL, PublisherRef};
use anyhow::{Context, Result};
use hyper::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderValue};
use hyper::http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use log::{error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// 轮询接口路径
pub const METRICS_PATH: &str = "/api/system/metrics";
/// 推送接口路径
pub const STREAM_PATH: &str = "/api/system/metrics/stream";

const NO_STORE: &str = "no-store";
const STREAM_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate, proxy-revalidate";

/// 状态服务器
pub struct StatusServer {
    sampler: SamplerRef,
    publisher: PublisherRef,
}

impl StatusServer {
    /// 创建新的状态服务器实例
    #[inline]
    pub fn new(sampler: SamplerRef, publisher: PublisherRef) -> Self {
        Self { sampler, publisher }
    }

    /// 运行服务器，直到收到 Ctrl-C
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("无法绑定地址 {addr}"))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// 在已绑定的监听器上提供服务，`shutdown` 完成后关闭所有订阅并优雅退出
    pub async fn serve(
        self,
        listener: std::net::TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        let sampler = self.sampler;
        let publisher = self.publisher;

        let make_svc = {
            let publisher = publisher.clone();
            make_service_fn(move |_conn| {
                let sampler = sampler.clone();
                let publisher = publisher.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        Self::handle_request(req, sampler.clone(), publisher.clone())
                    }))
                }
            })
        };

        // 推送连接是长连接，必须先关闭订阅，优雅退出才能完成
        let signal = async move {
            shutdown.await;
            info!("正在关闭 {} 个推送订阅", publisher.active_subscribers());
            publisher.shutdown();
        };

        let server = Server::from_tcp(listener)?
            .http1_keepalive(true)
            .http1_half_close(false)
            .tcp_keepalive(Some(Duration::from_secs(10)))
            .tcp_nodelay(true)
            .serve(make_svc)
            .with_graceful_shutdown(signal);

        info!("服务器运行在: http://{addr}");
        info!("轮询接口: {METRICS_PATH}，推送接口: {STREAM_PATH}");

        server.await.map_err(|e| {
            error!("服务器错误: {e}");
            anyhow::anyhow!("服务器运行错误: {e}")
        })?;

        info!("服务器正常关闭");
        Ok(())
    }

    /// 处理 HTTP 请求
    async fn handle_request(
        req: Request<Body>,
        sampler: SamplerRef,
        publisher: PublisherRef,
    ) -> std::result::Result<Response<Body>, Infallible> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, METRICS_PATH) => Ok(Self::serve_metrics(sampler).await),
            (&Method::GET, STREAM_PATH) => Ok(Self::serve_stream(&publisher)),
            (&Method::GET, "/health") => Ok(Self::serve_health()),
            _ => Ok(Self::serve_404()),
        }
    }

    /// 单次采样并以 JSON 返回
    async fn serve_metrics(sampler: SamplerRef) -> Response<Body> {
        let sample = match sampler.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                error!("采样失败: {e}");
                return Self::serve_json_error(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match serde_json::to_vec(&sample) {
            Ok(body) => Self::json_response(StatusCode::OK, Body::from(body)),
            Err(e) => {
                error!("序列化采样结果失败: {e}");
                Self::serve_json_error(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// 建立 SSE 推送
    fn serve_stream(publisher: &PublisherRef) -> Response<Body> {
        let (_subscription, frames) = publisher.subscribe();

        let mut response = Response::new(Body::wrap_stream(frames));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(STREAM_CACHE_CONTROL));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        response
    }

    /// 提供健康检查端点
    #[inline]
    fn serve_health() -> Response<Body> {
        let mut response = Response::new(Body::from("OK"));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    /// 提供 404 页面
    #[inline]
    fn serve_404() -> Response<Body> {
        warn!("请求了不存在的页面");
        let mut response = Response::new(Body::from("页面未找到"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// 以 `{"error": ...}` 返回错误
    #[inline]
    fn serve_json_error(message: &str, status: StatusCode) -> Response<Body> {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::json_response(status, Body::from(body))
    }

    fn json_response(status: StatusCode, body: Body) -> Response<Body> {
        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
        response
    }
}

/// 等待 Ctrl-C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听退出信号: {e}");
        std::future::pending::<()>().await;
    }
    info!("收到退出信号");
}

/// 配置结构
#[derive(Debug, Clone)]
pub struct Config {
    /// 服务端绑定地址
    pub bind_address: String,
    /// 服务端端口
    pub port: u16,
    /// 统计磁盘占用的挂载点
    pub mount_point: String,
    /// 推送间隔（毫秒）
    pub interval_ms: u64,
    /// 单项读取超时（毫秒）
    pub reading_timeout_ms: u64,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            mount_point: "/".to_string(),
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            reading_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// 构建服务器地址
    pub fn address(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .with_context(|| format!("无效的地址格式: {}", self.bind_address))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// 推送间隔
    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// 采样器配置
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            mount_point: self.mount_point.clone(),
            reading_timeout: Duration::from_millis(self.reading_timeout_ms),
            ..SamplerConfig::default()
        }
    }
}
