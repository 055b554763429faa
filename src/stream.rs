//! 采样结果的推送订阅
//!
//! 每个订阅对应一个 tokio 任务：先写入一帧注释，然后立即采样一次，
//! 之后按固定间隔采样并推送。客户端断开、写入失败或显式关闭都会走同一个
//! `Subscription::close`，只生效一次。

use crate::sse::Frame;
use crate::stats::SamplerRef;
use futures_util::Stream;
use hyper::body::Bytes;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 默认推送间隔
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// 订阅已关闭，帧无法写入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionClosed;

impl std::fmt::Display for SubscriptionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "订阅已关闭")
    }
}

impl std::error::Error for SubscriptionClosed {}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 待发送的帧：注释帧单独保留，数据帧只保留最新的一帧
#[derive(Default)]
struct Outbox {
    comment: Option<Bytes>,
    latest: Option<Bytes>,
    waker: Option<Waker>,
}

impl Outbox {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

struct SubscriptionInner {
    id: u64,
    closed: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    outbox: Mutex<Outbox>,
    active: Arc<AtomicUsize>,
}

/// 一个订阅的资源句柄：定时任务 + 待发送的帧
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 关闭订阅：停止定时任务并丢弃未发送的帧
    ///
    /// 只有第一次调用生效并返回 `true`，之后的调用什么也不做。
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(ticker) = lock(&self.inner.ticker).take() {
            ticker.abort();
        }
        {
            let mut outbox = lock(&self.inner.outbox);
            outbox.comment = None;
            outbox.latest = None;
            outbox.wake();
        }

        let remaining = self.inner.active.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("订阅 #{} 已关闭，剩余订阅数: {remaining}", self.inner.id);
        true
    }

    /// 写入一帧，不等待传输层
    ///
    /// 数据帧和错误帧会覆盖尚未被取走的上一帧，返回值表示是否发生了覆盖。
    pub fn push(&self, frame: &Frame) -> Result<bool, SubscriptionClosed> {
        let mut outbox = lock(&self.inner.outbox);
        if self.is_closed() {
            return Err(SubscriptionClosed);
        }

        let slot = match frame {
            Frame::Comment(_) => &mut outbox.comment,
            Frame::Data(_) | Frame::Error => &mut outbox.latest,
        };
        let replaced = slot.replace(frame.encode()).is_some();
        outbox.wake();
        Ok(replaced)
    }

    fn poll_frame(&self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let mut outbox = lock(&self.inner.outbox);
        if self.is_closed() {
            return Poll::Ready(None);
        }

        // 注释帧总是先于数据帧
        let frame = match outbox.comment.take() {
            Some(comment) => Some(comment),
            None => outbox.latest.take(),
        };
        if frame.is_some() {
            return Poll::Ready(frame);
        }
        outbox.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn attach_ticker(&self, handle: JoinHandle<()>) {
        let mut slot = lock(&self.inner.ticker);
        if self.is_closed() {
            handle.abort();
            return;
        }
        *slot = Some(handle);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 交给 HTTP 响应体的帧流，被丢弃即视为客户端断开
pub struct FrameStream {
    subscription: Subscription,
}

impl Stream for FrameStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_frame(cx).map(|frame| frame.map(Ok))
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if self.subscription.close() {
            info!("订阅 #{} 客户端断开", self.subscription.id());
        }
    }
}

/// 推送发布器
///
/// 发布器被丢弃时，它建立的所有订阅都会随之关闭。
pub struct StreamPublisher {
    sampler: SamplerRef,
    interval: Duration,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
}

/// 发布器引用类型别名
pub type PublisherRef = Arc<StreamPublisher>;

impl StreamPublisher {
    /// 创建发布器，间隔为 0 时按 1 毫秒处理
    pub fn new(sampler: SamplerRef, interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sampler,
            interval: interval.max(Duration::from_millis(1)),
            next_id: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 当前存活的订阅数
    #[inline]
    pub fn active_subscribers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// 建立新订阅，必须在 tokio 运行时中调用
    pub fn subscribe(&self) -> (Subscription, FrameStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;

        let subscription = Subscription {
            inner: Arc::new(SubscriptionInner {
                id,
                closed: AtomicBool::new(false),
                ticker: Mutex::new(None),
                outbox: Mutex::new(Outbox::default()),
                active: self.active.clone(),
            }),
        };

        let handle = tokio::spawn(run_subscription(
            subscription.clone(),
            self.sampler.clone(),
            self.interval,
            self.shutdown.subscribe(),
        ));
        subscription.attach_ticker(handle);

        info!("新的推送订阅 #{id}，当前订阅数: {active}");

        let stream = FrameStream {
            subscription: subscription.clone(),
        };
        (subscription, stream)
    }

    /// 关闭所有订阅（服务器停止时调用）
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// 创建发布器实例的便捷函数
#[inline]
pub fn create_publisher(sampler: SamplerRef, interval: Duration) -> PublisherRef {
    Arc::new(StreamPublisher::new(sampler, interval))
}

async fn run_subscription(
    subscription: Subscription,
    sampler: SamplerRef,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = subscription.id();

    if *shutdown.borrow_and_update() {
        subscription.close();
        return;
    }

    // 先发一帧注释，让中间代理认为连接已经建立
    if subscription.push(&Frame::Comment("ok".to_string())).is_err() {
        subscription.close();
        return;
    }

    // 第一次 tick 立即完成，客户端不必等满一个间隔
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                subscription.close();
                return;
            }
        }

        let frame = match sampler.sample().await {
            Ok(sample) => Frame::sample(&sample).unwrap_or_else(|e| {
                warn!("订阅 #{id} 序列化采样结果失败: {e}");
                Frame::Error
            }),
            Err(e) => {
                warn!("订阅 #{id} 采样失败: {e}");
                Frame::Error
            }
        };

        match subscription.push(&frame) {
            Ok(false) => {}
            Ok(true) => debug!("订阅 #{id} 客户端消费过慢，旧帧已被覆盖"),
            Err(SubscriptionClosed) => {
                subscription.close();
                return;
            }
        }
    }
}
