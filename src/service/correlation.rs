use crate::models::Payment;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// notifyPayment 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// 已交给挂起中的任务
    Delivered(String),
    /// 暂无等待的任务, 先缓存
    Buffered,
}

/// park 的结果
#[derive(Debug)]
pub enum Parking {
    /// 付款先于任务到达
    Ready(Payment),
    Parked(oneshot::Receiver<Payment>),
}

#[derive(Debug)]
struct Buffered {
    payment: Payment,
    at: Instant,
}

#[derive(Debug, Default)]
struct Book {
    /// job_id -> (发票键, 唤醒通道)
    parked: HashMap<String, (Option<String>, oneshot::Sender<Payment>)>,
    /// 发票键 -> 按挂起顺序排列的 job_id
    by_invoice: HashMap<String, VecDeque<String>>,
    buffered_by_job: HashMap<String, Buffered>,
    buffered_by_ref: HashMap<String, Buffered>,
}

impl Book {
    fn unlink(&mut self, invoice_key: &str, job_id: &str) {
        if let Some(queue) = self.by_invoice.get_mut(invoice_key) {
            queue.retain(|j| j != job_id);
            if queue.is_empty() {
                self.by_invoice.remove(invoice_key);
            }
        }
    }

    fn prune(&mut self, ttl: Duration) {
        let before = self.buffered_by_job.len() + self.buffered_by_ref.len();
        self.buffered_by_job.retain(|_, b| b.at.elapsed() < ttl);
        self.buffered_by_ref.retain(|_, b| b.at.elapsed() < ttl);
        let expired = before - self.buffered_by_job.len() - self.buffered_by_ref.len();
        if expired > 0 {
            debug!("清理过期未关联付款 {} 笔", expired);
        }
    }

    fn buffered_len(&self) -> usize {
        self.buffered_by_job.len() + self.buffered_by_ref.len()
    }

    /// 淘汰最早缓存的一笔
    fn evict_oldest(&mut self) {
        let oldest_job = self
            .buffered_by_job
            .iter()
            .min_by_key(|(_, b)| b.at)
            .map(|(k, b)| (k.clone(), b.at));
        let oldest_ref = self
            .buffered_by_ref
            .iter()
            .min_by_key(|(_, b)| b.at)
            .map(|(k, b)| (k.clone(), b.at));

        let evicted = match (oldest_job, oldest_ref) {
            (Some((k, a)), Some((_, b))) if a <= b => self.buffered_by_job.remove(&k),
            (_, Some((k, _))) => self.buffered_by_ref.remove(&k),
            (Some((k, _)), None) => self.buffered_by_job.remove(&k),
            (None, None) => None,
        };
        if let Some(b) = evicted {
            warn!(payment_id = %b.payment.payment_id, "付款缓存已满, 丢弃最早的未关联付款");
        }
    }
}

/// 付款与挂起任务的关联簿
///
/// 挂起只登记一个 oneshot 通道, 不占用 worker; 所有查找与登记在同一把锁内完成,
/// 付款与任务谁先到都不会丢. 未关联的付款按 ttl 过期, 总数不超过 capacity.
#[derive(Debug)]
pub struct PaymentBook {
    inner: Mutex<Book>,
    ttl: Duration,
    capacity: usize,
}

impl Default for PaymentBook {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), 10_000)
    }
}

fn key(reference: &str) -> String {
    reference.trim().to_ascii_uppercase()
}

impl PaymentBook {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Book::default()),
            ttl,
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Book> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 任务进入等待: 先认领缓存的付款, 否则登记续体
    pub fn park(&self, job_id: &str, invoice_number: Option<&str>) -> Parking {
        let mut book = self.lock();
        book.prune(self.ttl);

        if let Some(buffered) = book.buffered_by_job.remove(job_id) {
            return Parking::Ready(buffered.payment);
        }
        let invoice_key = invoice_number.map(key).filter(|k| !k.is_empty());
        if let Some(k) = &invoice_key {
            if let Some(buffered) = book.buffered_by_ref.remove(k) {
                return Parking::Ready(buffered.payment);
            }
        }

        let (tx, rx) = oneshot::channel();
        if let Some(k) = &invoice_key {
            let queue = book.by_invoice.entry(k.clone()).or_default();
            if !queue.is_empty() {
                warn!(
                    job_id = %job_id,
                    "发票号 {} 已有等待中的任务 {:?}, 按挂起顺序关联",
                    k,
                    queue
                );
            }
            queue.push_back(job_id.to_string());
        }
        book.parked.insert(job_id.to_string(), (invoice_key, tx));
        Parking::Parked(rx)
    }

    /// 按显式 job_id 或 reference=发票号 关联
    pub fn deliver(&self, payment: Payment) -> Correlation {
        let mut book = self.lock();
        book.prune(self.ttl);

        let target = payment
            .job_id
            .clone()
            .filter(|j| book.parked.contains_key(j))
            .or_else(|| {
                book.by_invoice
                    .get(&key(&payment.reference))
                    .and_then(|q| q.front().cloned())
            });

        if let Some(job_id) = target {
            if let Some((invoice_key, tx)) = book.parked.remove(&job_id) {
                if let Some(k) = invoice_key {
                    book.unlink(&k, &job_id);
                }
                match tx.send(payment) {
                    Ok(()) => return Correlation::Delivered(job_id),
                    // 接收端已放弃 (取消/超时), 当作未关联处理
                    Err(payment) => return self.buffer(&mut book, payment),
                }
            }
        }

        self.buffer(&mut book, payment)
    }

    fn buffer(&self, book: &mut Book, payment: Payment) -> Correlation {
        if self.capacity == 0 {
            warn!(payment_id = %payment.payment_id, "付款缓存已禁用, 丢弃未关联付款");
            return Correlation::Buffered;
        }
        while book.buffered_len() >= self.capacity {
            book.evict_oldest();
        }
        let buffered = Buffered {
            at: Instant::now(),
            payment,
        };
        match buffered.payment.job_id.clone() {
            Some(job_id) => {
                book.buffered_by_job.insert(job_id, buffered);
            }
            None => {
                book.buffered_by_ref.insert(key(&buffered.payment.reference), buffered);
            }
        }
        Correlation::Buffered
    }

    /// 任务结束/取消/超时后清理登记
    pub fn forget(&self, job_id: &str) {
        let mut book = self.lock();
        if let Some((Some(k), _)) = book.parked.remove(job_id) {
            book.unlink(&k, job_id);
        }
    }

    pub fn is_parked(&self, job_id: &str) -> bool {
        self.lock().parked.contains_key(job_id)
    }

    /// 当前缓存的未关联付款数 (已过期的不计)
    pub fn buffered_count(&self) -> usize {
        let mut book = self.lock();
        book.prune(self.ttl);
        book.buffered_len()
    }
}
