//! 活动跟踪器
//!
//! 抓取循环每秒可能处理数十到数百条数据，逐条回调会淹没消费方，
//! 因此跟踪器只在时间阈值或数量阈值到达时才发出一次快照。

use crate::bili::types::{ActivityInfo, Progress, ProgressCallback};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::debug;

/// 限流的活动跟踪器
///
/// `update(n)` 累加计数；仅当距上次发送超过时间阈值（通知源 2s、存档源 3s）
/// 或累计新增超过数量阈值（100/200 条）时才触发一次回调。
/// `finish()` 发送速度为 0 的最终快照，消费方以此判断阶段完成。
pub struct ActivityTracker {
    category: String,
    message: String,
    callback: ProgressCallback,
    start_time: Instant,
    last_emit: Instant,
    current_count: u64,
    last_reported: u64,
    emit_interval: Duration,
    emit_count_step: u64,
}

impl ActivityTracker {
    /// 通知类数据源用的默认阈值：每 2 秒或每 100 项
    pub fn new(category: &str, message: &str, callback: ProgressCallback) -> ActivityTracker {
        Self::with_thresholds(category, message, callback, Duration::from_secs(2), 100)
    }

    /// 存档类数据源数据量大，放宽到每 3 秒或每 200 项
    pub fn for_archive(category: &str, message: &str, callback: ProgressCallback) -> ActivityTracker {
        Self::with_thresholds(category, message, callback, Duration::from_secs(3), 200)
    }

    pub fn with_thresholds(
        category: &str,
        message: &str,
        callback: ProgressCallback,
        emit_interval: Duration,
        emit_count_step: u64,
    ) -> ActivityTracker {
        let now = Instant::now();
        ActivityTracker {
            category: category.to_string(),
            message: message.to_string(),
            callback,
            start_time: now,
            last_emit: now,
            current_count: 0,
            last_reported: 0,
            emit_interval,
            emit_count_step,
        }
    }

    /// 累加计数，必要时发出一次快照
    pub fn update(&mut self, count: u64) {
        self.current_count += count;
        let now = Instant::now();
        if now.duration_since(self.last_emit) >= self.emit_interval
            || self.current_count - self.last_reported >= self.emit_count_step
        {
            let elapsed = self.start_time.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                self.current_count as f64 / elapsed
            } else {
                0.0
            };
            self.emit(self.message.clone(), speed);
            self.last_emit = now;
            self.last_reported = self.current_count;
        }
    }

    /// 发送最终快照，速度置 0 表示阶段完成
    pub fn finish(&mut self) {
        self.emit(format!("{} - 完成", self.message), 0.0);
    }

    pub fn count(&self) -> u64 {
        self.current_count
    }

    fn emit(&self, message: String, speed: f64) {
        let info = ActivityInfo {
            message,
            current_count: self.current_count,
            speed,
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            category: self.category.clone(),
        };
        // 回调由外部提供，panic 不能中断抓取循环
        let cb = &self.callback;
        if catch_unwind(AssertUnwindSafe(|| cb(Progress::Activity(info)))).is_err() {
            debug!("[Activity] 进度回调 panic，已忽略");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::types::Progress;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn count_threshold_triggers_emit() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let cb: ProgressCallback = Arc::new(move |p| {
            if let Progress::Activity(info) = p {
                sink.lock().unwrap().push(info);
            }
        });
        let mut tracker =
            ActivityTracker::with_thresholds("liked", "正在获取点赞数据", cb, Duration::from_secs(3600), 100);

        for _ in 0..99 {
            tracker.update(1);
        }
        assert!(emitted.lock().unwrap().is_empty(), "未到阈值不应发送");

        tracker.update(1);
        let snapshots = emitted.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].current_count, 100);
        assert_eq!(snapshots[0].category, "liked");
    }

    #[test]
    fn finish_emits_zero_speed_snapshot() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let cb: ProgressCallback = Arc::new(move |p| {
            if let Progress::Activity(info) = p {
                sink.lock().unwrap().push(info);
            }
        });
        let mut tracker = ActivityTracker::new("replyed", "正在获取回复数据", cb);
        tracker.update(5);
        tracker.finish();

        let snapshots = emitted.lock().unwrap();
        let last = snapshots.last().expect("finish 必须发送快照");
        assert_eq!(last.speed, 0.0);
        assert_eq!(last.current_count, 5);
        assert!(last.message.ends_with("完成"));
    }

    #[test]
    fn panicking_callback_does_not_abort() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let cb: ProgressCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("回调故意崩溃");
        });
        let mut tracker =
            ActivityTracker::with_thresholds("system", "正在获取系统通知", cb, Duration::from_secs(3600), 1);
        tracker.update(1);
        tracker.update(1);
        tracker.finish();
        // 每次都触发了回调且循环没有被打断
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
