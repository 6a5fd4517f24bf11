//! 统一的抓取限速 / 退避策略
//!
//! 所有数据源共用同一套节流语义，只是参数不同：
//! 基础延迟在区间内均匀采样，叠加高斯扰动后不低于下限；
//! 另外以固定概率追加一次"长休息"模拟人类行为；每到第 N 页再强制休整一次。
//! 三种效果相互独立、可叠加。连续错误达到上限后由调用方保存断点退出。

use rand::Rng;
use rand_distr::Normal;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 基础延迟区间（秒），均匀采样
    pub base_min: f64,
    pub base_max: f64,
    /// 高斯扰动标准差（秒），0 表示不扰动
    pub jitter_sigma: f64,
    /// 单页延迟下限（秒）
    pub floor: f64,
    /// 长休息触发概率与区间（秒）
    pub long_pause_prob: f64,
    pub long_pause_min: f64,
    pub long_pause_max: f64,
    /// 每隔多少页强制休整一次，0 表示关闭
    pub rest_every: u32,
    pub rest_min: f64,
    pub rest_max: f64,
    /// 连续失败多少次后保存断点退出
    pub max_consecutive_errors: u32,
    /// 请求失败后的重试等待区间（秒）
    pub error_min: f64,
    pub error_max: f64,
}

impl BackoffPolicy {
    /// 通知类信息流（点赞/回复/@/系统通知）：轻量接口，基础延迟 1-2 秒
    pub fn feed() -> BackoffPolicy {
        BackoffPolicy {
            base_min: 1.0,
            base_max: 2.0,
            jitter_sigma: 1.0,
            floor: 1.0,
            long_pause_prob: 0.1,
            long_pause_min: 10.0,
            long_pause_max: 20.0,
            rest_every: 10,
            rest_min: 5.0,
            rest_max: 10.0,
            max_consecutive_errors: 3,
            error_min: 5.0,
            error_max: 8.0,
        }
    }

    /// AICU 存档接口：对方有反爬，基础延迟放大到 2-5 秒
    pub fn archive() -> BackoffPolicy {
        BackoffPolicy {
            base_min: 2.0,
            base_max: 5.0,
            ..BackoffPolicy::feed()
        }
    }

    /// 全零延迟，单元测试专用
    pub fn instant() -> BackoffPolicy {
        BackoffPolicy {
            base_min: 0.0,
            base_max: 0.0,
            jitter_sigma: 0.0,
            floor: 0.0,
            long_pause_prob: 0.0,
            long_pause_min: 0.0,
            long_pause_max: 0.0,
            rest_every: 0,
            rest_min: 0.0,
            rest_max: 0.0,
            max_consecutive_errors: 3,
            error_min: 0.0,
            error_max: 0.0,
        }
    }

    /// 第 `page` 页之后的翻页延迟（页号从 1 开始计）
    pub fn page_delay(&self, page: u32) -> Duration {
        let mut rng = rand::thread_rng();
        let mut delay = rng.gen_range(self.base_min..=self.base_max);

        if self.jitter_sigma > 0.0 {
            if let Ok(normal) = Normal::new(0.0, self.jitter_sigma) {
                delay += rng.sample(normal);
            }
        }
        delay = delay.max(self.floor);

        if self.long_pause_prob > 0.0 && rng.gen_bool(self.long_pause_prob) {
            delay += rng.gen_range(self.long_pause_min..=self.long_pause_max);
        }

        if self.rest_every > 0 && page > 0 && page % self.rest_every == 0 {
            delay += rng.gen_range(self.rest_min..=self.rest_max);
        }

        Duration::from_secs_f64(delay)
    }

    /// 请求失败后的重试等待
    pub fn error_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(self.error_min..=self.error_max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::feed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_delay_respects_floor() {
        let policy = BackoffPolicy::feed();
        for page in 1..200 {
            assert!(policy.page_delay(page).as_secs_f64() >= policy.floor);
        }
    }

    #[test]
    fn forced_long_pause_stacks_on_base() {
        let policy = BackoffPolicy {
            long_pause_prob: 1.0,
            jitter_sigma: 0.0,
            ..BackoffPolicy::feed()
        };
        // 长休息必定触发：延迟至少为 floor + long_pause_min
        let d = policy.page_delay(1).as_secs_f64();
        assert!(d >= policy.floor + policy.long_pause_min);
    }

    #[test]
    fn periodic_rest_applies_on_every_nth_page() {
        let policy = BackoffPolicy {
            base_min: 1.0,
            base_max: 1.0,
            jitter_sigma: 0.0,
            long_pause_prob: 0.0,
            ..BackoffPolicy::feed()
        };
        let tenth = policy.page_delay(10).as_secs_f64();
        let ninth = policy.page_delay(9).as_secs_f64();
        assert!(tenth >= 1.0 + policy.rest_min);
        assert!(ninth < 1.0 + policy.rest_min);
    }

    #[test]
    fn error_delay_within_range() {
        let policy = BackoffPolicy::archive();
        for _ in 0..50 {
            let d = policy.error_delay().as_secs_f64();
            assert!(d >= policy.error_min && d <= policy.error_max);
        }
    }

    #[test]
    fn instant_policy_is_zero() {
        let policy = BackoffPolicy::instant();
        assert_eq!(policy.page_delay(10), Duration::ZERO);
        assert_eq!(policy.error_delay(), Duration::ZERO);
    }
}
