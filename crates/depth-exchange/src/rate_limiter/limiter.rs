//! 1분 창 가중치 기반 REST rate limiter.
//!
//! 거래소는 최근 1분간 사용한 가중치를 응답 헤더로 알려주지만, 동시에 나간
//! 요청들의 가중치는 아직 반영되지 않은 상태입니다. 그래서 세 가지 값을 함께
//! 추적합니다.
//!
//! - 서버가 알려준 사용량 (`used_weight`, 샘플 시각과 함께)
//! - 이번 분에 확인(confirm)된 요청 가중치 합 (`computed_used_weight`)
//! - 등록되었지만 아직 응답을 받지 못한 가중치 합 (`pending_total_weight`)
//!
//! 서버 샘플이 현재 분의 것이면 `max(used, computed) + pending`, 아니면
//! `computed + pending`을 현재 사용량 추정치로 씁니다.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use depth_core::{floor_minute, Clock, RateLimiterConfig, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 대기자 재확인 주기.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 418/429 응답 시 가용 배수에 곱하는 값.
pub const THROTTLE_FACTOR: f64 = 0.9;

#[derive(Debug)]
struct Registration {
    uri: String,
    weight: i64,
    registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RateWindow {
    used_weight: i64,
    used_weight_at: Option<DateTime<Utc>>,
    computed_used_weight: i64,
    pending_total_weight: i64,
    last_reset: DateTime<Utc>,
    multiplier: f64,
    registrations: HashMap<u64, Registration>,
    next_id: u64,
}

impl RateWindow {
    /// 분이 바뀌었으면 확인된 사용량을 초기화하고 지난 등록을 정리합니다.
    fn roll(&mut self, now: DateTime<Utc>) {
        if floor_minute(now) > floor_minute(self.last_reset) {
            self.computed_used_weight = 0;
            self.last_reset = now;
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let floor = floor_minute(now);
        let before = self.registrations.len();
        self.registrations.retain(|id, registration| {
            let live = registration.registered_at.timestamp() >= floor;
            if !live {
                debug!(
                    id,
                    uri = %registration.uri,
                    weight = registration.weight,
                    "Dropping registration from a previous window"
                );
            }
            live
        });

        let live_total: i64 = self.registrations.values().map(|r| r.weight).sum();
        if live_total != self.pending_total_weight {
            if before == self.registrations.len() {
                warn!(
                    tracked = self.pending_total_weight,
                    live = live_total,
                    "Pending weight drifted, correcting"
                );
            }
            self.pending_total_weight = live_total;
        }
    }

    fn is_sample_fresh(&self, now: DateTime<Utc>) -> bool {
        self.used_weight_at.is_some_and(|at| {
            now - at < ChronoDuration::minutes(1) && floor_minute(at) == floor_minute(now)
        })
    }

    fn guess_total_weight_in_force(&self, now: DateTime<Utc>) -> i64 {
        if self.is_sample_fresh(now) {
            self.used_weight.max(self.computed_used_weight) + self.pending_total_weight
        } else {
            self.computed_used_weight + self.pending_total_weight
        }
    }
}

/// 가중치 기반 rate limiter. 루트가 하나를 만들어 `Arc`로 나눠 씁니다.
pub struct WeightedRateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<RateWindow>,
    admission: tokio::sync::Mutex<()>,
    notify: Notify,
}

impl WeightedRateLimiter {
    /// 시스템 시계를 사용하는 limiter.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 시계를 주입합니다.
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let window = RateWindow {
            used_weight: 0,
            used_weight_at: None,
            computed_used_weight: 0,
            pending_total_weight: 0,
            last_reset: now,
            multiplier: config.available_weight_multiplier,
            registrations: HashMap::new(),
            next_id: 0,
        };
        Self {
            config,
            clock,
            window: Mutex::new(window),
            admission: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
        }
    }

    /// 설정.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn lock_window(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 분 경계를 반영한 뒤 창 상태를 읽습니다.
    fn with_window<R>(&self, f: impl FnOnce(&mut RateWindow, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut window = self.lock_window();
        window.roll(now);
        f(&mut window, now)
    }

    fn ceiling_for(&self, multiplier: f64) -> i64 {
        (self.config.max_usable_weight as f64 * multiplier).floor() as i64
    }

    /// 현재 허용 상한 (`max_usable_weight * 가용 배수`).
    pub fn ceiling(&self) -> i64 {
        let multiplier = self.lock_window().multiplier;
        self.ceiling_for(multiplier)
    }

    /// 현재 사용량 추정치.
    pub fn guess_total_weight_in_force(&self) -> i64 {
        self.with_window(|window, now| window.guess_total_weight_in_force(now))
    }

    /// 상한까지 남은 가중치 (음수일 수 있음).
    pub fn available_weight(&self) -> i64 {
        self.with_window(|window, now| {
            self.ceiling_for(window.multiplier) - window.guess_total_weight_in_force(now)
        })
    }

    /// 응답 대기 중인 가중치 합.
    pub fn pending_total_weight(&self) -> i64 {
        self.with_window(|window, _| window.pending_total_weight)
    }

    /// 이번 분에 확인된 가중치 합.
    pub fn computed_used_weight(&self) -> i64 {
        self.with_window(|window, _| window.computed_used_weight)
    }

    /// 마지막 서버 사용량 샘플.
    pub fn used_weight(&self) -> i64 {
        self.lock_window().used_weight
    }

    /// 현재 가용 배수.
    pub fn available_weight_multiplier(&self) -> f64 {
        self.lock_window().multiplier
    }

    /// 살아 있는 등록 수와 가중치 합.
    pub fn live_registrations(&self) -> (usize, i64) {
        self.with_window(|window, _| {
            (
                window.registrations.len(),
                window.registrations.values().map(|r| r.weight).sum(),
            )
        })
    }

    /// 현재 상한보다 큰 가중치는 기다려도 들어올 수 없으므로 바로 거부합니다.
    fn validate_weight(&self, weight: i64) -> ExchangeResult<()> {
        let ceiling = self.ceiling();
        if weight < 0 || weight > ceiling {
            return Err(ExchangeError::InvalidWeight {
                weight,
                max: ceiling,
            });
        }
        Ok(())
    }

    fn can_admit(&self, weight: i64) -> bool {
        self.with_window(|window, now| {
            window.guess_total_weight_in_force(now) + weight <= self.ceiling_for(window.multiplier)
        })
    }

    /// 창 잠금 안에서 다시 확인하고 등록합니다.
    fn register(self: &Arc<Self>, uri: &str, weight: i64) -> Option<ApiCallRegistration> {
        let id = self.with_window(|window, now| {
            let guess = window.guess_total_weight_in_force(now);
            if guess + weight > self.ceiling_for(window.multiplier) {
                return None;
            }
            window.next_id += 1;
            let id = window.next_id;
            window.registrations.insert(
                id,
                Registration {
                    uri: uri.to_string(),
                    weight,
                    registered_at: now,
                },
            );
            window.pending_total_weight += weight;
            Some(id)
        })?;

        Some(ApiCallRegistration {
            id,
            uri: uri.to_string(),
            weight,
            limiter: Arc::clone(self),
            confirmed: false,
        })
    }

    /// 대기 없이 등록을 시도합니다. 상한에 걸리면 `Ok(None)`.
    pub fn try_acquire(
        self: &Arc<Self>,
        uri: &str,
        weight: i64,
    ) -> ExchangeResult<Option<ApiCallRegistration>> {
        self.validate_weight(weight)?;
        let registration = self.register(uri, weight);
        if registration.is_some() {
            self.notify.notify_waiters();
        }
        Ok(registration)
    }

    /// 가중치 슬롯을 기다려 등록합니다.
    ///
    /// 상한 안에 들어올 때까지 대기하며, 대기 한도를 넘으면 `SlotWaitTimeout`,
    /// 토큰이 취소되면 `Cancelled`를 반환합니다. 취소된 호출은 등록을 남기지 않습니다.
    pub async fn wait_for_slot(
        self: &Arc<Self>,
        uri: &str,
        weight: i64,
        cancel: &CancellationToken,
    ) -> ExchangeResult<ApiCallRegistration> {
        self.validate_weight(weight)?;

        let started = Instant::now();
        let deadline = self.config.wait_for_slot_timeout().map(|t| started + t);
        let mut logged = false;

        loop {
            if cancel.is_cancelled() {
                return Err(ExchangeError::Cancelled);
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.can_admit(weight) {
                let _admission = self.admission.lock().await;
                if let Some(registration) = self.register(uri, weight) {
                    self.notify.notify_waiters();
                    if logged {
                        debug!(
                            uri,
                            weight,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Rate limit slot acquired"
                        );
                    }
                    return Ok(registration);
                }
            }

            if !logged {
                debug!(uri, weight, available = self.available_weight(), "Waiting for rate limit slot");
                logged = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
                _ = wait_deadline(deadline) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(uri, weight, waited_ms, "Timed out waiting for rate limit slot");
                    return Err(ExchangeError::SlotWaitTimeout { weight, waited_ms });
                }
                _ = &mut notified => {}
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// 등록을 확인합니다. `drop`과 같습니다.
    pub fn confirm(&self, registration: ApiCallRegistration) {
        drop(registration);
    }

    fn confirm_registration(&self, id: u64) {
        self.with_window(|window, now| {
            if let Some(registration) = window.registrations.remove(&id) {
                window.pending_total_weight -= registration.weight;
                if window.pending_total_weight < 0 {
                    warn!(
                        pending = window.pending_total_weight,
                        "Pending weight went negative, clamping"
                    );
                    window.pending_total_weight = 0;
                }
                if registration.registered_at.timestamp() >= floor_minute(now) {
                    window.computed_used_weight += registration.weight;
                }
            }
            window.sweep(now);
        });
        self.notify.notify_waiters();
    }

    fn mark_sent(&self, id: u64) {
        self.with_window(|window, now| {
            if let Some(registration) = window.registrations.get_mut(&id) {
                registration.registered_at = now;
            }
        });
    }

    /// 서버가 알려준 사용량을 반영합니다.
    ///
    /// 더 새로운 샘플은 그대로 받습니다. 같은 시각의 샘플은 그 시각이 정확히 분
    /// 경계이면 새 값, 아니면 큰 값을 씁니다. 오래된 샘플은 무시합니다.
    pub fn update_used_weight(&self, weight: i64, at: DateTime<Utc>) {
        {
            let mut window = self.lock_window();
            let accepted = match window.used_weight_at {
                None => Some(weight),
                Some(previous) if at > previous => Some(weight),
                Some(previous) if at == previous => {
                    if at.timestamp() == floor_minute(at) && at.timestamp_subsec_nanos() == 0 {
                        Some(weight)
                    } else {
                        Some(window.used_weight.max(weight))
                    }
                }
                Some(_) => None,
            };
            match accepted {
                Some(value) => {
                    window.used_weight = value;
                    window.used_weight_at = Some(at);
                }
                None => debug!(weight, at = %at, "Ignoring stale used weight sample"),
            }
        }
        self.notify_if_admissible();
    }

    fn notify_if_admissible(&self) {
        let admissible = self.with_window(|window, now| {
            window.guess_total_weight_in_force(now) < self.ceiling_for(window.multiplier)
        });
        if admissible {
            self.notify.notify_waiters();
        }
    }

    /// 418/429 응답을 받았을 때 호출합니다.
    ///
    /// 이번 분의 사용량을 상한 초과로 간주하고 가용 배수를 줄입니다.
    pub fn on_throttled(&self) {
        let now = self.clock.now();
        let mut window = self.lock_window();
        let ceiling = self.ceiling_for(window.multiplier);
        window.used_weight = ceiling + 1;
        window.used_weight_at = Some(window.used_weight_at.map_or(now, |at| at.max(now)));
        window.multiplier *= THROTTLE_FACTOR;
        warn!(
            multiplier = window.multiplier,
            ceiling = self.ceiling_for(window.multiplier),
            "Throttled by exchange, reducing usable weight"
        );
    }

    /// 가용 배수를 설정값으로 되돌립니다.
    pub fn reset_multiplier(&self) {
        self.lock_window().multiplier = self.config.available_weight_multiplier;
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for WeightedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let window = self.lock_window();
        f.debug_struct("WeightedRateLimiter")
            .field("used_weight", &window.used_weight)
            .field("computed_used_weight", &window.computed_used_weight)
            .field("pending_total_weight", &window.pending_total_weight)
            .field("multiplier", &window.multiplier)
            .finish()
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 슬롯 등록. 확인(`confirm`)하거나 버려지면 가중치가 대기에서 확인으로 옮겨갑니다.
#[derive(Debug)]
pub struct ApiCallRegistration {
    id: u64,
    uri: String,
    weight: i64,
    limiter: Arc<WeightedRateLimiter>,
    confirmed: bool,
}

impl ApiCallRegistration {
    /// 요청 URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 등록 가중치.
    pub fn weight(&self) -> i64 {
        self.weight
    }

    /// 응답을 받은 시각으로 등록 시각을 갱신합니다.
    pub fn mark_sent(&self) {
        self.limiter.mark_sent(self.id);
    }

    /// 등록을 확인합니다.
    pub fn confirm(mut self) {
        self.confirm_once();
    }

    fn confirm_once(&mut self) {
        if !self.confirmed {
            self.confirmed = true;
            self.limiter.confirm_registration(self.id);
        }
    }
}

impl Drop for ApiCallRegistration {
    fn drop(&mut self) {
        self.confirm_once();
    }
}
