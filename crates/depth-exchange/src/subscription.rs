//! 전송 계층별 구독 상태.
//!
//! 구독 하나는 대기(pending), 구독됨(subscribed), 해제 대기(pending unsubscribe)
//! 세 집합 중 최대 하나에만 속합니다. 재연결하면 `Incremental` 프로토콜은 모든
//! 구독을 초기화하고 다시 보냅니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 채널 + 종목 구독.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    /// 채널 (예: `books`, `orderbook`, `depth@100ms`)
    pub channel: String,
    /// 거래소 종목 코드
    pub instrument: String,
}

impl Subscription {
    /// 새 구독.
    pub fn new(channel: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            instrument: instrument.into(),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.instrument)
    }
}

/// 구독 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// 추적하지 않음
    None,
    /// 구독 요청을 보냈고 확인 대기 중
    Pending,
    /// 구독 확인됨
    Subscribed,
    /// 해제 요청을 보냈고 확인 대기 중
    PendingUnsubscribe,
}

/// 세 개의 상호 배타적 구독 집합.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    pending: HashMap<Subscription, DateTime<Utc>>,
    subscribed: HashMap<Subscription, DateTime<Utc>>,
    pending_unsubscribe: HashMap<Subscription, DateTime<Utc>>,
}

impl SubscriptionSet {
    /// 빈 집합.
    pub fn new() -> Self {
        Self::default()
    }

    /// 구독 요청을 기록합니다.
    ///
    /// 이미 구독된 경우 에러, 이미 대기 중이면 `false`를 반환합니다.
    /// 해제 대기 중이던 구독은 대기 상태로 되돌립니다.
    pub fn pending_subscription(
        &mut self,
        subscription: Subscription,
        at: DateTime<Utc>,
    ) -> ExchangeResult<bool> {
        if self.subscribed.contains_key(&subscription) {
            return Err(ExchangeError::Subscription(format!(
                "{} is already subscribed",
                subscription
            )));
        }
        self.pending_unsubscribe.remove(&subscription);
        if self.pending.contains_key(&subscription) {
            return Ok(false);
        }
        self.pending.insert(subscription, at);
        Ok(true)
    }

    /// 구독 확인을 반영합니다.
    ///
    /// `check_was_pending`이면 대기 중이 아니던 구독 확인은 에러입니다.
    /// 이미 구독된 경우 `false`.
    pub fn confirm_subscription(
        &mut self,
        subscription: Subscription,
        at: DateTime<Utc>,
        check_was_pending: bool,
    ) -> ExchangeResult<bool> {
        let was_pending = self.pending.remove(&subscription).is_some();
        if check_was_pending && !was_pending {
            return Err(ExchangeError::Subscription(format!(
                "{} was not pending",
                subscription
            )));
        }
        self.pending_unsubscribe.remove(&subscription);
        Ok(self.subscribed.insert(subscription, at).is_none())
    }

    /// 해제 요청을 기록합니다.
    ///
    /// `check_was_subscribed`이면 구독되지 않은 항목의 해제는 에러입니다.
    pub fn unsubscribe(
        &mut self,
        subscription: Subscription,
        at: DateTime<Utc>,
        check_was_subscribed: bool,
    ) -> ExchangeResult<bool> {
        let was_subscribed = self.subscribed.remove(&subscription).is_some();
        let was_pending = self.pending.remove(&subscription).is_some();
        if check_was_subscribed && !was_subscribed {
            return Err(ExchangeError::Subscription(format!(
                "{} was not subscribed",
                subscription
            )));
        }
        if !was_subscribed && !was_pending {
            return Ok(false);
        }
        Ok(self.pending_unsubscribe.insert(subscription, at).is_none())
    }

    /// 해제 확인 또는 강제 제거. 제거된 집합 수를 반환합니다.
    pub fn force_remove(&mut self, subscription: &Subscription) -> usize {
        [
            self.pending.remove(subscription),
            self.subscribed.remove(subscription),
            self.pending_unsubscribe.remove(subscription),
        ]
        .iter()
        .filter(|removed| removed.is_some())
        .count()
    }

    /// 구독 상태.
    pub fn get_state(&self, subscription: &Subscription) -> SubscriptionState {
        if self.pending.contains_key(subscription) {
            SubscriptionState::Pending
        } else if self.subscribed.contains_key(subscription) {
            SubscriptionState::Subscribed
        } else if self.pending_unsubscribe.contains_key(subscription) {
            SubscriptionState::PendingUnsubscribe
        } else {
            SubscriptionState::None
        }
    }

    /// 추적 중인지 여부.
    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.get_state(subscription) != SubscriptionState::None
    }

    /// 대기 중인 구독 수.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 확인된 구독 수.
    pub fn subscribed_count(&self) -> usize {
        self.subscribed.len()
    }

    /// 전체 추적 수.
    pub fn len(&self) -> usize {
        self.pending.len() + self.subscribed.len() + self.pending_unsubscribe.len()
    }

    /// 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 유지해야 할 구독 (대기 + 구독됨), 정렬됨.
    pub fn active(&self) -> Vec<Subscription> {
        let mut active: Vec<Subscription> = self
            .pending
            .keys()
            .chain(self.subscribed.keys())
            .cloned()
            .collect();
        active.sort();
        active
    }

    /// 대기, 구독됨, 해제 대기 순으로 순회합니다.
    pub fn iter(&self) -> impl Iterator<Item = (&Subscription, SubscriptionState)> {
        self.pending
            .keys()
            .map(|s| (s, SubscriptionState::Pending))
            .chain(self.subscribed.keys().map(|s| (s, SubscriptionState::Subscribed)))
            .chain(
                self.pending_unsubscribe
                    .keys()
                    .map(|s| (s, SubscriptionState::PendingUnsubscribe)),
            )
    }

    /// 재연결 시 모든 상태를 `None`으로 되돌립니다.
    ///
    /// 해제 대기 중이던 구독은 새 연결에서 요청하지 않으므로 해제 확인 없이
    /// 제거된 것으로 보고 `dropped`에 담습니다.
    pub fn reset_all(&mut self) -> SubscriptionReset {
        let resend = self.active();
        let mut dropped: Vec<Subscription> =
            self.pending_unsubscribe.drain().map(|(s, _)| s).collect();
        dropped.sort();
        self.pending.clear();
        self.subscribed.clear();
        SubscriptionReset { resend, dropped }
    }
}

/// `reset_all` 결과.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionReset {
    /// 새 연결에서 다시 보낼 구독 (정렬됨)
    pub resend: Vec<Subscription>,
    /// 해제 확인 없이 버려진 구독 (정렬됨)
    pub dropped: Vec<Subscription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(symbol: &str) -> Subscription {
        Subscription::new("books", symbol)
    }

    #[test]
    fn test_subscribe_lifecycle() {
        let now = Utc::now();
        let mut set = SubscriptionSet::new();
        let btc = sub("BTC-USDT");

        assert!(set.pending_subscription(btc.clone(), now).unwrap());
        assert!(!set.pending_subscription(btc.clone(), now).unwrap());
        assert_eq!(set.get_state(&btc), SubscriptionState::Pending);

        assert!(set.confirm_subscription(btc.clone(), now, true).unwrap());
        assert_eq!(set.get_state(&btc), SubscriptionState::Subscribed);
        assert!(set.pending_subscription(btc.clone(), now).is_err());

        assert!(set.unsubscribe(btc.clone(), now, true).unwrap());
        assert_eq!(set.get_state(&btc), SubscriptionState::PendingUnsubscribe);

        assert_eq!(set.force_remove(&btc), 1);
        assert_eq!(set.get_state(&btc), SubscriptionState::None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_states_mutually_exclusive() {
        let now = Utc::now();
        let mut set = SubscriptionSet::new();
        let eth = sub("ETH-USDT");

        set.pending_subscription(eth.clone(), now).unwrap();
        set.unsubscribe(eth.clone(), now, false).unwrap();
        assert_eq!(set.len(), 1);
        // 해제 대기 중 재구독하면 대기로 복귀
        set.pending_subscription(eth.clone(), now).unwrap();
        assert_eq!(set.get_state(&eth), SubscriptionState::Pending);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_checked_transitions() {
        let now = Utc::now();
        let mut set = SubscriptionSet::new();
        assert!(set.confirm_subscription(sub("A"), now, true).is_err());
        assert!(set.unsubscribe(sub("A"), now, true).is_err());
        assert!(!set.unsubscribe(sub("B"), now, false).unwrap());
        // 확인만 와도 구독됨으로 기록 (요청 없이 들어온 ack)
        assert!(set.confirm_subscription(sub("C"), now, false).unwrap());
        assert_eq!(set.subscribed_count(), 1);
    }

    #[test]
    fn test_reset_all_returns_active() {
        let now = Utc::now();
        let mut set = SubscriptionSet::new();
        set.pending_subscription(sub("B"), now).unwrap();
        set.confirm_subscription(sub("A"), now, false).unwrap();
        set.confirm_subscription(sub("C"), now, false).unwrap();
        set.unsubscribe(sub("C"), now, true).unwrap();

        let reset = set.reset_all();
        assert_eq!(reset.resend, vec![sub("A"), sub("B")]);
        assert_eq!(reset.dropped, vec![sub("C")]);
        assert!(set.is_empty());
    }
}
