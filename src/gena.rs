//! GENA subscription management.
//!
//! Drives SUBSCRIBE / renewal / UNSUBSCRIBE against service event URLs,
//! tracks SID → service so the event receiver can route notifications, and
//! runs the keep-alive scheduler that renews subscriptions shortly before
//! they lapse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::{Device, Service, Subscription};
use crate::error::{Error, Result};

pub(crate) const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u32 = 300;

/// Renewals are issued this long before the advertised expiry, but never
/// earlier than at 9/10 of the subscription lifetime.
const RENEWAL_MARGIN: Duration = Duration::from_secs(10);
/// Lower bound on scheduler sleeps; guards against busy loops under clock
/// skew.
const MIN_SCHEDULER_SLEEP: Duration = Duration::from_secs(1);
const IDLE_SCHEDULER_SLEEP: Duration = Duration::from_secs(3600);

fn subscribe_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"SUBSCRIBE").expect("valid method")
}

fn unsubscribe_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"UNSUBSCRIBE").expect("valid method")
}

/// Parses a GENA `TIMEOUT` header value: `Second-N` (case-insensitive) in
/// milliseconds, `infinite` as −1.
pub(crate) fn parse_timeout_ms(value: &str) -> Result<i64> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("infinite") {
        return Ok(-1);
    }
    let seconds = value
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("second-"))
        .and_then(|_| value[7..].parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("bad TIMEOUT header {value:?}")))?;
    Ok(seconds.saturating_mul(1000))
}

/// Time after `subscriptionStart` at which the renewal should go out, or
/// `None` for an infinite subscription.
pub(crate) fn renewal_delay(timeout_ms: i64) -> Option<Duration> {
    if timeout_ms < 0 {
        return None;
    }
    let timeout = timeout_ms as u64;
    let margin = RENEWAL_MARGIN.as_millis() as u64;
    Some(Duration::from_millis(
        timeout.saturating_sub(margin).max(timeout / 10 * 9),
    ))
}

fn renew_at(service: &Service) -> Option<Instant> {
    let subscription = service.subscription()?;
    let delay = renewal_delay(subscription.timeout_ms)?;
    Some(subscription.started + delay)
}

#[derive(Default)]
struct Inner {
    /// SID → subscribed service, for event routing.
    registry: Mutex<HashMap<String, Arc<Service>>>,
    /// Services under keep-alive renewal.
    keepalive: Mutex<Vec<Arc<Service>>>,
    wake: Notify,
}

/// SUBSCRIBE / RENEW / UNSUBSCRIBE driver plus the keep-alive scheduler.
#[derive(Clone)]
pub struct SubscriptionManager {
    http: reqwest::Client,
    user_agent: String,
    timeout_secs: u32,
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub(crate) fn new(http: reqwest::Client, user_agent: impl Into<String>, timeout_secs: u32) -> Self {
        Self {
            http,
            user_agent: user_agent.into(),
            timeout_secs,
            inner: Arc::default(),
        }
    }

    /// Subscribes to a service's events, delivering to `callback_url`. With
    /// `keep`, the subscription is handed to the keep-alive scheduler.
    pub async fn subscribe(
        &self,
        service: &Arc<Service>,
        callback_url: &str,
        keep: bool,
    ) -> Result<()> {
        tracing::debug!(
            service = service.service_id(),
            url = %service.event_sub_url(),
            callback = callback_url,
            "subscribing"
        );
        let response = self
            .http
            .request(subscribe_method(), service.event_sub_url().clone())
            .header("NT", "upnp:event")
            .header("CALLBACK", format!("<{callback_url}>"))
            .header("TIMEOUT", format!("Second-{}", self.timeout_secs))
            .header("USER-AGENT", &self.user_agent)
            .header("CONTENT-LENGTH", "0")
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::Protocol(format!(
                "SUBSCRIBE {} returned status {status}",
                service.event_sub_url()
            )));
        }
        let sid = header(&response, "SID").unwrap_or_default();
        if sid.is_empty() {
            return Err(Error::Protocol(
                "SUBSCRIBE response without SID".to_string(),
            ));
        }
        let timeout_ms = match header(&response, "TIMEOUT") {
            Some(value) => parse_timeout_ms(&value)?,
            None => i64::from(self.timeout_secs) * 1000,
        };

        // a re-subscribe may hand out a fresh SID
        if let Some(previous) = service.subscription() {
            self.inner.registry.lock().remove(&previous.sid);
        }
        service.set_subscription(Subscription {
            sid: sid.clone(),
            started: Instant::now(),
            timeout_ms,
        });
        self.inner.registry.lock().insert(sid, service.clone());
        if keep && timeout_ms >= 0 {
            self.add_keepalive(service);
        }
        Ok(())
    }

    /// Renews an active subscription. The device must answer with the same
    /// SID.
    pub async fn renew(&self, service: &Arc<Service>) -> Result<()> {
        let current = service.subscription().ok_or_else(|| {
            Error::Protocol("renew without an active subscription".to_string())
        })?;
        tracing::debug!(service = service.service_id(), sid = %current.sid, "renewing");
        let response = self
            .http
            .request(subscribe_method(), service.event_sub_url().clone())
            .header("SID", &current.sid)
            .header("TIMEOUT", format!("Second-{}", self.timeout_secs))
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::Protocol(format!(
                "renewal SUBSCRIBE {} returned status {status}",
                service.event_sub_url()
            )));
        }
        let sid = header(&response, "SID").unwrap_or_default();
        if sid != current.sid {
            return Err(Error::Protocol(format!(
                "renewal returned SID {sid:?}, expected {:?}",
                current.sid
            )));
        }
        let timeout_ms = match header(&response, "TIMEOUT") {
            Some(value) => parse_timeout_ms(&value)?,
            None => current.timeout_ms,
        };
        service.set_subscription(Subscription {
            sid,
            started: Instant::now(),
            timeout_ms,
        });
        Ok(())
    }

    pub async fn unsubscribe(&self, service: &Arc<Service>) -> Result<()> {
        let current = service
            .subscription()
            .ok_or_else(|| Error::Protocol("service is not subscribed".to_string()))?;
        self.remove_keepalive(service);
        tracing::debug!(service = service.service_id(), sid = %current.sid, "unsubscribing");
        let response = self
            .http
            .request(unsubscribe_method(), service.event_sub_url().clone())
            .header("SID", &current.sid)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::Protocol(format!(
                "UNSUBSCRIBE {} returned status {status}",
                service.event_sub_url()
            )));
        }
        service.clear_subscription();
        self.inner.registry.lock().remove(&current.sid);
        Ok(())
    }

    pub(crate) fn service_by_sid(&self, sid: &str) -> Option<Arc<Service>> {
        self.inner.registry.lock().get(sid).cloned()
    }

    pub(crate) fn subscribed_services(&self) -> Vec<Arc<Service>> {
        self.inner.registry.lock().values().cloned().collect()
    }

    /// Marks every subscription of a removed device invalid, locally.
    pub(crate) fn invalidate_device(&self, device: &Device) {
        let mut registry = self.inner.registry.lock();
        for service in device.all_services() {
            if let Some(subscription) = service.subscription() {
                registry.remove(&subscription.sid);
                service.clear_subscription();
            }
            self.inner
                .keepalive
                .lock()
                .retain(|s| !Arc::ptr_eq(s, service));
        }
        self.inner.wake.notify_one();
    }

    pub(crate) fn clear(&self) {
        for (_, service) in self.inner.registry.lock().drain() {
            service.clear_subscription();
        }
        self.inner.keepalive.lock().clear();
        self.inner.wake.notify_one();
    }

    fn add_keepalive(&self, service: &Arc<Service>) {
        let mut keepalive = self.inner.keepalive.lock();
        if !keepalive.iter().any(|s| Arc::ptr_eq(s, service)) {
            keepalive.push(service.clone());
        }
        drop(keepalive);
        self.inner.wake.notify_one();
    }

    fn remove_keepalive(&self, service: &Arc<Service>) {
        self.inner
            .keepalive
            .lock()
            .retain(|s| !Arc::ptr_eq(s, service));
        self.inner.wake.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn keepalive_len(&self) -> usize {
        self.inner.keepalive.lock().len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .keepalive
            .lock()
            .iter()
            .filter_map(|s| renew_at(s))
            .min()
    }

    async fn renew_due(&self) {
        let now = Instant::now();
        let due: Vec<Arc<Service>> = {
            let keepalive = self.inner.keepalive.lock();
            keepalive
                .iter()
                .filter(|s| renew_at(s).is_some_and(|at| at <= now))
                .cloned()
                .collect()
        };
        for service in due {
            if let Err(e) = self.renew(&service).await {
                // not retried here; the expiry sweep will drop the device
                tracing::warn!(
                    service = service.service_id(),
                    "subscription renewal failed: {e}"
                );
                self.remove_keepalive(&service);
            }
        }
        self.inner
            .keepalive
            .lock()
            .retain(|s| s.subscription().is_some());
    }

    /// Runs the keep-alive scheduler until cancelled: sleep until the head
    /// renewal is due, renew everything due, repeat. Adding or removing
    /// services wakes the worker.
    pub(crate) fn spawn_keepalive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let sleep_for = match manager.next_deadline() {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .max(MIN_SCHEDULER_SLEEP),
                    None => IDLE_SCHEDULER_SLEEP,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.inner.wake.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {
                        manager.renew_due().await;
                    }
                }
            }
            tracing::trace!("keep-alive scheduler done");
        })
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    const CONTENT_DIRECTORY: &str = "urn:upnp-org:serviceId:ContentDirectory";

    #[test]
    fn timeout_header_parsing() {
        assert_eq!(parse_timeout_ms("Second-300").unwrap(), 300_000);
        assert_eq!(parse_timeout_ms("second-1800").unwrap(), 1_800_000);
        assert_eq!(parse_timeout_ms("SECOND-5").unwrap(), 5_000);
        assert_eq!(parse_timeout_ms("infinite").unwrap(), -1);
        assert_eq!(parse_timeout_ms("Infinite").unwrap(), -1);
        assert!(parse_timeout_ms("300").is_err());
        assert!(parse_timeout_ms("Second-").is_err());
        assert!(parse_timeout_ms("Minute-5").is_err());
    }

    #[test]
    fn renewal_delay_formula() {
        // margin dominates for long subscriptions
        assert_eq!(renewal_delay(300_000), Some(Duration::from_millis(290_000)));
        // 9/10 dominates for short ones
        assert_eq!(renewal_delay(30_000), Some(Duration::from_millis(27_000)));
        assert_eq!(renewal_delay(0), Some(Duration::ZERO));
        assert_eq!(renewal_delay(-1), None);

        // first renewal lands inside [max(T - 10s, 0.9 T), T]
        for timeout_ms in [20_000i64, 60_000, 300_000, 3_600_000] {
            let delay = renewal_delay(timeout_ms).unwrap().as_millis() as i64;
            assert!(delay >= (timeout_ms - 10_000).max(timeout_ms / 10 * 9));
            assert!(delay <= timeout_ms);
        }
    }

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(
            reqwest::Client::new(),
            "test UPnP/1.1 upnp-client/0.1",
            DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
        )
    }

    #[tokio::test]
    async fn subscribe_persists_state_and_registers_sid() {
        let (addr, requests, _guard) = test_util::spawn_http_server(|req| {
            assert_eq!(req.method, "SUBSCRIBE");
            test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-300")])
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", true)
            .await
            .unwrap();

        let subscription = service.subscription().unwrap();
        assert_eq!(subscription.sid, "uuid:s1");
        assert_eq!(subscription.timeout_ms, 300_000);
        assert!(!subscription.is_infinite());
        assert!(manager.service_by_sid("uuid:s1").is_some());
        assert_eq!(manager.keepalive_len(), 1);

        let seen = requests.lock().clone();
        assert_eq!(seen[0].headers.get("NT"), Some("upnp:event"));
        assert_eq!(
            seen[0].headers.get("CALLBACK"),
            Some("<http://192.0.2.3:49152/cb>")
        );
        assert_eq!(seen[0].headers.get("TIMEOUT"), Some("Second-300"));
    }

    #[tokio::test]
    async fn infinite_subscription_is_never_scheduled() {
        let (addr, _requests, _guard) = test_util::spawn_http_server(|_| {
            test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "infinite")])
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", true)
            .await
            .unwrap();
        assert!(service.subscription().unwrap().is_infinite());
        assert_eq!(manager.keepalive_len(), 0);
    }

    #[tokio::test]
    async fn subscribe_without_sid_fails() {
        let (addr, _requests, _guard) = test_util::spawn_http_server(|_| {
            test_util::header_response(200, &[("TIMEOUT", "Second-300")])
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();
        let err = manager()
            .subscribe(&service, "http://192.0.2.3:49152/cb", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        assert!(service.subscription().is_none());
    }

    #[tokio::test]
    async fn renewal_keeps_sid_and_rejects_mismatch() {
        let (addr, requests, _guard) = test_util::spawn_http_server(|req| {
            if req.headers.contains("SID") {
                // renewal
                test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-600")])
            } else {
                test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-300")])
            }
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", false)
            .await
            .unwrap();
        manager.renew(&service).await.unwrap();
        let subscription = service.subscription().unwrap();
        assert_eq!(subscription.sid, "uuid:s1");
        assert_eq!(subscription.timeout_ms, 600_000);

        // renewal requests carry SID + TIMEOUT, not NT/CALLBACK
        let seen = requests.lock().clone();
        assert_eq!(seen[1].headers.get("SID"), Some("uuid:s1"));
        assert!(!seen[1].headers.contains("NT"));
        assert!(!seen[1].headers.contains("CALLBACK"));
    }

    #[tokio::test]
    async fn renewal_with_different_sid_fails() {
        let (addr, _requests, _guard) = test_util::spawn_http_server(|req| {
            if req.headers.contains("SID") {
                test_util::header_response(200, &[("SID", "uuid:other"), ("TIMEOUT", "Second-300")])
            } else {
                test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-300")])
            }
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", false)
            .await
            .unwrap();
        let err = manager.renew(&service).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unsubscribe_clears_state() {
        let (addr, requests, _guard) = test_util::spawn_http_server(|req| {
            if req.method == "UNSUBSCRIBE" {
                test_util::header_response(200, &[])
            } else {
                test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-300")])
            }
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", true)
            .await
            .unwrap();
        manager.unsubscribe(&service).await.unwrap();

        assert!(service.subscription().is_none());
        assert!(manager.service_by_sid("uuid:s1").is_none());
        assert_eq!(manager.keepalive_len(), 0);
        let seen = requests.lock().clone();
        assert_eq!(seen[1].method, "UNSUBSCRIBE");
        assert_eq!(seen[1].headers.get("SID"), Some("uuid:s1"));
    }

    #[tokio::test]
    async fn invalidate_device_drops_subscriptions_locally() {
        let (addr, _requests, _guard) = test_util::spawn_http_server(|_| {
            test_util::header_response(200, &[("SID", "uuid:s1"), ("TIMEOUT", "Second-300")])
        })
        .await;
        let device = test_util::sample_device_served_by(addr);
        let service = device.find_service(CONTENT_DIRECTORY).unwrap();

        let manager = manager();
        manager
            .subscribe(&service, "http://192.0.2.3:49152/cb", true)
            .await
            .unwrap();
        manager.invalidate_device(&device);
        assert!(service.subscription().is_none());
        assert!(manager.service_by_sid("uuid:s1").is_none());
        assert_eq!(manager.keepalive_len(), 0);
    }
}
