use crate::types::{InboundMessage, PushUpdate, Route};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Callback for decoded push updates. Runs on the connection task and must not block.
pub type PushHandler = Arc<dyn Fn(PushUpdate) + Send + Sync>;

/// A subscription the server has confirmed.
struct LiveSubscription {
    route: Route,
    handler: PushHandler,
}

/// A subscription the caller wants, replayed after every reconnect.
struct SubscriptionIntent {
    request: Value,
    handler: PushHandler,
    generation: u64,
}

/// Outcome of activating a confirmed subscription.
#[derive(Debug, PartialEq)]
pub(crate) enum Activation {
    /// Registered; carries the server id it replaced on the same route.
    Activated { replaced: Option<String> },
    /// The intent was withdrawn or superseded while the request was in flight.
    Withdrawn,
}

#[derive(Default)]
struct RegistryState {
    /// Server subscription id -> live entry.
    live: HashMap<String, LiveSubscription>,
    /// Route -> server subscription id.
    routes: HashMap<Route, String>,
    intents: HashMap<Route, SubscriptionIntent>,
}

/// Tracks desired and live push subscriptions and routes pushes to handlers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

/// Snapshot of one intent for replay.
pub(crate) struct IntentSnapshot {
    pub route: Route,
    pub request: Value,
    pub handler: PushHandler,
    pub generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record (or replace) the desired subscription for a route.
    pub(crate) fn set_intent(&self, route: Route, request: Value, handler: PushHandler, generation: u64) {
        self.lock().intents.insert(
            route,
            SubscriptionIntent {
                request,
                handler,
                generation,
            },
        );
    }

    /// Drop the intent only if it still belongs to `generation`.
    pub(crate) fn withdraw_intent(&self, route: &Route, generation: u64) {
        let mut state = self.lock();
        if state.intents.get(route).map(|i| i.generation) == Some(generation) {
            state.intents.remove(route);
        }
    }

    pub(crate) fn intents(&self) -> Vec<IntentSnapshot> {
        self.lock()
            .intents
            .iter()
            .map(|(route, intent)| IntentSnapshot {
                route: route.clone(),
                request: intent.request.clone(),
                handler: intent.handler.clone(),
                generation: intent.generation,
            })
            .collect()
    }

    /// Register a confirmed subscription if its intent is still current.
    pub(crate) fn activate(
        &self,
        server_id: &str,
        route: &Route,
        handler: PushHandler,
        generation: u64,
    ) -> Activation {
        let mut state = self.lock();
        if state.intents.get(route).map(|i| i.generation) != Some(generation) {
            return Activation::Withdrawn;
        }

        let replaced = state
            .routes
            .insert(route.clone(), server_id.to_string())
            .filter(|old| old != server_id);
        if let Some(old) = &replaced {
            state.live.remove(old);
        }
        state.live.insert(
            server_id.to_string(),
            LiveSubscription {
                route: route.clone(),
                handler,
            },
        );
        Activation::Activated { replaced }
    }

    /// Remove intent and live entry for a route. Returns the server id, if live.
    pub fn remove(&self, route: &Route) -> Option<String> {
        let mut state = self.lock();
        state.intents.remove(route);
        let server_id = state.routes.remove(route)?;
        state.live.remove(&server_id);
        Some(server_id)
    }

    /// Route a push to its handler. Returns false if the subscription id is unknown.
    pub fn dispatch(&self, msg: &InboundMessage) -> bool {
        let Some(server_id) = msg.subscription_id.as_deref() else {
            return false;
        };
        let entry = {
            let state = self.lock();
            state
                .live
                .get(server_id)
                .map(|live| (live.route.clone(), live.handler.clone()))
        };
        match entry {
            Some((route, handler)) => {
                deliver(&route, &handler, msg);
                true
            }
            None => false,
        }
    }

    /// Forget every live entry; intents are kept for replay.
    pub fn clear_live(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.live.len();
        state.live.clear();
        state.routes.clear();
        cleared
    }

    /// Forget everything, intents included.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.live.clear();
        state.routes.clear();
        state.intents.clear();
    }

    pub fn server_id(&self, route: &Route) -> Option<String> {
        self.lock().routes.get(route).cloned()
    }

    pub fn is_live(&self, route: &Route) -> bool {
        self.lock().routes.contains_key(route)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn intent_count(&self) -> usize {
        self.lock().intents.len()
    }
}

/// Decode a message for its route and hand it to the handler.
pub(crate) fn deliver(route: &Route, handler: &PushHandler, msg: &InboundMessage) {
    match PushUpdate::decode(route, msg) {
        Ok(update) => handler(update),
        Err(e) if msg.error.is_some() => warn!("Subscription {} reported an error: {}", route, e),
        Err(e) => debug!("Undecodable push on {}: {}", route, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler() -> (PushHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: PushHandler = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    fn tick_push(sub_id: &str, quote: f64) -> InboundMessage {
        let text = format!(
            r#"{{"msg_type":"tick","subscription":{{"id":"{}"}},"tick":{{"symbol":"R_100","quote":{},"epoch":1}}}}"#,
            sub_id, quote
        );
        InboundMessage::parse(&text, 1).unwrap()
    }

    #[test]
    fn test_activate_and_dispatch() {
        let registry = SubscriptionRegistry::new();
        let route = Route::Ticks("R_100".to_string());
        let (handler, count) = counting_handler();

        registry.set_intent(route.clone(), Value::Null, handler.clone(), 1);
        assert_eq!(
            registry.activate("s1", &route, handler, 1),
            Activation::Activated { replaced: None }
        );
        assert!(registry.dispatch(&tick_push("s1", 100.0)));
        assert!(!registry.dispatch(&tick_push("unknown", 100.0)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_route_replaces_prior() {
        let registry = SubscriptionRegistry::new();
        let route = Route::Balance;
        let (handler, _) = counting_handler();

        registry.set_intent(route.clone(), Value::Null, handler.clone(), 1);
        registry.activate("old", &route, handler.clone(), 1);
        registry.set_intent(route.clone(), Value::Null, handler.clone(), 2);
        assert_eq!(
            registry.activate("new", &route, handler, 2),
            Activation::Activated {
                replaced: Some("old".to_string())
            }
        );
        assert_eq!(registry.live_count(), 1);
        assert!(!registry.dispatch(&tick_push("old", 1.0)));
    }

    #[test]
    fn test_stale_generation_is_withdrawn() {
        let registry = SubscriptionRegistry::new();
        let route = Route::Ticks("R_50".to_string());
        let (handler, _) = counting_handler();

        registry.set_intent(route.clone(), Value::Null, handler.clone(), 2);
        assert_eq!(registry.activate("s1", &route, handler.clone(), 1), Activation::Withdrawn);

        registry.remove(&route);
        assert_eq!(registry.activate("s2", &route, handler, 2), Activation::Withdrawn);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let route = Route::OpenContract(7);
        let (handler, count) = counting_handler();

        registry.set_intent(route.clone(), Value::Null, handler.clone(), 1);
        registry.activate("c7", &route, handler, 1);
        assert_eq!(registry.remove(&route).as_deref(), Some("c7"));
        assert_eq!(registry.remove(&route), None);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.intent_count(), 0);
        assert!(!registry.dispatch(&tick_push("c7", 1.0)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_live_keeps_intents() {
        let registry = SubscriptionRegistry::new();
        let (handler, _) = counting_handler();
        for (i, symbol) in ["R_10", "R_25"].iter().enumerate() {
            let route = Route::Ticks(symbol.to_string());
            registry.set_intent(route.clone(), Value::Null, handler.clone(), i as u64);
            registry.activate(&format!("s{}", i), &route, handler.clone(), i as u64);
        }
        assert_eq!(registry.clear_live(), 2);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.intent_count(), 2);
        assert_eq!(registry.intents().len(), 2);
    }
}
