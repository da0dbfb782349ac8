//! One tracked VPN connection

use crate::backend::{Event, EventSender, LinkId, Subscription};
use crate::host::{Action, ItemObserver, Translator};
use crate::state::State;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

const ICON_EMPTY: &str = ":shield-empty";
const ICON_HALF: &str = ":shield-half";
const ICON_FULL: &str = ":shield-full";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Association between an item and the active instance currently serving it.
///
/// Owns the instance's status subscription; dropping the link cancels it.
#[derive(Debug)]
pub struct ActiveLink {
    instance: String,
    id: LinkId,
    _subscription: Subscription,
}

impl ActiveLink {
    pub(crate) fn new(instance: String, id: LinkId, subscription: Subscription) -> Self {
        Self {
            instance,
            id,
            _subscription: subscription,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn id(&self) -> LinkId {
        self.id
    }
}

/// A VPN connection as the host sees it
pub struct VpnItem {
    id: String,
    name: String,
    state: Mutex<State>,
    observers: Mutex<Vec<Weak<dyn ItemObserver>>>,
    link: Mutex<Option<ActiveLink>>,
    requests: EventSender,
    translator: Arc<dyn Translator>,
}

impl VpnItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        initial: State,
        requests: EventSender,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: Mutex::new(initial),
            observers: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            requests,
            translator,
        }
    }

    /// Platform identifier of the connection definition
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name
    pub fn text(&self) -> &str {
        &self.name
    }

    pub fn subtext(&self) -> String {
        let state = self.state().tr_str(self.translator.as_ref());
        self.translator.tr("VPN connection: %1").replace("%1", &state)
    }

    pub fn input_action_text(&self) -> &str {
        &self.name
    }

    pub fn icon_urls(&self) -> Vec<String> {
        let icon = match self.state() {
            State::Invalid | State::Disconnected => ICON_EMPTY,
            State::Connecting | State::Disconnecting => ICON_HALF,
            State::Connected => ICON_FULL,
        };
        vec![icon.to_string()]
    }

    /// Actions available in the current state.
    ///
    /// Transitional and unknown states offer nothing so the user cannot race
    /// a transition that is already in flight.
    pub fn actions(&self) -> Vec<Action> {
        let (action_id, label, connect) = match self.state() {
            State::Connected => ("disconnect", "Disconnect", false),
            State::Disconnected => ("connect", "Connect", true),
            State::Invalid | State::Connecting | State::Disconnecting => return Vec::new(),
        };

        let requests = self.requests.clone();
        let id = self.id.clone();
        vec![Action::new(action_id, self.translator.tr(label), move || {
            send_request(&requests, &id, connect)
        })]
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    /// Apply a platform-reported state and notify observers if it changed
    pub(crate) fn set_state(&self, state: State) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }

        debug!("State changed: {} {}", self.name, state);

        let observers: Vec<Arc<dyn ItemObserver>> = {
            let mut observers = lock(&self.observers);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.notify(self);
        }
    }

    /// Ask the platform to start or stop this connection.
    ///
    /// Fire-and-forget: the state only changes once the platform reports it.
    pub fn set_connected(&self, connect: bool) {
        send_request(&self.requests, &self.id, connect)
    }

    pub fn add_observer(&self, observer: &Arc<dyn ItemObserver>) {
        let observer = Arc::downgrade(observer);
        let mut observers = lock(&self.observers);
        observers.retain(|o| o.strong_count() > 0);
        if !observers.iter().any(|o| o.ptr_eq(&observer)) {
            observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ItemObserver>) {
        let observer = Arc::downgrade(observer);
        lock(&self.observers).retain(|o| !o.ptr_eq(&observer));
    }

    /// Number of live registered observers
    pub fn observer_count(&self) -> usize {
        lock(&self.observers)
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }

    /// Active instance currently linked to this item
    pub fn active_instance(&self) -> Option<String> {
        lock(&self.link).as_ref().map(|l| l.instance().to_string())
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.link).is_some()
    }

    pub(crate) fn is_linked_to(&self, instance: &str, link: LinkId) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|l| l.id() == link && l.instance() == instance)
    }

    pub(crate) fn attach_link(&self, link: ActiveLink) {
        let mut current = lock(&self.link);
        debug_assert!(current.is_none(), "item {} already linked", self.id);
        *current = Some(link);
    }

    pub(crate) fn take_link(&self) -> Option<ActiveLink> {
        lock(&self.link).take()
    }
}

fn send_request(requests: &EventSender, id: &str, connect: bool) {
    let request = Event::Request {
        id: id.to_string(),
        connect,
    };
    if requests.send(request).is_err() {
        debug!("Dropping request for {}: plugin stopped", id);
    }
}

impl fmt::Debug for VpnItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("instance", &self.active_instance())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Untranslated;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl ItemObserver for Counter {
        fn notify(&self, _item: &VpnItem) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counter {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    fn item(state: State) -> (VpnItem, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (VpnItem::new("vpn-a", "Office", state, tx, Arc::new(Untranslated)), rx)
    }

    #[test]
    fn test_display_contract() {
        let (item, _rx) = item(State::Disconnected);
        assert_eq!(item.id(), "vpn-a");
        assert_eq!(item.text(), "Office");
        assert_eq!(item.input_action_text(), "Office");
        assert_eq!(item.subtext(), "VPN connection: Disconnected");
        assert_eq!(item.icon_urls(), vec![":shield-empty"]);

        item.set_state(State::Connecting);
        assert_eq!(item.subtext(), "VPN connection: Connecting…");
        assert_eq!(item.icon_urls(), vec![":shield-half"]);

        item.set_state(State::Connected);
        assert_eq!(item.icon_urls(), vec![":shield-full"]);

        item.set_state(State::Invalid);
        assert_eq!(item.icon_urls(), vec![":shield-empty"]);
    }

    #[test]
    fn test_actions_per_state() {
        let (item, _rx) = item(State::Invalid);
        let ids = |item: &VpnItem| item.actions().into_iter().map(|a| a.id).collect::<Vec<_>>();

        assert!(ids(&item).is_empty());
        item.set_state(State::Disconnected);
        assert_eq!(ids(&item), vec!["connect"]);
        item.set_state(State::Connecting);
        assert!(ids(&item).is_empty());
        item.set_state(State::Connected);
        assert_eq!(ids(&item), vec!["disconnect"]);
        item.set_state(State::Disconnecting);
        assert!(ids(&item).is_empty());
    }

    #[test]
    fn test_action_sends_request_without_changing_state() {
        let (item, mut rx) = item(State::Disconnected);
        let actions = item.actions();
        assert_eq!(actions[0].label, "Connect");
        actions[0].activate();

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Request { id: "vpn-a".to_string(), connect: true }
        );
        assert_eq!(item.state(), State::Disconnected);

        item.set_state(State::Connected);
        item.actions()[0].activate();
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Request { id: "vpn-a".to_string(), connect: false }
        );
    }

    #[test]
    fn test_request_after_consumer_gone_is_dropped() {
        let (item, rx) = item(State::Disconnected);
        drop(rx);
        item.set_connected(true);
        assert_eq!(item.state(), State::Disconnected);
    }

    #[test]
    fn test_set_state_notifies_only_on_change() {
        let (item, _rx) = item(State::Disconnected);
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let first_dyn: Arc<dyn ItemObserver> = first.clone();
        let second_dyn: Arc<dyn ItemObserver> = second.clone();
        item.add_observer(&first_dyn);
        item.add_observer(&second_dyn);

        item.set_state(State::Disconnected);
        assert_eq!(first.hits(), 0);
        assert_eq!(second.hits(), 0);

        item.set_state(State::Connecting);
        assert_eq!(first.hits(), 1);
        assert_eq!(second.hits(), 1);

        item.set_state(State::Connecting);
        assert_eq!(first.hits(), 1);
    }

    #[test]
    fn test_observer_registration_is_idempotent() {
        let (item, _rx) = item(State::Disconnected);
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn ItemObserver> = counter.clone();

        item.add_observer(&observer);
        item.add_observer(&observer);
        assert_eq!(item.observer_count(), 1);

        item.set_state(State::Connected);
        assert_eq!(counter.hits(), 1);

        item.remove_observer(&observer);
        item.remove_observer(&observer);
        assert_eq!(item.observer_count(), 0);

        item.set_state(State::Disconnected);
        assert_eq!(counter.hits(), 1);
    }

    #[test]
    fn test_item_does_not_own_observers() {
        let (item, _rx) = item(State::Disconnected);
        let observer: Arc<dyn ItemObserver> = Arc::new(Counter::default());
        item.add_observer(&observer);
        drop(observer);

        assert_eq!(item.observer_count(), 0);
        item.set_state(State::Connected);
    }

    #[test]
    fn test_dropped_observers_are_pruned_without_state_changes() {
        let (item, _rx) = item(State::Disconnected);
        for _ in 0..50 {
            let observer: Arc<dyn ItemObserver> = Arc::new(Counter::default());
            item.add_observer(&observer);
        }
        assert_eq!(lock(&item.observers).len(), 1);
        assert_eq!(item.observer_count(), 0);
    }

    #[test]
    fn test_dropping_link_cancels_subscription() {
        let (item, _rx) = item(State::Disconnected);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let sub = Subscription::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        item.attach_link(ActiveLink::new("/ac/1".to_string(), LinkId(1), sub));
        assert_eq!(item.active_instance().as_deref(), Some("/ac/1"));
        assert!(item.is_linked_to("/ac/1", LinkId(1)));
        assert!(!item.is_linked_to("/ac/1", LinkId(2)));

        drop(item.take_link());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!item.is_linked());
    }
}
