//! The per-session state machine and its owned subscription.
//!
//! A session moves `Unauthenticated -> Authenticating -> Online -> Offline`;
//! offline is terminal.  Going online wires up presence and contact access;
//! going offline cancels the active subscription and fires a best-effort
//! presence write that never blocks teardown.
//!
//! At most one conversation subscription exists per session.  Switching
//! partners cancels the previous subscription before establishing the new
//! one, so a stale conversation can never deliver into the new view.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use stello_shared::{ConversationKey, Role, UserId};
use stello_store::{
    Backend, ContactResolver, DashboardSnapshot, DashboardStats, Message, MessageStore,
    PresenceTracker, ReadStateTracker, StoreError, Subscription, SubscriptionEvent, UserProfile,
    UserRegistry,
};

use crate::error::SessionError;
use crate::identity::{IdentityService, SessionEvent};

/// Longest the sign-out path waits for the offline presence write.  On
/// expiry the stale "online" status is accepted and only logged.
const OFFLINE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Online,
    /// Terminal for this session; create a new context to sign in again.
    Offline,
}

struct ActiveConversation {
    partner: UserProfile,
    key: ConversationKey,
    subscription: Subscription,
}

/// Everything one signed-in viewer holds: their profile, their stores, and
/// the single active conversation subscription.
pub struct SessionContext<B> {
    registry: UserRegistry<B>,
    messages: MessageStore<B>,
    read_state: ReadStateTracker<B>,
    contacts: ContactResolver<B>,
    presence: PresenceTracker<B>,
    stats: DashboardStats<B>,
    state: SessionState,
    profile: Option<UserProfile>,
    active: Option<ActiveConversation>,
}

impl<B: Backend> SessionContext<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            registry: UserRegistry::new(Arc::clone(&backend)),
            messages: MessageStore::new(Arc::clone(&backend)),
            read_state: ReadStateTracker::new(Arc::clone(&backend)),
            contacts: ContactResolver::new(Arc::clone(&backend)),
            presence: PresenceTracker::new(Arc::clone(&backend)),
            stats: DashboardStats::new(backend),
            state: SessionState::Unauthenticated,
            profile: None,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn active_partner(&self) -> Option<&UserProfile> {
        self.active.as_ref().map(|a| &a.partner)
    }

    fn online_profile(&self) -> Result<&UserProfile, SessionError> {
        match (self.state, self.profile.as_ref()) {
            (SessionState::Online, Some(profile)) => Ok(profile),
            _ => Err(SessionError::NotSignedIn),
        }
    }

    /// Bring the session online for an id the auth service vouched for.
    pub async fn sign_in(&mut self, id: &UserId) -> Result<UserProfile, SessionError> {
        match self.state {
            SessionState::Unauthenticated => {}
            SessionState::Online | SessionState::Authenticating => {
                return Err(SessionError::AlreadySignedIn)
            }
            SessionState::Offline => return Err(SessionError::SessionClosed),
        }

        self.state = SessionState::Authenticating;
        let profile = match self.registry.get(id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.state = SessionState::Unauthenticated;
                return Err(SessionError::UnknownUser(id.clone()));
            }
            Err(err) => {
                self.state = SessionState::Unauthenticated;
                return Err(err.into());
            }
        };

        if let Err(err) = self.presence.set_online(&profile.id).await {
            self.state = SessionState::Unauthenticated;
            return Err(err.into());
        }

        tracing::info!(user = %profile.id, role = %profile.role, "session online");
        self.profile = Some(profile.clone());
        self.state = SessionState::Online;
        Ok(profile)
    }

    /// The viewer's chat partners (users sharing a conversation).
    pub async fn contacts(&self) -> Result<Vec<UserProfile>, SessionError> {
        let profile = self.online_profile()?;
        Ok(self.contacts.partners(&profile.id, profile.role).await?)
    }

    /// The viewer's dashboard numbers.
    pub async fn dashboard(&self) -> Result<DashboardSnapshot, SessionError> {
        let profile = self.online_profile()?;
        Ok(self.stats.snapshot(&profile.id, profile.role).await?)
    }

    /// Open the conversation with `partner_id`: establish the pairing,
    /// replace any previous subscription, mark the backlog read, and return
    /// it in order.  New messages flow to `on_event`.
    pub async fn open_conversation<F>(
        &mut self,
        partner_id: &UserId,
        on_event: F,
    ) -> Result<Vec<Message>, SessionError>
    where
        F: FnMut(SubscriptionEvent) + Send + 'static,
    {
        let viewer = self.online_profile()?.clone();
        let partner = self
            .registry
            .get(partner_id)
            .await?
            .ok_or_else(|| SessionError::UnknownUser(partner_id.clone()))?;

        let (doctor, patient) = match (viewer.role, partner.role) {
            (Role::Doctor, Role::Patient) => (&viewer, &partner),
            (Role::Patient, Role::Doctor) => (&partner, &viewer),
            (Role::Admin, _) => return Err(StoreError::InvalidRole(Role::Admin).into()),
            _ => return Err(StoreError::InvalidRole(partner.role).into()),
        };
        let conversation = self.messages.ensure_conversation(doctor, patient).await?;

        // Cancel before subscribing; only then can no stale message land in
        // the new view.
        self.close_conversation();
        let subscription = self.messages.subscribe(&conversation.key, on_event);

        // The viewer is the non-author of everything unread here.
        let marked = self.read_state.mark_read(&conversation.key, &viewer.id).await?;
        let backlog = self.messages.read_ordered(&conversation.key).await?;
        tracing::debug!(
            key = %conversation.key,
            partner = %partner.id,
            backlog = backlog.len(),
            marked,
            "conversation opened"
        );

        self.active = Some(ActiveConversation {
            partner,
            key: conversation.key,
            subscription,
        });
        Ok(backlog)
    }

    /// Send a message in the active conversation.
    pub async fn send_message(&self, text: &str) -> Result<Message, SessionError> {
        let viewer = self.online_profile()?;
        let active = self
            .active
            .as_ref()
            .ok_or(SessionError::NoActiveConversation)?;
        Ok(self.messages.append(&active.key, &viewer.id, text).await?)
    }

    /// Cancel the active subscription, if any.
    pub fn close_conversation(&mut self) {
        if let Some(active) = self.active.take() {
            active.subscription.cancel();
            tracing::debug!(key = %active.key, "conversation closed");
        }
    }

    /// Take the session offline.
    ///
    /// Cancels the subscription and spawns the offline presence write so
    /// teardown never blocks on the backend; if the write cannot complete in
    /// time the stale "online" status stands and is only logged.
    pub fn sign_out(&mut self) {
        self.close_conversation();

        if let Some(profile) = self.profile.take() {
            tracing::info!(user = %profile.id, "session offline");
            let presence = self.presence.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    OFFLINE_WRITE_TIMEOUT,
                    presence.set_offline(&profile.id),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(user = %profile.id, error = %err, "offline presence write failed")
                    }
                    Err(_) => {
                        tracing::warn!(user = %profile.id, "offline presence write timed out")
                    }
                }
            });
        }

        self.state = SessionState::Offline;
    }
}

/// Map identity-service transitions onto the session state machine.  Runs
/// until the identity event stream ends.
pub async fn drive<B, I>(ctx: Arc<Mutex<SessionContext<B>>>, identity: I)
where
    B: Backend,
    I: IdentityService,
{
    let mut events = identity.subscribe();

    // A user may already be signed in when driving starts.
    if let Some(id) = identity.current_user_id() {
        if let Err(err) = ctx.lock().await.sign_in(&id).await {
            tracing::warn!(user = %id, error = %err, "initial sign-in failed");
        }
    }

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::SignedIn(id) => {
                if let Err(err) = ctx.lock().await.sign_in(&id).await {
                    tracing::warn!(user = %id, error = %err, "sign-in failed");
                }
            }
            SessionEvent::SignedOut => ctx.lock().await.sign_out(),
        }
    }
    tracing::debug!("identity event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use stello_shared::Presence;
    use stello_store::MemoryBackend;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    async fn seeded_backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        let registry = UserRegistry::new(Arc::clone(&backend));
        registry
            .register(UserId::from("doc-1"), "gregory", "g@example.com", Role::Doctor)
            .await
            .unwrap();
        registry
            .register(UserId::from("pat-1"), "lisa", "l@example.com", Role::Patient)
            .await
            .unwrap();
        registry
            .register(UserId::from("pat-2"), "james", "j@example.com", Role::Patient)
            .await
            .unwrap();
        backend
    }

    fn collector() -> (
        impl FnMut(SubscriptionEvent) + Send + 'static,
        mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn sign_in_goes_online_and_sets_presence() {
        init_tracing();
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(Arc::clone(&backend));
        assert_eq!(ctx.state(), SessionState::Unauthenticated);

        let profile = ctx.sign_in(&UserId::from("doc-1")).await.unwrap();
        assert_eq!(ctx.state(), SessionState::Online);
        assert_eq!(profile.role, Role::Doctor);

        let presence = PresenceTracker::new(backend);
        assert_eq!(
            presence.presence_of(&profile.id).await.unwrap().presence,
            Presence::Online
        );

        assert!(matches!(
            ctx.sign_in(&UserId::from("doc-1")).await,
            Err(SessionError::AlreadySignedIn)
        ));
    }

    #[tokio::test]
    async fn unknown_user_stays_unauthenticated() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(backend);

        assert!(matches!(
            ctx.sign_in(&UserId::from("ghost")).await,
            Err(SessionError::UnknownUser(_))
        ));
        assert_eq!(ctx.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn open_conversation_delivers_live_messages() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(Arc::clone(&backend));
        ctx.sign_in(&UserId::from("doc-1")).await.unwrap();

        let (on_event, mut rx) = collector();
        let backlog = ctx
            .open_conversation(&UserId::from("pat-1"), on_event)
            .await
            .unwrap();
        assert!(backlog.is_empty());
        sleep(Duration::from_millis(50)).await;

        // The patient replies through their own store.
        let patient_store = MessageStore::new(backend);
        let key = ctx.active.as_ref().unwrap().key.clone();
        patient_store
            .append(&key, &UserId::from("pat-1"), "hello doctor")
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match event {
            SubscriptionEvent::Message(msg) => {
                assert_eq!(msg.text, "hello doctor");
                assert_eq!(msg.sender_id, UserId::from("pat-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn opening_marks_backlog_read() {
        let backend = seeded_backend().await;
        let store = MessageStore::new(Arc::clone(&backend));
        let doctor = UserId::from("doc-1");
        let patient = UserId::from("pat-1");
        let key = ConversationKey::derive(&doctor, &patient).unwrap();
        store.append(&key, &patient, "are you there?").await.unwrap();

        let mut ctx = SessionContext::new(Arc::clone(&backend));
        ctx.sign_in(&doctor).await.unwrap();
        let (on_event, _rx) = collector();
        let backlog = ctx.open_conversation(&patient, on_event).await.unwrap();

        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].read);
        let tracker = ReadStateTracker::new(backend);
        assert_eq!(tracker.unread_count(&key, &doctor).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn switching_partner_cancels_previous_subscription() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(Arc::clone(&backend));
        ctx.sign_in(&UserId::from("doc-1")).await.unwrap();

        let (first_cb, mut first_rx) = collector();
        ctx.open_conversation(&UserId::from("pat-1"), first_cb).await.unwrap();
        let first_key = ctx.active.as_ref().unwrap().key.clone();

        let (second_cb, _second_rx) = collector();
        ctx.open_conversation(&UserId::from("pat-2"), second_cb).await.unwrap();
        assert_eq!(ctx.active_partner().unwrap().id, UserId::from("pat-2"));
        sleep(Duration::from_millis(50)).await;

        // Traffic in the first conversation must not reach the old callback.
        MessageStore::new(backend)
            .append(&first_key, &UserId::from("pat-1"), "stale")
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_uses_active_conversation() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(Arc::clone(&backend));
        ctx.sign_in(&UserId::from("doc-1")).await.unwrap();

        let (on_event, _rx) = collector();
        ctx.open_conversation(&UserId::from("pat-1"), on_event).await.unwrap();
        let sent = ctx.send_message("  take two daily  ").await.unwrap();
        assert_eq!(sent.text, "take two daily");
        assert_eq!(sent.sender_id, UserId::from("doc-1"));

        assert!(matches!(
            ctx.send_message("   ").await,
            Err(SessionError::Store(StoreError::EmptyMessage))
        ));
    }

    #[tokio::test]
    async fn send_message_needs_an_open_conversation() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(backend);
        ctx.sign_in(&UserId::from("doc-1")).await.unwrap();

        assert!(matches!(
            ctx.send_message("hi").await,
            Err(SessionError::NoActiveConversation)
        ));

        let (on_event, _rx) = collector();
        ctx.open_conversation(&UserId::from("pat-1"), on_event).await.unwrap();
        ctx.close_conversation();
        assert!(matches!(
            ctx.send_message("hi").await,
            Err(SessionError::NoActiveConversation)
        ));
    }

    #[tokio::test]
    async fn admin_cannot_open_conversations() {
        let backend = seeded_backend().await;
        UserRegistry::new(Arc::clone(&backend))
            .ensure_default_admin(UserId::from("adm-1"))
            .await
            .unwrap();
        let mut ctx = SessionContext::new(backend);
        ctx.sign_in(&UserId::from("adm-1")).await.unwrap();

        let (on_event, _rx) = collector();
        assert!(matches!(
            ctx.open_conversation(&UserId::from("pat-1"), on_event).await,
            Err(SessionError::Store(StoreError::InvalidRole(Role::Admin)))
        ));
    }

    #[tokio::test]
    async fn contacts_and_dashboard_require_online() {
        let backend = seeded_backend().await;
        let ctx = SessionContext::new(backend);
        assert!(matches!(ctx.contacts().await, Err(SessionError::NotSignedIn)));
        assert!(matches!(ctx.dashboard().await, Err(SessionError::NotSignedIn)));
    }

    #[tokio::test]
    async fn sign_out_is_terminal_and_best_effort_offline() {
        let backend = seeded_backend().await;
        let mut ctx = SessionContext::new(Arc::clone(&backend));
        ctx.sign_in(&UserId::from("doc-1")).await.unwrap();

        ctx.sign_out();
        assert_eq!(ctx.state(), SessionState::Offline);
        assert!(matches!(
            ctx.sign_in(&UserId::from("doc-1")).await,
            Err(SessionError::SessionClosed)
        ));

        // The spawned write lands shortly after.
        sleep(Duration::from_millis(100)).await;
        let presence = PresenceTracker::new(backend);
        assert_eq!(
            presence.presence_of(&UserId::from("doc-1")).await.unwrap().presence,
            Presence::Offline
        );
    }

    struct StubIdentity {
        current: Option<UserId>,
        rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    }

    impl IdentityService for StubIdentity {
        fn current_user_id(&self) -> Option<UserId> {
            self.current.clone()
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
            self.rx
                .lock()
                .expect("stub lock poisoned")
                .take()
                .expect("subscribed twice")
        }
    }

    #[tokio::test]
    async fn drive_maps_identity_events_onto_the_state_machine() {
        init_tracing();
        let backend = seeded_backend().await;
        let ctx = Arc::new(Mutex::new(SessionContext::new(Arc::clone(&backend))));

        let (tx, rx) = mpsc::unbounded_channel();
        let identity = StubIdentity {
            current: None,
            rx: StdMutex::new(Some(rx)),
        };
        let driver = tokio::spawn(drive(Arc::clone(&ctx), identity));

        tx.send(SessionEvent::SignedIn(UserId::from("doc-1"))).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.lock().await.state(), SessionState::Online);

        tx.send(SessionEvent::SignedOut).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.lock().await.state(), SessionState::Offline);

        drop(tx);
        timeout(Duration::from_secs(1), driver).await.unwrap().unwrap();
    }
}
