use super::TestDb;
use async_trait::async_trait;
use fulcrum::device::codes::CodeGenerator;
use fulcrum::device::record::{NewDeviceAuthorization, RecordMutation};
use fulcrum::device::store::InsertOutcome;
use fulcrum::device::{
    AuthorizationStateMachine, BruteForceGuard, BruteForcePolicy, ClientAuthMethod,
    ClientAuthentication, DeviceAuthorizationRecord, DeviceAuthorizationStore, DeviceInfo,
    DeviceStatus, DeviceTokenEndpoint, ManualClock, RecordId, SeaAttemptStore, SeaDeviceStore,
    StartRequest,
};
use fulcrum::errors::FulcrumError;
use fulcrum::settings::Settings;
use fulcrum::tokens::{RefreshOutcome, TokenIssuer, TokenSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Arbitrary fixed start time for the manual clock.
pub const T0: i64 = 1_700_000_000;

/// Issuer that records what it minted instead of touching the database.
#[derive(Default)]
pub struct StubIssuer {
    issued: AtomicUsize,
    subjects: Mutex<Vec<String>>,
}

impl StubIssuer {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl TokenIssuer for StubIssuer {
    async fn issue(
        &self,
        subject: &str,
        _client_id: &str,
        scopes: &[String],
        _auth_time: Option<i64>,
    ) -> Result<TokenSet, FulcrumError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.subjects
            .lock()
            .expect("poisoned")
            .push(subject.to_string());
        Ok(TokenSet {
            access_token: format!("at-{}", n),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            refresh_token: Some(format!("rt-{}", n)),
            id_token: None,
            scope: scopes.join(" "),
        })
    }

    async fn refresh(
        &self,
        _refresh_token: &str,
        _client_id: &str,
        _requested_scopes: Option<&[String]>,
    ) -> Result<RefreshOutcome, FulcrumError> {
        Ok(RefreshOutcome::InvalidGrant)
    }
}

/// Generator that always hands out the same pair, to force collisions.
pub struct FixedCodes {
    pub user_code: String,
    counter: AtomicUsize,
}

impl FixedCodes {
    pub fn new(user_code: &str) -> Self {
        Self {
            user_code: user_code.to_string(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl CodeGenerator for FixedCodes {
    fn device_code(&self) -> String {
        // distinct device codes so only the user_code collides
        format!("fixed-device-code-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn user_code(&self) -> String {
        self.user_code.clone()
    }
}

/// Device store on which every poll guarded by the previous poll time
/// loses, as if another poller of the same code always wrote first.
pub struct ContendedPolls {
    inner: SeaDeviceStore,
    lost: AtomicUsize,
}

impl ContendedPolls {
    pub fn new(inner: SeaDeviceStore) -> Self {
        Self {
            inner,
            lost: AtomicUsize::new(0),
        }
    }

    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceAuthorizationStore for ContendedPolls {
    async fn insert(&self, new: NewDeviceAuthorization) -> Result<InsertOutcome, FulcrumError> {
        self.inner.insert(new).await
    }

    async fn find_by_id(
        &self,
        id: RecordId,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        self.inner.find_by_device_code(device_code).await
    }

    async fn find_by_user_code(
        &self,
        user_code: &str,
        now: i64,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        self.inner.find_by_user_code(user_code, now).await
    }

    async fn compare_and_transition(
        &self,
        id: RecordId,
        expected: DeviceStatus,
        new: DeviceStatus,
        mutation: RecordMutation,
        now: i64,
    ) -> Result<bool, FulcrumError> {
        if mutation.if_last_poll_at.is_some() {
            self.lost.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        self.inner
            .compare_and_transition(id, expected, new, mutation, now)
            .await
    }

    async fn reclaim(&self, now: i64, retention_secs: i64) -> Result<u64, FulcrumError> {
        self.inner.reclaim(now, retention_secs).await
    }
}

/// State machine over a fresh database, a manual clock and a stub issuer.
pub struct Harness {
    pub db: TestDb,
    pub clock: Arc<ManualClock>,
    pub issuer: Arc<StubIssuer>,
    pub machine: Arc<AuthorizationStateMachine>,
    pub endpoint: DeviceTokenEndpoint,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(Settings::default(), None).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        Self::build(settings, None).await
    }

    pub async fn with_codes(codes: Arc<dyn CodeGenerator>) -> Self {
        Self::build(Settings::default(), Some(codes)).await
    }

    /// Harness whose polls always lose the last-poll race.
    pub async fn with_contended_polls() -> (Self, Arc<ContendedPolls>) {
        let db = TestDb::new().await;
        let store = Arc::new(ContendedPolls::new(SeaDeviceStore::new(
            db.connection().clone(),
        )));
        let shared: Arc<dyn DeviceAuthorizationStore> = store.clone();
        let harness = Self::build_on(db, Settings::default(), None, Some(shared));
        (harness, store)
    }

    async fn build(settings: Settings, codes: Option<Arc<dyn CodeGenerator>>) -> Self {
        Self::build_on(TestDb::new().await, settings, codes, None)
    }

    fn build_on(
        db: TestDb,
        settings: Settings,
        codes: Option<Arc<dyn CodeGenerator>>,
        store: Option<Arc<dyn DeviceAuthorizationStore>>,
    ) -> Self {
        let store: Arc<dyn DeviceAuthorizationStore> = match store {
            Some(store) => store,
            None => Arc::new(SeaDeviceStore::new(db.connection().clone())),
        };
        let clock = Arc::new(ManualClock::new(T0));
        let issuer = Arc::new(StubIssuer::default());
        let guard = BruteForceGuard::new(
            BruteForcePolicy::from(&settings.brute_force),
            Arc::new(SeaAttemptStore::new(db.connection().clone())),
        );

        let mut machine = AuthorizationStateMachine::new(
            &settings,
            store,
            guard,
            issuer.clone(),
            clock.clone(),
        );
        if let Some(codes) = codes {
            machine = machine.with_code_generator(codes);
        }
        let machine = Arc::new(machine);

        Self {
            endpoint: DeviceTokenEndpoint::new(machine.clone()),
            db,
            clock,
            issuer,
            machine,
        }
    }

    pub fn request(client_id: &str) -> StartRequest {
        StartRequest {
            client: ClientAuthentication {
                client_id: client_id.to_string(),
                method: ClientAuthMethod::ClientSecretBasic,
            },
            client_name: Some("Living Room TV".to_string()),
            scopes: vec!["openid".to_string(), "profile".to_string()],
            device_info: Some(DeviceInfo {
                ip_address: Some("192.0.2.10".to_string()),
                user_agent: Some("tv/1.0".to_string()),
            }),
        }
    }

    pub async fn start(&self, client_id: &str) -> DeviceAuthorizationRecord {
        self.machine
            .start(Self::request(client_id))
            .await
            .expect("start failed")
    }

    /// Move the clock to `T0 + offset`.
    pub fn at(&self, offset: i64) {
        self.clock.set(T0 + offset);
    }
}
