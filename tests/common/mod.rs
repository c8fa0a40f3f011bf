use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use url::Url;

use lightwave_smart::auth::{TokenLifecycleManager, TokenSet, TokenStore};
use lightwave_smart::error::Result;
use lightwave_smart::flow::{
    AuthorizationCodeProvider, CredentialValidator, FlowController, PendingFlowStore,
};
use lightwave_smart::host::memory::{MemoryEntryStore, MemoryRegistry, MemoryStore};
use lightwave_smart::installation::{Installation, InstallationContext};
use lightwave_smart::link::fake::{FakeLink, FakeLinkFactory};
use lightwave_smart::link::{Device, FeatureSet, HierarchyBuilder, HierarchySnapshot, Hub};
use lightwave_smart::link::RetryPolicy;

/// In-memory host plus fake remote client, shared by the integration tests.
#[allow(dead_code)]
pub struct Harness {
    pub kv: Arc<MemoryStore>,
    pub entries: Arc<MemoryEntryStore>,
    pub devices: Arc<MemoryRegistry>,
    pub entities: Arc<MemoryRegistry>,
    pub links: Arc<FakeLinkFactory>,
    pub tokens: TokenLifecycleManager,
    pub pending: PendingFlowStore,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let kv = Arc::new(MemoryStore::new());
        Self {
            entries: Arc::new(MemoryEntryStore::new()),
            devices: Arc::new(MemoryRegistry::new()),
            entities: Arc::new(MemoryRegistry::new()),
            links: Arc::new(FakeLinkFactory::new()),
            tokens: TokenLifecycleManager::new(TokenStore::new(kv.clone())),
            pending: PendingFlowStore::new(kv.clone()),
            kv,
        }
    }

    pub fn controller(&self) -> FlowController {
        FlowController::new(
            self.entries.clone(),
            self.tokens.clone(),
            self.pending.clone(),
            CredentialValidator::new(self.links.clone()),
        )
    }

    pub fn controller_with_authorization(
        &self,
        provider: Arc<dyn AuthorizationCodeProvider>,
    ) -> FlowController {
        self.controller().with_authorization_code(provider)
    }

    pub fn context(&self, policy: RetryPolicy) -> InstallationContext {
        InstallationContext {
            entries: self.entries.clone(),
            devices: self.devices.clone(),
            entities: self.entities.clone(),
            tokens: self.tokens.clone(),
            pending: self.pending.clone(),
            links: self.links.clone(),
            policy,
        }
    }

    pub fn installation(&self, entry_id: &str) -> Installation {
        Installation::new(entry_id, self.context(RetryPolicy::interactive()))
    }

    /// Queues a link that connects and reports `tokens`.
    pub fn queue_link(&self, tokens: TokenSet) -> Arc<FakeLink> {
        let link = Arc::new(FakeLink::new().with_tokens(tokens));
        self.links.push(link.clone());
        link
    }
}

#[allow(dead_code)]
pub fn token_set(access: &str, refresh: &str) -> TokenSet {
    TokenSet {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        expires_at: None,
    }
}

/// Authorization-code provider whose registration state tests can flip.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct SwitchableAuthorization {
    registered: AtomicBool,
}

#[allow(dead_code)]
impl SwitchableAuthorization {
    pub fn unregistered() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuthorizationCodeProvider for SwitchableAuthorization {
    async fn has_client_registration(&self) -> Result<bool> {
        Ok(self.registered.load(Ordering::SeqCst))
    }

    fn authorize_url(&self, flow_id: &str) -> Result<Url> {
        let mut url = Url::parse("https://auth.example.com/authorize")?;
        url.query_pairs_mut().append_pair("state", flow_id);
        Ok(url)
    }
}

/// One hub with one device and its feature-set.
#[allow(dead_code)]
pub fn sample_hierarchy() -> HierarchySnapshot {
    HierarchyBuilder::new()
        .hub(Hub {
            id: "hub-1".to_string(),
            name: "Link Plus".to_string(),
            product_code: Some("L2".to_string()),
            structure: Some("Home".to_string()),
        })
        .device(Device {
            id: "dev-1".to_string(),
            name: "Kitchen dimmer".to_string(),
            product_code: "L21".to_string(),
            gen2: true,
            link: Some("hub-1".to_string()),
        })
        .featureset(FeatureSet {
            id: "fs-1".to_string(),
            device_id: "dev-1".to_string(),
            name: "Kitchen light".to_string(),
        })
        .finish()
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
