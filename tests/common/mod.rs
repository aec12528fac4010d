#![allow(dead_code)]

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tempfile::TempDir;
use vpn_control::{
    allocator::Pool,
    control::{ControlError, InterfaceControl},
    database::Database,
    keys::{KeyError, KeyPair, KeyPairProvider, NativeKeys},
    service::Controller,
    settings::ServerSettings,
};

pub const TEMPLATE: &str = "[Interface]
Address = 10.99.0.1/24
ListenPort = 51820
PrivateKey = server-private


";

/// Records every call; `bring_up` fails while `fail_up` is set.
#[derive(Clone, Default)]
pub struct FakeControl {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_down: Arc<AtomicBool>,
    pub fail_up: Arc<AtomicBool>,
}

impl FakeControl {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn refused(cmd: String) -> ControlError {
        ControlError::Spawn {
            cmd,
            source: io::Error::new(io::ErrorKind::Other, "refused"),
        }
    }
}

#[async_trait]
impl InterfaceControl for FakeControl {
    async fn bring_down(&self, name: &str) -> Result<(), ControlError> {
        let cmd = format!("down {name}");
        self.calls.lock().unwrap().push(cmd.clone());
        if self.fail_down.load(Ordering::SeqCst) {
            return Err(Self::refused(cmd));
        }
        Ok(())
    }

    async fn bring_up(&self, name: &str, config_path: &Path) -> Result<(), ControlError> {
        let cmd = format!("up {name} {}", config_path.display());
        self.calls.lock().unwrap().push(cmd.clone());
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(Self::refused(cmd));
        }
        Ok(())
    }
}

pub struct BrokenKeys;

#[async_trait]
impl KeyPairProvider for BrokenKeys {
    async fn generate(&self) -> Result<KeyPair, KeyError> {
        Err(KeyError::KeyGenUnavailable("wg: not found".to_owned()))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<Database>,
    pub control: FakeControl,
    pub settings: ServerSettings,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("wg0-base.conf");
        std::fs::write(&template_path, TEMPLATE).unwrap();

        let db = format!("sqlite://{}", dir.path().join("peers.db").display());
        let store = Arc::new(Database::new(&db).await.unwrap());

        let settings = ServerSettings {
            interface: "wg0".to_owned(),
            listen_port: Some(51820),
            address: Some("10.99.0.1/24".to_owned()),
            private_key: Some("server-private".to_owned()),
            public_key: Some("server-public".to_owned()),
            endpoint: Some("vpn.example.com:51820".to_owned()),
            dns: vec!["1.1.1.1".to_owned()],
            client_allowed_ips: vec!["10.99.0.0/24".to_owned()],
            post_up: vec![],
            post_down: vec![],
            config_path: dir.path().join("wg0.conf"),
            template_path,
        };

        Self {
            dir,
            store,
            control: FakeControl::default(),
            settings,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.settings.config_path.clone()
    }

    pub fn config(&self) -> String {
        std::fs::read_to_string(self.config_path()).unwrap()
    }

    pub fn controller(&self) -> Controller {
        self.controller_with(Pool::new("10.99.0.0/24".parse().unwrap(), 100, 200).unwrap())
    }

    pub fn controller_with(&self, pool: Pool) -> Controller {
        self.build(pool, Box::new(NativeKeys))
    }

    pub fn build(&self, pool: Pool, keys: Box<dyn KeyPairProvider>) -> Controller {
        Controller::new(
            self.settings.clone(),
            pool,
            self.store.clone(),
            keys,
            Box::new(self.control.clone()),
        )
    }
}
