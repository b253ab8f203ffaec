//! Scripted SMTP client collaborator for delivery tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::{
    ClientError, EmailAddress, Envelope, EnvelopeStatus, Flows, IdSource, NextHop, SmtpClient,
};
use postrider_delivery::{ClientCache, Connector, DeliveryConfig, DeliveryProcessor};
use postrider_spool::{Disposition, Entry, MessageRecord, Spool, SpoolConfig};
use tempfile::TempDir;

pub type Script = Arc<Mutex<VecDeque<Result<EnvelopeStatus, ClientError>>>>;
pub type SentLog = Arc<Mutex<Vec<Envelope>>>;

pub struct ScriptedClient {
    script: Script,
    sent: SentLog,
}

#[async_trait]
impl SmtpClient for ScriptedClient {
    async fn send_envelope(
        &mut self,
        envelope: &Envelope,
        _body: Arc<[u8]>,
        _flows: &Flows,
    ) -> Result<EnvelopeStatus, ClientError> {
        self.sent.lock().unwrap().push(envelope.clone());
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(EnvelopeStatus::Ok {
                remote_id: "fallback".to_string(),
                rejected_recipients: Vec::new(),
            })
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

pub struct ScriptedConnector {
    pub script: Script,
    pub sent: SentLog,
}

impl ScriptedConnector {
    pub fn new(outcomes: Vec<Result<EnvelopeStatus, ClientError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(outcomes.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Client = ScriptedClient;

    async fn connect(&self, _hop: &NextHop) -> Result<ScriptedClient, ClientError> {
        Ok(ScriptedClient {
            script: self.script.clone(),
            sent: self.sent.clone(),
        })
    }
}

pub fn addr(s: &str) -> EmailAddress {
    EmailAddress::parse(s).unwrap()
}

pub async fn open_spool(dir: &TempDir) -> Arc<Spool> {
    Spool::open(SpoolConfig::new(dir.path()), IdSource::new())
        .await
        .expect("Failed to open spool")
}

pub fn processor(
    spool: Arc<Spool>,
    connector: ScriptedConnector,
) -> Arc<DeliveryProcessor<ScriptedConnector>> {
    let config = DeliveryConfig::default();
    let cache = Arc::new(ClientCache::new(
        connector,
        config.max_concurrent_send_jobs,
        config.max_session_uses,
    ));
    Arc::new(DeliveryProcessor::new(spool, cache, config))
}

pub async fn read_record(spool: &Spool, entry: &Entry) -> MessageRecord {
    spool
        .with_entry(entry, Duration::from_secs(5), |record| {
            (Disposition::Keep, record)
        })
        .await
        .expect("Failed to read record")
}
