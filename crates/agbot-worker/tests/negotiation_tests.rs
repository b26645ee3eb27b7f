//! End-to-end negotiation scenarios driven through the worker handlers
//! against an in-memory store, a recording exchange double, and a
//! controllable ledger double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use agbot_exchange::{
    Device, ExchangeClient, MessageTarget, Microservice, SearchResultDevice, WorkloadApiSpec,
    WorkloadDefinition, WorkloadDeployment,
};
use agbot_policy::{
    AgreementProtocol, ApiSpecification, LedgerRef, Policy, PolicyHeader, Property, Workload,
    WorkloadPriority,
};
use agbot_protocol::{
    AsyncCancelCmd, BasicProtocolDriver, DataReceivedAck, LedgerClient, LedgerError, LedgerResult,
    ProposalReply, ProtocolDriver, ReplyAck, TerminationReason, BASIC_PROTOCOL_NAME,
    BASIC_PROTOCOL_VERSION,
};
use agbot_store::{AgreementFilter, AgreementState, AgreementStore, SqliteAgreementStore};
use agbot_worker::{
    AgreementLockManager, AgreementWork, AgreementWorker, HandleDataReceivedAck, HandleReply,
    HandleWorkloadUpgrade, InitiateAgreement, NegotiationConfig, WorkerPool,
};

const DEVICE_ID: &str = "myorg/device1";
const POLICY_NAME: &str = "netspeed policy";

// ============================================================
// Test doubles
// ============================================================

#[derive(Default)]
struct MockExchange {
    devices: Mutex<HashMap<String, Device>>,
    workloads: Mutex<HashMap<String, WorkloadDefinition>>,
    sent: Mutex<Vec<(String, String)>>,
    deleted_messages: Mutex<Vec<i64>>,
    deleted_agreements: Mutex<Vec<String>>,
    states: Mutex<Vec<(String, String)>>,
    device_gets: AtomicU32,
}

impl MockExchange {
    async fn add_device(&self, id: &str, device: Device) {
        self.devices.lock().await.insert(id.to_string(), device);
    }

    async fn add_workload(&self, url: &str, def: WorkloadDefinition) {
        self.workloads.lock().await.insert(url.to_string(), def);
    }

    async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    async fn last_sent(&self) -> (String, String) {
        self.sent.lock().await.last().cloned().expect("nothing sent")
    }

    async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_device(&self, device_id: &str) -> agbot_exchange::Result<Device> {
        self.device_gets.fetch_add(1, Ordering::SeqCst);
        self.devices
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| agbot_exchange::ExchangeError::DeviceNotFound(device_id.to_string()))
    }

    async fn get_workload(
        &self,
        workload_url: &str,
        _org: &str,
        _version: &str,
        _arch: &str,
    ) -> agbot_exchange::Result<Option<WorkloadDefinition>> {
        Ok(self.workloads.lock().await.get(workload_url).cloned())
    }

    async fn send_message(
        &self,
        target: &MessageTarget,
        payload: &str,
        _ttl_s: u64,
    ) -> agbot_exchange::Result<()> {
        self.sent
            .lock()
            .await
            .push((target.receiver_id.clone(), payload.to_string()));
        Ok(())
    }

    async fn delete_message(&self, message_id: i64) -> agbot_exchange::Result<()> {
        self.deleted_messages.lock().await.push(message_id);
        Ok(())
    }

    async fn delete_consumer_agreement(&self, agreement_id: &str) -> agbot_exchange::Result<()> {
        self.deleted_agreements
            .lock()
            .await
            .push(agreement_id.to_string());
        Ok(())
    }

    async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        _policy_name: &str,
        _org: &str,
        state: &str,
    ) -> agbot_exchange::Result<()> {
        self.states
            .lock()
            .await
            .push((agreement_id.to_string(), state.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockLedger {
    writable: AtomicBool,
    fail_commit: AtomicBool,
    commits: Mutex<Vec<String>>,
    terminations: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn is_writable(&self, _ledger_type: &str, _name: &str, _org: &str) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    async fn record_agreement(
        &self,
        agreement_id: &str,
        _counterparty_address: &str,
        _proposal: &str,
    ) -> LedgerResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(LedgerError::WriteFailed("injected failure".to_string()));
        }
        self.commits.lock().await.push(agreement_id.to_string());
        Ok(())
    }

    async fn terminate_agreement(
        &self,
        agreement_id: &str,
        _counterparty_address: &str,
        reason_code: u32,
    ) -> LedgerResult<()> {
        self.terminations
            .lock()
            .await
            .push((agreement_id.to_string(), reason_code));
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

struct Harness {
    store: Arc<SqliteAgreementStore>,
    exchange: Arc<MockExchange>,
    ledger: Arc<MockLedger>,
    locks: Arc<AgreementLockManager>,
    worker: AgreementWorker,
    deferred_rx: mpsc::UnboundedReceiver<AsyncCancelCmd>,
}

async fn harness() -> Harness {
    let store = Arc::new(SqliteAgreementStore::new_in_memory().await.unwrap());
    let exchange = Arc::new(MockExchange::default());
    let ledger = Arc::new(MockLedger::default());
    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
    let driver: Arc<dyn ProtocolDriver> = Arc::new(BasicProtocolDriver::new(
        "myorg/agbot1",
        180,
        exchange.clone(),
        store.clone(),
        ledger.clone(),
        deferred_tx,
    ));
    let locks = Arc::new(AgreementLockManager::new());
    let worker = AgreementWorker::new(
        "worker-test",
        store.clone(),
        exchange.clone(),
        driver,
        locks.clone(),
        NegotiationConfig {
            no_data_interval_s: 900,
            default_workload_pw: "defaultpw".to_string(),
            ignore_contract_with_attribs: vec!["ethereum_account".to_string()],
        },
    );
    Harness {
        store,
        exchange,
        ledger,
        locks,
        worker,
        deferred_rx,
    }
}

fn workload(url: &str, priority: u32, retries: u32) -> Workload {
    Workload {
        workload_url: url.to_string(),
        org: "myorg".to_string(),
        version: "1.0.0".to_string(),
        arch: "amd64".to_string(),
        priority: WorkloadPriority {
            priority_value: priority,
            retries,
            retry_duration_s: 3600,
            verified_duration_s: 0,
        },
        ..Default::default()
    }
}

fn consumer_policy(workloads: Vec<Workload>) -> Policy {
    Policy {
        header: PolicyHeader {
            name: POLICY_NAME.to_string(),
            version: "2.0".to_string(),
        },
        workloads,
        ..Default::default()
    }
}

fn producer_policy() -> Policy {
    Policy {
        header: PolicyHeader {
            name: "device policy".to_string(),
            version: "2.0".to_string(),
        },
        ..Default::default()
    }
}

/// Producer policy requiring a ledger for the Basic protocol.
fn producer_policy_with_ledger() -> Policy {
    let mut pol = producer_policy();
    pol.agreement_protocols.push(AgreementProtocol {
        name: BASIC_PROTOCOL_NAME.to_string(),
        protocol_version: BASIC_PROTOCOL_VERSION,
        ledgers: vec![LedgerRef {
            ledger_type: "ethereum".to_string(),
            name: "main".to_string(),
            org: "myorg".to_string(),
        }],
    });
    pol
}

fn device() -> SearchResultDevice {
    SearchResultDevice {
        id: DEVICE_ID.to_string(),
        name: "edge-node-1".to_string(),
        msg_endpoint: String::new(),
        public_key: "devicekey".to_string(),
    }
}

fn initiate(producer: Policy, consumer: Policy) -> InitiateAgreement {
    let original = producer.to_json().unwrap();
    InitiateAgreement {
        producer_policy: producer,
        original_producer_policy: original,
        consumer_policy: consumer,
        org: "myorg".to_string(),
        device: device(),
    }
}

/// Workload definition with no API requirements (every device supports it).
fn plain_definition(url: &str) -> WorkloadDefinition {
    WorkloadDefinition {
        workload_url: url.to_string(),
        version: "1.0.0".to_string(),
        arch: "amd64".to_string(),
        workloads: vec![WorkloadDeployment {
            deployment: "{\"services\":{}}".to_string(),
            deployment_signature: "sig".to_string(),
            torrent: String::new(),
        }],
        ..Default::default()
    }
}

/// Workload definition requiring the given API spec.
fn definition_requiring(url: &str, spec_ref: &str) -> WorkloadDefinition {
    let mut def = plain_definition(url);
    def.api_specs = vec![WorkloadApiSpec {
        spec_ref: spec_ref.to_string(),
        org: "myorg".to_string(),
        version: "1.0.0".to_string(),
        arch: "amd64".to_string(),
    }];
    def
}

async fn current_agreement_id(h: &Harness) -> String {
    let filters = [
        AgreementFilter::Unarchived,
        AgreementFilter::DeviceAndPolicy {
            device_id: DEVICE_ID.to_string(),
            policy_name: POLICY_NAME.to_string(),
        },
    ];
    let ags = h
        .store
        .find_agreements(&filters, BASIC_PROTOCOL_NAME)
        .await
        .unwrap();
    assert_eq!(ags.len(), 1, "expected exactly one live agreement");
    ags[0].current_agreement_id.clone()
}

fn accepted_reply(agreement_id: &str) -> HandleReply {
    let mut reply = ProposalReply::new(BASIC_PROTOCOL_NAME, BASIC_PROTOCOL_VERSION, agreement_id, true);
    reply.counterparty_address = "0xdevice1".to_string();
    reply.device_id = DEVICE_ID.to_string();
    HandleReply {
        reply_text: reply.to_json().unwrap(),
        sender_id: DEVICE_ID.to_string(),
        sender_pub_key: "devicekey".to_string(),
        sender_msg_endpoint: String::new(),
        message_id: 42,
    }
}

// ============================================================
// Scenario: happy path
// ============================================================

#[tokio::test]
async fn test_happy_path_initiate_reply_data_ack() {
    let mut h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    // Initiate: pending record created, proposal sent, state recorded.
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer_policy(vec![workload("https://wl/w0", 1, 2)])))
        .await;

    let id = current_agreement_id(&h).await;
    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::Proposed);
    assert!(!ag.proposal.is_empty());
    assert_eq!(id.len(), 64);

    let (receiver, payload) = h.exchange.last_sent().await;
    assert_eq!(receiver, DEVICE_ID);
    let proposal = agbot_protocol::Proposal::from_json(&payload).unwrap();
    assert_eq!(proposal.agreement_id, id);
    // the terms and conditions carry exactly the chosen workload, with the
    // default password filled in
    let tc = Policy::from_json(&proposal.ts_and_cs).unwrap();
    assert_eq!(tc.workloads.len(), 1);
    assert_eq!(tc.workloads[0].workload_password, "defaultpw");

    // no pattern: the device record is never fetched
    assert_eq!(h.exchange.device_gets.load(Ordering::SeqCst), 0);

    // Reply: positive ack, usage record created, message deleted.
    let accepted = h.worker.handle_agreement_reply(accepted_reply(&id)).await;
    assert!(accepted);

    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::Replied);
    assert_eq!(ag.counterparty_address, "0xdevice1");
    assert_eq!(ag.protocol_version, 2);

    let wu = h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .expect("usage record should exist after reply");
    assert_eq!(wu.priority, 1);
    assert!(!wu.reqs_not_met);
    assert_eq!(wu.current_agreement_id, id);

    let (_, ack_payload) = h.exchange.last_sent().await;
    let ack: ReplyAck = serde_json::from_str(&ack_payload).unwrap();
    assert!(ack.still_valid);
    assert_eq!(h.exchange.deleted_messages.lock().await.as_slice(), &[42]);

    let states = h.exchange.states.lock().await;
    assert!(states.contains(&(id.clone(), "Agreement created".to_string())));
    assert!(states.contains(&(id.clone(), "Producer agreed".to_string())));
    drop(states);

    // Data received ack: timestamp recorded, message deleted.
    let ack_msg = DataReceivedAck::new(BASIC_PROTOCOL_NAME, BASIC_PROTOCOL_VERSION, &id);
    h.worker
        .handle_data_received_ack(HandleDataReceivedAck {
            ack_text: ack_msg.to_json().unwrap(),
            sender_id: DEVICE_ID.to_string(),
            sender_pub_key: "devicekey".to_string(),
            sender_msg_endpoint: String::new(),
            message_id: 43,
        })
        .await;

    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::DataReceived);
    assert!(h.deferred_rx.try_recv().is_err());
}

// ============================================================
// Scenario: priority rollback
// ============================================================

#[tokio::test]
async fn test_priority_rollback_selects_lower_priority() {
    let h = harness().await;
    // W0 needs a gps spec the device does not advertise; W1 needs nothing.
    h.exchange
        .add_workload(
            "https://wl/w0",
            definition_requiring("https://wl/w0", "https://ms/gps"),
        )
        .await;
    h.exchange
        .add_workload("https://wl/w1", plain_definition("https://wl/w1"))
        .await;

    let consumer = consumer_policy(vec![
        workload("https://wl/w0", 1, 2),
        workload("https://wl/w1", 2, 1),
    ]);
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer))
        .await;

    // the agreement offers W1
    let id = current_agreement_id(&h).await;
    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    let proposal = agbot_protocol::Proposal::from_json(&ag.proposal).unwrap();
    let tc = Policy::from_json(&proposal.ts_and_cs).unwrap();
    assert_eq!(tc.workloads[0].workload_url, "https://wl/w1");

    // the skipped higher priority is remembered with a burned retry budget
    let wu = h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .unwrap();
    assert!(wu.reqs_not_met);
    assert_eq!(wu.priority, 1);
    assert_eq!(wu.retry_count, 3);
}

#[tokio::test]
async fn test_verified_workload_rolls_to_lower_priority_variant() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;
    h.exchange
        .add_workload("https://wl/w1", plain_definition("https://wl/w1"))
        .await;

    // The priority 1 workload has run verified on this device, so its
    // rollback retries are disabled.
    h.store
        .new_workload_usage(DEVICE_ID, &[], "", POLICY_NAME, 1, 3600, 52_000, false, "")
        .await
        .unwrap();
    h.store
        .disable_workload_retry(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap();

    let consumer = consumer_policy(vec![
        workload("https://wl/w0", 1, 2),
        workload("https://wl/w1", 2, 1),
    ]);
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer))
        .await;

    // the proposal offers the next less preferred variant, not the
    // verified one
    let id = current_agreement_id(&h).await;
    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    let proposal = agbot_protocol::Proposal::from_json(&ag.proposal).unwrap();
    let tc = Policy::from_json(&proposal.ts_and_cs).unwrap();
    assert_eq!(tc.workloads[0].workload_url, "https://wl/w1");

    // the reply leaves the verified record's priority alone and just
    // points it at the new agreement
    assert!(h.worker.handle_agreement_reply(accepted_reply(&id)).await);
    let wu = h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .unwrap();
    assert!(wu.disable_retry);
    assert_eq!(wu.priority, 1);
    assert_eq!(wu.retry_count, 0);
    assert_eq!(wu.current_agreement_id, id);
}

#[tokio::test]
async fn test_no_supported_workload_fails_selection() {
    let h = harness().await;
    h.exchange
        .add_workload(
            "https://wl/w0",
            definition_requiring("https://wl/w0", "https://ms/gps"),
        )
        .await;

    h.worker
        .initiate_new_agreement(initiate(
            producer_policy(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;

    // no agreement, no proposal, and the loop-created usage record is gone
    let ags = h
        .store
        .find_agreements(&[AgreementFilter::Unarchived], BASIC_PROTOCOL_NAME)
        .await
        .unwrap();
    assert!(ags.is_empty());
    assert_eq!(h.exchange.sent_count().await, 0);
    assert!(h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .is_none());
}

// ============================================================
// Scenario: duplicate reply
// ============================================================

#[tokio::test]
async fn test_duplicate_reply_discarded_without_ack() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer_policy(vec![workload("https://wl/w0", 1, 2)])))
        .await;
    let id = current_agreement_id(&h).await;

    assert!(h.worker.handle_agreement_reply(accepted_reply(&id)).await);
    let wu_before = h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .unwrap();
    h.exchange.clear_sent().await;

    // second delivery: no ack, no store change
    let mut dup = accepted_reply(&id);
    dup.message_id = 77;
    assert!(!h.worker.handle_agreement_reply(dup).await);

    assert_eq!(h.exchange.sent_count().await, 0, "duplicate must not be acked");
    let wu_after = h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wu_before, wu_after);
    // the duplicate message is still consumed
    assert!(h.exchange.deleted_messages.lock().await.contains(&77));
}

#[tokio::test]
async fn test_reply_for_unknown_agreement_discarded_without_ack() {
    let h = harness().await;
    let ghost = "f".repeat(64);
    assert!(!h.worker.handle_agreement_reply(accepted_reply(&ghost)).await);
    assert_eq!(h.exchange.sent_count().await, 0);
}

// ============================================================
// Scenario: commit failure
// ============================================================

#[tokio::test]
async fn test_ledger_commit_failure_cancels_agreement() {
    let h = harness().await;
    h.ledger.writable.store(true, Ordering::SeqCst);
    h.ledger.fail_commit.store(true, Ordering::SeqCst);
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    h.worker
        .initiate_new_agreement(initiate(
            producer_policy_with_ledger(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;
    let id = current_agreement_id(&h).await;

    let accepted = h.worker.handle_agreement_reply(accepted_reply(&id)).await;
    assert!(!accepted, "failed commit must not count as accepted");

    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::Archived);
    assert_eq!(ag.terminated_reason, TerminationReason::LedgerWriteFailed.code());
    assert_eq!(
        ag.terminated_description,
        TerminationReason::LedgerWriteFailed.description()
    );

    // the cancel path retired the lock
    assert!(!h.locks.has_lock(&id));
}

// ============================================================
// Scenario: forced upgrade
// ============================================================

#[tokio::test]
async fn test_forced_upgrade_cancels_all_and_deletes_usage() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    // two live agreements for the same (device, policy)
    for _ in 0..2 {
        h.worker
            .initiate_new_agreement(initiate(
                producer_policy(),
                consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
            ))
            .await;
    }
    h.store
        .new_workload_usage(DEVICE_ID, &[], "", POLICY_NAME, 1, 3600, 0, false, "")
        .await
        .unwrap();

    h.worker
        .handle_workload_upgrade(HandleWorkloadUpgrade {
            agreement_id: String::new(),
            protocol: BASIC_PROTOCOL_NAME.to_string(),
            device_id: DEVICE_ID.to_string(),
            policy_name: POLICY_NAME.to_string(),
        })
        .await;

    let archived = h
        .store
        .find_agreements(&[AgreementFilter::Archived], BASIC_PROTOCOL_NAME)
        .await
        .unwrap();
    assert_eq!(archived.len(), 2);
    for ag in &archived {
        assert_eq!(ag.terminated_reason, TerminationReason::ForcedUpgrade.code());
    }
    assert!(h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .is_none());
}

// ============================================================
// Scenario: deferred cancel
// ============================================================

#[tokio::test]
async fn test_unwritable_ledger_defers_cancel_then_completes() {
    let mut h = harness().await;
    h.ledger.writable.store(true, Ordering::SeqCst);
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    h.worker
        .initiate_new_agreement(initiate(
            producer_policy_with_ledger(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;
    let id = current_agreement_id(&h).await;
    assert!(h.worker.handle_agreement_reply(accepted_reply(&id)).await);

    // ledger goes dark before the cancel
    h.ledger.writable.store(false, Ordering::SeqCst);
    let reason = TerminationReason::PolicyChanged.code();
    h.worker.cancel_agreement_with_lock(&id, reason).await;

    // archived locally, ledger work deferred, nothing terminated yet
    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::Archived);
    let cmd = h.deferred_rx.try_recv().expect("cancel should be deferred");
    assert_eq!(cmd.agreement_id, id);
    assert!(h.ledger.terminations.lock().await.is_empty());

    // ledger comes back; the deferred cancel finds the archived record and
    // still performs the ledger-side termination
    h.ledger.writable.store(true, Ordering::SeqCst);
    h.worker.external_cancel(&cmd.agreement_id, cmd.reason).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.ledger.terminations.lock().await.as_slice(),
        &[(id.clone(), reason)]
    );
}

#[tokio::test]
async fn test_empty_counterparty_cancels_immediately() {
    let mut h = harness().await;
    // ledger required but unwritable, and no reply was ever processed
    h.ledger.writable.store(false, Ordering::SeqCst);
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;
    h.worker
        .initiate_new_agreement(initiate(
            producer_policy_with_ledger(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;
    let id = current_agreement_id(&h).await;

    let reason = TerminationReason::NoReply.code();
    h.worker.cancel_agreement_with_lock(&id, reason).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // empty counterparty bypasses the writability gate
    assert_eq!(
        h.ledger.terminations.lock().await.as_slice(),
        &[(id.clone(), reason)]
    );
    // and the unwritable ledger still queues a deferred retry
    assert!(h.deferred_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_old_protocol_version_always_defers_once() {
    let mut h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;
    h.worker
        .initiate_new_agreement(initiate(
            producer_policy(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;
    let id = current_agreement_id(&h).await;

    // a version 1 counterparty replies
    let mut reply = ProposalReply::new(BASIC_PROTOCOL_NAME, 1, &id, true);
    reply.counterparty_address = "0xold".to_string();
    let wi = HandleReply {
        reply_text: reply.to_json().unwrap(),
        sender_id: DEVICE_ID.to_string(),
        sender_pub_key: "devicekey".to_string(),
        sender_msg_endpoint: String::new(),
        message_id: 0,
    };
    assert!(h.worker.handle_agreement_reply(wi).await);

    h.worker
        .cancel_agreement_with_lock(&id, TerminationReason::PolicyChanged.code())
        .await;
    let cmd = h
        .deferred_rx
        .try_recv()
        .expect("old protocol versions defer the ledger cancel");
    assert_eq!(cmd.agreement_id, id);
}

// ============================================================
// Boundary behaviors
// ============================================================

#[tokio::test]
async fn test_empty_priority_workload_never_creates_usage() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    h.worker
        .initiate_new_agreement(initiate(
            producer_policy(),
            consumer_policy(vec![workload("https://wl/w0", 0, 0)]),
        ))
        .await;
    let id = current_agreement_id(&h).await;
    assert!(h.worker.handle_agreement_reply(accepted_reply(&id)).await);

    assert!(h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_ignored_property_skips_device() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    let mut producer = producer_policy();
    producer.properties.push(Property {
        name: "ethereum_account".to_string(),
        value: serde_json::json!("0xabc"),
    });
    h.worker
        .initiate_new_agreement(initiate(
            producer,
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;

    let ags = h
        .store
        .find_agreements(&[], BASIC_PROTOCOL_NAME)
        .await
        .unwrap();
    assert!(ags.is_empty());
    assert_eq!(h.exchange.sent_count().await, 0);
}

#[tokio::test]
async fn test_missing_ha_partner_blocks_initiation() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    let mut producer = producer_policy();
    producer.ha_group.partners = vec!["myorg/partner1".to_string()];
    h.worker
        .initiate_new_agreement(initiate(
            producer,
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        ))
        .await;

    // partner is not registered, so no agreement is attempted
    let ags = h
        .store
        .find_agreements(&[], BASIC_PROTOCOL_NAME)
        .await
        .unwrap();
    assert!(ags.is_empty());
}

#[tokio::test]
async fn test_pattern_merges_device_microservice_policies() {
    let h = harness().await;
    h.exchange
        .add_workload(
            "https://wl/w0",
            definition_requiring("https://wl/w0", "https://ms/gps"),
        )
        .await;

    // The device's gps microservice advertises the spec the workload needs.
    let mut ms_policy = producer_policy();
    ms_policy
        .api_specs
        .push(ApiSpecification::new("https://ms/gps", "myorg", "2.0.0", "amd64"));
    h.exchange
        .add_device(
            DEVICE_ID,
            Device {
                name: "edge-node-1".to_string(),
                registered_microservices: vec![Microservice {
                    url: "https://ms/gps".to_string(),
                    policy: ms_policy.to_json().unwrap(),
                    num_agreements: 0,
                }],
                ..Default::default()
            },
        )
        .await;

    let mut consumer = consumer_policy(vec![workload("https://wl/w0", 1, 2)]);
    consumer.pattern_id = "myorg/mypattern".to_string();
    // producer policy starts with no specs; the merge supplies them
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer))
        .await;

    assert_eq!(h.exchange.device_gets.load(Ordering::SeqCst), 1);
    let id = current_agreement_id(&h).await;
    assert!(!id.is_empty());
}

#[tokio::test]
async fn test_stale_workload_choice_rejects_reply() {
    let h = harness().await;

    // Build an agreement whose frozen proposal committed to the lower
    // priority workload while the policy now prefers a higher one.
    let id = agbot_worker::generate_agreement_id();
    h.store
        .agreement_attempt(&id, "myorg", DEVICE_ID, POLICY_NAME, "", "", "", BASIC_PROTOCOL_NAME, "", "")
        .await
        .unwrap();

    let full_policy = consumer_policy(vec![
        workload("https://wl/w0", 1, 2),
        workload("https://wl/w1", 2, 1),
    ]);
    let mut tc_policy = full_policy.clone();
    tc_policy.workloads = vec![workload("https://wl/w1", 2, 1)];
    let proposal = agbot_protocol::Proposal::new(
        BASIC_PROTOCOL_NAME,
        BASIC_PROTOCOL_VERSION,
        &id,
        &tc_policy.to_json().unwrap(),
        "{}",
        "myorg/agbot1",
    );
    h.store
        .persist_agreement_proposal(
            &id,
            BASIC_PROTOCOL_NAME,
            &serde_json::to_string(&proposal).unwrap(),
            &full_policy.to_json().unwrap(),
        )
        .await
        .unwrap();

    let accepted = h.worker.handle_agreement_reply(accepted_reply(&id)).await;
    assert!(!accepted);

    // a negative ack is sent and no usage record is created
    let (_, payload) = h.exchange.last_sent().await;
    let ack: ReplyAck = serde_json::from_str(&payload).unwrap();
    assert!(!ack.still_valid);
    assert!(h
        .store
        .find_single_workload_usage(DEVICE_ID, POLICY_NAME)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_negative_reply_enters_cancel_path() {
    let h = harness().await;
    h.exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;
    h.worker
        .initiate_new_agreement(initiate(producer_policy(), consumer_policy(vec![workload("https://wl/w0", 1, 2)])))
        .await;
    let id = current_agreement_id(&h).await;

    let rejection = ProposalReply::new(BASIC_PROTOCOL_NAME, BASIC_PROTOCOL_VERSION, &id, false);
    let wi = HandleReply {
        reply_text: rejection.to_json().unwrap(),
        sender_id: DEVICE_ID.to_string(),
        sender_pub_key: "devicekey".to_string(),
        sender_msg_endpoint: String::new(),
        message_id: 9,
    };
    assert!(!h.worker.handle_agreement_reply(wi).await);

    let ag = h
        .store
        .find_single_agreement(&id, BASIC_PROTOCOL_NAME, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag.state(), AgreementState::Archived);
    assert_eq!(ag.terminated_reason, TerminationReason::NegativeReply.code());
    assert!(h.exchange.deleted_agreements.lock().await.contains(&id));
}

// ============================================================
// Worker pool
// ============================================================

#[tokio::test]
async fn test_pool_processes_enqueued_work() {
    let store = Arc::new(SqliteAgreementStore::new_in_memory().await.unwrap());
    let exchange = Arc::new(MockExchange::default());
    let ledger = Arc::new(MockLedger::default());
    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
    let driver: Arc<dyn ProtocolDriver> = Arc::new(BasicProtocolDriver::new(
        "myorg/agbot1",
        180,
        exchange.clone(),
        store.clone(),
        ledger,
        deferred_tx,
    ));
    exchange
        .add_workload("https://wl/w0", plain_definition("https://wl/w0"))
        .await;

    let pool = WorkerPool::start(
        3,
        store.clone(),
        exchange.clone(),
        driver,
        Arc::new(AgreementLockManager::new()),
        NegotiationConfig::default(),
        deferred_rx,
        Duration::from_millis(20),
    );

    pool.sender()
        .send(AgreementWork::Initiate(initiate(
            producer_policy(),
            consumer_policy(vec![workload("https://wl/w0", 1, 2)]),
        )))
        .await
        .unwrap();

    // wait for a worker to pick it up
    let mut found = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ags = store
            .find_agreements(&[AgreementFilter::Unarchived], BASIC_PROTOCOL_NAME)
            .await
            .unwrap();
        if !ags.is_empty() {
            found = true;
            break;
        }
    }
    assert!(found, "pool never processed the initiate event");

    pool.shutdown().await;
}
