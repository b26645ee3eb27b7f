//! Agreement Negotiation Handlers
//!
//! One [`AgreementWorker`] per pool slot. Every handler takes the lock for
//! the agreement id it touches before mutating the store, so handlers for
//! the same agreement never overlap while handlers for distinct agreements
//! run in parallel.
//!
//! Handlers never propagate errors upward. A failure is logged and the
//! event abandoned; the producer's resend or a retry timer re-enqueues the
//! work, so the event queue is the retry fabric.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, error, info, warn};

use agbot_exchange::{create_message_target, ExchangeClient};
use agbot_policy::{ApiSpecList, ApiSpecification, Policy, Workload};
use agbot_protocol::{AsyncCancelCmd, ProtocolDriver, TerminationReason};
use agbot_store::{Agreement, AgreementFilter, AgreementStore};

use crate::events::{
    AgreementWork, HandleDataReceivedAck, HandleReply, HandleWorkloadUpgrade, InitiateAgreement,
};
use crate::locks::AgreementLockManager;

/// Negotiation knobs shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct NegotiationConfig {
    /// Seconds without data before an agreement counts as idle; folded into
    /// proposals whose policy enables data verification without an
    /// interval.
    pub no_data_interval_s: u64,

    /// Workload password offered when the policy does not set one.
    pub default_workload_pw: String,

    /// Devices advertising any property named here are skipped.
    pub ignore_contract_with_attribs: Vec<String>,
}

/// A single negotiation worker.
pub struct AgreementWorker {
    worker_id: String,
    store: Arc<dyn AgreementStore>,
    exchange: Arc<dyn ExchangeClient>,
    driver: Arc<dyn ProtocolDriver>,
    locks: Arc<AgreementLockManager>,
    config: NegotiationConfig,
}

/// A freshly generated agreement id: 32 random bytes in hex.
pub fn generate_agreement_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl AgreementWorker {
    pub fn new(
        worker_id: &str,
        store: Arc<dyn AgreementStore>,
        exchange: Arc<dyn ExchangeClient>,
        driver: Arc<dyn ProtocolDriver>,
        locks: Arc<AgreementLockManager>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            store,
            exchange,
            driver,
            locks,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Dispatch one unit of work.
    pub async fn handle(&self, work: AgreementWork) {
        debug!(worker_id = %self.worker_id, work = %work, "processing event");
        match work {
            AgreementWork::Initiate(wi) => self.initiate_new_agreement(wi).await,
            AgreementWork::Reply(wi) => {
                self.handle_agreement_reply(wi).await;
            }
            AgreementWork::DataReceivedAck(wi) => self.handle_data_received_ack(wi).await,
            AgreementWork::Cancel(wi) => {
                self.cancel_agreement_with_lock(&wi.agreement_id, wi.reason)
                    .await;
            }
            AgreementWork::WorkloadUpgrade(wi) => self.handle_workload_upgrade(wi).await,
            AgreementWork::AsyncCancel(wi) => {
                self.external_cancel(&wi.agreement_id, wi.reason).await;
            }
        }
    }

    // ============================================================
    // Initiation and workload selection
    // ============================================================

    /// Start a negotiation: choose a workload the device can support,
    /// persist a Pending agreement, and send the proposal.
    pub async fn initiate_new_agreement(&self, mut wi: InitiateAgreement) {
        let agreement_id = generate_agreement_id();
        debug!(
            worker_id = %self.worker_id,
            agreement_id = %agreement_id,
            device_id = %wi.device.id,
            "initiating agreement"
        );

        let (ledger_type, ledger_name, ledger_org) =
            wi.producer_policy.requires_known_ledger(self.driver.name());

        // Serialize against any other event for this id from the start.
        let lock = self.locks.get_lock(&agreement_id);
        let _guard = lock.lock().await;

        // Under a pattern the device's own microservice policies are needed
        // for merging; fetch the full device record up front.
        let exchange_dev = if !wi.consumer_policy.pattern_id.is_empty() {
            match self.exchange.get_device(&wi.device.id).await {
                Ok(dev) => Some(dev),
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        device_id = %wi.device.id,
                        error = %e,
                        "error reading device policies"
                    );
                    return;
                }
            }
        } else {
            None
        };

        let policy_name = wi.consumer_policy.header.name.clone();

        // Walk the workload variants from the most preferred downward until
        // the device supports one. Each pass either accepts, moves to a
        // strictly lower priority, or repeats a variant, which ends the
        // search.
        let mut last_workload: Option<Workload> = None;
        let workload = loop {
            let wl_usage = match self
                .store
                .find_single_workload_usage(&wi.device.id, &policy_name)
                .await
            {
                Ok(u) => u,
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        device_id = %wi.device.id,
                        policy = %policy_name,
                        error = %e,
                        "error reading workload usage"
                    );
                    return;
                }
            };
            let usage_exists = wl_usage.is_some();

            let candidate = match &wl_usage {
                None => wi.consumer_policy.next_highest_priority_workload(0, 0, 0),
                // verified workload: the zero retry count selects strictly
                // below its priority
                Some(u) if u.disable_retry => wi
                    .consumer_policy
                    .next_highest_priority_workload(u.priority, 0, u.first_try_time),
                Some(u) => wi.consumer_policy.next_highest_priority_workload(
                    u.priority,
                    u.retry_count + 1,
                    u.first_try_time,
                ),
            };
            let mut workload = match candidate {
                Some(w) => w.clone(),
                None => {
                    warn!(
                        worker_id = %self.worker_id,
                        policy = %policy_name,
                        "consumer policy has no workloads"
                    );
                    return;
                }
            };

            // Choosing the same variant twice in a row means the options
            // are exhausted.
            if last_workload
                .as_ref()
                .is_some_and(|lw| lw.same_variant(&workload) && lw.priority.is_same(&workload.priority))
            {
                warn!(
                    worker_id = %self.worker_id,
                    device_id = %wi.device.id,
                    policy = %policy_name,
                    "no supported workload for device"
                );
                if let Err(e) = self
                    .store
                    .delete_workload_usage(&wi.device.id, &policy_name)
                    .await
                {
                    warn!(
                        worker_id = %self.worker_id,
                        device_id = %wi.device.id,
                        error = %e,
                        "unable to delete workload usage record"
                    );
                }
                return;
            }

            let details = match self
                .exchange
                .get_workload(
                    &workload.workload_url,
                    &workload.org,
                    &workload.version,
                    &workload.arch,
                )
                .await
            {
                Ok(Some(d)) => d,
                Ok(None) => {
                    error!(
                        worker_id = %self.worker_id,
                        workload_url = %workload.workload_url,
                        "workload not found on the exchange"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        workload_url = %workload.workload_url,
                        error = %e,
                        "error fetching workload details"
                    );
                    return;
                }
            };

            // Convert the definition's API specs, merging the device's
            // per-microservice producer policies when a pattern is in play.
            let mut asl = ApiSpecList::new();
            let mut merged_producer: Option<Policy> = None;
            for api_spec in &details.api_specs {
                asl.push(ApiSpecification::new(
                    &api_spec.spec_ref,
                    &api_spec.org,
                    &api_spec.version,
                    &api_spec.arch,
                ));
                if wi.consumer_policy.pattern_id.is_empty() {
                    continue;
                }
                let Some(dev) = &exchange_dev else { continue };
                for dev_ms in &dev.registered_microservices {
                    if dev_ms.url != api_spec.spec_ref {
                        continue;
                    }
                    let pol = match Policy::from_json(&dev_ms.policy) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(
                                worker_id = %self.worker_id,
                                device_id = %wi.device.id,
                                error = %e,
                                "error demarshalling device policy"
                            );
                            return;
                        }
                    };
                    merged_producer = match merged_producer.take() {
                        None => Some(pol),
                        Some(mp) => {
                            match Policy::merge_producers(&mp, &pol, self.config.no_data_interval_s)
                            {
                                Ok(p) => Some(p),
                                Err(e) => {
                                    error!(
                                        worker_id = %self.worker_id,
                                        device_id = %wi.device.id,
                                        error = %e,
                                        "error merging device policies"
                                    );
                                    return;
                                }
                            }
                        }
                    };
                    break;
                }
            }
            if !wi.consumer_policy.pattern_id.is_empty() {
                if let Some(mp) = merged_producer {
                    wi.producer_policy = mp;
                }
            }

            if let Err(e) = wi.producer_policy.api_specs.supports(&asl) {
                warn!(
                    worker_id = %self.worker_id,
                    device_id = %wi.device.id,
                    workload_url = %workload.workload_url,
                    error = %e,
                    "skipping workload the device cannot support"
                );

                // Remember that a higher-priority workload was skipped, then
                // push the retry count past the budget so the next pass
                // picks a strictly lower priority.
                if !workload.has_empty_priority() {
                    if usage_exists {
                        if let Err(e) = self
                            .store
                            .update_priority(
                                &wi.device.id,
                                &policy_name,
                                workload.priority.priority_value,
                                workload.priority.retry_duration_s,
                                workload.priority.verified_duration_s,
                                &agreement_id,
                            )
                            .await
                        {
                            error!(
                                worker_id = %self.worker_id,
                                error = %e,
                                "error updating workload usage priority"
                            );
                            return;
                        }
                    } else if let Err(e) = self
                        .store
                        .new_workload_usage(
                            &wi.device.id,
                            &wi.producer_policy.ha_group.partners,
                            "",
                            &policy_name,
                            workload.priority.priority_value,
                            workload.priority.retry_duration_s,
                            workload.priority.verified_duration_s,
                            true,
                            &agreement_id,
                        )
                        .await
                    {
                        error!(
                            worker_id = %self.worker_id,
                            error = %e,
                            "error creating workload usage record"
                        );
                        return;
                    }

                    if let Err(e) = self
                        .store
                        .update_retry_count(
                            &wi.device.id,
                            &policy_name,
                            workload.priority.retries + 1,
                            &agreement_id,
                        )
                        .await
                    {
                        error!(
                            worker_id = %self.worker_id,
                            error = %e,
                            "error updating workload usage retry count"
                        );
                        return;
                    }
                }
                last_workload = Some(workload);
                continue;
            }

            // Supported: take the definition's API specs into the consumer
            // policy and attach the deployment payload. Definitions are
            // validated upstream to carry exactly one deployment entry.
            wi.consumer_policy.api_specs = asl;
            let Some(deployment) = details.workloads.first() else {
                error!(
                    worker_id = %self.worker_id,
                    workload_url = %workload.workload_url,
                    "workload definition has no deployment"
                );
                return;
            };
            workload.deployment = deployment.deployment.clone();
            workload.deployment_signature = deployment.deployment_signature.clone();
            if !deployment.torrent.is_empty() {
                workload.torrent = match serde_json::from_str(&deployment.torrent) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(
                            worker_id = %self.worker_id,
                            workload_url = %workload.workload_url,
                            error = %e,
                            "unable to demarshal torrent info"
                        );
                        return;
                    }
                };
            }
            debug!(
                worker_id = %self.worker_id,
                device_id = %wi.device.id,
                workload_url = %workload.workload_url,
                "workload is supported by device"
            );
            break workload;
        };

        // All HA partners must be registered before any agreement proceeds
        // with any of them.
        if let Err(e) = self.check_ha_group(&wi.producer_policy).await {
            warn!(
                worker_id = %self.worker_id,
                device_id = %wi.device.id,
                error = %e,
                "HA group is incomplete"
            );
            return;
        }

        if self.ignore_device(&wi.producer_policy) {
            debug!(
                worker_id = %self.worker_id,
                device_id = %wi.device.id,
                "skipping device, advertises ignored property"
            );
            return;
        }

        let node_health = match serde_json::to_string(&wi.consumer_policy.node_health) {
            Ok(t) => t,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "error serializing node health");
                return;
            }
        };

        if let Err(e) = self
            .store
            .agreement_attempt(
                &agreement_id,
                &wi.org,
                &wi.device.id,
                &policy_name,
                &ledger_type,
                &ledger_name,
                &ledger_org,
                self.driver.name(),
                &wi.consumer_policy.pattern_id,
                &node_health,
            )
            .await
        {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error persisting agreement attempt"
            );
            return;
        }

        let target = match create_message_target(
            &wi.device.id,
            &wi.device.public_key,
            &wi.device.msg_endpoint,
        ) {
            Ok(t) => t,
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    device_id = %wi.device.id,
                    error = %e,
                    "error creating message target"
                );
                return;
            }
        };

        let proposal = match self
            .driver
            .initiate_agreement(
                &agreement_id,
                &wi.original_producer_policy,
                &wi.consumer_policy,
                &wi.org,
                &target,
                &workload,
                &self.config.default_workload_pw,
                self.config.no_data_interval_s,
            )
            .await
        {
            Ok(p) => p,
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    error = %e,
                    "error initiating agreement"
                );
                // Roll the pending record back so the id is not left behind.
                if let Err(e) = self
                    .store
                    .delete_agreement(&agreement_id, self.driver.name())
                    .await
                {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error deleting pending agreement"
                    );
                }
                return;
            }
        };

        let proposal_text = match proposal.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "error serializing proposal");
                return;
            }
        };
        let policy_text = match wi.consumer_policy.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "error serializing policy");
                return;
            }
        };
        if let Err(e) = self
            .store
            .persist_agreement_proposal(&agreement_id, self.driver.name(), &proposal_text, &policy_text)
            .await
        {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error persisting proposal"
            );
            return;
        }

        if let Err(e) = self
            .driver
            .record_consumer_agreement_state(
                &agreement_id,
                &policy_name,
                &wi.org,
                "Agreement created",
                &self.worker_id,
            )
            .await
        {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error recording agreement state"
            );
        }
    }

    // ============================================================
    // Reply handling
    // ============================================================

    /// Process a proposal reply. Returns whether the reply was acked as
    /// valid (and hence committed).
    pub async fn handle_agreement_reply(&self, wi: HandleReply) -> bool {
        let reply = match self.driver.validate_reply(&wi.reply_text) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    sender = %wi.sender_id,
                    error = %e,
                    "discarding unparseable reply"
                );
                self.delete_message(wi.message_id).await;
                return false;
            }
        };

        // A rejection goes straight to the cancel path, serialized under
        // the agreement lock like every other mutation.
        if !reply.accepted() {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %reply.agreement_id,
                sender = %wi.sender_id,
                "received rejection from producer"
            );
            let lock = self.locks.get_lock(&reply.agreement_id);
            {
                let _guard = lock.lock().await;
                self.cancel_agreement(
                    &reply.agreement_id,
                    self.driver.get_termination_code(TerminationReason::NegativeReply),
                )
                .await;
            }
            self.delete_message(wi.message_id).await;
            return false;
        }

        let agreement_id = reply.agreement_id.clone();
        let lock = self.locks.get_lock(&agreement_id);
        // Held until just before the ledger commit; a slow commit must not
        // block unrelated events for this agreement id's neighbors.
        let mut guard = Some(lock.lock().await);

        let mut ack_valid = false;
        let mut send_reply = true;
        let mut deleted_message = false;

        'process: {
            let agreement = match self
                .store
                .find_single_agreement(&agreement_id, self.driver.name(), &[AgreementFilter::Unarchived])
                .await
            {
                Ok(Some(ag)) => ag,
                Ok(None) => {
                    debug!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        "discarding reply, agreement not in the database"
                    );
                    send_reply = false;
                    break 'process;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error querying pending agreement"
                    );
                    break 'process;
                }
            };

            if agreement.already_received_reply() {
                debug!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    "discarding reply, already received one"
                );
                send_reply = false;
                break 'process;
            }

            let proposal = match self.driver.demarshal_proposal(&agreement.proposal) {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error validating saved proposal"
                    );
                    break 'process;
                }
            };
            let tc_policy = match Policy::from_json(&proposal.ts_and_cs) {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error demarshalling terms and conditions"
                    );
                    break 'process;
                }
            };

            if let Err(e) = self.driver.persist_reply(&reply, &tc_policy).await {
                error!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    error = %e,
                    "error persisting reply"
                );
                break 'process;
            }
            if let Err(e) = self
                .driver
                .record_consumer_agreement_state(
                    &agreement_id,
                    &agreement.policy_name,
                    &agreement.org,
                    "Producer agreed",
                    &self.worker_id,
                )
                .await
            {
                error!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    error = %e,
                    "error recording agreement state"
                );
                break 'process;
            }
            let consumer_policy = match Policy::from_json(&agreement.policy) {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error demarshalling agreement policy"
                    );
                    break 'process;
                }
            };

            ack_valid = true;

            match tc_policy.workloads.first() {
                None => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        "proposal carries no workload"
                    );
                    ack_valid = false;
                }
                Some(tc_workload) => {
                    self.reconcile_workload_usage(
                        &wi,
                        &agreement,
                        &consumer_policy,
                        &tc_policy,
                        tc_workload,
                        &mut ack_valid,
                    )
                    .await;
                }
            }

            if ack_valid {
                match create_message_target(&wi.sender_id, &wi.sender_pub_key, &wi.sender_msg_endpoint)
                {
                    Ok(target) => {
                        if let Err(e) = self.driver.confirm(true, &agreement_id, &target).await {
                            error!(
                                worker_id = %self.worker_id,
                                agreement_id = %agreement_id,
                                error = %e,
                                "error sending reply ack"
                            );
                        }
                    }
                    Err(e) => {
                        error!(
                            worker_id = %self.worker_id,
                            error = %e,
                            "error creating message target"
                        );
                    }
                }

                self.delete_message(wi.message_id).await;
                deleted_message = true;

                // Release the lock before the (possibly slow) durable
                // commit so other events for this id are not starved.
                drop(guard.take());

                if let Err(e) = self
                    .driver
                    .post_reply(
                        &agreement_id,
                        &proposal,
                        &reply,
                        &consumer_policy,
                        &agreement.org,
                        &self.worker_id,
                    )
                    .await
                {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %agreement_id,
                        error = %e,
                        "error recording agreement on the ledger"
                    );
                    self.cancel_agreement_with_lock(
                        &agreement_id,
                        self.driver
                            .get_termination_code(TerminationReason::LedgerWriteFailed),
                    )
                    .await;
                    ack_valid = false;
                }
            }
        }

        // A positive-decision reply is always answered unless it was a
        // duplicate or for an unknown agreement.
        if !ack_valid && send_reply {
            match create_message_target(&wi.sender_id, &wi.sender_pub_key, &wi.sender_msg_endpoint) {
                Ok(target) => {
                    if let Err(e) = self.driver.confirm(false, &agreement_id, &target).await {
                        error!(
                            worker_id = %self.worker_id,
                            agreement_id = %agreement_id,
                            error = %e,
                            "error sending negative reply ack"
                        );
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "error creating message target");
                }
            }
        }

        drop(guard);
        if !deleted_message {
            self.delete_message(wi.message_id).await;
        }
        ack_valid
    }

    /// Bring the workload-usage record in line with the workload the reply
    /// commits to. Clears `ack_valid` when the chosen workload is no longer
    /// the one the policy would select.
    async fn reconcile_workload_usage(
        &self,
        wi: &HandleReply,
        agreement: &Agreement,
        consumer_policy: &Policy,
        tc_policy: &Policy,
        tc_workload: &Workload,
        ack_valid: &mut bool,
    ) {
        let policy_name = &consumer_policy.header.name;
        match self
            .store
            .find_single_workload_usage(&wi.sender_id, policy_name)
            .await
        {
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    device_id = %wi.sender_id,
                    policy = %policy_name,
                    error = %e,
                    "error reading workload usage"
                );
            }
            Ok(None) => {
                // No usage record: the committed workload must still be the
                // policy's first choice, otherwise the system has moved on
                // and this agreement is rejected.
                let expected = consumer_policy.next_highest_priority_workload(0, 0, 0);
                match expected {
                    Some(w) if w.priority.is_same(&tc_workload.priority) => {
                        if !tc_workload.has_empty_priority() {
                            if let Err(e) = self
                                .store
                                .new_workload_usage(
                                    &wi.sender_id,
                                    &tc_policy.ha_group.partners,
                                    &agreement.policy,
                                    policy_name,
                                    tc_workload.priority.priority_value,
                                    tc_workload.priority.retry_duration_s,
                                    tc_workload.priority.verified_duration_s,
                                    false,
                                    &agreement.current_agreement_id,
                                )
                                .await
                            {
                                error!(
                                    worker_id = %self.worker_id,
                                    device_id = %wi.sender_id,
                                    error = %e,
                                    "error creating workload usage record"
                                );
                            }
                        }
                    }
                    _ => {
                        warn!(
                            worker_id = %self.worker_id,
                            agreement_id = %agreement.current_agreement_id,
                            "committed workload is no longer the highest priority choice"
                        );
                        *ack_valid = false;
                    }
                }
            }
            Ok(Some(wu)) => {
                if wu.policy.is_empty() {
                    if let Err(e) = self
                        .store
                        .update_policy(&wi.sender_id, policy_name, &agreement.policy)
                        .await
                    {
                        error!(
                            worker_id = %self.worker_id,
                            device_id = %wi.sender_id,
                            error = %e,
                            "error updating workload usage policy"
                        );
                    }
                }

                if !wu.disable_retry {
                    if tc_workload.priority.priority_value != wu.priority {
                        if let Err(e) = self
                            .store
                            .update_priority(
                                &wi.sender_id,
                                policy_name,
                                tc_workload.priority.priority_value,
                                tc_workload.priority.retry_duration_s,
                                tc_workload.priority.verified_duration_s,
                                &agreement.current_agreement_id,
                            )
                            .await
                        {
                            error!(
                                worker_id = %self.worker_id,
                                device_id = %wi.sender_id,
                                error = %e,
                                "error updating workload usage priority"
                            );
                        }
                    } else if let Err(e) = self
                        .store
                        .update_retry_count(
                            &wi.sender_id,
                            policy_name,
                            wu.retry_count + 1,
                            &agreement.current_agreement_id,
                        )
                        .await
                    {
                        error!(
                            worker_id = %self.worker_id,
                            device_id = %wi.sender_id,
                            error = %e,
                            "error updating workload usage retry count"
                        );
                    }
                } else if let Err(e) = self
                    .store
                    .update_wu_agreement_id(
                        &wi.sender_id,
                        policy_name,
                        &agreement.current_agreement_id,
                    )
                    .await
                {
                    error!(
                        worker_id = %self.worker_id,
                        device_id = %wi.sender_id,
                        error = %e,
                        "error updating workload usage agreement id"
                    );
                }
            }
        }
    }

    // ============================================================
    // Data received ack
    // ============================================================

    pub async fn handle_data_received_ack(&self, wi: HandleDataReceivedAck) {
        let ack = match self.driver.validate_data_received_ack(&wi.ack_text) {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    sender = %wi.sender_id,
                    error = %e,
                    "discarding unparseable data received ack"
                );
                self.delete_message(wi.message_id).await;
                return;
            }
        };

        let lock = self.locks.get_lock(&ack.agreement_id);
        {
            let _guard = lock.lock().await;
            match self
                .store
                .find_single_agreement(&ack.agreement_id, self.driver.name(), &[AgreementFilter::Unarchived])
                .await
            {
                Ok(Some(ag)) => {
                    if let Err(e) = self
                        .store
                        .data_notification(&ag.current_agreement_id, self.driver.name())
                        .await
                    {
                        error!(
                            worker_id = %self.worker_id,
                            agreement_id = %ag.current_agreement_id,
                            error = %e,
                            "unable to record data notification"
                        );
                    }
                }
                Ok(None) => {
                    debug!(
                        worker_id = %self.worker_id,
                        agreement_id = %ack.agreement_id,
                        "no database record for data received ack"
                    );
                }
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        agreement_id = %ack.agreement_id,
                        error = %e,
                        "error querying agreement"
                    );
                }
            }
        }

        self.delete_message(wi.message_id).await;
    }

    // ============================================================
    // Workload upgrade
    // ============================================================

    /// Force a device off its current workload. Cancels the named
    /// agreement, or every agreement for the (device, policy) pair when no
    /// id is given, then deletes the usage record so the next negotiation
    /// starts from the highest priority.
    pub async fn handle_workload_upgrade(&self, wi: HandleWorkloadUpgrade) {
        let reason = self
            .driver
            .get_termination_code(TerminationReason::ForcedUpgrade);

        if wi.agreement_id.is_empty() {
            let filters = [
                AgreementFilter::Unarchived,
                AgreementFilter::DeviceAndPolicy {
                    device_id: wi.device_id.clone(),
                    policy_name: wi.policy_name.clone(),
                },
            ];
            match self.store.find_agreements(&filters, self.driver.name()).await {
                Ok(ags) if ags.is_empty() => {
                    debug!(
                        worker_id = %self.worker_id,
                        device_id = %wi.device_id,
                        policy = %wi.policy_name,
                        "forced upgrade found no current agreement"
                    );
                }
                Ok(ags) => {
                    for ag in ags {
                        self.cancel_agreement_with_lock(&ag.current_agreement_id, reason)
                            .await;
                    }
                }
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        device_id = %wi.device_id,
                        policy = %wi.policy_name,
                        error = %e,
                        "error finding agreements for forced upgrade"
                    );
                }
            }
        } else {
            self.cancel_agreement_with_lock(&wi.agreement_id, reason).await;
        }

        if let Err(e) = self
            .store
            .delete_workload_usage(&wi.device_id, &wi.policy_name)
            .await
        {
            error!(
                worker_id = %self.worker_id,
                device_id = %wi.device_id,
                policy = %wi.policy_name,
                error = %e,
                "error deleting workload usage record"
            );
        }
    }

    // ============================================================
    // Cancellation
    // ============================================================

    /// Top-level cancel: serialize under the agreement lock, then retire
    /// the lock itself. The lock is never deleted before the cancel
    /// completes.
    pub async fn cancel_agreement_with_lock(&self, agreement_id: &str, reason: u32) {
        let lock = self.locks.get_lock(agreement_id);
        {
            let _guard = lock.lock().await;
            self.cancel_agreement(agreement_id, reason).await;
        }
        self.locks.delete_lock(agreement_id);
    }

    /// Cancel an agreement: mark it timed out, detach and possibly delete
    /// its workload usage, run or defer the ledger-side termination, and
    /// archive the record. Callers must hold the agreement lock.
    pub async fn cancel_agreement(&self, agreement_id: &str, reason: u32) {
        info!(
            worker_id = %self.worker_id,
            agreement_id = %agreement_id,
            reason,
            "terminating agreement"
        );

        if let Err(e) = self
            .store
            .agreement_timedout(agreement_id, self.driver.name())
            .await
        {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error marking agreement terminated"
            );
        }

        if let Err(e) = self.exchange.delete_consumer_agreement(agreement_id).await {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error deleting agreement in the exchange"
            );
        }

        let ag = match self
            .store
            .find_single_agreement(agreement_id, self.driver.name(), &[AgreementFilter::Unarchived])
            .await
        {
            Ok(Some(ag)) => ag,
            Ok(None) => {
                debug!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    "nothing to terminate, no database record"
                );
                return;
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    error = %e,
                    "error querying agreement"
                );
                return;
            }
        };

        // Detach the usage record from this agreement. A reqs-not-met
        // record is deleted outright so the next negotiation tries the
        // highest priority workload again.
        match self
            .store
            .update_wu_agreement_id(&ag.device_id, &ag.policy_name, "")
            .await
        {
            Ok(Some(wu)) if wu.reqs_not_met => {
                if let Err(e) = self
                    .store
                    .delete_workload_usage(&ag.device_id, &ag.policy_name)
                    .await
                {
                    error!(
                        worker_id = %self.worker_id,
                        device_id = %ag.device_id,
                        policy = %ag.policy_name,
                        error = %e,
                        "error deleting workload usage record"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    device_id = %ag.device_id,
                    policy = %ag.policy_name,
                    error = %e,
                    "error detaching workload usage from agreement"
                );
            }
        }

        // Ledger-side termination runs now when possible, and is deferred
        // for retry when the substrate is unavailable or the counterparty
        // predates deferred-capable protocol versions.
        if self.driver.can_cancel_now(&ag).await || ag.counterparty_address.is_empty() {
            self.do_async_cancel(ag.clone(), reason).await;
        }

        let (ledger_type, ledger_name, ledger_org) = self.driver.get_known_ledger(&ag);
        if ag.protocol_version < 2
            || (!ledger_type.is_empty()
                && !self
                    .driver
                    .is_ledger_writable(&ledger_type, &ledger_name, &ledger_org)
                    .await)
        {
            debug!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                "deferring ledger cancel"
            );
            self.driver.defer_command(AsyncCancelCmd {
                agreement_id: agreement_id.to_string(),
                protocol: self.driver.name().to_string(),
                reason,
            });
        }

        if let Err(e) = self
            .store
            .archive_agreement(
                agreement_id,
                self.driver.name(),
                reason,
                &self.driver.get_termination_reason(reason),
            )
            .await
        {
            error!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                error = %e,
                "error archiving terminated agreement"
            );
        }
    }

    /// Deferred cancel retry. The record may already be archived locally;
    /// the ledger-side termination is still owed.
    pub async fn external_cancel(&self, agreement_id: &str, reason: u32) {
        debug!(
            worker_id = %self.worker_id,
            agreement_id = %agreement_id,
            "starting deferred cancel"
        );

        let ag = match self
            .store
            .find_single_agreement(agreement_id, self.driver.name(), &[])
            .await
        {
            Ok(Some(ag)) => ag,
            Ok(None) => {
                debug!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    "nothing to terminate, no database record"
                );
                return;
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    agreement_id = %agreement_id,
                    error = %e,
                    "error querying agreement"
                );
                return;
            }
        };

        let (ledger_type, ledger_name, ledger_org) = self.driver.get_known_ledger(&ag);
        if ledger_type.is_empty()
            || self
                .driver
                .is_ledger_writable(&ledger_type, &ledger_name, &ledger_org)
                .await
        {
            self.do_async_cancel(ag, reason).await;
        } else {
            debug!(
                worker_id = %self.worker_id,
                agreement_id = %agreement_id,
                "ledger still not writable, deferring again"
            );
            self.driver.defer_command(AsyncCancelCmd {
                agreement_id: agreement_id.to_string(),
                protocol: self.driver.name().to_string(),
                reason,
            });
        }
    }

    /// Spawn the ledger-side termination on its own task. It joins nothing
    /// and reports only through logs.
    async fn do_async_cancel(&self, agreement: Agreement, reason: u32) {
        debug!(
            worker_id = %self.worker_id,
            agreement_id = %agreement.current_agreement_id,
            "starting async cancel"
        );
        let driver = self.driver.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            driver.terminate_agreement(&agreement, reason, &worker_id).await;
        });
    }

    // ============================================================
    // Helpers
    // ============================================================

    async fn delete_message(&self, message_id: i64) {
        if message_id == 0 {
            return;
        }
        if let Err(e) = self.exchange.delete_message(message_id).await {
            error!(
                worker_id = %self.worker_id,
                message_id,
                error = %e,
                "error deleting message from exchange"
            );
        }
    }

    /// Every HA partner must be registered in the exchange. Partners do not
    /// have to be heartbeating, just present.
    async fn check_ha_group(&self, producer_policy: &Policy) -> Result<(), String> {
        for partner in &producer_policy.ha_group.partners {
            if let Err(e) = self.exchange.get_device(partner).await {
                return Err(format!("could not obtain partner {partner}: {e}"));
            }
        }
        Ok(())
    }

    /// Devices advertising a configured ignore property are skipped.
    fn ignore_device(&self, producer_policy: &Policy) -> bool {
        producer_policy
            .properties
            .iter()
            .any(|p| self.config.ignore_contract_with_attribs.contains(&p.name))
    }
}
