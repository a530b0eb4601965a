//! The deployment orchestrator.
//!
//! One [`Deployment`] instance drives a full FUOTA update: it creates the
//! multicast group, walks every device through multicast-setup,
//! fragmentation-session setup and multicast-session setup over unicast,
//! broadcasts the fragments during the multicast window and optionally
//! collects per-device reception status. Device answers arrive
//! asynchronously through [`UplinkHandler::handle_uplink`] and are fanned in
//! to the driver task via per-phase completion channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chirpstack_api::integration;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use applayer::{fragmentation, gps, multicastsetup, Aes128Key, DevAddr, Eui64};
use ns_client::{
    DeviceQueueItem, MulticastGroupConfig, MulticastGroupType, MulticastQueueItem,
    NetworkServerClient,
};
use storage::entity::{deployment, deployment_device};
use storage::{DeploymentStore, NewDeploymentLog};

use crate::error::Result;
use crate::eventhandler::{EventRouter, UplinkHandler};

/// If and when the fragmentation-session status must be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragSessionStatusRequest {
    NoRequest,
    AfterFragmentEnqueue,
    AfterSessionTimeout,
}

/// Per-device options.
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    /// McRootKey pre-provisioned on the device; McKeyEncrypted is derived
    /// from it per device.
    pub mc_root_key: Aes128Key,
}

/// Options for a FUOTA deployment, frozen at creation.
#[derive(Clone, Debug)]
pub struct DeploymentOptions {
    /// Application id on the network server; the devices must belong to it.
    pub application_id: String,

    pub devices: HashMap<Eui64, DeviceOptions>,

    pub multicast_group_type: MulticastGroupType,

    pub multicast_dr: u8,

    /// Ping-slot periodicity 0..=7, Class-B groups only.
    pub multicast_class_b_ping_slot_periodicity: u8,

    /// Multicast frequency in Hz.
    pub multicast_frequency: u32,

    /// Multicast group id, 0..=3.
    pub multicast_group_id: u8,

    /// Multicast timeout code; the session window lasts 2^timeout seconds.
    pub multicast_timeout: u8,

    /// Region name as the network server knows it, e.g. EU868.
    pub multicast_region: String,

    /// Time to wait for device answers before retrying a unicast command.
    pub unicast_timeout: Duration,

    /// Number of attempts before a unicast command counts as failed.
    pub unicast_attempt_count: usize,

    /// Maximum size of each payload fragment.
    pub frag_size: usize,

    /// The firmware payload.
    pub payload: Vec<u8>,

    /// Number of redundancy (parity) fragments.
    pub redundancy: usize,

    pub fragmentation_session_index: u8,

    pub fragmentation_matrix: u8,

    pub block_ack_delay: u8,

    pub descriptor: [u8; 4],

    pub request_fragmentation_session_status: FragSessionStatusRequest,
}

// The four phases a device acknowledges over unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    McGroupSetup,
    FragSessionSetup,
    McSession,
    FragSessionStatus,
}

#[derive(Default)]
struct DeviceState {
    multicast_setup: bool,
    fragmentation_session_setup: bool,
    multicast_session_setup: bool,
    fragmentation_session_status: bool,
}

impl DeviceState {
    fn get(&self, phase: Phase) -> bool {
        match phase {
            Phase::McGroupSetup => self.multicast_setup,
            Phase::FragSessionSetup => self.fragmentation_session_setup,
            Phase::McSession => self.multicast_session_setup,
            Phase::FragSessionStatus => self.fragmentation_session_status,
        }
    }

    fn set(&mut self, phase: Phase) {
        match phase {
            Phase::McGroupSetup => self.multicast_setup = true,
            Phase::FragSessionSetup => self.fragmentation_session_setup = true,
            Phase::McSession => self.multicast_session_setup = true,
            Phase::FragSessionStatus => self.fragmentation_session_status = true,
        }
    }

    // A device takes part in a phase only when it completed the phase the
    // commands build on.
    fn eligible(&self, phase: Phase) -> bool {
        match phase {
            Phase::McGroupSetup => true,
            Phase::FragSessionSetup => self.multicast_setup,
            Phase::McSession => self.fragmentation_session_setup,
            Phase::FragSessionStatus => self.multicast_session_setup,
        }
    }
}

// Capacity-1 completion channel; `notify` never blocks, a second completion
// within the same attempt window is dropped.
struct PhaseSignal {
    tx: mpsc::Sender<()>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl PhaseSignal {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

// Runtime multicast-session state, written by the driver task.
#[derive(Default)]
struct SessionState {
    mc_addr: DevAddr,
    mc_key: Aes128Key,
    multicast_group_id: String,
    session_start: Option<DateTime<Utc>>,
    session_end: Option<DateTime<Utc>>,
}

// Unregisters the uplink handler when the deployment finishes, fails or is
// cancelled.
struct RouterGuard {
    router: Arc<EventRouter>,
    id: Uuid,
}

impl Drop for RouterGuard {
    fn drop(&mut self) {
        self.router.unregister(self.id);
    }
}

/// A running FUOTA deployment.
pub struct Deployment {
    id: Uuid,
    opts: DeploymentOptions,
    store: Arc<dyn DeploymentStore>,
    client: Arc<dyn NetworkServerClient>,

    device_state: RwLock<HashMap<Eui64, DeviceState>>,
    session: Mutex<SessionState>,

    mc_group_setup_done: PhaseSignal,
    frag_session_setup_done: PhaseSignal,
    mc_session_done: PhaseSignal,
    frag_session_status_done: PhaseSignal,
}

impl Deployment {
    /// Creates the deployment: assigns a random id and persists the
    /// deployment row plus one row per device in a single transaction.
    pub async fn new(
        opts: DeploymentOptions,
        store: Arc<dyn DeploymentStore>,
        client: Arc<dyn NetworkServerClient>,
    ) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();
        let dev_euis: Vec<Eui64> = opts.devices.keys().copied().collect();

        store.create_deployment(id, &dev_euis).await?;

        let device_state = dev_euis
            .iter()
            .map(|dev_eui| (*dev_eui, DeviceState::default()))
            .collect();

        Ok(Arc::new(Self {
            id,
            opts,
            store,
            client,
            device_state: RwLock::new(device_state),
            session: Mutex::new(SessionState::default()),
            mc_group_setup_done: PhaseSignal::new(),
            frag_session_setup_done: PhaseSignal::new(),
            mc_session_done: PhaseSignal::new(),
            frag_session_status_done: PhaseSignal::new(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs the deployment to completion. The uplink handler is registered
    /// on the router for the duration of the run and unregistered on every
    /// exit path, including cancellation.
    pub async fn run(self: Arc<Self>, router: Arc<EventRouter>) -> Result<()> {
        router.register(self.id, self.clone());
        let _guard = RouterGuard {
            router,
            id: self.id,
        };

        info!(deployment_id = %self.id, "fuota: starting deployment");

        self.step_create_multicast_group().await?;
        self.step_add_devices_to_multicast_group().await?;
        self.step_multicast_setup().await?;
        self.step_fragmentation_session_setup().await?;
        self.step_multicast_class_b_session_setup().await?;
        self.step_multicast_class_c_session_setup().await?;
        self.step_enqueue().await?;
        self.step_frag_session_status().await?;
        self.step_wait_until_timeout().await?;
        self.step_delete_multicast_group().await?;

        info!(deployment_id = %self.id, "fuota: deployment completed");
        Ok(())
    }

    fn signal(&self, phase: Phase) -> &PhaseSignal {
        match phase {
            Phase::McGroupSetup => &self.mc_group_setup_done,
            Phase::FragSessionSetup => &self.frag_session_setup_done,
            Phase::McSession => &self.mc_session_done,
            Phase::FragSessionStatus => &self.frag_session_status_done,
        }
    }

    fn device_flag(&self, dev_eui: Eui64, phase: Phase) -> bool {
        let states = self.device_state.read().unwrap();
        states.get(&dev_eui).map(|s| s.get(phase)).unwrap_or(false)
    }

    // Sets the device's phase flag and reports, under the same lock, whether
    // every eligible device now has it.
    fn set_device_flag(&self, dev_eui: Eui64, phase: Phase) -> bool {
        let mut states = self.device_state.write().unwrap();
        if let Some(state) = states.get_mut(&dev_eui) {
            state.set(phase);
        }
        states
            .values()
            .all(|s| !s.eligible(phase) || s.get(phase))
    }

    // Signals the phase channel when no eligible device is still pending.
    // Covers the empty-eligible-set case right after an enqueue pass.
    fn check_phase_done(&self, phase: Phase) {
        let states = self.device_state.read().unwrap();
        let done = states
            .values()
            .all(|s| !s.eligible(phase) || s.get(phase));
        drop(states);
        if done {
            self.signal(phase).notify();
        }
    }

    async fn stamp_deployment(
        &self,
        set: impl FnOnce(&mut deployment::Model, DateTime<Utc>),
    ) -> Result<()> {
        let mut d = self.store.get_deployment(self.id).await?;
        set(&mut d, storage::now_ms());
        self.store.update_deployment(d).await?;
        Ok(())
    }

    async fn stamp_device(
        &self,
        dev_eui: Eui64,
        set: impl FnOnce(&mut deployment_device::Model, DateTime<Utc>),
    ) -> Result<()> {
        let mut dd = self.store.get_deployment_device(self.id, dev_eui).await?;
        set(&mut dd, storage::now_ms());
        self.store.update_deployment_device(dd).await?;
        Ok(())
    }

    async fn log_command<I>(&self, dev_eui: Eui64, f_port: u8, command: &str, fields: I)
    where
        I: IntoIterator<Item = (&'static str, String)>,
    {
        let log = NewDeploymentLog {
            deployment_id: self.id,
            dev_eui,
            f_port,
            command: command.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        if let Err(e) = self.store.create_deployment_log(log).await {
            error!(deployment_id = %self.id, error = %e, "fuota: create deployment log error");
        }
    }

    async fn sleep_until(&self, deadline: Option<DateTime<Utc>>, what: &str) {
        let Some(deadline) = deadline else {
            return;
        };
        if let Ok(wait) = (deadline - Utc::now()).to_std() {
            info!(
                deployment_id = %self.id,
                sleep_secs = wait.as_secs(),
                "fuota: waiting for {}",
                what
            );
            sleep(wait).await;
        }
    }

    // Step 1: create the multicast group on the network server with a fresh
    // random McAddr and McKey.
    async fn step_create_multicast_group(&self) -> Result<()> {
        let mut mc_addr = [0u8; 4];
        OsRng.fill_bytes(&mut mc_addr);
        let mc_addr = DevAddr(mc_addr);

        let mut mc_key = [0u8; 16];
        OsRng.fill_bytes(&mut mc_key);
        let mc_key = Aes128Key(mc_key);

        let mc_app_s_key = multicastsetup::get_mc_app_s_key(mc_key, mc_addr);
        let mc_net_s_key = multicastsetup::get_mc_net_s_key(mc_key, mc_addr);

        let group_id = self
            .client
            .create_multicast_group(MulticastGroupConfig {
                name: format!("fuota-{}", self.id),
                application_id: self.opts.application_id.clone(),
                region: self.opts.multicast_region.clone(),
                mc_addr: mc_addr.to_string(),
                mc_nwk_s_key: mc_net_s_key.to_string(),
                mc_app_s_key: mc_app_s_key.to_string(),
                group_type: self.opts.multicast_group_type,
                dr: self.opts.multicast_dr,
                frequency: self.opts.multicast_frequency,
                class_b_ping_slot_periodicity: self.opts.multicast_class_b_ping_slot_periodicity,
            })
            .await?;

        info!(deployment_id = %self.id, multicast_group_id = %group_id, "fuota: multicast-group created");

        let mut session = self.session.lock().unwrap();
        session.mc_addr = mc_addr;
        session.mc_key = mc_key;
        session.multicast_group_id = group_id;

        Ok(())
    }

    // Step 2: add every device to the multicast group.
    async fn step_add_devices_to_multicast_group(&self) -> Result<()> {
        let group_id = self.multicast_group_id();

        for dev_eui in self.opts.devices.keys() {
            info!(
                deployment_id = %self.id,
                dev_eui = %dev_eui,
                multicast_group_id = %group_id,
                "fuota: adding device to multicast-group"
            );
            self.client
                .add_device_to_multicast_group(&group_id, *dev_eui)
                .await?;
        }

        Ok(())
    }

    // Step 3: multicast-setup over unicast, retried per device.
    async fn step_multicast_setup(&self) -> Result<()> {
        info!(deployment_id = %self.id, "fuota: starting multicast-setup for devices");

        let mut rx = self.mc_group_setup_done.rx.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > self.opts.unicast_attempt_count {
                warn!(
                    deployment_id = %self.id,
                    "fuota: multicast-setup reached max attempts, some devices did not complete"
                );
                break;
            }

            let (mc_addr, mc_key) = {
                let session = self.session.lock().unwrap();
                (session.mc_addr, session.mc_key)
            };

            for (dev_eui, device) in &self.opts.devices {
                if self.device_flag(*dev_eui, Phase::McGroupSetup) {
                    continue;
                }

                info!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    attempt,
                    "fuota: initiating multicast-setup for device"
                );

                let mc_ke_key = multicastsetup::get_mc_ke_key(device.mc_root_key);
                let mc_key_encrypted = multicastsetup::encrypt_mc_key(mc_ke_key, mc_key);

                let cmd = multicastsetup::Command::McGroupSetupReq(
                    multicastsetup::McGroupSetupReqPayload {
                        mc_group_id: self.opts.multicast_group_id,
                        mc_addr,
                        mc_key_encrypted,
                        min_mc_f_cnt: 0,
                        max_mc_f_cnt: u32::MAX,
                    },
                );

                if let Err(e) = self
                    .client
                    .enqueue_device(DeviceQueueItem {
                        dev_eui: *dev_eui,
                        f_port: multicastsetup::DEFAULT_FPORT,
                        data: cmd.to_bytes()?,
                    })
                    .await
                {
                    error!(
                        deployment_id = %self.id,
                        dev_eui = %dev_eui,
                        error = %e,
                        "fuota: enqueue payload error"
                    );
                    continue;
                }

                self.log_command(
                    *dev_eui,
                    multicastsetup::DEFAULT_FPORT,
                    "McGroupSetupReq",
                    [
                        ("mc_group_id", self.opts.multicast_group_id.to_string()),
                        ("mc_addr", mc_addr.to_string()),
                        ("mc_key_encrypted", mc_key_encrypted.to_string()),
                        ("min_mc_f_cnt", 0.to_string()),
                        ("max_mc_f_cnt", u32::MAX.to_string()),
                    ],
                )
                .await;
            }

            self.check_phase_done(Phase::McGroupSetup);

            tokio::select! {
                _ = sleep(self.opts.unicast_timeout) => continue,
                _ = rx.recv() => {
                    info!(deployment_id = %self.id, "fuota: multicast-setup completed for all devices");
                    break;
                }
            }
        }

        self.stamp_deployment(|d, now| d.mc_group_setup_completed_at = Some(now))
            .await
    }

    // Step 4: fragmentation-session setup for devices that completed
    // multicast-setup.
    async fn step_fragmentation_session_setup(&self) -> Result<()> {
        info!(deployment_id = %self.id, "fuota: starting fragmentation-session setup for devices");

        let padding =
            (self.opts.frag_size - (self.opts.payload.len() % self.opts.frag_size))
                % self.opts.frag_size;
        let nb_frag = (self.opts.payload.len() + padding) / self.opts.frag_size;

        let mut rx = self.frag_session_setup_done.rx.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > self.opts.unicast_attempt_count {
                warn!(
                    deployment_id = %self.id,
                    "fuota: fragmentation-session setup reached max attempts, some devices did not complete"
                );
                break;
            }

            for dev_eui in self.opts.devices.keys() {
                if !self.device_flag(*dev_eui, Phase::McGroupSetup)
                    || self.device_flag(*dev_eui, Phase::FragSessionSetup)
                {
                    continue;
                }

                info!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    attempt,
                    "fuota: initiating fragmentation-session setup for device"
                );

                let mut mc_group_bit_mask = [false; 4];
                mc_group_bit_mask[self.opts.multicast_group_id as usize] = true;

                let cmd = fragmentation::Command::FragSessionSetupReq(
                    fragmentation::FragSessionSetupReqPayload {
                        frag_index: self.opts.fragmentation_session_index,
                        mc_group_bit_mask,
                        nb_frag: nb_frag as u16,
                        frag_size: self.opts.frag_size as u8,
                        fragmentation_matrix: self.opts.fragmentation_matrix,
                        block_ack_delay: self.opts.block_ack_delay,
                        padding: padding as u8,
                        descriptor: self.opts.descriptor,
                    },
                );

                if let Err(e) = self
                    .client
                    .enqueue_device(DeviceQueueItem {
                        dev_eui: *dev_eui,
                        f_port: fragmentation::DEFAULT_FPORT,
                        data: cmd.to_bytes()?,
                    })
                    .await
                {
                    error!(
                        deployment_id = %self.id,
                        dev_eui = %dev_eui,
                        error = %e,
                        "fuota: enqueue payload error"
                    );
                    continue;
                }

                self.log_command(
                    *dev_eui,
                    fragmentation::DEFAULT_FPORT,
                    "FragSessionSetupReq",
                    [
                        (
                            "frag_index",
                            self.opts.fragmentation_session_index.to_string(),
                        ),
                        (
                            "mc_group_bit_mask",
                            (1u8 << self.opts.multicast_group_id).to_string(),
                        ),
                        ("nb_frag", nb_frag.to_string()),
                        ("frag_size", self.opts.frag_size.to_string()),
                        (
                            "fragmentation_matrix",
                            self.opts.fragmentation_matrix.to_string(),
                        ),
                        ("block_ack_delay", self.opts.block_ack_delay.to_string()),
                        ("padding", padding.to_string()),
                        ("descriptor", hex::encode(self.opts.descriptor)),
                    ],
                )
                .await;
            }

            self.check_phase_done(Phase::FragSessionSetup);

            tokio::select! {
                _ = sleep(self.opts.unicast_timeout) => continue,
                _ = rx.recv() => {
                    info!(
                        deployment_id = %self.id,
                        "fuota: fragmentation-session setup completed for all devices"
                    );
                    break;
                }
            }
        }

        self.stamp_deployment(|d, now| d.frag_session_setup_completed_at = Some(now))
            .await
    }

    // Step 5: Class-B multicast session setup; no-op for Class-C groups.
    async fn step_multicast_class_b_session_setup(&self) -> Result<()> {
        if self.opts.multicast_group_type != MulticastGroupType::ClassB {
            return Ok(());
        }

        info!(deployment_id = %self.id, "fuota: starting multicast class-b session setup for devices");

        let mut rx = self.mc_session_done.rx.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > self.opts.unicast_attempt_count {
                warn!(
                    deployment_id = %self.id,
                    "fuota: multicast class-b session setup reached max attempts, some devices did not complete"
                );
                break;
            }

            let session_time = self.schedule_session();

            for dev_eui in self.opts.devices.keys() {
                if !self.device_flag(*dev_eui, Phase::FragSessionSetup)
                    || self.device_flag(*dev_eui, Phase::McSession)
                {
                    continue;
                }

                info!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    attempt,
                    "fuota: initiating multicast class-b session setup for device"
                );

                let cmd = multicastsetup::Command::McClassBSessionReq(
                    multicastsetup::McClassBSessionReqPayload {
                        mc_group_id: self.opts.multicast_group_id,
                        session_time,
                        periodicity: self.opts.multicast_class_b_ping_slot_periodicity,
                        time_out: self.opts.multicast_timeout,
                        dl_frequency: self.opts.multicast_frequency,
                        dr: self.opts.multicast_dr,
                    },
                );

                if let Err(e) = self
                    .client
                    .enqueue_device(DeviceQueueItem {
                        dev_eui: *dev_eui,
                        f_port: multicastsetup::DEFAULT_FPORT,
                        data: cmd.to_bytes()?,
                    })
                    .await
                {
                    error!(
                        deployment_id = %self.id,
                        dev_eui = %dev_eui,
                        error = %e,
                        "fuota: enqueue payload error"
                    );
                    continue;
                }

                self.log_command(
                    *dev_eui,
                    multicastsetup::DEFAULT_FPORT,
                    "McClassBSessionReq",
                    [
                        ("mc_group_id", self.opts.multicast_group_id.to_string()),
                        ("session_time", session_time.to_string()),
                        (
                            "session_periodicity",
                            self.opts
                                .multicast_class_b_ping_slot_periodicity
                                .to_string(),
                        ),
                        ("session_time_out", self.opts.multicast_timeout.to_string()),
                        ("dl_frequency", self.opts.multicast_frequency.to_string()),
                        ("dr", self.opts.multicast_dr.to_string()),
                    ],
                )
                .await;
            }

            self.check_phase_done(Phase::McSession);

            tokio::select! {
                _ = sleep(self.opts.unicast_timeout) => continue,
                _ = rx.recv() => {
                    info!(
                        deployment_id = %self.id,
                        "fuota: multicast class-b session setup completed for all devices"
                    );
                    break;
                }
            }
        }

        self.stamp_deployment(|d, now| d.mc_session_completed_at = Some(now))
            .await
    }

    // Step 6: Class-C multicast session setup; no-op for Class-B groups.
    async fn step_multicast_class_c_session_setup(&self) -> Result<()> {
        if self.opts.multicast_group_type != MulticastGroupType::ClassC {
            return Ok(());
        }

        info!(deployment_id = %self.id, "fuota: starting multicast class-c session setup for devices");

        let mut rx = self.mc_session_done.rx.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > self.opts.unicast_attempt_count {
                warn!(
                    deployment_id = %self.id,
                    "fuota: multicast class-c session setup reached max attempts, some devices did not complete"
                );
                break;
            }

            let session_time = self.schedule_session();

            for dev_eui in self.opts.devices.keys() {
                if !self.device_flag(*dev_eui, Phase::FragSessionSetup)
                    || self.device_flag(*dev_eui, Phase::McSession)
                {
                    continue;
                }

                info!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    attempt,
                    "fuota: initiating multicast class-c session setup for device"
                );

                let cmd = multicastsetup::Command::McClassCSessionReq(
                    multicastsetup::McClassCSessionReqPayload {
                        mc_group_id: self.opts.multicast_group_id,
                        session_time,
                        session_time_out: self.opts.multicast_timeout,
                        dl_frequency: self.opts.multicast_frequency,
                        dr: self.opts.multicast_dr,
                    },
                );

                if let Err(e) = self
                    .client
                    .enqueue_device(DeviceQueueItem {
                        dev_eui: *dev_eui,
                        f_port: multicastsetup::DEFAULT_FPORT,
                        data: cmd.to_bytes()?,
                    })
                    .await
                {
                    error!(
                        deployment_id = %self.id,
                        dev_eui = %dev_eui,
                        error = %e,
                        "fuota: enqueue payload error"
                    );
                    continue;
                }

                self.log_command(
                    *dev_eui,
                    multicastsetup::DEFAULT_FPORT,
                    "McClassCSessionReq",
                    [
                        ("mc_group_id", self.opts.multicast_group_id.to_string()),
                        ("session_time", session_time.to_string()),
                        ("session_time_out", self.opts.multicast_timeout.to_string()),
                        ("dl_frequency", self.opts.multicast_frequency.to_string()),
                        ("dr", self.opts.multicast_dr.to_string()),
                    ],
                )
                .await;
            }

            self.check_phase_done(Phase::McSession);

            tokio::select! {
                _ = sleep(self.opts.unicast_timeout) => continue,
                _ = rx.recv() => {
                    info!(
                        deployment_id = %self.id,
                        "fuota: multicast class-c session setup completed for all devices"
                    );
                    break;
                }
            }
        }

        self.stamp_deployment(|d, now| d.mc_session_completed_at = Some(now))
            .await
    }

    // Step 7: wait for the session to open, then enqueue the encoded
    // fragments on the multicast group. This step does not await device
    // feedback.
    async fn step_enqueue(&self) -> Result<()> {
        info!(deployment_id = %self.id, "fuota: starting multicast enqueue");

        self.sleep_until(self.session_start(), "multicast-session to start")
            .await;

        let padding =
            (self.opts.frag_size - (self.opts.payload.len() % self.opts.frag_size))
                % self.opts.frag_size;
        let mut payload = self.opts.payload.clone();
        payload.extend(std::iter::repeat(0).take(padding));

        let fragments = fragmentation::encode(&payload, self.opts.frag_size, self.opts.redundancy)?;
        let group_id = self.multicast_group_id();

        for (i, fragment) in fragments.into_iter().enumerate() {
            let cmd = fragmentation::Command::DataFragment(fragmentation::DataFragmentPayload {
                frag_index: self.opts.fragmentation_session_index,
                n: (i + 1) as u16,
                payload: fragment,
            });

            self.client
                .enqueue_multicast(MulticastQueueItem {
                    multicast_group_id: group_id.clone(),
                    f_cnt: i as u32,
                    f_port: fragmentation::DEFAULT_FPORT,
                    data: cmd.to_bytes()?,
                })
                .await?;
        }

        self.stamp_deployment(|d, now| d.enqueue_completed_at = Some(now))
            .await
    }

    // Step 8: fragmentation-session status request, depending on the
    // configured policy.
    async fn step_frag_session_status(&self) -> Result<()> {
        match self.opts.request_fragmentation_session_status {
            FragSessionStatusRequest::NoRequest => {
                info!(deployment_id = %self.id, "fuota: skipping fragmentation-session status request as requested");
                return Ok(());
            }
            FragSessionStatusRequest::AfterSessionTimeout => {
                self.sleep_until(self.session_end(), "multicast-session to end")
                    .await;
            }
            FragSessionStatusRequest::AfterFragmentEnqueue => {}
        }

        info!(deployment_id = %self.id, "fuota: starting fragmentation-session status request for devices");

        let mut rx = self.frag_session_status_done.rx.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > self.opts.unicast_attempt_count {
                warn!(
                    deployment_id = %self.id,
                    "fuota: fragmentation-session status request reached max attempts, some devices did not complete"
                );
                break;
            }

            for dev_eui in self.opts.devices.keys() {
                if !self.device_flag(*dev_eui, Phase::McSession)
                    || self.device_flag(*dev_eui, Phase::FragSessionStatus)
                {
                    continue;
                }

                info!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    attempt,
                    "fuota: requesting fragmentation-session status for device"
                );

                let cmd = fragmentation::Command::FragSessionStatusReq(
                    fragmentation::FragSessionStatusReqPayload {
                        frag_index: self.opts.fragmentation_session_index,
                        participants: true,
                    },
                );

                if let Err(e) = self
                    .client
                    .enqueue_device(DeviceQueueItem {
                        dev_eui: *dev_eui,
                        f_port: fragmentation::DEFAULT_FPORT,
                        data: cmd.to_bytes()?,
                    })
                    .await
                {
                    error!(
                        deployment_id = %self.id,
                        dev_eui = %dev_eui,
                        error = %e,
                        "fuota: enqueue payload error"
                    );
                }

                self.log_command(
                    *dev_eui,
                    fragmentation::DEFAULT_FPORT,
                    "FragSessionStatusReq",
                    [
                        (
                            "frag_index",
                            self.opts.fragmentation_session_index.to_string(),
                        ),
                        ("participants", true.to_string()),
                    ],
                )
                .await;
            }

            self.check_phase_done(Phase::FragSessionStatus);

            // The status request is only answered once the multicast session
            // has ended for the devices.
            if self.opts.request_fragmentation_session_status
                != FragSessionStatusRequest::AfterSessionTimeout
            {
                self.sleep_until(self.session_end(), "multicast-session to end")
                    .await;
            }

            tokio::select! {
                _ = sleep(self.opts.unicast_timeout) => continue,
                _ = rx.recv() => {
                    info!(
                        deployment_id = %self.id,
                        "fuota: fragmentation-session status request completed for all devices"
                    );
                    break;
                }
            }
        }

        self.stamp_deployment(|d, now| d.frag_status_completed_at = Some(now))
            .await
    }

    // Step 9: make sure the multicast window has fully elapsed before the
    // group is cleaned up, also when the status request step was skipped.
    async fn step_wait_until_timeout(&self) -> Result<()> {
        self.sleep_until(self.session_end(), "multicast-session to end")
            .await;
        Ok(())
    }

    // Step 10: delete the multicast group.
    async fn step_delete_multicast_group(&self) -> Result<()> {
        let group_id = self.multicast_group_id();
        self.client.delete_multicast_group(&group_id).await?;

        info!(
            deployment_id = %self.id,
            multicast_group_id = %group_id,
            "fuota: multicast-group deleted"
        );
        Ok(())
    }

    fn multicast_group_id(&self) -> String {
        self.session.lock().unwrap().multicast_group_id.clone()
    }

    fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session.lock().unwrap().session_start
    }

    fn session_end(&self) -> Option<DateTime<Utc>> {
        self.session.lock().unwrap().session_end
    }

    // Plans the multicast window for this attempt: it opens one unicast
    // timeout from now and lasts 2^multicast_timeout seconds. Returns the
    // session time as GPS-epoch seconds mod 2^32.
    fn schedule_session(&self) -> u32 {
        let start = Utc::now()
            + chrono::Duration::from_std(self.opts.unicast_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let end = start + chrono::Duration::seconds(1i64 << self.opts.multicast_timeout);

        let mut session = self.session.lock().unwrap();
        session.session_start = Some(start);
        session.session_end = Some(end);

        gps::seconds_mod_2_32(start)
    }

    async fn handle_multicast_setup_command(&self, dev_eui: Eui64, data: &[u8]) -> Result<()> {
        let cmd = multicastsetup::Command::from_bytes(true, data)?;

        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            cid = cmd.cid(),
            "fuota: multicast-setup command received"
        );

        match cmd {
            multicastsetup::Command::McGroupSetupAns(pl) => {
                self.handle_mc_group_setup_ans(dev_eui, pl).await
            }
            multicastsetup::Command::McClassBSessionAns(pl) => {
                self.handle_mc_class_b_session_ans(dev_eui, pl).await
            }
            multicastsetup::Command::McClassCSessionAns(pl) => {
                self.handle_mc_class_c_session_ans(dev_eui, pl).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_fragmentation_command(&self, dev_eui: Eui64, data: &[u8]) -> Result<()> {
        let cmd = fragmentation::Command::from_bytes(true, data)?;

        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            cid = cmd.cid(),
            "fuota: fragmentation command received"
        );

        match cmd {
            fragmentation::Command::FragSessionSetupAns(pl) => {
                self.handle_frag_session_setup_ans(dev_eui, pl).await
            }
            fragmentation::Command::FragSessionStatusAns(pl) => {
                self.handle_frag_session_status_ans(dev_eui, pl).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_mc_group_setup_ans(
        &self,
        dev_eui: Eui64,
        pl: multicastsetup::McGroupSetupAnsPayload,
    ) -> Result<()> {
        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            mc_group_id = pl.mc_group_id,
            id_error = pl.id_error,
            "fuota: McGroupSetupAns received"
        );

        self.log_command(
            dev_eui,
            multicastsetup::DEFAULT_FPORT,
            "McGroupSetupAns",
            [
                ("mc_group_id", pl.mc_group_id.to_string()),
                ("id_error", pl.id_error.to_string()),
            ],
        )
        .await;

        if pl.mc_group_id == self.opts.multicast_group_id && !pl.id_error {
            let done = self.set_device_flag(dev_eui, Phase::McGroupSetup);
            self.stamp_device(dev_eui, |dd, now| {
                dd.mc_group_setup_completed_at = Some(now)
            })
            .await?;
            if done {
                self.mc_group_setup_done.notify();
            }
        }

        Ok(())
    }

    async fn handle_frag_session_setup_ans(
        &self,
        dev_eui: Eui64,
        pl: fragmentation::FragSessionSetupAnsPayload,
    ) -> Result<()> {
        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            frag_index = pl.frag_index,
            wrong_descriptor = pl.wrong_descriptor,
            frag_session_index_not_supported = pl.frag_session_index_not_supported,
            not_enough_memory = pl.not_enough_memory,
            encoding_unsupported = pl.encoding_unsupported,
            "fuota: FragSessionSetupAns received"
        );

        self.log_command(
            dev_eui,
            fragmentation::DEFAULT_FPORT,
            "FragSessionSetupAns",
            [
                ("frag_index", pl.frag_index.to_string()),
                ("wrong_descriptor", pl.wrong_descriptor.to_string()),
                (
                    "frag_session_index_not_supported",
                    pl.frag_session_index_not_supported.to_string(),
                ),
                ("not_enough_memory", pl.not_enough_memory.to_string()),
                (
                    "encoding_unsupported",
                    pl.encoding_unsupported.to_string(),
                ),
            ],
        )
        .await;

        if pl.frag_index == self.opts.fragmentation_session_index && pl.is_ok() {
            let done = self.set_device_flag(dev_eui, Phase::FragSessionSetup);
            self.stamp_device(dev_eui, |dd, now| {
                dd.frag_session_setup_completed_at = Some(now)
            })
            .await?;
            if done {
                self.frag_session_setup_done.notify();
            }
        }

        Ok(())
    }

    async fn handle_mc_class_b_session_ans(
        &self,
        dev_eui: Eui64,
        pl: multicastsetup::McClassBSessionAnsPayload,
    ) -> Result<()> {
        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            mc_group_id = pl.mc_group_id,
            mc_group_undefined = pl.mc_group_undefined,
            freq_error = pl.freq_error,
            dr_error = pl.dr_error,
            "fuota: McClassBSessionAns received"
        );

        self.log_command(
            dev_eui,
            multicastsetup::DEFAULT_FPORT,
            "McClassBSessionAns",
            [
                ("mc_group_id", pl.mc_group_id.to_string()),
                ("mc_group_undefined", pl.mc_group_undefined.to_string()),
                ("freq_error", pl.freq_error.to_string()),
                ("dr_error", pl.dr_error.to_string()),
            ],
        )
        .await;

        if pl.mc_group_id == self.opts.multicast_group_id
            && !pl.mc_group_undefined
            && !pl.freq_error
            && !pl.dr_error
        {
            let done = self.set_device_flag(dev_eui, Phase::McSession);
            self.stamp_device(dev_eui, |dd, now| dd.mc_session_completed_at = Some(now))
                .await?;
            if done {
                self.mc_session_done.notify();
            }
        }

        Ok(())
    }

    async fn handle_mc_class_c_session_ans(
        &self,
        dev_eui: Eui64,
        pl: multicastsetup::McClassCSessionAnsPayload,
    ) -> Result<()> {
        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            mc_group_id = pl.mc_group_id,
            mc_group_undefined = pl.mc_group_undefined,
            freq_error = pl.freq_error,
            dr_error = pl.dr_error,
            "fuota: McClassCSessionAns received"
        );

        self.log_command(
            dev_eui,
            multicastsetup::DEFAULT_FPORT,
            "McClassCSessionAns",
            [
                ("mc_group_id", pl.mc_group_id.to_string()),
                ("mc_group_undefined", pl.mc_group_undefined.to_string()),
                ("freq_error", pl.freq_error.to_string()),
                ("dr_error", pl.dr_error.to_string()),
            ],
        )
        .await;

        if pl.mc_group_id == self.opts.multicast_group_id
            && !pl.mc_group_undefined
            && !pl.freq_error
            && !pl.dr_error
        {
            let done = self.set_device_flag(dev_eui, Phase::McSession);
            self.stamp_device(dev_eui, |dd, now| dd.mc_session_completed_at = Some(now))
                .await?;
            if done {
                self.mc_session_done.notify();
            }
        }

        Ok(())
    }

    async fn handle_frag_session_status_ans(
        &self,
        dev_eui: Eui64,
        pl: fragmentation::FragSessionStatusAnsPayload,
    ) -> Result<()> {
        info!(
            deployment_id = %self.id,
            dev_eui = %dev_eui,
            frag_index = pl.frag_index,
            nb_frag_received = pl.nb_frag_received,
            missing_frag = pl.missing_frag,
            not_enough_matrix_memory = pl.not_enough_matrix_memory,
            "fuota: FragSessionStatusAns received"
        );

        self.log_command(
            dev_eui,
            fragmentation::DEFAULT_FPORT,
            "FragSessionStatusAns",
            [
                ("frag_index", pl.frag_index.to_string()),
                ("nb_frag_received", pl.nb_frag_received.to_string()),
                ("missing_frag", pl.missing_frag.to_string()),
                (
                    "not_enough_matrix_memory",
                    pl.not_enough_matrix_memory.to_string(),
                ),
            ],
        )
        .await;

        if pl.frag_index == self.opts.fragmentation_session_index
            && pl.missing_frag == 0
            && !pl.not_enough_matrix_memory
        {
            let done = self.set_device_flag(dev_eui, Phase::FragSessionStatus);
            self.stamp_device(dev_eui, |dd, now| dd.frag_status_completed_at = Some(now))
                .await?;
            if done {
                self.frag_session_status_done.notify();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl UplinkHandler for Deployment {
    /// Correlates an uplink event with this deployment. Events for unknown
    /// DevEUIs or unrelated FPorts are silently discarded.
    async fn handle_uplink(&self, event: integration::UplinkEvent) -> Result<()> {
        let Ok(dev_eui) = event
            .device_info
            .as_ref()
            .map(|d| d.dev_eui.as_str())
            .unwrap_or("")
            .parse::<Eui64>()
        else {
            return Ok(());
        };

        if !self.opts.devices.contains_key(&dev_eui) {
            debug!(
                deployment_id = %self.id,
                dev_eui = %dev_eui,
                f_port = event.f_port,
                "fuota: ignoring uplink event"
            );
            return Ok(());
        }

        match event.f_port as u8 {
            multicastsetup::DEFAULT_FPORT => {
                self.handle_multicast_setup_command(dev_eui, &event.data)
                    .await
            }
            fragmentation::DEFAULT_FPORT => {
                self.handle_fragmentation_command(dev_eui, &event.data).await
            }
            _ => {
                debug!(
                    deployment_id = %self.id,
                    dev_eui = %dev_eui,
                    f_port = event.f_port,
                    "fuota: ignoring uplink event"
                );
                Ok(())
            }
        }
    }
}
