//! End-to-end orchestrator scenarios against an in-memory store and a
//! scripted network-server client.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use applayer::{fragmentation, gps, multicastsetup, Aes128Key, Eui64};
use ns_client::{DeviceQueueItem, MulticastGroupType};
use storage::DeploymentStore;

use fuota::config::Marshaler;
use fuota::deployment::{
    Deployment, DeploymentOptions, DeviceOptions, FragSessionStatusRequest,
};
use fuota::eventhandler::{EventRouter, UplinkHandler};

use common::{log_fields, uplink_event, ClientCall, MemStore, MockClient, MOCK_GROUP_ID};

fn dev_eui() -> Eui64 {
    "0102030405060708".parse().unwrap()
}

fn mc_root_key() -> Aes128Key {
    Aes128Key([
        0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ])
}

fn base_opts(group_type: MulticastGroupType) -> DeploymentOptions {
    let mut devices = HashMap::new();
    devices.insert(
        dev_eui(),
        DeviceOptions {
            mc_root_key: mc_root_key(),
        },
    );

    DeploymentOptions {
        application_id: "1".to_string(),
        devices,
        multicast_group_type: group_type,
        multicast_dr: 5,
        multicast_class_b_ping_slot_periodicity: 1,
        multicast_frequency: 868_100_000,
        multicast_group_id: 0,
        // 2^0 = 1 second multicast window, keeps the tests fast.
        multicast_timeout: 0,
        multicast_region: "EU868".to_string(),
        unicast_timeout: Duration::from_millis(100),
        unicast_attempt_count: 1,
        frag_size: 50,
        payload: (0..1000usize).map(|i| i as u8).collect(),
        redundancy: 1,
        fragmentation_session_index: 0,
        fragmentation_matrix: 0,
        block_ack_delay: 1,
        descriptor: [0; 4],
        request_fragmentation_session_status: FragSessionStatusRequest::AfterSessionTimeout,
    }
}

// A device that acknowledges every command successfully.
fn happy_answer(item: &DeviceQueueItem) -> Option<Vec<u8>> {
    match item.f_port {
        multicastsetup::DEFAULT_FPORT => {
            match multicastsetup::Command::from_bytes(false, &item.data).ok()? {
                multicastsetup::Command::McGroupSetupReq(pl) => {
                    multicastsetup::Command::McGroupSetupAns(
                        multicastsetup::McGroupSetupAnsPayload {
                            mc_group_id: pl.mc_group_id,
                            id_error: false,
                        },
                    )
                    .to_bytes()
                    .ok()
                }
                multicastsetup::Command::McClassBSessionReq(pl) => {
                    multicastsetup::Command::McClassBSessionAns(
                        multicastsetup::McClassBSessionAnsPayload {
                            mc_group_id: pl.mc_group_id,
                            dr_error: false,
                            freq_error: false,
                            mc_group_undefined: false,
                            time_to_start: Some(0),
                        },
                    )
                    .to_bytes()
                    .ok()
                }
                multicastsetup::Command::McClassCSessionReq(pl) => {
                    multicastsetup::Command::McClassCSessionAns(
                        multicastsetup::McClassCSessionAnsPayload {
                            mc_group_id: pl.mc_group_id,
                            dr_error: false,
                            freq_error: false,
                            mc_group_undefined: false,
                            time_to_start: Some(0),
                        },
                    )
                    .to_bytes()
                    .ok()
                }
                _ => None,
            }
        }
        fragmentation::DEFAULT_FPORT => {
            match fragmentation::Command::from_bytes(false, &item.data).ok()? {
                fragmentation::Command::FragSessionSetupReq(pl) => {
                    fragmentation::Command::FragSessionSetupAns(
                        fragmentation::FragSessionSetupAnsPayload {
                            frag_index: pl.frag_index,
                            wrong_descriptor: false,
                            frag_session_index_not_supported: false,
                            not_enough_memory: false,
                            encoding_unsupported: false,
                        },
                    )
                    .to_bytes()
                    .ok()
                }
                fragmentation::Command::FragSessionStatusReq(pl) => {
                    fragmentation::Command::FragSessionStatusAns(
                        fragmentation::FragSessionStatusAnsPayload {
                            frag_index: pl.frag_index,
                            nb_frag_received: 21,
                            missing_frag: 0,
                            not_enough_matrix_memory: false,
                        },
                    )
                    .to_bytes()
                    .ok()
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn spawn_responder<F>(
    depl: Arc<Deployment>,
    mut calls: mpsc::UnboundedReceiver<ClientCall>,
    answer: F,
) where
    F: Fn(&DeviceQueueItem) -> Option<Vec<u8>> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(call) = calls.recv().await {
            let ClientCall::EnqueueDevice(item) = call else {
                continue;
            };
            if let Some(data) = answer(&item) {
                let _ = depl
                    .handle_uplink(uplink_event(item.dev_eui, item.f_port, data))
                    .await;
            }
        }
    });
}

#[tokio::test]
async fn class_c_happy_path() {
    let store = MemStore::new();
    let (client, calls) = MockClient::new();
    let router = EventRouter::new(Marshaler::Protobuf, client.clone());

    let depl = Deployment::new(
        base_opts(MulticastGroupType::ClassC),
        store.clone(),
        client.clone(),
    )
    .await
    .unwrap();
    let id = depl.id();

    spawn_responder(depl.clone(), calls, happy_answer);
    depl.run(router.clone()).await.unwrap();

    // All five phase timestamps are set and lie inside the record window.
    let d = store.get_deployment(id).await.unwrap();
    assert!(d.created_at <= d.updated_at);
    for ts in [
        d.mc_group_setup_completed_at,
        d.frag_session_setup_completed_at,
        d.mc_session_completed_at,
        d.enqueue_completed_at,
        d.frag_status_completed_at,
    ] {
        let ts = ts.expect("phase timestamp set");
        assert!(ts >= d.created_at && ts <= d.updated_at);
    }

    // Per-device timestamps are all set.
    let dd = store.get_deployment_device(id, dev_eui()).await.unwrap();
    assert!(dd.mc_group_setup_completed_at.is_some());
    assert!(dd.frag_session_setup_completed_at.is_some());
    assert!(dd.mc_session_completed_at.is_some());
    assert!(dd.frag_status_completed_at.is_some());

    // The multicast group was created and deleted again.
    {
        let all = client.calls.lock().unwrap();
        let created = all
            .iter()
            .find_map(|c| match c {
                ClientCall::CreateMulticastGroup(g) => Some(g.clone()),
                _ => None,
            })
            .expect("multicast group created");
        assert_eq!(created.name, format!("fuota-{}", id));
        assert_eq!(created.group_type, MulticastGroupType::ClassC);
        assert!(all.iter().any(|c| matches!(
            c,
            ClientCall::AddDevice { group_id, .. } if group_id == MOCK_GROUP_ID
        )));
    }
    assert!(client.group_deleted());

    // 1000-byte payload, 50-byte fragments, one redundancy fragment: 21
    // multicast enqueues with FCnt 0..=20 on FPort 201.
    let enqueued = client.multicast_enqueues();
    assert_eq!(enqueued.len(), 21);
    for (i, item) in enqueued.iter().enumerate() {
        assert_eq!(item.f_cnt, i as u32);
        assert_eq!(item.f_port, fragmentation::DEFAULT_FPORT);
        assert_eq!(item.multicast_group_id, MOCK_GROUP_ID);

        let cmd = fragmentation::Command::from_bytes(false, &item.data).unwrap();
        let fragmentation::Command::DataFragment(pl) = cmd else {
            panic!("expected DataFragment");
        };
        assert_eq!(pl.n, (i + 1) as u16);
        assert_eq!(pl.frag_index, 0);
        assert_eq!(pl.payload.len(), 50);
    }

    // Payload is a multiple of the fragment size: no padding, 20 fragments.
    let setup_req = client
        .device_enqueues()
        .iter()
        .filter(|i| i.f_port == fragmentation::DEFAULT_FPORT)
        .find_map(
            |i| match fragmentation::Command::from_bytes(false, &i.data).ok()? {
                fragmentation::Command::FragSessionSetupReq(pl) => Some(pl),
                _ => None,
            },
        )
        .expect("FragSessionSetupReq sent");
    assert_eq!(setup_req.nb_frag, 20);
    assert_eq!(setup_req.padding, 0);
    assert_eq!(setup_req.frag_size, 50);

    // Sent commands and parsed answers are all logged, in order.
    let logs = store.get_deployment_logs(id, dev_eui()).await.unwrap();
    let commands: Vec<&str> = logs.iter().map(|l| l.command.as_str()).collect();
    for expected in [
        "McGroupSetupReq",
        "McGroupSetupAns",
        "FragSessionSetupReq",
        "FragSessionSetupAns",
        "McClassCSessionReq",
        "McClassCSessionAns",
        "FragSessionStatusReq",
        "FragSessionStatusAns",
    ] {
        assert_eq!(
            commands.iter().filter(|c| **c == expected).count(),
            1,
            "expected exactly one {} log",
            expected
        );
    }
    assert!(logs.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    // The uplink handler is unregistered once the deployment ends.
    assert_eq!(router.handler_count(), 0);
}

#[tokio::test]
async fn recoverable_protocol_error_is_retried() {
    let store = MemStore::new();
    let (client, calls) = MockClient::new();
    let router = EventRouter::new(Marshaler::Protobuf, client.clone());

    let mut opts = base_opts(MulticastGroupType::ClassC);
    opts.unicast_attempt_count = 2;

    let depl = Deployment::new(opts, store.clone(), client.clone())
        .await
        .unwrap();
    let id = depl.id();

    // The first McGroupSetupAns reports an id error, the second succeeds.
    let setup_answers = AtomicUsize::new(0);
    spawn_responder(depl.clone(), calls, move |item| {
        if item.f_port == multicastsetup::DEFAULT_FPORT {
            if let Ok(multicastsetup::Command::McGroupSetupReq(pl)) =
                multicastsetup::Command::from_bytes(false, &item.data)
            {
                let id_error = setup_answers.fetch_add(1, Ordering::SeqCst) == 0;
                return multicastsetup::Command::McGroupSetupAns(
                    multicastsetup::McGroupSetupAnsPayload {
                        mc_group_id: pl.mc_group_id,
                        id_error,
                    },
                )
                .to_bytes()
                .ok();
            }
        }
        happy_answer(item)
    });

    depl.run(router).await.unwrap();

    // Two requests were sent and logged; the deployment completed anyway.
    let setup_reqs = client
        .device_enqueues()
        .iter()
        .filter(|i| {
            i.f_port == multicastsetup::DEFAULT_FPORT
                && matches!(
                    multicastsetup::Command::from_bytes(false, &i.data),
                    Ok(multicastsetup::Command::McGroupSetupReq(_))
                )
        })
        .count();
    assert_eq!(setup_reqs, 2);

    let logs = store.get_deployment_logs(id, dev_eui()).await.unwrap();
    let sends = logs.iter().filter(|l| l.command == "McGroupSetupReq").count();
    assert_eq!(sends, 2);

    let answers: Vec<_> = logs
        .iter()
        .filter(|l| l.command == "McGroupSetupAns")
        .collect();
    assert_eq!(answers.len(), 2);
    assert_eq!(
        log_fields(answers[0]).get("id_error").map(String::as_str),
        Some("true")
    );
    assert_eq!(
        log_fields(answers[1]).get("id_error").map(String::as_str),
        Some("false")
    );

    let d = store.get_deployment(id).await.unwrap();
    assert!(d.frag_status_completed_at.is_some());

    let dd = store.get_deployment_device(id, dev_eui()).await.unwrap();
    assert!(dd.mc_group_setup_completed_at.is_some());
}

#[tokio::test]
async fn attempt_exhaustion_filters_device_from_later_phases() {
    let store = MemStore::new();
    let (client, calls) = MockClient::new();
    let router = EventRouter::new(Marshaler::Protobuf, client.clone());

    let depl = Deployment::new(
        base_opts(MulticastGroupType::ClassC),
        store.clone(),
        client.clone(),
    )
    .await
    .unwrap();
    let id = depl.id();

    // The device never answers the fragmentation-session setup.
    spawn_responder(depl.clone(), calls, |item| {
        if item.f_port == fragmentation::DEFAULT_FPORT {
            return None;
        }
        happy_answer(item)
    });

    depl.run(router).await.unwrap();

    // The deployment phase ended (timestamp set) but the device never
    // completed it.
    let d = store.get_deployment(id).await.unwrap();
    assert!(d.frag_session_setup_completed_at.is_some());
    assert!(d.mc_session_completed_at.is_some());

    let dd = store.get_deployment_device(id, dev_eui()).await.unwrap();
    assert!(dd.mc_group_setup_completed_at.is_some());
    assert!(dd.frag_session_setup_completed_at.is_none());
    assert!(dd.mc_session_completed_at.is_none());

    // The device was filtered out of the multicast-session setup.
    let class_c_reqs = client
        .device_enqueues()
        .iter()
        .filter(|i| {
            matches!(
                multicastsetup::Command::from_bytes(false, &i.data),
                Ok(multicastsetup::Command::McClassCSessionReq(_))
            )
        })
        .count();
    assert_eq!(class_c_reqs, 0);
}

#[tokio::test]
async fn class_b_session_time_and_group_mismatch() {
    let store = MemStore::new();
    let (client, calls) = MockClient::new();
    let router = EventRouter::new(Marshaler::Protobuf, client.clone());

    let opts = base_opts(MulticastGroupType::ClassB);
    let unicast_timeout = opts.unicast_timeout;

    let depl = Deployment::new(opts, store.clone(), client.clone())
        .await
        .unwrap();
    let id = depl.id();

    let before = Utc::now();

    // The session answer carries a different multicast group id; the flag
    // must not be set.
    spawn_responder(depl.clone(), calls, |item| {
        if let Ok(multicastsetup::Command::McClassBSessionReq(pl)) =
            multicastsetup::Command::from_bytes(false, &item.data)
        {
            return multicastsetup::Command::McClassBSessionAns(
                multicastsetup::McClassBSessionAnsPayload {
                    mc_group_id: (pl.mc_group_id + 1) & 0x03,
                    dr_error: false,
                    freq_error: false,
                    mc_group_undefined: false,
                    time_to_start: Some(0),
                },
            )
            .to_bytes()
            .ok();
        }
        happy_answer(item)
    });

    depl.run(router).await.unwrap();
    let after = Utc::now();

    // The Class-B group was created with the configured ping-slot
    // periodicity.
    let created = client
        .calls
        .lock()
        .unwrap()
        .iter()
        .find_map(|c| match c {
            ClientCall::CreateMulticastGroup(g) => Some(g.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(created.group_type, MulticastGroupType::ClassB);
    assert_eq!(created.class_b_ping_slot_periodicity, 1);

    // session_time is gps_seconds(session start) mod 2^32, where the session
    // starts one unicast timeout after the request was prepared.
    let req = client
        .device_enqueues()
        .iter()
        .find_map(
            |i| match multicastsetup::Command::from_bytes(false, &i.data).ok()? {
                multicastsetup::Command::McClassBSessionReq(pl) => Some(pl),
                _ => None,
            },
        )
        .expect("McClassBSessionReq sent");

    let lo = gps::seconds_mod_2_32(before);
    let hi = gps::seconds_mod_2_32(
        after + chrono::Duration::from_std(unicast_timeout).unwrap(),
    );
    assert!(
        req.session_time >= lo && req.session_time <= hi,
        "session_time {} outside [{}, {}]",
        req.session_time,
        lo,
        hi
    );
    assert_eq!(req.periodicity, 1);
    assert_eq!(req.time_out, 0);

    // Mismatched group id: the phase ended by exhaustion, the device flag
    // was never set.
    let d = store.get_deployment(id).await.unwrap();
    assert!(d.mc_session_completed_at.is_some());

    let dd = store.get_deployment_device(id, dev_eui()).await.unwrap();
    assert!(dd.mc_session_completed_at.is_none());
}

#[tokio::test]
async fn uplink_for_unknown_device_mutates_nothing() {
    let store = MemStore::new();
    let (client, _calls) = MockClient::new();

    let depl = Deployment::new(
        base_opts(MulticastGroupType::ClassC),
        store.clone(),
        client.clone(),
    )
    .await
    .unwrap();
    let id = depl.id();

    let stranger: Eui64 = "ffffffffffffffff".parse().unwrap();
    let ans = multicastsetup::Command::McGroupSetupAns(multicastsetup::McGroupSetupAnsPayload {
        mc_group_id: 0,
        id_error: false,
    })
    .to_bytes()
    .unwrap();

    depl.handle_uplink(uplink_event(stranger, multicastsetup::DEFAULT_FPORT, ans))
        .await
        .unwrap();

    assert!(store.get_deployment_logs(id, stranger).await.unwrap().is_empty());
    let dd = store.get_deployment_device(id, dev_eui()).await.unwrap();
    assert!(dd.mc_group_setup_completed_at.is_none());
}
