//! Clock-sync responder.
//!
//! Answers device `AppTimeReq` commands with the network's notion of GPS
//! time. The receive metadata's `time_since_gps_epoch` is preferred; the
//! gateway `time` field and finally the server wall clock are fallbacks.

use chirpstack_api::integration;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use applayer::{clocksync, gps, Eui64};
use ns_client::{DeviceQueueItem, NetworkServerClient};

use crate::error::{Error, Result};

pub async fn handle_clock_sync(
    client: &dyn NetworkServerClient,
    event: &integration::UplinkEvent,
) -> Result<()> {
    let dev_eui: Eui64 = event
        .device_info
        .as_ref()
        .map(|d| d.dev_eui.as_str())
        .unwrap_or("")
        .parse()
        .map_err(|_| Error::Validation("uplink event carries no valid dev_eui".into()))?;

    let network_gps_seconds = network_gps_seconds(event);

    let cmd = clocksync::Command::from_bytes(true, &event.data)?;
    debug!(%dev_eui, cid = cmd.cid(), "clocksync: command received");

    match cmd {
        clocksync::Command::AppTimeReq(pl) => {
            handle_app_time_req(client, dev_eui, network_gps_seconds, pl).await
        }
        _ => Ok(()),
    }
}

// GPS-epoch seconds (mod 2^32) at which the uplink was received.
fn network_gps_seconds(event: &integration::UplinkEvent) -> u32 {
    let mut gps_seconds: Option<i64> = None;
    let mut gw_time: Option<DateTime<Utc>> = None;

    for rx_info in &event.rx_info {
        if let Some(d) = &rx_info.time_since_gps_epoch {
            gps_seconds = Some(d.seconds);
        } else if let Some(t) = &rx_info.gw_time {
            gw_time = Utc.timestamp_opt(t.seconds, t.nanos as u32).single();
        }
    }

    let gps_seconds = gps_seconds.unwrap_or_else(|| {
        let t = gw_time.unwrap_or_else(Utc::now);
        gps::time_since_gps_epoch(t).num_seconds()
    });

    (gps_seconds as u64 % (1u64 << 32)) as u32
}

async fn handle_app_time_req(
    client: &dyn NetworkServerClient,
    dev_eui: Eui64,
    network_gps_seconds: u32,
    pl: clocksync::AppTimeReqPayload,
) -> Result<()> {
    info!(
        %dev_eui,
        device_time = pl.device_time,
        token_req = pl.token_req,
        ans_required = pl.ans_required,
        "clocksync: AppTimeReq received"
    );

    let time_correction = network_gps_seconds.wrapping_sub(pl.device_time) as i32;

    let ans = clocksync::Command::AppTimeAns(clocksync::AppTimeAnsPayload {
        time_correction,
        token_ans: pl.token_req,
    });

    client
        .enqueue_device(DeviceQueueItem {
            dev_eui,
            f_port: clocksync::DEFAULT_FPORT,
            data: ans.to_bytes()?,
        })
        .await?;

    Ok(())
}
