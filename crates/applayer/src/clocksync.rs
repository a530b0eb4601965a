//! Application Layer Clock Synchronization (TS003) commands.
//!
//! Commands are exchanged on FPort 202. `AppTimeReq` is device-initiated and
//! may arrive before any deployment exists.

use crate::CommandError;

/// FPort reserved for clock synchronization by TS003.
pub const DEFAULT_FPORT: u8 = 202;

const APP_TIME_CID: u8 = 0x01;
const DEVICE_APP_TIME_PERIODICITY_CID: u8 = 0x02;
const FORCE_DEVICE_RESYNC_CID: u8 = 0x03;

/// A clock-sync command, CID plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AppTimeReq(AppTimeReqPayload),
    AppTimeAns(AppTimeAnsPayload),
    DeviceAppTimePeriodicityReq(DeviceAppTimePeriodicityReqPayload),
    DeviceAppTimePeriodicityAns(DeviceAppTimePeriodicityAnsPayload),
    ForceDeviceResyncReq(ForceDeviceResyncReqPayload),
}

impl Command {
    pub fn cid(&self) -> u8 {
        match self {
            Command::AppTimeReq(_) | Command::AppTimeAns(_) => APP_TIME_CID,
            Command::DeviceAppTimePeriodicityReq(_) | Command::DeviceAppTimePeriodicityAns(_) => {
                DEVICE_APP_TIME_PERIODICITY_CID
            }
            Command::ForceDeviceResyncReq(_) => FORCE_DEVICE_RESYNC_CID,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommandError> {
        let mut b = vec![self.cid()];
        match self {
            Command::AppTimeReq(pl) => pl.encode(&mut b)?,
            Command::AppTimeAns(pl) => pl.encode(&mut b)?,
            Command::DeviceAppTimePeriodicityReq(pl) => pl.encode(&mut b)?,
            Command::DeviceAppTimePeriodicityAns(pl) => pl.encode(&mut b),
            Command::ForceDeviceResyncReq(pl) => pl.encode(&mut b)?,
        }
        Ok(b)
    }

    pub fn from_bytes(uplink: bool, b: &[u8]) -> Result<Self, CommandError> {
        let (&cid, rest) = b.split_first().ok_or(CommandError::InvalidLength)?;
        match (cid, uplink) {
            (APP_TIME_CID, true) => Ok(Command::AppTimeReq(AppTimeReqPayload::decode(rest)?)),
            (APP_TIME_CID, false) => Ok(Command::AppTimeAns(AppTimeAnsPayload::decode(rest)?)),
            (DEVICE_APP_TIME_PERIODICITY_CID, false) => Ok(Command::DeviceAppTimePeriodicityReq(
                DeviceAppTimePeriodicityReqPayload::decode(rest)?,
            )),
            (DEVICE_APP_TIME_PERIODICITY_CID, true) => Ok(Command::DeviceAppTimePeriodicityAns(
                DeviceAppTimePeriodicityAnsPayload::decode(rest)?,
            )),
            (FORCE_DEVICE_RESYNC_CID, false) => Ok(Command::ForceDeviceResyncReq(
                ForceDeviceResyncReqPayload::decode(rest)?,
            )),
            _ => Err(CommandError::UnknownCid(cid)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppTimeReqPayload {
    /// Device clock in GPS-epoch seconds modulo 2^32.
    pub device_time: u32,
    /// Request token, 0..=15, echoed in the answer.
    pub token_req: u8,
    pub ans_required: bool,
}

impl AppTimeReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.token_req > 15 {
            return Err(CommandError::OutOfRange("token_req"));
        }
        b.extend_from_slice(&self.device_time.to_le_bytes());
        let mut param = self.token_req & 0x0f;
        if self.ans_required {
            param |= 0x10;
        }
        b.push(param);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 5 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            device_time: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            token_req: b[4] & 0x0f,
            ans_required: b[4] & 0x10 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppTimeAnsPayload {
    /// Signed seconds the device must add to its clock.
    pub time_correction: i32,
    /// Token of the answered request, 0..=15.
    pub token_ans: u8,
}

impl AppTimeAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.token_ans > 15 {
            return Err(CommandError::OutOfRange("token_ans"));
        }
        b.extend_from_slice(&self.time_correction.to_le_bytes());
        b.push(self.token_ans & 0x0f);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 5 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            time_correction: i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            token_ans: b[4] & 0x0f,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAppTimePeriodicityReqPayload {
    /// Resync period exponent, 0..=15; the device reports every 128*2^period seconds.
    pub period: u8,
}

impl DeviceAppTimePeriodicityReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.period > 15 {
            return Err(CommandError::OutOfRange("period"));
        }
        b.push(self.period & 0x0f);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            period: b[0] & 0x0f,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAppTimePeriodicityAnsPayload {
    pub not_supported: bool,
    /// Device clock in GPS-epoch seconds modulo 2^32.
    pub time: u32,
}

impl DeviceAppTimePeriodicityAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) {
        b.push(if self.not_supported { 1 } else { 0 });
        b.extend_from_slice(&self.time.to_le_bytes());
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 5 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            not_supported: b[0] & 0x01 != 0,
            time: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceDeviceResyncReqPayload {
    /// Number of AppTimeReq transmissions to force, 0..=7.
    pub nb_transmissions: u8,
}

impl ForceDeviceResyncReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.nb_transmissions > 7 {
            return Err(CommandError::OutOfRange("nb_transmissions"));
        }
        b.push(self.nb_transmissions & 0x07);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            nb_transmissions: b[0] & 0x07,
        })
    }
}
