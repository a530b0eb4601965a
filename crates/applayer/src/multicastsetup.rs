//! Remote Multicast Setup (TS005) commands and key derivation.
//!
//! Commands are exchanged on FPort 200. Requests travel as downlinks, answers
//! come back as uplinks; both directions of a pair share the same CID, so
//! decoding needs the link direction.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::{Aes128Key, CommandError, DevAddr};

/// FPort reserved for multicast-setup by TS005.
pub const DEFAULT_FPORT: u8 = 200;

const MC_GROUP_SETUP_CID: u8 = 0x02;
const MC_GROUP_DELETE_CID: u8 = 0x03;
const MC_CLASS_C_SESSION_CID: u8 = 0x04;
const MC_CLASS_B_SESSION_CID: u8 = 0x05;

/// A multicast-setup command, CID plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    McGroupSetupReq(McGroupSetupReqPayload),
    McGroupSetupAns(McGroupSetupAnsPayload),
    McGroupDeleteReq(McGroupDeleteReqPayload),
    McGroupDeleteAns(McGroupDeleteAnsPayload),
    McClassBSessionReq(McClassBSessionReqPayload),
    McClassBSessionAns(McClassBSessionAnsPayload),
    McClassCSessionReq(McClassCSessionReqPayload),
    McClassCSessionAns(McClassCSessionAnsPayload),
}

impl Command {
    pub fn cid(&self) -> u8 {
        match self {
            Command::McGroupSetupReq(_) | Command::McGroupSetupAns(_) => MC_GROUP_SETUP_CID,
            Command::McGroupDeleteReq(_) | Command::McGroupDeleteAns(_) => MC_GROUP_DELETE_CID,
            Command::McClassCSessionReq(_) | Command::McClassCSessionAns(_) => {
                MC_CLASS_C_SESSION_CID
            }
            Command::McClassBSessionReq(_) | Command::McClassBSessionAns(_) => {
                MC_CLASS_B_SESSION_CID
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommandError> {
        let mut b = vec![self.cid()];
        match self {
            Command::McGroupSetupReq(pl) => pl.encode(&mut b)?,
            Command::McGroupSetupAns(pl) => pl.encode(&mut b),
            Command::McGroupDeleteReq(pl) => pl.encode(&mut b)?,
            Command::McGroupDeleteAns(pl) => pl.encode(&mut b),
            Command::McClassBSessionReq(pl) => pl.encode(&mut b)?,
            Command::McClassBSessionAns(pl) => pl.encode(&mut b),
            Command::McClassCSessionReq(pl) => pl.encode(&mut b)?,
            Command::McClassCSessionAns(pl) => pl.encode(&mut b),
        }
        Ok(b)
    }

    /// Decodes a command. `uplink` selects between the request and answer
    /// form of the shared CID.
    pub fn from_bytes(uplink: bool, b: &[u8]) -> Result<Self, CommandError> {
        let (&cid, rest) = b.split_first().ok_or(CommandError::InvalidLength)?;
        match (cid, uplink) {
            (MC_GROUP_SETUP_CID, false) => {
                Ok(Command::McGroupSetupReq(McGroupSetupReqPayload::decode(rest)?))
            }
            (MC_GROUP_SETUP_CID, true) => {
                Ok(Command::McGroupSetupAns(McGroupSetupAnsPayload::decode(rest)?))
            }
            (MC_GROUP_DELETE_CID, false) => Ok(Command::McGroupDeleteReq(
                McGroupDeleteReqPayload::decode(rest)?,
            )),
            (MC_GROUP_DELETE_CID, true) => Ok(Command::McGroupDeleteAns(
                McGroupDeleteAnsPayload::decode(rest)?,
            )),
            (MC_CLASS_B_SESSION_CID, false) => Ok(Command::McClassBSessionReq(
                McClassBSessionReqPayload::decode(rest)?,
            )),
            (MC_CLASS_B_SESSION_CID, true) => Ok(Command::McClassBSessionAns(
                McClassBSessionAnsPayload::decode(rest)?,
            )),
            (MC_CLASS_C_SESSION_CID, false) => Ok(Command::McClassCSessionReq(
                McClassCSessionReqPayload::decode(rest)?,
            )),
            (MC_CLASS_C_SESSION_CID, true) => Ok(Command::McClassCSessionAns(
                McClassCSessionAnsPayload::decode(rest)?,
            )),
            _ => Err(CommandError::UnknownCid(cid)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McGroupSetupReqPayload {
    /// Multicast group id, 0..=3.
    pub mc_group_id: u8,
    pub mc_addr: DevAddr,
    pub mc_key_encrypted: Aes128Key,
    pub min_mc_f_cnt: u32,
    pub max_mc_f_cnt: u32,
}

impl McGroupSetupReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.mc_group_id > 3 {
            return Err(CommandError::OutOfRange("mc_group_id"));
        }
        b.push(self.mc_group_id);
        b.extend_from_slice(&self.mc_addr.to_le_bytes());
        b.extend_from_slice(self.mc_key_encrypted.as_bytes());
        b.extend_from_slice(&self.min_mc_f_cnt.to_le_bytes());
        b.extend_from_slice(&self.max_mc_f_cnt.to_le_bytes());
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 29 {
            return Err(CommandError::InvalidLength);
        }
        let mut mc_key_encrypted = [0u8; 16];
        mc_key_encrypted.copy_from_slice(&b[5..21]);
        Ok(Self {
            mc_group_id: b[0] & 0x03,
            mc_addr: DevAddr::from_le_bytes([b[1], b[2], b[3], b[4]]),
            mc_key_encrypted: Aes128Key(mc_key_encrypted),
            min_mc_f_cnt: u32::from_le_bytes([b[21], b[22], b[23], b[24]]),
            max_mc_f_cnt: u32::from_le_bytes([b[25], b[26], b[27], b[28]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McGroupSetupAnsPayload {
    pub mc_group_id: u8,
    /// Set when the device rejects the requested group id.
    pub id_error: bool,
}

impl McGroupSetupAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) {
        let mut v = self.mc_group_id & 0x03;
        if self.id_error {
            v |= 0x04;
        }
        b.push(v);
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            mc_group_id: b[0] & 0x03,
            id_error: b[0] & 0x04 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McGroupDeleteReqPayload {
    pub mc_group_id: u8,
}

impl McGroupDeleteReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.mc_group_id > 3 {
            return Err(CommandError::OutOfRange("mc_group_id"));
        }
        b.push(self.mc_group_id);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            mc_group_id: b[0] & 0x03,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McGroupDeleteAnsPayload {
    pub mc_group_id: u8,
    pub mc_group_undefined: bool,
}

impl McGroupDeleteAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) {
        let mut v = self.mc_group_id & 0x03;
        if self.mc_group_undefined {
            v |= 0x04;
        }
        b.push(v);
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            mc_group_id: b[0] & 0x03,
            mc_group_undefined: b[0] & 0x04 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McClassBSessionReqPayload {
    pub mc_group_id: u8,
    /// GPS-epoch seconds modulo 2^32 at which the session opens.
    pub session_time: u32,
    /// Ping-slot periodicity, 0..=7.
    pub periodicity: u8,
    /// Session timeout exponent, 0..=15; the window lasts 2^timeout seconds.
    pub time_out: u8,
    /// Downlink frequency in Hz, multiple of 100, < 2^24 * 100.
    pub dl_frequency: u32,
    pub dr: u8,
}

impl McClassBSessionReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.mc_group_id > 3 {
            return Err(CommandError::OutOfRange("mc_group_id"));
        }
        if self.periodicity > 7 {
            return Err(CommandError::OutOfRange("periodicity"));
        }
        if self.time_out > 15 {
            return Err(CommandError::OutOfRange("time_out"));
        }
        b.push(self.mc_group_id);
        b.extend_from_slice(&self.session_time.to_le_bytes());
        b.push((self.time_out & 0x0f) | ((self.periodicity & 0x07) << 4));
        encode_frequency(self.dl_frequency, b)?;
        b.push(self.dr);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 10 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            mc_group_id: b[0] & 0x03,
            session_time: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
            time_out: b[5] & 0x0f,
            periodicity: (b[5] >> 4) & 0x07,
            dl_frequency: decode_frequency([b[6], b[7], b[8]]),
            dr: b[9],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McClassBSessionAnsPayload {
    pub mc_group_id: u8,
    pub dr_error: bool,
    pub freq_error: bool,
    pub mc_group_undefined: bool,
    /// Seconds until the session opens; present only when no error bit is set.
    pub time_to_start: Option<u32>,
}

impl McClassBSessionAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) {
        encode_session_ans(
            self.mc_group_id,
            self.dr_error,
            self.freq_error,
            self.mc_group_undefined,
            self.time_to_start,
            b,
        );
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        let (mc_group_id, dr_error, freq_error, mc_group_undefined, time_to_start) =
            decode_session_ans(b)?;
        Ok(Self {
            mc_group_id,
            dr_error,
            freq_error,
            mc_group_undefined,
            time_to_start,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McClassCSessionReqPayload {
    pub mc_group_id: u8,
    /// GPS-epoch seconds modulo 2^32 at which the session opens.
    pub session_time: u32,
    /// Session timeout exponent, 0..=15.
    pub session_time_out: u8,
    pub dl_frequency: u32,
    pub dr: u8,
}

impl McClassCSessionReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.mc_group_id > 3 {
            return Err(CommandError::OutOfRange("mc_group_id"));
        }
        if self.session_time_out > 15 {
            return Err(CommandError::OutOfRange("session_time_out"));
        }
        b.push(self.mc_group_id);
        b.extend_from_slice(&self.session_time.to_le_bytes());
        b.push(self.session_time_out & 0x0f);
        encode_frequency(self.dl_frequency, b)?;
        b.push(self.dr);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 10 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            mc_group_id: b[0] & 0x03,
            session_time: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
            session_time_out: b[5] & 0x0f,
            dl_frequency: decode_frequency([b[6], b[7], b[8]]),
            dr: b[9],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McClassCSessionAnsPayload {
    pub mc_group_id: u8,
    pub dr_error: bool,
    pub freq_error: bool,
    pub mc_group_undefined: bool,
    pub time_to_start: Option<u32>,
}

impl McClassCSessionAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) {
        encode_session_ans(
            self.mc_group_id,
            self.dr_error,
            self.freq_error,
            self.mc_group_undefined,
            self.time_to_start,
            b,
        );
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        let (mc_group_id, dr_error, freq_error, mc_group_undefined, time_to_start) =
            decode_session_ans(b)?;
        Ok(Self {
            mc_group_id,
            dr_error,
            freq_error,
            mc_group_undefined,
            time_to_start,
        })
    }
}

// Frequency travels as a 24-bit little-endian value in units of 100 Hz.
fn encode_frequency(freq: u32, b: &mut Vec<u8>) -> Result<(), CommandError> {
    let units = freq / 100;
    if units >= 1 << 24 {
        return Err(CommandError::OutOfRange("dl_frequency"));
    }
    let le = units.to_le_bytes();
    b.extend_from_slice(&le[..3]);
    Ok(())
}

fn decode_frequency(b: [u8; 3]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], 0]) * 100
}

fn encode_session_ans(
    mc_group_id: u8,
    dr_error: bool,
    freq_error: bool,
    mc_group_undefined: bool,
    time_to_start: Option<u32>,
    b: &mut Vec<u8>,
) {
    let mut v = mc_group_id & 0x03;
    if dr_error {
        v |= 0x04;
    }
    if freq_error {
        v |= 0x08;
    }
    if mc_group_undefined {
        v |= 0x10;
    }
    b.push(v);
    if let Some(tts) = time_to_start {
        b.extend_from_slice(&tts.to_le_bytes()[..3]);
    }
}

type SessionAns = (u8, bool, bool, bool, Option<u32>);

fn decode_session_ans(b: &[u8]) -> Result<SessionAns, CommandError> {
    if b.len() != 1 && b.len() != 4 {
        return Err(CommandError::InvalidLength);
    }
    let time_to_start = if b.len() == 4 {
        Some(u32::from_le_bytes([b[1], b[2], b[3], 0]))
    } else {
        None
    };
    Ok((
        b[0] & 0x03,
        b[0] & 0x04 != 0,
        b[0] & 0x08 != 0,
        b[0] & 0x10 != 0,
        time_to_start,
    ))
}

/// McRootKey = aes128_encrypt(GenAppKey, 0x00^16), LoRaWAN 1.0.x devices.
pub fn get_mc_root_key_for_gen_app_key(gen_app_key: Aes128Key) -> Aes128Key {
    aes_encrypt(gen_app_key, [0u8; 16])
}

/// McRootKey = aes128_encrypt(AppKey, 0x20 | 0x00^15), LoRaWAN 1.1 devices.
pub fn get_mc_root_key_for_app_key(app_key: Aes128Key) -> Aes128Key {
    let mut block = [0u8; 16];
    block[0] = 0x20;
    aes_encrypt(app_key, block)
}

/// McKEKey = aes128_encrypt(McRootKey, 0x00^16).
pub fn get_mc_ke_key(mc_root_key: Aes128Key) -> Aes128Key {
    aes_encrypt(mc_root_key, [0u8; 16])
}

/// McAppSKey = aes128_encrypt(McKey, 0x01 | McAddr | pad16).
pub fn get_mc_app_s_key(mc_key: Aes128Key, mc_addr: DevAddr) -> Aes128Key {
    aes_encrypt(mc_key, session_key_block(0x01, mc_addr))
}

/// McNetSKey = aes128_encrypt(McKey, 0x02 | McAddr | pad16).
pub fn get_mc_net_s_key(mc_key: Aes128Key, mc_addr: DevAddr) -> Aes128Key {
    aes_encrypt(mc_key, session_key_block(0x02, mc_addr))
}

/// McKeyEncrypted = aes128_encrypt(McKEKey, McKey).
///
/// The device holds the same McKEKey and recovers McKey with a single block
/// decrypt.
pub fn encrypt_mc_key(mc_ke_key: Aes128Key, mc_key: Aes128Key) -> Aes128Key {
    aes_encrypt(mc_ke_key, mc_key.0)
}

/// Device-side inverse of [`encrypt_mc_key`].
pub fn decrypt_mc_key(mc_ke_key: Aes128Key, mc_key_encrypted: Aes128Key) -> Aes128Key {
    let cipher = Aes128::new(GenericArray::from_slice(mc_ke_key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(mc_key_encrypted.as_bytes());
    cipher.decrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    Aes128Key(out)
}

fn session_key_block(prefix: u8, mc_addr: DevAddr) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = prefix;
    b[1..5].copy_from_slice(&mc_addr.to_le_bytes());
    b
}

fn aes_encrypt(key: Aes128Key, plain: [u8; 16]) -> Aes128Key {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(&plain);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    Aes128Key(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mc_group_setup_req_round_trip() {
        let cmd = Command::McGroupSetupReq(McGroupSetupReqPayload {
            mc_group_id: 1,
            mc_addr: "01020304".parse().unwrap(),
            mc_key_encrypted: Aes128Key([9; 16]),
            min_mc_f_cnt: 0,
            max_mc_f_cnt: u32::MAX,
        });

        let b = cmd.to_bytes().unwrap();
        assert_eq!(b.len(), 30);
        assert_eq!(b[0], 0x02);
        assert_eq!(b[1], 0x01);
        // McAddr is little-endian on the wire.
        assert_eq!(&b[2..6], &[4, 3, 2, 1]);
        assert_eq!(&b[22..26], &[0, 0, 0, 0]);
        assert_eq!(&b[26..30], &[0xff, 0xff, 0xff, 0xff]);

        assert_eq!(Command::from_bytes(false, &b).unwrap(), cmd);
    }

    #[test]
    fn mc_group_setup_ans_flags() {
        let cmd = Command::from_bytes(true, &[0x02, 0x06]).unwrap();
        assert_eq!(
            cmd,
            Command::McGroupSetupAns(McGroupSetupAnsPayload {
                mc_group_id: 2,
                id_error: true,
            })
        );
    }

    #[test]
    fn class_c_session_req_round_trip() {
        let cmd = Command::McClassCSessionReq(McClassCSessionReqPayload {
            mc_group_id: 0,
            session_time: 0x01020304,
            session_time_out: 6,
            dl_frequency: 869_525_000,
            dr: 5,
        });

        let b = cmd.to_bytes().unwrap();
        assert_eq!(b.len(), 11);
        assert_eq!(b[0], 0x04);
        assert_eq!(&b[2..6], &[4, 3, 2, 1]);
        assert_eq!(b[6], 6);

        assert_eq!(Command::from_bytes(false, &b).unwrap(), cmd);
    }

    #[test]
    fn class_b_session_req_round_trip() {
        let cmd = Command::McClassBSessionReq(McClassBSessionReqPayload {
            mc_group_id: 3,
            session_time: 1234,
            periodicity: 7,
            time_out: 12,
            dl_frequency: 868_100_000,
            dr: 3,
        });

        let b = cmd.to_bytes().unwrap();
        assert_eq!(b.len(), 11);
        assert_eq!(b[6], 0x0c | (7 << 4));
        assert_eq!(Command::from_bytes(false, &b).unwrap(), cmd);
    }

    #[test]
    fn session_ans_with_and_without_time_to_start() {
        let ok = Command::McClassCSessionAns(McClassCSessionAnsPayload {
            mc_group_id: 1,
            dr_error: false,
            freq_error: false,
            mc_group_undefined: false,
            time_to_start: Some(300),
        });
        let b = ok.to_bytes().unwrap();
        assert_eq!(b.len(), 5);
        assert_eq!(Command::from_bytes(true, &b).unwrap(), ok);

        let err = Command::McClassCSessionAns(McClassCSessionAnsPayload {
            mc_group_id: 1,
            dr_error: true,
            freq_error: true,
            mc_group_undefined: false,
            time_to_start: None,
        });
        let b = err.to_bytes().unwrap();
        assert_eq!(b, vec![0x04, 0x01 | 0x04 | 0x08]);
        assert_eq!(Command::from_bytes(true, &b).unwrap(), err);
    }

    #[test]
    fn frequency_out_of_range() {
        let cmd = Command::McClassCSessionReq(McClassCSessionReqPayload {
            mc_group_id: 0,
            session_time: 0,
            session_time_out: 0,
            dl_frequency: u32::MAX,
            dr: 0,
        });
        assert_eq!(
            cmd.to_bytes(),
            Err(CommandError::OutOfRange("dl_frequency"))
        );
    }

    #[test]
    fn unknown_cid() {
        assert_eq!(
            Command::from_bytes(true, &[0x7f, 0x00]),
            Err(CommandError::UnknownCid(0x7f))
        );
    }

    #[test]
    fn mc_key_encryption_round_trip() {
        let mc_root_key = Aes128Key([
            0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ]);
        let mc_key = Aes128Key([0x42; 16]);

        let mc_ke_key = get_mc_ke_key(mc_root_key);
        assert_ne!(mc_ke_key, mc_root_key);

        let encrypted = encrypt_mc_key(mc_ke_key, mc_key);
        assert_ne!(encrypted, mc_key);
        assert_eq!(decrypt_mc_key(mc_ke_key, encrypted), mc_key);
    }

    #[test]
    fn mc_root_key_derivations_differ_per_key_type() {
        let key = Aes128Key([0x11; 16]);
        assert_ne!(
            get_mc_root_key_for_gen_app_key(key),
            get_mc_root_key_for_app_key(key)
        );
    }

    #[test]
    fn session_keys_are_distinct_and_deterministic() {
        let mc_key = Aes128Key([0x01; 16]);
        let mc_addr: DevAddr = "01020304".parse().unwrap();

        let app = get_mc_app_s_key(mc_key, mc_addr);
        let net = get_mc_net_s_key(mc_key, mc_addr);

        assert_ne!(app, net);
        assert_eq!(app, get_mc_app_s_key(mc_key, mc_addr));

        let other_addr: DevAddr = "04030201".parse().unwrap();
        assert_ne!(app, get_mc_app_s_key(mc_key, other_addr));
    }
}
