//! Fragmented Data Block Transport (TS004) commands and the
//! forward-error-correction fragment codec.
//!
//! Commands are exchanged on FPort 201. The parity scheme is the low-density
//! code from the TS004 recommendation: parity row `i` XORs the data fragments
//! selected by a pseudo-random matrix line seeded with `1 + 1001 * i`.

use thiserror::Error;

use crate::CommandError;

/// FPort reserved for fragmentation by TS004.
pub const DEFAULT_FPORT: u8 = 201;

const FRAG_SESSION_STATUS_CID: u8 = 0x01;
const FRAG_SESSION_SETUP_CID: u8 = 0x02;
const FRAG_SESSION_DELETE_CID: u8 = 0x03;
const DATA_FRAGMENT_CID: u8 = 0x08;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentationError {
    #[error("payload must not be empty")]
    EmptyPayload,

    #[error("fragment size must be at least 1")]
    ZeroFragSize,

    #[error("payload length must be a multiple of the fragment size")]
    UnalignedPayload,

    #[error("{got} fragments received, at least {required} required")]
    InsufficientFragments { required: usize, got: usize },

    #[error("received fragments are linearly dependent")]
    DependentFragments,

    #[error("fragment {index} has length {got}, expected {expected}")]
    FragmentLength {
        index: usize,
        got: usize,
        expected: usize,
    },

    #[error("fragment indices are 1-based; 0 is not valid")]
    ZeroFragmentIndex,
}

/// Encodes a padded payload into data fragments followed by `redundancy`
/// parity fragments.
///
/// The payload length must already be a multiple of `frag_size`; the caller
/// appends `(frag_size - len % frag_size) % frag_size` zero bytes beforehand
/// and transmits that count in the fragmentation session setup.
pub fn encode(
    payload: &[u8],
    frag_size: usize,
    redundancy: usize,
) -> Result<Vec<Vec<u8>>, FragmentationError> {
    if payload.is_empty() {
        return Err(FragmentationError::EmptyPayload);
    }
    if frag_size == 0 {
        return Err(FragmentationError::ZeroFragSize);
    }
    if payload.len() % frag_size != 0 {
        return Err(FragmentationError::UnalignedPayload);
    }

    let nb_frag = payload.len() / frag_size;
    let mut fragments: Vec<Vec<u8>> = payload.chunks(frag_size).map(|c| c.to_vec()).collect();

    for i in 0..redundancy {
        let line = matrix_line(i + 1, nb_frag);
        let mut parity = vec![0u8; frag_size];
        for (m, selected) in line.iter().enumerate() {
            if *selected {
                for (p, d) in parity.iter_mut().zip(&fragments[m]) {
                    *p ^= d;
                }
            }
        }
        fragments.push(parity);
    }

    Ok(fragments)
}

/// Reconstructs the original payload from any `nb_frag` linearly independent
/// fragments out of the `nb_frag + redundancy` produced by [`encode`].
///
/// `fragments` carries `(wire index, bytes)` pairs where the wire index is
/// the 1-based `N` of the `DataFragment` command. `padding` trailing zero
/// bytes are stripped from the result.
pub fn decode(
    fragments: &[(usize, Vec<u8>)],
    nb_frag: usize,
    frag_size: usize,
    padding: usize,
) -> Result<Vec<u8>, FragmentationError> {
    if fragments.len() < nb_frag {
        return Err(FragmentationError::InsufficientFragments {
            required: nb_frag,
            got: fragments.len(),
        });
    }

    // Each received fragment is one GF(2) equation over the data fragments.
    let mut rows: Vec<Vec<bool>> = Vec::with_capacity(fragments.len());
    let mut data: Vec<Vec<u8>> = Vec::with_capacity(fragments.len());

    for (index, bytes) in fragments {
        if *index == 0 {
            return Err(FragmentationError::ZeroFragmentIndex);
        }
        if bytes.len() != frag_size {
            return Err(FragmentationError::FragmentLength {
                index: *index,
                got: bytes.len(),
                expected: frag_size,
            });
        }

        let row = if *index <= nb_frag {
            let mut unit = vec![false; nb_frag];
            unit[*index - 1] = true;
            unit
        } else {
            matrix_line(*index - nb_frag, nb_frag)
        };

        rows.push(row);
        data.push(bytes.clone());
    }

    // Gauss-Jordan elimination; after the loop rows 0..nb_frag are the
    // identity and data 0..nb_frag are the payload chunks in order.
    for col in 0..nb_frag {
        let pivot = (col..rows.len())
            .find(|&r| rows[r][col])
            .ok_or(FragmentationError::DependentFragments)?;
        rows.swap(col, pivot);
        data.swap(col, pivot);

        let pivot_row = rows[col].clone();
        let pivot_data = data[col].clone();
        for r in 0..rows.len() {
            if r != col && rows[r][col] {
                for (a, b) in rows[r].iter_mut().zip(&pivot_row) {
                    *a ^= b;
                }
                for (a, b) in data[r].iter_mut().zip(&pivot_data) {
                    *a ^= b;
                }
            }
        }
    }

    let mut payload = Vec::with_capacity(nb_frag * frag_size);
    for chunk in data.iter().take(nb_frag) {
        payload.extend_from_slice(chunk);
    }
    payload.truncate(payload.len().saturating_sub(padding));
    Ok(payload)
}

// 23-bit PRBS used by the parity-matrix generator.
fn prbs23(x: u32) -> u32 {
    let b0 = x & 1;
    let b1 = (x >> 5) & 1;
    (x >> 1) | ((b0 ^ b1) << 22)
}

// Line `n` (1-based) of the parity matrix over `m` data fragments.
fn matrix_line(n: usize, m: usize) -> Vec<bool> {
    let mut line = vec![false; m];
    let mm = if m.is_power_of_two() { 1 } else { 0 };

    let mut x = (1 + 1001 * n) as u32;
    let mut nb_coeff = 0;
    while nb_coeff < m / 2 {
        let mut r = 1 << 16;
        while r >= m {
            x = prbs23(x);
            r = x as usize % (m + mm);
        }
        line[r] = true;
        nb_coeff += 1;
    }

    line
}

/// A fragmentation command, CID plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FragSessionSetupReq(FragSessionSetupReqPayload),
    FragSessionSetupAns(FragSessionSetupAnsPayload),
    FragSessionDeleteReq(FragSessionDeleteReqPayload),
    FragSessionDeleteAns(FragSessionDeleteAnsPayload),
    FragSessionStatusReq(FragSessionStatusReqPayload),
    FragSessionStatusAns(FragSessionStatusAnsPayload),
    DataFragment(DataFragmentPayload),
}

impl Command {
    pub fn cid(&self) -> u8 {
        match self {
            Command::FragSessionStatusReq(_) | Command::FragSessionStatusAns(_) => {
                FRAG_SESSION_STATUS_CID
            }
            Command::FragSessionSetupReq(_) | Command::FragSessionSetupAns(_) => {
                FRAG_SESSION_SETUP_CID
            }
            Command::FragSessionDeleteReq(_) | Command::FragSessionDeleteAns(_) => {
                FRAG_SESSION_DELETE_CID
            }
            Command::DataFragment(_) => DATA_FRAGMENT_CID,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommandError> {
        let mut b = vec![self.cid()];
        match self {
            Command::FragSessionSetupReq(pl) => pl.encode(&mut b)?,
            Command::FragSessionSetupAns(pl) => pl.encode(&mut b)?,
            Command::FragSessionDeleteReq(pl) => pl.encode(&mut b)?,
            Command::FragSessionDeleteAns(pl) => pl.encode(&mut b)?,
            Command::FragSessionStatusReq(pl) => pl.encode(&mut b)?,
            Command::FragSessionStatusAns(pl) => pl.encode(&mut b)?,
            Command::DataFragment(pl) => pl.encode(&mut b)?,
        }
        Ok(b)
    }

    pub fn from_bytes(uplink: bool, b: &[u8]) -> Result<Self, CommandError> {
        let (&cid, rest) = b.split_first().ok_or(CommandError::InvalidLength)?;
        match (cid, uplink) {
            (FRAG_SESSION_SETUP_CID, false) => Ok(Command::FragSessionSetupReq(
                FragSessionSetupReqPayload::decode(rest)?,
            )),
            (FRAG_SESSION_SETUP_CID, true) => Ok(Command::FragSessionSetupAns(
                FragSessionSetupAnsPayload::decode(rest)?,
            )),
            (FRAG_SESSION_DELETE_CID, false) => Ok(Command::FragSessionDeleteReq(
                FragSessionDeleteReqPayload::decode(rest)?,
            )),
            (FRAG_SESSION_DELETE_CID, true) => Ok(Command::FragSessionDeleteAns(
                FragSessionDeleteAnsPayload::decode(rest)?,
            )),
            (FRAG_SESSION_STATUS_CID, false) => Ok(Command::FragSessionStatusReq(
                FragSessionStatusReqPayload::decode(rest)?,
            )),
            (FRAG_SESSION_STATUS_CID, true) => Ok(Command::FragSessionStatusAns(
                FragSessionStatusAnsPayload::decode(rest)?,
            )),
            (DATA_FRAGMENT_CID, false) => {
                Ok(Command::DataFragment(DataFragmentPayload::decode(rest)?))
            }
            _ => Err(CommandError::UnknownCid(cid)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragSessionSetupReqPayload {
    /// Fragmentation session index, 0..=3.
    pub frag_index: u8,
    /// One bit per multicast group id 0..=3.
    pub mc_group_bit_mask: [bool; 4],
    pub nb_frag: u16,
    pub frag_size: u8,
    /// Fragmentation matrix selector, 0..=7.
    pub fragmentation_matrix: u8,
    /// Block-ack delay code, 0..=7.
    pub block_ack_delay: u8,
    /// Number of zero bytes appended to the payload before encoding.
    pub padding: u8,
    /// Opaque application descriptor.
    pub descriptor: [u8; 4],
}

impl FragSessionSetupReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        if self.fragmentation_matrix > 7 {
            return Err(CommandError::OutOfRange("fragmentation_matrix"));
        }
        if self.block_ack_delay > 7 {
            return Err(CommandError::OutOfRange("block_ack_delay"));
        }
        let mut session = self.frag_index << 4;
        for (i, set) in self.mc_group_bit_mask.iter().enumerate() {
            if *set {
                session |= 1 << i;
            }
        }
        b.push(session);
        b.extend_from_slice(&self.nb_frag.to_le_bytes());
        b.push(self.frag_size);
        b.push((self.block_ack_delay & 0x07) | ((self.fragmentation_matrix & 0x07) << 3));
        b.push(self.padding);
        b.extend_from_slice(&self.descriptor);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 10 {
            return Err(CommandError::InvalidLength);
        }
        let mut mask = [false; 4];
        for (i, set) in mask.iter_mut().enumerate() {
            *set = b[0] & (1 << i) != 0;
        }
        Ok(Self {
            frag_index: (b[0] >> 4) & 0x03,
            mc_group_bit_mask: mask,
            nb_frag: u16::from_le_bytes([b[1], b[2]]),
            frag_size: b[3],
            block_ack_delay: b[4] & 0x07,
            fragmentation_matrix: (b[4] >> 3) & 0x07,
            padding: b[5],
            descriptor: [b[6], b[7], b[8], b[9]],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionSetupAnsPayload {
    pub frag_index: u8,
    pub wrong_descriptor: bool,
    pub frag_session_index_not_supported: bool,
    pub not_enough_memory: bool,
    pub encoding_unsupported: bool,
}

impl FragSessionSetupAnsPayload {
    /// True when the device accepted the session setup.
    pub fn is_ok(&self) -> bool {
        !self.wrong_descriptor
            && !self.frag_session_index_not_supported
            && !self.not_enough_memory
            && !self.encoding_unsupported
    }

    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        let mut v = self.frag_index << 6;
        if self.encoding_unsupported {
            v |= 0x01;
        }
        if self.not_enough_memory {
            v |= 0x02;
        }
        if self.frag_session_index_not_supported {
            v |= 0x04;
        }
        if self.wrong_descriptor {
            v |= 0x08;
        }
        b.push(v);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            frag_index: (b[0] >> 6) & 0x03,
            encoding_unsupported: b[0] & 0x01 != 0,
            not_enough_memory: b[0] & 0x02 != 0,
            frag_session_index_not_supported: b[0] & 0x04 != 0,
            wrong_descriptor: b[0] & 0x08 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionDeleteReqPayload {
    pub frag_index: u8,
}

impl FragSessionDeleteReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        b.push(self.frag_index);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            frag_index: b[0] & 0x03,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionDeleteAnsPayload {
    pub frag_index: u8,
    pub session_does_not_exist: bool,
}

impl FragSessionDeleteAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        let mut v = self.frag_index & 0x03;
        if self.session_does_not_exist {
            v |= 0x04;
        }
        b.push(v);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            frag_index: b[0] & 0x03,
            session_does_not_exist: b[0] & 0x04 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionStatusReqPayload {
    pub frag_index: u8,
    /// When set, all devices of the session answer, not only the ones with
    /// missing fragments.
    pub participants: bool,
}

impl FragSessionStatusReqPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        let mut v = (self.frag_index & 0x03) << 1;
        if self.participants {
            v |= 0x01;
        }
        b.push(v);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 1 {
            return Err(CommandError::InvalidLength);
        }
        Ok(Self {
            participants: b[0] & 0x01 != 0,
            frag_index: (b[0] >> 1) & 0x03,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionStatusAnsPayload {
    pub frag_index: u8,
    pub nb_frag_received: u16,
    pub missing_frag: u8,
    pub not_enough_matrix_memory: bool,
}

impl FragSessionStatusAnsPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        if self.nb_frag_received >= 1 << 14 {
            return Err(CommandError::OutOfRange("nb_frag_received"));
        }
        let received_and_index = self.nb_frag_received | ((self.frag_index as u16) << 14);
        b.extend_from_slice(&received_and_index.to_le_bytes());
        b.push(self.missing_frag);
        b.push(if self.not_enough_matrix_memory { 1 } else { 0 });
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() != 4 {
            return Err(CommandError::InvalidLength);
        }
        let received_and_index = u16::from_le_bytes([b[0], b[1]]);
        Ok(Self {
            nb_frag_received: received_and_index & 0x3fff,
            frag_index: (received_and_index >> 14) as u8,
            missing_frag: b[2],
            not_enough_matrix_memory: b[3] & 0x01 != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragmentPayload {
    pub frag_index: u8,
    /// 1-based fragment number, data fragments first, then parity.
    pub n: u16,
    pub payload: Vec<u8>,
}

impl DataFragmentPayload {
    fn encode(&self, b: &mut Vec<u8>) -> Result<(), CommandError> {
        if self.frag_index > 3 {
            return Err(CommandError::OutOfRange("frag_index"));
        }
        if self.n >= 1 << 14 {
            return Err(CommandError::OutOfRange("n"));
        }
        let index_and_n = self.n | ((self.frag_index as u16) << 14);
        b.extend_from_slice(&index_and_n.to_le_bytes());
        b.extend_from_slice(&self.payload);
        Ok(())
    }

    fn decode(b: &[u8]) -> Result<Self, CommandError> {
        if b.len() < 2 {
            return Err(CommandError::InvalidLength);
        }
        let index_and_n = u16::from_le_bytes([b[0], b[1]]);
        Ok(Self {
            n: index_and_n & 0x3fff,
            frag_index: (index_and_n >> 14) as u8,
            payload: b[2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_aligned_payload() {
        let payload: Vec<u8> = (0..100u8).collect();
        let fragments = encode(&payload, 50, 0).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], payload[..50]);
        assert_eq!(fragments[1], payload[50..]);
    }

    #[test]
    fn encode_rejects_unaligned_payload() {
        assert_eq!(
            encode(&[0u8; 99], 50, 0),
            Err(FragmentationError::UnalignedPayload)
        );
    }

    #[test]
    fn encode_parity_count() {
        let payload = vec![0xabu8; 1000];
        let fragments = encode(&payload, 50, 1).unwrap();
        assert_eq!(fragments.len(), 21);
        assert!(fragments.iter().all(|f| f.len() == 50));
    }

    #[test]
    fn decode_from_data_fragments_only() {
        let payload: Vec<u8> = (0..200u8).collect();
        let fragments = encode(&payload, 50, 2).unwrap();
        let received: Vec<(usize, Vec<u8>)> = fragments
            .iter()
            .take(4)
            .enumerate()
            .map(|(i, f)| (i + 1, f.clone()))
            .collect();
        assert_eq!(decode(&received, 4, 50, 0).unwrap(), payload);
    }

    #[test]
    fn decode_recovers_single_lost_fragment() {
        // 200-byte payload, 4 data + 2 parity fragments; the first data
        // fragment is lost and recovered through parity line 1 ({0, 2}).
        let payload: Vec<u8> = (0..200u8).collect();
        let fragments = encode(&payload, 50, 2).unwrap();
        assert_eq!(fragments.len(), 6);

        let received: Vec<(usize, Vec<u8>)> = [1usize, 2, 3, 4]
            .iter()
            .map(|&i| (i + 1, fragments[i].clone()))
            .collect();

        assert_eq!(decode(&received, 4, 50, 0).unwrap(), payload);
    }

    #[test]
    fn decode_recovers_two_lost_fragments() {
        // 1000-byte payload, 20 data + 2 parity fragments; data fragments 1
        // and 2 are lost. Parity lines 1 and 2 both select index 3 and
        // differ on 1 and 2, so the system has full rank.
        let payload: Vec<u8> = (0..1000usize).map(|i| i as u8).collect();
        let fragments = encode(&payload, 50, 2).unwrap();
        assert_eq!(fragments.len(), 22);

        let received: Vec<(usize, Vec<u8>)> = (0..22usize)
            .filter(|i| *i != 1 && *i != 2)
            .map(|i| (i + 1, fragments[i].clone()))
            .collect();

        assert_eq!(decode(&received, 20, 50, 0).unwrap(), payload);
    }

    #[test]
    fn decode_strips_padding() {
        let mut payload: Vec<u8> = (0..190u8).collect();
        let padding = 10;
        payload.extend(std::iter::repeat(0).take(padding));

        let fragments = encode(&payload, 50, 1).unwrap();
        let received: Vec<(usize, Vec<u8>)> = fragments
            .iter()
            .take(4)
            .enumerate()
            .map(|(i, f)| (i + 1, f.clone()))
            .collect();

        let decoded = decode(&received, 4, 50, padding).unwrap();
        assert_eq!(decoded.len(), 190);
        assert_eq!(decoded[..], payload[..190]);
    }

    #[test]
    fn decode_insufficient_fragments() {
        let payload: Vec<u8> = (0..200u8).collect();
        let fragments = encode(&payload, 50, 0).unwrap();
        let received: Vec<(usize, Vec<u8>)> = fragments
            .iter()
            .take(3)
            .enumerate()
            .map(|(i, f)| (i + 1, f.clone()))
            .collect();
        assert_eq!(
            decode(&received, 4, 50, 0),
            Err(FragmentationError::InsufficientFragments {
                required: 4,
                got: 3
            })
        );
    }

    #[test]
    fn decode_dependent_fragments() {
        let payload: Vec<u8> = (0..200u8).collect();
        let fragments = encode(&payload, 50, 0).unwrap();
        // The same fragment four times is not a solvable system.
        let received: Vec<(usize, Vec<u8>)> =
            (0..4).map(|_| (1, fragments[0].clone())).collect();
        assert_eq!(
            decode(&received, 4, 50, 0),
            Err(FragmentationError::DependentFragments)
        );
    }

    #[test]
    fn matrix_line_known_vectors() {
        // The generator places m/2 coefficients but may hit the same index
        // twice, so line 1 over 20 fragments has 7 distinct entries.
        let selected: Vec<usize> = matrix_line(1, 20)
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.then_some(i))
            .collect();
        assert_eq!(selected, vec![2, 3, 5, 11, 15, 16, 19]);

        let selected: Vec<usize> = matrix_line(2, 20)
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.then_some(i))
            .collect();
        assert_eq!(selected, vec![1, 3, 5, 9, 10, 11, 12, 14, 15, 19]);
    }

    #[test]
    fn frag_session_setup_req_round_trip() {
        let cmd = Command::FragSessionSetupReq(FragSessionSetupReqPayload {
            frag_index: 2,
            mc_group_bit_mask: [true, false, false, false],
            nb_frag: 20,
            frag_size: 50,
            fragmentation_matrix: 0,
            block_ack_delay: 1,
            padding: 0,
            descriptor: [1, 2, 3, 4],
        });

        let b = cmd.to_bytes().unwrap();
        assert_eq!(b.len(), 11);
        assert_eq!(b[0], 0x02);
        assert_eq!(b[1], 0x01 | (2 << 4));
        assert_eq!(&b[2..4], &[20, 0]);
        assert_eq!(b[4], 50);

        assert_eq!(Command::from_bytes(false, &b).unwrap(), cmd);
    }

    #[test]
    fn frag_session_setup_ans_flags() {
        let cmd = Command::from_bytes(true, &[0x02, 0x08 | (1 << 6)]).unwrap();
        let Command::FragSessionSetupAns(pl) = cmd else {
            panic!("expected FragSessionSetupAns");
        };
        assert_eq!(pl.frag_index, 1);
        assert!(pl.wrong_descriptor);
        assert!(!pl.not_enough_memory);
        assert!(!pl.is_ok());
    }

    #[test]
    fn data_fragment_round_trip() {
        let cmd = Command::DataFragment(DataFragmentPayload {
            frag_index: 1,
            n: 21,
            payload: vec![0xaa; 50],
        });
        let b = cmd.to_bytes().unwrap();
        assert_eq!(b.len(), 53);
        assert_eq!(b[0], 0x08);
        assert_eq!(u16::from_le_bytes([b[1], b[2]]), 21 | (1 << 14));
        assert_eq!(Command::from_bytes(false, &b).unwrap(), cmd);
    }

    #[test]
    fn frag_session_status_round_trip() {
        let req = Command::FragSessionStatusReq(FragSessionStatusReqPayload {
            frag_index: 3,
            participants: true,
        });
        let b = req.to_bytes().unwrap();
        assert_eq!(b, vec![0x01, 0x01 | (3 << 1)]);
        assert_eq!(Command::from_bytes(false, &b).unwrap(), req);

        let ans = Command::FragSessionStatusAns(FragSessionStatusAnsPayload {
            frag_index: 1,
            nb_frag_received: 20,
            missing_frag: 0,
            not_enough_matrix_memory: false,
        });
        let b = ans.to_bytes().unwrap();
        assert_eq!(b.len(), 5);
        assert_eq!(Command::from_bytes(true, &b).unwrap(), ans);
    }

    #[test]
    fn frag_session_delete_round_trip() {
        let req = Command::FragSessionDeleteReq(FragSessionDeleteReqPayload { frag_index: 0 });
        let b = req.to_bytes().unwrap();
        assert_eq!(b, vec![0x03, 0x00]);
        assert_eq!(Command::from_bytes(false, &b).unwrap(), req);

        let ans = Command::FragSessionDeleteAns(FragSessionDeleteAnsPayload {
            frag_index: 0,
            session_does_not_exist: true,
        });
        let b = ans.to_bytes().unwrap();
        assert_eq!(b, vec![0x03, 0x04]);
        assert_eq!(Command::from_bytes(true, &b).unwrap(), ans);
    }
}
