//! TPM 2.0 behind a Command Response Buffer (CRB) interface, locality 0.
//!
//! # MMIO Layout (base 0xFED40000)
//!
//! | Offset | Register |
//! |--------|----------|
//! | 0x000 | LOC_STATE: established (0), assigned (1), active locality (4:2), valid (7) |
//! | 0x008 | LOC_CTRL: request (0), relinquish (1) |
//! | 0x00C | LOC_STS: granted (0) |
//! | 0x030 | INTF_ID (64-bit) |
//! | 0x040 | CTRL_REQ: cmdReady (0), goIdle (1) |
//! | 0x044 | CTRL_STS: error (0), idle (1) |
//! | 0x04C | CTRL_START: write 1 to execute, reads 1 until done |
//! | 0x058 | CTRL_CMD_SIZE, 0x05C/0x060 CTRL_CMD_LADDR/HADDR |
//! | 0x064 | CTRL_RSP_SIZE, 0x068 CTRL_RSP_ADDR (64-bit) |
//! | 0x080 | data buffer, shared by command and response |
//!
//! Commands and responses are big-endian TPM 2.0 structures. Every response
//! starts with the 10-byte header `tag:u16 size:u32 rc:u32`; failures carry
//! only the header.
//!
//! Only the SHA-256 PCR bank is allocated. Extending it hashes the old value
//! with the new digest; digests for other algorithms are ignored.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{deposit, extract, AccessWidth, Device, DeviceSnapshot, SnapshotError};

pub const TPM_BASE: u64 = 0xFED4_0000;
pub const TPM_SIZE: u64 = 0x1000;

pub const BUFFER_OFFSET: u64 = 0x80;
pub const BUFFER_SIZE: usize = 0x300;

pub const PCR_COUNT: usize = 24;
const DIGEST_SIZE: usize = 32;
const MAX_NV_SIZE: usize = 2048;
const MAX_NV_INDICES: usize = 32;
const MAX_TRANSIENT: usize = 3;
const TRANSIENT_FIRST: u32 = 0x8000_0000;

pub mod regs {
    pub const LOC_STATE: u64 = 0x00;
    pub const LOC_CTRL: u64 = 0x08;
    pub const LOC_STS: u64 = 0x0C;
    pub const INTF_ID_LO: u64 = 0x30;
    pub const INTF_ID_HI: u64 = 0x34;
    pub const CTRL_REQ: u64 = 0x40;
    pub const CTRL_STS: u64 = 0x44;
    pub const CTRL_CANCEL: u64 = 0x48;
    pub const CTRL_START: u64 = 0x4C;
    pub const CTRL_INT_ENABLE: u64 = 0x50;
    pub const CTRL_INT_STS: u64 = 0x54;
    pub const CTRL_CMD_SIZE: u64 = 0x58;
    pub const CTRL_CMD_LADDR: u64 = 0x5C;
    pub const CTRL_CMD_HADDR: u64 = 0x60;
    pub const CTRL_RSP_SIZE: u64 = 0x64;
    pub const CTRL_RSP_ADDR_LO: u64 = 0x68;
    pub const CTRL_RSP_ADDR_HI: u64 = 0x6C;
}

const LOC_STATE_ESTABLISHED: u32 = 1 << 0;
const LOC_STATE_ASSIGNED: u32 = 1 << 1;
const LOC_STATE_VALID: u32 = 1 << 7;
const LOC_CTRL_REQUEST: u32 = 1 << 0;
const LOC_CTRL_RELINQUISH: u32 = 1 << 1;
const LOC_STS_GRANTED: u32 = 1 << 0;
const CTRL_REQ_READY: u32 = 1 << 0;
const CTRL_REQ_IDLE: u32 = 1 << 1;
const CTRL_STS_IDLE: u32 = 1 << 1;

/// CRB interface, version 1, CRB idle bypass, 64-byte transfers.
const INTF_ID: u64 = 0x1 | (0x1 << 4) | (1 << 9) | (0x3 << 11) | (1 << 14) | (0x1 << 17) | (0x1014 << 48);

pub const ST_NO_SESSIONS: u16 = 0x8001;
pub const ST_SESSIONS: u16 = 0x8002;
const ST_CREATION: u16 = 0x8021;

pub mod cc {
    pub const NV_UNDEFINE_SPACE: u32 = 0x122;
    pub const NV_DEFINE_SPACE: u32 = 0x12A;
    pub const CREATE_PRIMARY: u32 = 0x131;
    pub const NV_WRITE: u32 = 0x137;
    pub const SELF_TEST: u32 = 0x143;
    pub const STARTUP: u32 = 0x144;
    pub const SHUTDOWN: u32 = 0x145;
    pub const NV_READ: u32 = 0x14E;
    pub const FLUSH_CONTEXT: u32 = 0x165;
    pub const GET_CAPABILITY: u32 = 0x17A;
    pub const GET_RANDOM: u32 = 0x17B;
    pub const PCR_READ: u32 = 0x17E;
    pub const PCR_EXTEND: u32 = 0x182;
}

pub mod rc {
    pub const SUCCESS: u32 = 0x000;
    pub const BAD_TAG: u32 = 0x01E;
    pub const VALUE: u32 = 0x084;
    pub const HANDLE: u32 = 0x08B;
    pub const SIZE: u32 = 0x095;
    pub const INSUFFICIENT: u32 = 0x09A;
    pub const INITIALIZE: u32 = 0x100;
    pub const COMMAND_SIZE: u32 = 0x142;
    pub const COMMAND_CODE: u32 = 0x143;
    pub const AUTHSIZE: u32 = 0x144;
    pub const NV_RANGE: u32 = 0x146;
    pub const NV_AUTHORIZATION: u32 = 0x149;
    pub const NV_UNINITIALIZED: u32 = 0x14A;
    pub const NV_SPACE: u32 = 0x14B;
    pub const NV_DEFINED: u32 = 0x14C;
    pub const OBJECT_MEMORY: u32 = 0x902;
}

const ALG_SHA1: u16 = 0x0004;
const ALG_SHA256: u16 = 0x000B;
const ALG_SHA384: u16 = 0x000C;
const ALG_SHA512: u16 = 0x000D;

const CAP_ALGS: u32 = 0;
const CAP_HANDLES: u32 = 1;
const CAP_PCRS: u32 = 5;
const CAP_TPM_PROPERTIES: u32 = 6;

/// Fixed TPM properties (TPM_PT_*), sorted by tag.
const PROPERTIES: &[(u32, u32)] = &[
    (0x100, 0x322E_3000),
    (0x101, 0),
    (0x102, 159),
    (0x105, 0x4352_424E),
    (0x106, 0x6361_7262),
    (0x10B, 1),
    (0x10D, BUFFER_SIZE as u32),
    (0x10E, MAX_TRANSIENT as u32),
    (0x112, PCR_COUNT as u32),
    (0x117, MAX_NV_SIZE as u32),
    (0x11E, BUFFER_SIZE as u32),
    (0x11F, BUFFER_SIZE as u32),
    (0x120, DIGEST_SIZE as u32),
];

pub mod nv {
    pub const PPWRITE: u32 = 1 << 0;
    pub const OWNERWRITE: u32 = 1 << 1;
    pub const AUTHWRITE: u32 = 1 << 2;
    pub const POLICYWRITE: u32 = 1 << 3;
    pub const PPREAD: u32 = 1 << 16;
    pub const OWNERREAD: u32 = 1 << 17;
    pub const AUTHREAD: u32 = 1 << 18;
    pub const POLICYREAD: u32 = 1 << 19;
    pub const WRITTEN: u32 = 1 << 29;

    pub const WRITE_MASK: u32 = PPWRITE | OWNERWRITE | AUTHWRITE | POLICYWRITE;
    pub const READ_MASK: u32 = PPREAD | OWNERREAD | AUTHREAD | POLICYREAD;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NvIndex {
    attributes: u32,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TpmState {
    loc_granted: bool,
    idle: bool,
    start: bool,
    int_enable: u32,
    int_sts: u32,
    buffer: Vec<u8>,
    started: bool,
    pcrs: Vec<[u8; DIGEST_SIZE]>,
    pcr_update_counter: u32,
    nv: BTreeMap<u32, NvIndex>,
    transients: Vec<u32>,
}

impl TpmState {
    fn power_on(nv: BTreeMap<u32, NvIndex>) -> Self {
        Self {
            loc_granted: false,
            idle: true,
            start: false,
            int_enable: 0,
            int_sts: 0,
            buffer: vec![0; BUFFER_SIZE],
            started: false,
            pcrs: vec![[0; DIGEST_SIZE]; PCR_COUNT],
            pcr_update_counter: 0,
            nv,
            transients: Vec::new(),
        }
    }
}

/// Big-endian cursor over a command. Running out of bytes is
/// `TPM_RC_INSUFFICIENT`.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], u32> {
        if self.remaining() < n {
            return Err(rc::INSUFFICIENT);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, u32> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, u32> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A TPM2B: u16 size followed by that many bytes.
    fn sized(&mut self) -> Result<&'a [u8], u32> {
        let n = self.u16()? as usize;
        self.bytes(n)
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn sized(&mut self, data: &[u8]) -> &mut Self {
        self.u16(data.len() as u16);
        self.0.extend_from_slice(data);
        self
    }
}

/// Handle area and parameter area of a successful response.
#[derive(Default)]
struct Reply {
    handles: Writer,
    params: Writer,
}

fn handle_count(code: u32) -> Option<usize> {
    match code {
        cc::STARTUP | cc::SHUTDOWN | cc::SELF_TEST | cc::PCR_READ | cc::GET_CAPABILITY | cc::GET_RANDOM
        | cc::FLUSH_CONTEXT => Some(0),
        cc::PCR_EXTEND | cc::NV_DEFINE_SPACE | cc::CREATE_PRIMARY => Some(1),
        cc::NV_UNDEFINE_SPACE | cc::NV_WRITE | cc::NV_READ => Some(2),
        _ => None,
    }
}

fn digest_size(alg: u16) -> Option<usize> {
    match alg {
        ALG_SHA1 => Some(20),
        ALG_SHA256 => Some(32),
        ALG_SHA384 => Some(48),
        ALG_SHA512 => Some(64),
        _ => None,
    }
}

/// `continueSession` attribute of each command session.
fn parse_sessions(r: &mut Reader) -> Result<Vec<u8>, u32> {
    let size = r.u32()? as usize;
    if size > r.remaining() {
        return Err(rc::AUTHSIZE);
    }
    let mut area = Reader::new(r.bytes(size)?);
    let mut sessions = Vec::new();
    while area.remaining() > 0 {
        let _handle = area.u32()?;
        let _nonce = area.sized()?;
        let attributes = area.u8()?;
        let _hmac = area.sized()?;
        sessions.push(attributes & 1);
    }
    Ok(sessions)
}

fn error_response(code: u32) -> Vec<u8> {
    let mut w = Writer::default();
    w.u16(ST_NO_SESSIONS).u32(10).u32(code);
    w.0
}

/// TPM 2.0 command processor with a CRB register front end.
pub struct Tpm {
    state: TpmState,
    rng: Box<dyn RngCore + Send>,
}

impl Default for Tpm {
    fn default() -> Self {
        Self::new()
    }
}

impl Tpm {
    pub fn new() -> Self {
        Self::with_rng(Box::new(StdRng::from_entropy()))
    }

    /// TPM drawing `GetRandom` bytes from `rng`.
    pub fn with_rng(rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            state: TpmState::power_on(BTreeMap::new()),
            rng,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.started
    }

    pub fn pcr(&self, index: usize) -> Option<[u8; DIGEST_SIZE]> {
        self.state.pcrs.get(index).copied()
    }

    fn read_reg(&self, reg: u64) -> u32 {
        let s = &self.state;
        match reg {
            regs::LOC_STATE => {
                let assigned = if s.loc_granted { LOC_STATE_ASSIGNED } else { 0 };
                LOC_STATE_ESTABLISHED | LOC_STATE_VALID | assigned
            }
            regs::LOC_STS => {
                if s.loc_granted {
                    LOC_STS_GRANTED
                } else {
                    0
                }
            }
            regs::INTF_ID_LO => INTF_ID as u32,
            regs::INTF_ID_HI => (INTF_ID >> 32) as u32,
            regs::CTRL_STS => {
                if s.idle {
                    CTRL_STS_IDLE
                } else {
                    0
                }
            }
            regs::CTRL_START => s.start as u32,
            regs::CTRL_INT_ENABLE => s.int_enable,
            regs::CTRL_INT_STS => s.int_sts,
            regs::CTRL_CMD_SIZE | regs::CTRL_RSP_SIZE => BUFFER_SIZE as u32,
            regs::CTRL_CMD_LADDR | regs::CTRL_RSP_ADDR_LO => (TPM_BASE + BUFFER_OFFSET) as u32,
            _ => 0,
        }
    }

    fn write_reg(&mut self, reg: u64, value: u32) {
        match reg {
            regs::LOC_CTRL => {
                if value & LOC_CTRL_REQUEST != 0 {
                    self.state.loc_granted = true;
                }
                if value & LOC_CTRL_RELINQUISH != 0 {
                    self.state.loc_granted = false;
                }
            }
            regs::CTRL_REQ => {
                if value & CTRL_REQ_READY != 0 {
                    self.state.idle = false;
                }
                if value & CTRL_REQ_IDLE != 0 {
                    self.state.idle = true;
                }
            }
            regs::CTRL_START => {
                if value & 1 != 0 {
                    self.start();
                }
            }
            regs::CTRL_INT_ENABLE => self.state.int_enable = value,
            regs::CTRL_INT_STS => self.state.int_sts &= !value,
            regs::CTRL_CANCEL => {}
            _ => debug!("tpm write to read-only register {:#x}", reg),
        }
    }

    fn start(&mut self) {
        if self.state.idle {
            debug!("tpm start while idle ignored");
            return;
        }
        self.state.start = true;
        let command = self.state.buffer.clone();
        let response = self.execute(&command);
        let len = response.len().min(BUFFER_SIZE);
        self.state.buffer[..len].copy_from_slice(&response[..len]);
        self.state.start = false;
        self.state.int_sts |= self.state.int_enable & 1;
    }

    /// Run one command and build its full response.
    pub fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        match self.dispatch(command) {
            Ok(response) => response,
            Err(code) => {
                debug!("tpm command failed: rc {:#x}", code);
                error_response(code)
            }
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> Result<Vec<u8>, u32> {
        let mut header = Reader::new(command);
        let tag = header.u16()?;
        let size = header.u32()? as usize;
        let code = header.u32()?;
        if tag != ST_NO_SESSIONS && tag != ST_SESSIONS {
            return Err(rc::BAD_TAG);
        }
        if !(10..=BUFFER_SIZE).contains(&size) || size > command.len() {
            return Err(rc::COMMAND_SIZE);
        }
        let handle_count = handle_count(code).ok_or(rc::COMMAND_CODE)?;
        if !self.state.started && code != cc::STARTUP {
            return Err(rc::INITIALIZE);
        }

        let mut r = Reader::new(&command[10..size]);
        let handles = (0..handle_count).map(|_| r.u32()).collect::<Result<Vec<_>, _>>()?;
        let sessions = if tag == ST_SESSIONS {
            parse_sessions(&mut r)?
        } else {
            Vec::new()
        };

        let reply = match code {
            cc::STARTUP => self.startup(&mut r)?,
            cc::SHUTDOWN => {
                r.u16()?;
                Reply::default()
            }
            cc::SELF_TEST => {
                r.u8()?;
                Reply::default()
            }
            cc::PCR_EXTEND => self.pcr_extend(handles[0], &mut r)?,
            cc::PCR_READ => self.pcr_read(&mut r)?,
            cc::NV_DEFINE_SPACE => self.nv_define(&mut r)?,
            cc::NV_UNDEFINE_SPACE => self.nv_undefine(handles[1])?,
            cc::NV_WRITE => self.nv_write(handles[1], &mut r)?,
            cc::NV_READ => self.nv_read(handles[1], &mut r)?,
            cc::GET_CAPABILITY => self.get_capability(&mut r)?,
            cc::GET_RANDOM => self.get_random(&mut r)?,
            cc::FLUSH_CONTEXT => self.flush_context(&mut r)?,
            cc::CREATE_PRIMARY => self.create_primary(handles[0])?,
            _ => return Err(rc::COMMAND_CODE),
        };
        Ok(assemble(tag, reply, &sessions))
    }

    fn startup(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let kind = r.u16()?;
        if self.state.started {
            return Err(rc::INITIALIZE);
        }
        if kind > 1 {
            return Err(rc::VALUE);
        }
        info!("tpm startup ({})", if kind == 0 { "clear" } else { "state" });
        self.state.started = true;
        if kind == 0 {
            self.state.pcrs = vec![[0; DIGEST_SIZE]; PCR_COUNT];
            self.state.pcr_update_counter = 0;
        }
        Ok(Reply::default())
    }

    fn pcr_extend(&mut self, handle: u32, r: &mut Reader) -> Result<Reply, u32> {
        let index = handle as usize;
        if index >= PCR_COUNT {
            return Err(rc::VALUE);
        }
        let count = r.u32()?;
        for _ in 0..count {
            let alg = r.u16()?;
            let size = digest_size(alg).ok_or(rc::VALUE)?;
            let digest = r.bytes(size)?;
            if alg != ALG_SHA256 {
                continue;
            }
            let pcr = &mut self.state.pcrs[index];
            let mut hasher = Sha256::new();
            hasher.update(&pcr[..]);
            hasher.update(digest);
            pcr.copy_from_slice(&hasher.finalize());
        }
        self.state.pcr_update_counter = self.state.pcr_update_counter.wrapping_add(1);
        Ok(Reply::default())
    }

    fn pcr_read(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let count = r.u32()?;
        let mut reply = Reply::default();
        reply.params.u32(self.state.pcr_update_counter);
        reply.params.u32(count);

        let mut digests = Vec::new();
        for _ in 0..count {
            let alg = r.u16()?;
            let select_len = r.u8()? as usize;
            let select = r.bytes(select_len)?.to_vec();
            let mut returned = vec![0u8; select.len()];
            if alg == ALG_SHA256 {
                for pcr in 0..(select.len() * 8).min(PCR_COUNT) {
                    if select[pcr / 8] & (1 << (pcr % 8)) != 0 && digests.len() < 8 {
                        returned[pcr / 8] |= 1 << (pcr % 8);
                        digests.push(self.state.pcrs[pcr]);
                    }
                }
            }
            reply.params.u16(alg).u8(returned.len() as u8);
            reply.params.0.extend_from_slice(&returned);
        }

        reply.params.u32(digests.len() as u32);
        for digest in &digests {
            reply.params.sized(digest);
        }
        Ok(reply)
    }

    fn nv_define(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let _auth = r.sized()?;
        let mut public = Reader::new(r.sized()?);
        let index = public.u32()?;
        let _name_alg = public.u16()?;
        let attributes = public.u32()?;
        let _policy = public.sized()?;
        let size = public.u16()? as usize;

        if index >> 24 != 0x01 {
            return Err(rc::VALUE);
        }
        if size > MAX_NV_SIZE {
            return Err(rc::SIZE);
        }
        if self.state.nv.contains_key(&index) {
            return Err(rc::NV_DEFINED);
        }
        if self.state.nv.len() >= MAX_NV_INDICES {
            return Err(rc::NV_SPACE);
        }
        debug!("tpm nv define {:#x} ({} bytes)", index, size);
        self.state.nv.insert(
            index,
            NvIndex {
                attributes: attributes & !nv::WRITTEN,
                data: vec![0; size],
            },
        );
        Ok(Reply::default())
    }

    fn nv_undefine(&mut self, index: u32) -> Result<Reply, u32> {
        self.state.nv.remove(&index).ok_or(rc::HANDLE)?;
        Ok(Reply::default())
    }

    fn nv_write(&mut self, index: u32, r: &mut Reader) -> Result<Reply, u32> {
        let data = r.sized()?;
        let offset = r.u16()? as usize;
        let entry = self.state.nv.get_mut(&index).ok_or(rc::HANDLE)?;
        if entry.attributes & nv::WRITE_MASK == 0 {
            return Err(rc::NV_AUTHORIZATION);
        }
        let end = offset + data.len();
        if end > entry.data.len() {
            return Err(rc::NV_RANGE);
        }
        entry.data[offset..end].copy_from_slice(data);
        entry.attributes |= nv::WRITTEN;
        Ok(Reply::default())
    }

    fn nv_read(&mut self, index: u32, r: &mut Reader) -> Result<Reply, u32> {
        let size = r.u16()? as usize;
        let offset = r.u16()? as usize;
        let entry = self.state.nv.get(&index).ok_or(rc::HANDLE)?;
        if entry.attributes & nv::READ_MASK == 0 {
            return Err(rc::NV_AUTHORIZATION);
        }
        if entry.attributes & nv::WRITTEN == 0 {
            return Err(rc::NV_UNINITIALIZED);
        }
        let end = offset + size;
        if end > entry.data.len() {
            return Err(rc::NV_RANGE);
        }
        let mut reply = Reply::default();
        reply.params.sized(&entry.data[offset..end]);
        Ok(reply)
    }

    fn get_capability(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let capability = r.u32()?;
        let property = r.u32()?;
        let count = r.u32()? as usize;
        let mut reply = Reply::default();

        match capability {
            CAP_ALGS => {
                reply.params.u8(0).u32(capability).u32(1);
                reply.params.u16(ALG_SHA256).u32(0x04);
            }
            CAP_HANDLES => {
                let handles: Vec<u32> = self
                    .state
                    .nv
                    .keys()
                    .chain(self.state.transients.iter())
                    .copied()
                    .filter(|&h| h >> 24 == property >> 24 && h >= property)
                    .collect();
                let shown = handles.len().min(count);
                reply.params.u8((handles.len() > shown) as u8).u32(capability).u32(shown as u32);
                for &h in &handles[..shown] {
                    reply.params.u32(h);
                }
            }
            CAP_PCRS => {
                reply.params.u8(0).u32(capability).u32(1);
                reply.params.u16(ALG_SHA256).u8(3).u8(0xFF).u8(0xFF).u8(0xFF);
            }
            CAP_TPM_PROPERTIES => {
                let matching: Vec<_> = PROPERTIES.iter().filter(|&&(tag, _)| tag >= property).collect();
                let shown = matching.len().min(count);
                reply.params.u8((matching.len() > shown) as u8).u32(capability).u32(shown as u32);
                for &&(tag, value) in &matching[..shown] {
                    reply.params.u32(tag).u32(value);
                }
            }
            _ => return Err(rc::VALUE),
        }
        Ok(reply)
    }

    fn get_random(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let requested = (r.u16()? as usize).min(DIGEST_SIZE);
        let mut bytes = vec![0u8; requested];
        self.rng.fill_bytes(&mut bytes);
        let mut reply = Reply::default();
        reply.params.sized(&bytes);
        Ok(reply)
    }

    fn flush_context(&mut self, r: &mut Reader) -> Result<Reply, u32> {
        let handle = r.u32()?;
        let pos = self.state.transients.iter().position(|&h| h == handle).ok_or(rc::HANDLE)?;
        self.state.transients.remove(pos);
        Ok(Reply::default())
    }

    fn create_primary(&mut self, hierarchy: u32) -> Result<Reply, u32> {
        if !matches!(hierarchy, 0x4000_0001 | 0x4000_0007 | 0x4000_000B | 0x4000_000C) {
            return Err(rc::HANDLE);
        }
        if self.state.transients.len() >= MAX_TRANSIENT {
            return Err(rc::OBJECT_MEMORY);
        }
        let handle = (TRANSIENT_FIRST..)
            .find(|h| !self.state.transients.contains(h))
            .unwrap_or(TRANSIENT_FIRST);
        self.state.transients.push(handle);
        debug!("tpm created primary {:#x} under {:#x}", handle, hierarchy);

        let mut reply = Reply::default();
        reply.handles.u32(handle);
        // outPublic, creationData, creationHash, creationTicket, name
        reply.params.sized(&[]).sized(&[]).sized(&[]);
        reply.params.u16(ST_CREATION).u32(hierarchy).sized(&[]);
        reply.params.sized(&[]);
        Ok(reply)
    }
}

/// Header + handles + (parameterSize) + parameters + response sessions.
fn assemble(tag: u16, reply: Reply, sessions: &[u8]) -> Vec<u8> {
    let mut body = Writer::default();
    body.0.extend_from_slice(&reply.handles.0);
    if tag == ST_SESSIONS {
        body.u32(reply.params.0.len() as u32);
    }
    body.0.extend_from_slice(&reply.params.0);
    for &continue_session in sessions {
        body.sized(&[]).u8(continue_session).sized(&[]);
    }

    let mut out = Writer::default();
    out.u16(tag).u32(10 + body.0.len() as u32).u32(rc::SUCCESS);
    out.0.extend_from_slice(&body.0);
    out.0
}

impl Device for Tpm {
    fn name(&self) -> &str {
        "tpm"
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        if offset >= BUFFER_OFFSET {
            let start = (offset - BUFFER_OFFSET) as usize;
            return (0..width.bytes()).fold(0, |acc, i| {
                let byte = self.state.buffer.get(start + i).copied().unwrap_or(0xFF);
                acc | (byte as u32) << (8 * i)
            });
        }
        extract(self.read_reg(offset & !3) as u64, offset & 3, width)
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        if offset >= BUFFER_OFFSET {
            let start = (offset - BUFFER_OFFSET) as usize;
            for i in 0..width.bytes() {
                if let Some(byte) = self.state.buffer.get_mut(start + i) {
                    *byte = (value >> (8 * i)) as u8;
                }
            }
            return;
        }
        let value = deposit(0, offset & 3, width, value) as u32;
        self.write_reg(offset & !3, value);
    }

    /// Platform reset: volatile state cleared, NV indices kept.
    fn reset(&mut self) {
        let nv = std::mem::take(&mut self.state.nv);
        self.state = TpmState::power_on(nv);
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: TpmState = snapshot.decode(self.name())?;
        if state.buffer.len() != BUFFER_SIZE {
            return Err(SnapshotError::Malformed("TPM command buffer size".into()));
        }
        if state.pcrs.len() != PCR_COUNT {
            return Err(SnapshotError::Malformed("TPM PCR bank size".into()));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::edit_snapshot;

    const NV_INDEX: u32 = 0x0150_0001;

    fn tpm() -> Tpm {
        Tpm::with_rng(Box::new(StdRng::seed_from_u64(7)))
    }

    fn command(tag: u16, code: u32, body: &[u8]) -> Vec<u8> {
        let mut w = Writer::default();
        w.u16(tag).u32(10 + body.len() as u32).u32(code);
        w.0.extend_from_slice(body);
        w.0
    }

    /// Password session with an empty auth value.
    fn pw_session() -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(9).u32(0x4000_0009).sized(&[]).u8(1).sized(&[]);
        w.0
    }

    fn rc_of(response: &[u8]) -> u32 {
        u32::from_be_bytes([response[6], response[7], response[8], response[9]])
    }

    /// Send a command through the CRB registers and read back the response.
    fn crb_run(tpm: &mut Tpm, cmd: &[u8]) -> Vec<u8> {
        tpm.mmio_write(regs::LOC_CTRL, AccessWidth::Dword, LOC_CTRL_REQUEST);
        tpm.mmio_write(regs::CTRL_REQ, AccessWidth::Dword, CTRL_REQ_READY);
        for (i, &b) in cmd.iter().enumerate() {
            tpm.mmio_write(BUFFER_OFFSET + i as u64, AccessWidth::Byte, b as u32);
        }
        tpm.mmio_write(regs::CTRL_START, AccessWidth::Dword, 1);
        assert_eq!(tpm.mmio_read(regs::CTRL_START, AccessWidth::Dword), 0);
        let size = tpm.mmio_read(BUFFER_OFFSET + 2, AccessWidth::Dword).swap_bytes() as usize;
        (0..size)
            .map(|i| tpm.mmio_read(BUFFER_OFFSET + i as u64, AccessWidth::Byte) as u8)
            .collect()
    }

    fn started() -> Tpm {
        let mut tpm = tpm();
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::STARTUP, &[0, 0]));
        assert_eq!(rc_of(&resp), rc::SUCCESS);
        tpm
    }

    fn extend(tpm: &mut Tpm, pcr: u32, digest: &[u8; 32]) -> u32 {
        let mut body = Writer::default();
        body.u32(pcr);
        body.0.extend_from_slice(&pw_session());
        body.u32(1).u16(ALG_SHA256);
        body.0.extend_from_slice(digest);
        rc_of(&tpm.execute(&command(ST_SESSIONS, cc::PCR_EXTEND, &body.0)))
    }

    fn nv_define(tpm: &mut Tpm, index: u32, attributes: u32, size: u16) -> u32 {
        let mut public = Writer::default();
        public.u32(index).u16(ALG_SHA256).u32(attributes).sized(&[]).u16(size);
        let mut body = Writer::default();
        body.u32(0x4000_0001);
        body.0.extend_from_slice(&pw_session());
        body.sized(&[]).sized(&public.0);
        rc_of(&tpm.execute(&command(ST_SESSIONS, cc::NV_DEFINE_SPACE, &body.0)))
    }

    fn nv_write(tpm: &mut Tpm, index: u32, data: &[u8], offset: u16) -> u32 {
        let mut body = Writer::default();
        body.u32(index).u32(index);
        body.0.extend_from_slice(&pw_session());
        body.sized(data).u16(offset);
        rc_of(&tpm.execute(&command(ST_SESSIONS, cc::NV_WRITE, &body.0)))
    }

    fn nv_read(tpm: &mut Tpm, index: u32, size: u16, offset: u16) -> Vec<u8> {
        let mut body = Writer::default();
        body.u32(index).u32(index);
        body.0.extend_from_slice(&pw_session());
        body.u16(size).u16(offset);
        tpm.execute(&command(ST_SESSIONS, cc::NV_READ, &body.0))
    }

    #[test]
    fn test_interface_id_reports_crb() {
        let mut tpm = tpm();
        let id = tpm.mmio_read(regs::INTF_ID_LO, AccessWidth::Dword);
        assert_eq!(id & 0xF, 1, "CRB interface type");
        assert_ne!(id & (1 << 14), 0, "CRB capability");
        assert_eq!(tpm.mmio_read(regs::CTRL_CMD_SIZE, AccessWidth::Dword), BUFFER_SIZE as u32);
        assert_eq!(
            tpm.mmio_read(regs::CTRL_CMD_LADDR, AccessWidth::Dword),
            (TPM_BASE + BUFFER_OFFSET) as u32
        );
    }

    #[test]
    fn test_locality_request_and_relinquish() {
        let mut tpm = tpm();
        assert_eq!(tpm.mmio_read(regs::LOC_STS, AccessWidth::Dword), 0);
        tpm.mmio_write(regs::LOC_CTRL, AccessWidth::Dword, LOC_CTRL_REQUEST);
        assert_eq!(tpm.mmio_read(regs::LOC_STS, AccessWidth::Dword), LOC_STS_GRANTED);
        assert_ne!(tpm.mmio_read(regs::LOC_STATE, AccessWidth::Dword) & LOC_STATE_ASSIGNED, 0);
        tpm.mmio_write(regs::LOC_CTRL, AccessWidth::Dword, LOC_CTRL_RELINQUISH);
        assert_eq!(tpm.mmio_read(regs::LOC_STATE, AccessWidth::Dword) & LOC_STATE_ASSIGNED, 0);
    }

    #[test]
    fn test_idle_and_ready() {
        let mut tpm = tpm();
        assert_eq!(tpm.mmio_read(regs::CTRL_STS, AccessWidth::Dword), CTRL_STS_IDLE);
        tpm.mmio_write(regs::CTRL_REQ, AccessWidth::Dword, CTRL_REQ_READY);
        assert_eq!(tpm.mmio_read(regs::CTRL_STS, AccessWidth::Dword), 0);
        tpm.mmio_write(regs::CTRL_REQ, AccessWidth::Dword, CTRL_REQ_IDLE);
        assert_eq!(tpm.mmio_read(regs::CTRL_STS, AccessWidth::Dword), CTRL_STS_IDLE);
    }

    #[test]
    fn test_start_while_idle_is_ignored() {
        let mut tpm = tpm();
        let cmd = command(ST_NO_SESSIONS, cc::STARTUP, &[0, 0]);
        for (i, &b) in cmd.iter().enumerate() {
            tpm.mmio_write(BUFFER_OFFSET + i as u64, AccessWidth::Byte, b as u32);
        }
        tpm.mmio_write(regs::CTRL_START, AccessWidth::Dword, 1);
        assert!(!tpm.is_started());
    }

    #[test]
    fn test_startup_through_crb() {
        let mut tpm = tpm();
        let resp = crb_run(&mut tpm, &command(ST_NO_SESSIONS, cc::STARTUP, &[0, 0]));
        assert_eq!(resp, vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0, 0]);
        assert!(tpm.is_started());
    }

    #[test]
    fn test_commands_before_startup() {
        let mut tpm = tpm();
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::GET_RANDOM, &[0, 8]));
        assert_eq!(rc_of(&resp), rc::INITIALIZE);
        assert_eq!(resp.len(), 10);
    }

    #[test]
    fn test_second_startup_fails() {
        let mut tpm = started();
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::STARTUP, &[0, 0]));
        assert_eq!(rc_of(&resp), rc::INITIALIZE);
    }

    #[test]
    fn test_unknown_command_code() {
        let mut running = started();
        let resp = running.execute(&command(ST_NO_SESSIONS, 0x1FF, &[]));
        assert_eq!(rc_of(&resp), rc::COMMAND_CODE);
        let resp = tpm().execute(&command(ST_NO_SESSIONS, 0x1FF, &[]));
        assert_eq!(rc_of(&resp), rc::COMMAND_CODE);
    }

    #[test]
    fn test_malformed_headers() {
        let mut tpm = started();
        assert_eq!(rc_of(&tpm.execute(&command(0x1234, cc::SELF_TEST, &[1]))), rc::BAD_TAG);
        let mut cmd = command(ST_NO_SESSIONS, cc::SELF_TEST, &[1]);
        cmd[5] = 4;
        assert_eq!(rc_of(&tpm.execute(&cmd)), rc::COMMAND_SIZE);
        assert_eq!(rc_of(&tpm.execute(&command(ST_NO_SESSIONS, cc::GET_RANDOM, &[]))), rc::INSUFFICIENT);
    }

    #[test]
    fn test_pcr_extend_is_sha256_chain() {
        let mut tpm = started();
        let digest = [0xAB; 32];
        assert_eq!(extend(&mut tpm, 3, &digest), rc::SUCCESS);

        let mut hasher = Sha256::new();
        hasher.update([0u8; 32]);
        hasher.update(digest);
        let expected: Vec<u8> = hasher.finalize().to_vec();
        assert_eq!(tpm.pcr(3).map(|p| p.to_vec()), Some(expected));
        assert_eq!(tpm.pcr(4), Some([0; 32]));
        assert_eq!(extend(&mut tpm, 24, &digest), rc::VALUE);
    }

    #[test]
    fn test_pcr_read() {
        let mut tpm = started();
        extend(&mut tpm, 1, &[1; 32]);
        let mut body = Writer::default();
        body.u32(1).u16(ALG_SHA256).u8(3).u8(0b0000_0011).u8(0).u8(0);
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::PCR_READ, &body.0));

        assert_eq!(rc_of(&resp), rc::SUCCESS);

        let pcr1 = tpm.pcr(1).unwrap();
        let mut r = Reader::new(&resp[10..]);
        assert_eq!(r.u32(), Ok(1), "update counter");
        assert_eq!(r.u32(), Ok(1));
        assert_eq!(r.u16(), Ok(ALG_SHA256));
        assert_eq!(r.u8(), Ok(3));
        assert_eq!(r.bytes(3), Ok(&[0b11u8, 0, 0][..]));
        assert_eq!(r.u32(), Ok(2));
        assert_eq!(r.sized(), Ok(&[0u8; 32][..]));
        assert_eq!(r.sized(), Ok(&pcr1[..]));
    }

    #[test]
    fn test_nv_define_write_read() {
        let mut tpm = started();
        let attrs = nv::OWNERWRITE | nv::OWNERREAD;
        assert_eq!(nv_define(&mut tpm, NV_INDEX, attrs, 16), rc::SUCCESS);
        assert_eq!(nv_define(&mut tpm, NV_INDEX, attrs, 16), rc::NV_DEFINED);

        assert_eq!(rc_of(&nv_read(&mut tpm, NV_INDEX, 4, 0)), rc::NV_UNINITIALIZED);
        assert_eq!(nv_write(&mut tpm, NV_INDEX, b"carbon", 2), rc::SUCCESS);
        let resp = nv_read(&mut tpm, NV_INDEX, 6, 2);
        assert_eq!(rc_of(&resp), rc::SUCCESS);
        assert_eq!(resp[0..2], ST_SESSIONS.to_be_bytes());
        // parameterSize, then TPM2B buffer
        assert_eq!(&resp[14..16], &[0, 6]);
        assert_eq!(&resp[16..22], b"carbon");
        // one response session: nonce, attributes, hmac
        assert_eq!(&resp[22..], &[0, 0, 1, 0, 0]);

        assert_eq!(nv_write(&mut tpm, NV_INDEX, &[0; 8], 12), rc::NV_RANGE);
        assert_eq!(rc_of(&nv_read(&mut tpm, NV_INDEX, 17, 0)), rc::NV_RANGE);
    }

    #[test]
    fn test_nv_permissions() {
        let mut tpm = started();
        assert_eq!(nv_define(&mut tpm, NV_INDEX, nv::OWNERREAD, 8), rc::SUCCESS);
        assert_eq!(nv_write(&mut tpm, NV_INDEX, &[1], 0), rc::NV_AUTHORIZATION);

        assert_eq!(nv_define(&mut tpm, NV_INDEX + 1, nv::AUTHWRITE, 8), rc::SUCCESS);
        assert_eq!(nv_write(&mut tpm, NV_INDEX + 1, &[1], 0), rc::SUCCESS);
        assert_eq!(rc_of(&nv_read(&mut tpm, NV_INDEX + 1, 1, 0)), rc::NV_AUTHORIZATION);
    }

    #[test]
    fn test_nv_undefine_and_limits() {
        let mut tpm = started();
        assert_eq!(nv_define(&mut tpm, 0x8100_0000, nv::OWNERWRITE, 8), rc::VALUE);
        assert_eq!(nv_define(&mut tpm, NV_INDEX, nv::OWNERWRITE, 4096), rc::SIZE);
        assert_eq!(nv_define(&mut tpm, NV_INDEX, nv::OWNERWRITE, 8), rc::SUCCESS);

        let mut body = Writer::default();
        body.u32(0x4000_0001).u32(NV_INDEX);
        body.0.extend_from_slice(&pw_session());
        let undefine = command(ST_SESSIONS, cc::NV_UNDEFINE_SPACE, &body.0);
        assert_eq!(rc_of(&tpm.execute(&undefine)), rc::SUCCESS);
        assert_eq!(rc_of(&tpm.execute(&undefine)), rc::HANDLE);
        assert_eq!(nv_write(&mut tpm, NV_INDEX, &[1], 0), rc::HANDLE);
    }

    #[test]
    fn test_nv_survives_reset() {
        let mut tpm = started();
        nv_define(&mut tpm, NV_INDEX, nv::OWNERWRITE | nv::OWNERREAD, 4);
        nv_write(&mut tpm, NV_INDEX, &[9, 9], 0);
        extend(&mut tpm, 0, &[5; 32]);
        tpm.reset();
        assert!(!tpm.is_started());
        assert_eq!(tpm.pcr(0), Some([0; 32]));

        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::STARTUP, &[0, 0]));
        assert_eq!(rc_of(&resp), rc::SUCCESS);
        let resp = nv_read(&mut tpm, NV_INDEX, 2, 0);
        assert_eq!(&resp[16..18], &[9, 9]);
    }

    #[test]
    fn test_get_random() {
        let mut tpm = started();
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::GET_RANDOM, &[0, 8]));
        assert_eq!(rc_of(&resp), rc::SUCCESS);
        assert_eq!(&resp[10..12], &[0, 8]);
        assert_eq!(resp.len(), 20);

        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::GET_RANDOM, &[1, 0]));
        assert_eq!(&resp[10..12], &[0, 32], "capped at digest size");
    }

    #[test]
    fn test_get_capability_properties() {
        let mut tpm = started();
        let mut body = Writer::default();
        body.u32(CAP_TPM_PROPERTIES).u32(0x112).u32(1);
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::GET_CAPABILITY, &body.0));
        let mut r = Reader::new(&resp[10..]);
        assert_eq!(r.u8(), Ok(1), "more data");
        assert_eq!(r.u32(), Ok(CAP_TPM_PROPERTIES));
        assert_eq!(r.u32(), Ok(1));
        assert_eq!(r.u32(), Ok(0x112));
        assert_eq!(r.u32(), Ok(PCR_COUNT as u32));

        let mut body = Writer::default();
        body.u32(99).u32(0).u32(1);
        let resp = tpm.execute(&command(ST_NO_SESSIONS, cc::GET_CAPABILITY, &body.0));
        assert_eq!(rc_of(&resp), rc::VALUE);
    }

    #[test]
    fn test_create_primary_and_flush() {
        let mut tpm = started();
        let mut body = Writer::default();
        body.u32(0x4000_0001);
        body.0.extend_from_slice(&pw_session());
        let create = command(ST_SESSIONS, cc::CREATE_PRIMARY, &body.0);

        let resp = tpm.execute(&create);
        assert_eq!(rc_of(&resp), rc::SUCCESS);
        assert_eq!(&resp[10..14], &TRANSIENT_FIRST.to_be_bytes());
        let resp = tpm.execute(&create);
        assert_eq!(&resp[10..14], &(TRANSIENT_FIRST + 1).to_be_bytes());
        tpm.execute(&create);
        assert_eq!(rc_of(&tpm.execute(&create)), rc::OBJECT_MEMORY);

        let flush = command(ST_NO_SESSIONS, cc::FLUSH_CONTEXT, &TRANSIENT_FIRST.to_be_bytes());
        assert_eq!(rc_of(&tpm.execute(&flush)), rc::SUCCESS);
        assert_eq!(rc_of(&tpm.execute(&flush)), rc::HANDLE);
        let resp = tpm.execute(&create);
        assert_eq!(&resp[10..14], &TRANSIENT_FIRST.to_be_bytes(), "freed handle reused");
    }

    #[test]
    fn test_snapshot_restore() {
        let mut tpm = started();
        extend(&mut tpm, 7, &[7; 32]);
        let snap = tpm.snapshot().unwrap();
        let mut other = Tpm::new();
        other.restore(&snap).unwrap();
        assert!(other.is_started());
        assert_eq!(other.pcr(7), tpm.pcr(7));
    }

    #[test]
    fn test_restore_rejects_resized_register_files() {
        let mut tpm = started();
        let snap = tpm.snapshot().unwrap();
        let short_pcrs = edit_snapshot(&snap, |v| v["pcrs"].as_array_mut().unwrap().truncate(1));
        assert!(matches!(tpm.restore(&short_pcrs), Err(SnapshotError::Malformed(_))));
        let short_buffer = edit_snapshot(&snap, |v| v["buffer"].as_array_mut().unwrap().truncate(16));
        assert!(matches!(tpm.restore(&short_buffer), Err(SnapshotError::Malformed(_))));

        // The running state is untouched.
        assert_eq!(extend(&mut tpm, 5, &[5; 32]), rc::SUCCESS);
    }
}
