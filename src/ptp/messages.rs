//! PTPv2 wire codecs.
//!
//! All messages share a 34-byte big-endian common header. Event messages
//! (Sync, Delay_Req, Pdelay_Req, Pdelay_Resp) travel on UDP port 319 and
//! are timestamped on receipt; everything else is general traffic on
//! port 320.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use super::datasets::{ClockIdentity, ClockQuality, PortIdentity, TimeSource};
use crate::time::Timestamp;

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;

pub const PTP_PRIMARY_MULTICAST: &str = "224.0.1.129";
pub const PTP_PDELAY_MULTICAST: &str = "224.0.0.107";
pub const PTP_PRIMARY_MULTICAST_V6: &str = "ff0e::181";
pub const PTP_PDELAY_MULTICAST_V6: &str = "ff02::6b";
pub const PTP_ETHERTYPE_FORWARDABLE: [u8; 6] = [0x01, 0x1B, 0x19, 0x00, 0x00, 0x00];
pub const PTP_ETHERTYPE_NON_FORWARDABLE: [u8; 6] = [0x01, 0x80, 0xC2, 0x00, 0x00, 0x0E];

pub const PTP_VERSION: u8 = 2;
pub const HEADER_LENGTH: usize = 34;

// flagField octet 6
pub const FLAG_TWO_STEP: u8 = 0x02;
pub const FLAG_UNICAST: u8 = 0x04;

// flagField octet 7
pub const FLAG_LEAP61: u8 = 0x01;
pub const FLAG_LEAP59: u8 = 0x02;
pub const FLAG_UTC_OFFSET_VALID: u8 = 0x04;
pub const FLAG_PTP_TIMESCALE: u8 = 0x08;
pub const FLAG_TIME_TRACEABLE: u8 = 0x10;
pub const FLAG_FREQUENCY_TRACEABLE: u8 = 0x20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message truncated: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("unsupported PTP version {0}")]
    BadVersion(u8),
    #[error("unknown message type {0:#x}")]
    BadMessageType(u8),
    #[error("malformed timestamp field")]
    BadTimestamp,
    #[error("timestamp not representable on the wire")]
    UnrepresentableTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Sync,
    DelayReq,
    PdelayReq,
    PdelayResp,
    FollowUp,
    DelayResp,
    PdelayRespFollowUp,
    Announce,
    Signaling,
    Management,
}

impl MessageType {
    pub fn from_nibble(nibble: u8) -> Result<Self, MessageError> {
        match nibble {
            0x0 => Ok(MessageType::Sync),
            0x1 => Ok(MessageType::DelayReq),
            0x2 => Ok(MessageType::PdelayReq),
            0x3 => Ok(MessageType::PdelayResp),
            0x8 => Ok(MessageType::FollowUp),
            0x9 => Ok(MessageType::DelayResp),
            0xA => Ok(MessageType::PdelayRespFollowUp),
            0xB => Ok(MessageType::Announce),
            0xC => Ok(MessageType::Signaling),
            0xD => Ok(MessageType::Management),
            other => Err(MessageError::BadMessageType(other)),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            MessageType::Sync => 0x0,
            MessageType::DelayReq => 0x1,
            MessageType::PdelayReq => 0x2,
            MessageType::PdelayResp => 0x3,
            MessageType::FollowUp => 0x8,
            MessageType::DelayResp => 0x9,
            MessageType::PdelayRespFollowUp => 0xA,
            MessageType::Announce => 0xB,
            MessageType::Signaling => 0xC,
            MessageType::Management => 0xD,
        }
    }

    pub fn is_event(self) -> bool {
        matches!(
            self,
            MessageType::Sync
                | MessageType::DelayReq
                | MessageType::PdelayReq
                | MessageType::PdelayResp
        )
    }

    /// Legacy control field value (1588 table 23).
    pub fn control_field(self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::DelayReq => 1,
            MessageType::FollowUp => 2,
            MessageType::DelayResp => 3,
            MessageType::Management => 4,
            _ => 5,
        }
    }

    pub fn total_length(self) -> usize {
        match self {
            MessageType::Sync | MessageType::DelayReq | MessageType::FollowUp => 44,
            MessageType::DelayResp
            | MessageType::PdelayReq
            | MessageType::PdelayResp
            | MessageType::PdelayRespFollowUp => 54,
            MessageType::Announce => 64,
            MessageType::Signaling | MessageType::Management => HEADER_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transport_specific: u8,
    pub message_type: MessageType,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: [u8; 2],
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl Header {
    pub fn new(
        message_type: MessageType,
        domain_number: u8,
        source_port_identity: PortIdentity,
        sequence_id: u16,
        log_message_interval: i8,
    ) -> Self {
        Header {
            transport_specific: 0,
            message_type,
            message_length: message_type.total_length() as u16,
            domain_number,
            flags: [0, 0],
            correction_field: 0,
            source_port_identity,
            sequence_id,
            control_field: message_type.control_field(),
            log_message_interval,
        }
    }

    pub fn two_step(&self) -> bool {
        self.flags[0] & FLAG_TWO_STEP != 0
    }

    pub fn set_two_step(&mut self, on: bool) {
        if on {
            self.flags[0] |= FLAG_TWO_STEP;
        } else {
            self.flags[0] &= !FLAG_TWO_STEP;
        }
    }

    pub fn unicast(&self) -> bool {
        self.flags[0] & FLAG_UNICAST != 0
    }

    pub fn flag(&self, bit: u8) -> bool {
        self.flags[1] & bit != 0
    }

    pub fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.flags[1] |= bit;
        } else {
            self.flags[1] &= !bit;
        }
    }

    pub fn correction(&self) -> Timestamp {
        Timestamp::from_correction(self.correction_field)
    }

    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        if buf.len() < HEADER_LENGTH {
            return Err(MessageError::Truncated {
                got: buf.len(),
                need: HEADER_LENGTH,
            });
        }
        buf[0] = (self.transport_specific << 4) | self.message_type.to_nibble();
        buf[1] = PTP_VERSION;
        BigEndian::write_u16(&mut buf[2..4], self.message_length);
        buf[4] = self.domain_number;
        buf[5] = 0;
        buf[6] = self.flags[0];
        buf[7] = self.flags[1];
        BigEndian::write_i64(&mut buf[8..16], self.correction_field);
        buf[16..20].fill(0);
        buf[20..28].copy_from_slice(&self.source_port_identity.clock_identity.0);
        BigEndian::write_u16(&mut buf[28..30], self.source_port_identity.port_number);
        BigEndian::write_u16(&mut buf[30..32], self.sequence_id);
        buf[32] = self.control_field;
        buf[33] = self.log_message_interval as u8;
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<Header, MessageError> {
        if buf.len() < HEADER_LENGTH {
            return Err(MessageError::Truncated {
                got: buf.len(),
                need: HEADER_LENGTH,
            });
        }
        let version = buf[1] & 0x0F;
        if version != PTP_VERSION {
            return Err(MessageError::BadVersion(version));
        }
        let message_type = MessageType::from_nibble(buf[0] & 0x0F)?;
        let mut clock_identity = [0u8; 8];
        clock_identity.copy_from_slice(&buf[20..28]);
        Ok(Header {
            transport_specific: buf[0] >> 4,
            message_type,
            message_length: BigEndian::read_u16(&buf[2..4]),
            domain_number: buf[4],
            flags: [buf[6], buf[7]],
            correction_field: BigEndian::read_i64(&buf[8..16]),
            source_port_identity: PortIdentity {
                clock_identity: ClockIdentity(clock_identity),
                port_number: BigEndian::read_u16(&buf[28..30]),
            },
            sequence_id: BigEndian::read_u16(&buf[30..32]),
            control_field: buf[32],
            log_message_interval: buf[33] as i8,
        })
    }
}

fn pack_timestamp(ts: &Timestamp, buf: &mut [u8]) -> Result<(), MessageError> {
    let mut wire = [0u8; 10];
    if !ts.to_wire(&mut wire) {
        return Err(MessageError::UnrepresentableTimestamp);
    }
    buf[..10].copy_from_slice(&wire);
    Ok(())
}

fn unpack_timestamp(buf: &[u8]) -> Result<Timestamp, MessageError> {
    Timestamp::from_wire(buf).ok_or(MessageError::BadTimestamp)
}

fn unpack_port_identity(buf: &[u8]) -> PortIdentity {
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[0..8]);
    PortIdentity {
        clock_identity: ClockIdentity(id),
        port_number: BigEndian::read_u16(&buf[8..10]),
    }
}

fn pack_port_identity(identity: &PortIdentity, buf: &mut [u8]) {
    buf[0..8].copy_from_slice(&identity.clock_identity.0);
    BigEndian::write_u16(&mut buf[8..10], identity.port_number);
}

fn check_length(buf: &[u8], need: usize) -> Result<(), MessageError> {
    if buf.len() < need {
        Err(MessageError::Truncated {
            got: buf.len(),
            need,
        })
    } else {
        Ok(())
    }
}

/// Announce body (offsets relative to the start of the message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    pub origin_timestamp: Timestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: TimeSource,
}

impl Announce {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 64)?;
        pack_timestamp(&self.origin_timestamp, &mut buf[34..44])?;
        BigEndian::write_i16(&mut buf[44..46], self.current_utc_offset);
        buf[46] = 0;
        buf[47] = self.grandmaster_priority1;
        buf[48] = self.grandmaster_clock_quality.clock_class;
        buf[49] = self.grandmaster_clock_quality.clock_accuracy;
        BigEndian::write_u16(
            &mut buf[50..52],
            self.grandmaster_clock_quality.offset_scaled_log_variance,
        );
        buf[52] = self.grandmaster_priority2;
        buf[53..61].copy_from_slice(&self.grandmaster_identity.0);
        BigEndian::write_u16(&mut buf[61..63], self.steps_removed);
        buf[63] = self.time_source.to_wire();
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<Announce, MessageError> {
        check_length(buf, 64)?;
        let mut gm = [0u8; 8];
        gm.copy_from_slice(&buf[53..61]);
        Ok(Announce {
            origin_timestamp: unpack_timestamp(&buf[34..44])?,
            current_utc_offset: BigEndian::read_i16(&buf[44..46]),
            grandmaster_priority1: buf[47],
            grandmaster_clock_quality: ClockQuality {
                clock_class: buf[48],
                clock_accuracy: buf[49],
                offset_scaled_log_variance: BigEndian::read_u16(&buf[50..52]),
            },
            grandmaster_priority2: buf[52],
            grandmaster_identity: ClockIdentity(gm),
            steps_removed: BigEndian::read_u16(&buf[61..63]),
            time_source: TimeSource::from_wire(buf[63]),
        })
    }
}

/// Sync and Delay_Req share one body: a single origin timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBody {
    pub origin_timestamp: Timestamp,
}

impl SyncBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 44)?;
        pack_timestamp(&self.origin_timestamp, &mut buf[34..44])
    }

    pub fn unpack(buf: &[u8]) -> Result<SyncBody, MessageError> {
        check_length(buf, 44)?;
        Ok(SyncBody {
            origin_timestamp: unpack_timestamp(&buf[34..44])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpBody {
    pub precise_origin_timestamp: Timestamp,
}

impl FollowUpBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 44)?;
        pack_timestamp(&self.precise_origin_timestamp, &mut buf[34..44])
    }

    pub fn unpack(buf: &[u8]) -> Result<FollowUpBody, MessageError> {
        check_length(buf, 44)?;
        Ok(FollowUpBody {
            precise_origin_timestamp: unpack_timestamp(&buf[34..44])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRespBody {
    pub receive_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

impl DelayRespBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 54)?;
        pack_timestamp(&self.receive_timestamp, &mut buf[34..44])?;
        pack_port_identity(&self.requesting_port_identity, &mut buf[44..54]);
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<DelayRespBody, MessageError> {
        check_length(buf, 54)?;
        Ok(DelayRespBody {
            receive_timestamp: unpack_timestamp(&buf[34..44])?,
            requesting_port_identity: unpack_port_identity(&buf[44..54]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdelayReqBody {
    pub origin_timestamp: Timestamp,
}

impl PdelayReqBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 54)?;
        pack_timestamp(&self.origin_timestamp, &mut buf[34..44])?;
        buf[44..54].fill(0);
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<PdelayReqBody, MessageError> {
        check_length(buf, 54)?;
        Ok(PdelayReqBody {
            origin_timestamp: unpack_timestamp(&buf[34..44])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdelayRespBody {
    pub request_receipt_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

impl PdelayRespBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 54)?;
        pack_timestamp(&self.request_receipt_timestamp, &mut buf[34..44])?;
        pack_port_identity(&self.requesting_port_identity, &mut buf[44..54]);
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<PdelayRespBody, MessageError> {
        check_length(buf, 54)?;
        Ok(PdelayRespBody {
            request_receipt_timestamp: unpack_timestamp(&buf[34..44])?,
            requesting_port_identity: unpack_port_identity(&buf[44..54]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdelayRespFollowUpBody {
    pub response_origin_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

impl PdelayRespFollowUpBody {
    pub fn pack(&self, buf: &mut [u8]) -> Result<(), MessageError> {
        check_length(buf, 54)?;
        pack_timestamp(&self.response_origin_timestamp, &mut buf[34..44])?;
        pack_port_identity(&self.requesting_port_identity, &mut buf[44..54]);
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<PdelayRespFollowUpBody, MessageError> {
        check_length(buf, 54)?;
        Ok(PdelayRespFollowUpBody {
            response_origin_timestamp: unpack_timestamp(&buf[34..44])?,
            requesting_port_identity: unpack_port_identity(&buf[44..54]),
        })
    }
}
