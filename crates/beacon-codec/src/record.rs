use beacon_core::{MessageId, PeerId, SessionEpoch};

use crate::error::CodecError;
use crate::fields::{decode_id_list, encode_id_list, truncate_text, RecordFields};

pub const FIELD_KIND: &str = "k";
pub const FIELD_SENDER: &str = "id";
pub const FIELD_EPOCH: &str = "s";
pub const FIELD_TIMESTAMP: &str = "ts";
pub const FIELD_NAME: &str = "n";
pub const FIELD_HEARTBEAT: &str = "hb";
pub const FIELD_ACK: &str = "ack";
pub const FIELD_MESSAGE_ID: &str = "mid";
pub const FIELD_TEXT: &str = "txt";
pub const FIELD_SLOT: &str = "sl";
pub const FIELD_TARGET: &str = "to";
pub const FIELD_SENT: &str = "sent";
pub const FIELD_RECV: &str = "recv";

/// Advertised kind of a substrate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Presence,
    Message,
    Ack,
    Sync,
}

impl RecordKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            RecordKind::Presence => "hb",
            RecordKind::Message => "msg",
            RecordKind::Ack => "ack",
            RecordKind::Sync => "sync",
        }
    }

    pub fn from_wire(value: &str) -> Result<Self, CodecError> {
        match value {
            "hb" => Ok(RecordKind::Presence),
            "msg" => Ok(RecordKind::Message),
            "ack" => Ok(RecordKind::Ack),
            "sync" => Ok(RecordKind::Sync),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

/// Fields shared by every record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub sender: PeerId,
    pub epoch: SessionEpoch,
    pub timestamp_ms: u64,
}

impl RecordHeader {
    fn write(&self, kind: RecordKind, fields: &mut RecordFields) {
        fields.insert(FIELD_KIND, kind.as_wire());
        fields.insert(FIELD_SENDER, self.sender.as_str());
        fields.insert(FIELD_EPOCH, self.epoch.as_str());
        fields.insert(FIELD_TIMESTAMP, self.timestamp_ms.to_string());
    }

    fn read(fields: &RecordFields) -> Result<Self, CodecError> {
        let raw_sender = fields.required(FIELD_SENDER)?;
        let sender = PeerId::parse(raw_sender).map_err(|_| CodecError::InvalidField {
            field: FIELD_SENDER,
            value: raw_sender.to_string(),
        })?;
        Ok(Self {
            sender,
            epoch: SessionEpoch::from_wire(fields.required(FIELD_EPOCH)?),
            timestamp_ms: fields.required_u64(FIELD_TIMESTAMP)?,
        })
    }

    fn instance_name(&self, kind: RecordKind) -> String {
        format!("bcn-{}-{}", kind.as_wire(), self.sender.short())
    }
}

/// Periodic presence/heartbeat record with piggy-backed acks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub header: RecordHeader,
    pub display_name: String,
    pub heartbeat_seq: u64,
    pub acks: Vec<MessageId>,
}

/// One outbound message slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub header: RecordHeader,
    pub message_id: MessageId,
    pub text: String,
    pub slot: u8,
    pub target: Option<PeerId>,
    pub acks: Vec<MessageId>,
}

/// Dedicated best-effort ack record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub header: RecordHeader,
    pub acks: Vec<MessageId>,
}

/// Time-limited reconciliation record addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub header: RecordHeader,
    pub target_short: String,
    pub sent: Vec<MessageId>,
    pub recv: Vec<MessageId>,
}

impl PresenceRecord {
    pub fn instance_name(&self) -> String {
        self.header.instance_name(RecordKind::Presence)
    }

    pub fn encode(&self) -> Result<RecordFields, CodecError> {
        let mut fields = RecordFields::new();
        self.header.write(RecordKind::Presence, &mut fields);
        fields.insert_non_empty(FIELD_NAME, self.display_name.as_str());
        fields.insert(FIELD_HEARTBEAT, self.heartbeat_seq.to_string());
        fields.insert_non_empty(FIELD_ACK, encode_id_list(&self.acks));
        fields.ensure_within_budget()?;
        Ok(fields)
    }

    fn decode(header: RecordHeader, fields: &RecordFields) -> Result<Self, CodecError> {
        Ok(Self {
            header,
            display_name: fields.get(FIELD_NAME).unwrap_or_default().to_string(),
            heartbeat_seq: fields.required_u64(FIELD_HEARTBEAT)?,
            acks: decode_id_list(fields.get(FIELD_ACK)),
        })
    }
}

impl MessageRecord {
    pub fn instance_name(&self) -> String {
        format!(
            "{}-{}",
            self.header.instance_name(RecordKind::Message),
            self.slot
        )
    }

    /// Encodes the record, truncating text to `max_text_chars`.
    pub fn encode(&self, max_text_chars: usize) -> Result<RecordFields, CodecError> {
        let mut fields = RecordFields::new();
        self.header.write(RecordKind::Message, &mut fields);
        fields.insert(FIELD_MESSAGE_ID, self.message_id.as_str());
        fields.insert(FIELD_TEXT, truncate_text(&self.text, max_text_chars));
        fields.insert(FIELD_SLOT, self.slot.to_string());
        if let Some(target) = &self.target {
            fields.insert(FIELD_TARGET, target.as_str());
        }
        fields.insert_non_empty(FIELD_ACK, encode_id_list(&self.acks));
        fields.ensure_within_budget()?;
        Ok(fields)
    }

    fn decode(header: RecordHeader, fields: &RecordFields) -> Result<Self, CodecError> {
        let raw_slot = fields.required(FIELD_SLOT)?;
        let slot = raw_slot
            .trim()
            .parse::<u8>()
            .map_err(|_| CodecError::InvalidField {
                field: FIELD_SLOT,
                value: raw_slot.to_string(),
            })?;
        let target = match fields.get(FIELD_TARGET) {
            Some(raw) => Some(PeerId::parse(raw).map_err(|_| CodecError::InvalidField {
                field: FIELD_TARGET,
                value: raw.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            header,
            message_id: MessageId::from_wire(fields.required(FIELD_MESSAGE_ID)?),
            text: fields.get(FIELD_TEXT).unwrap_or_default().to_string(),
            slot,
            target,
            acks: decode_id_list(fields.get(FIELD_ACK)),
        })
    }
}

impl AckRecord {
    pub fn instance_name(&self) -> String {
        self.header.instance_name(RecordKind::Ack)
    }

    pub fn encode(&self) -> Result<RecordFields, CodecError> {
        let mut fields = RecordFields::new();
        self.header.write(RecordKind::Ack, &mut fields);
        fields.insert(FIELD_ACK, encode_id_list(&self.acks));
        fields.ensure_within_budget()?;
        Ok(fields)
    }

    fn decode(header: RecordHeader, fields: &RecordFields) -> Result<Self, CodecError> {
        let acks = decode_id_list(Some(fields.required(FIELD_ACK)?));
        Ok(Self { header, acks })
    }
}

impl SyncRecord {
    pub fn instance_name(&self) -> String {
        format!(
            "{}-{}",
            self.header.instance_name(RecordKind::Sync),
            self.target_short
        )
    }

    pub fn encode(&self) -> Result<RecordFields, CodecError> {
        let mut fields = RecordFields::new();
        self.header.write(RecordKind::Sync, &mut fields);
        fields.insert(FIELD_TARGET, self.target_short.as_str());
        fields.insert_non_empty(FIELD_SENT, encode_id_list(&self.sent));
        fields.insert_non_empty(FIELD_RECV, encode_id_list(&self.recv));
        fields.ensure_within_budget()?;
        Ok(fields)
    }

    fn decode(header: RecordHeader, fields: &RecordFields) -> Result<Self, CodecError> {
        Ok(Self {
            header,
            target_short: fields.required(FIELD_TARGET)?.to_string(),
            sent: decode_id_list(fields.get(FIELD_SENT)),
            recv: decode_id_list(fields.get(FIELD_RECV)),
        })
    }
}

/// A decoded inbound record, classified by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRecord {
    Presence(PresenceRecord),
    Message(MessageRecord),
    Ack(AckRecord),
    Sync(SyncRecord),
}

impl InboundRecord {
    pub fn decode(fields: &RecordFields) -> Result<Self, CodecError> {
        let kind = RecordKind::from_wire(fields.required(FIELD_KIND)?)?;
        let header = RecordHeader::read(fields)?;
        Ok(match kind {
            RecordKind::Presence => {
                InboundRecord::Presence(PresenceRecord::decode(header, fields)?)
            }
            RecordKind::Message => InboundRecord::Message(MessageRecord::decode(header, fields)?),
            RecordKind::Ack => InboundRecord::Ack(AckRecord::decode(header, fields)?),
            RecordKind::Sync => InboundRecord::Sync(SyncRecord::decode(header, fields)?),
        })
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            InboundRecord::Presence(_) => RecordKind::Presence,
            InboundRecord::Message(_) => RecordKind::Message,
            InboundRecord::Ack(_) => RecordKind::Ack,
            InboundRecord::Sync(_) => RecordKind::Sync,
        }
    }

    pub fn header(&self) -> &RecordHeader {
        match self {
            InboundRecord::Presence(r) => &r.header,
            InboundRecord::Message(r) => &r.header,
            InboundRecord::Ack(r) => &r.header,
            InboundRecord::Sync(r) => &r.header,
        }
    }

    /// Ack ids carried by this record, piggy-backed or dedicated.
    pub fn acks(&self) -> &[MessageId] {
        match self {
            InboundRecord::Presence(r) => &r.acks,
            InboundRecord::Message(r) => &r.acks,
            InboundRecord::Ack(r) => &r.acks,
            InboundRecord::Sync(_) => &[],
        }
    }

    /// Kind-specific discriminator used for short-window dedup.
    pub fn dedup_discriminator(&self) -> String {
        match self {
            InboundRecord::Presence(r) => r.heartbeat_seq.to_string(),
            InboundRecord::Message(r) => r.message_id.as_str().to_string(),
            InboundRecord::Ack(r) => encode_id_list(&r.acks),
            InboundRecord::Sync(r) => {
                format!(
                    "{}/{}/{}",
                    r.target_short,
                    encode_id_list(&r.sent),
                    encode_id_list(&r.recv)
                )
            }
        }
    }
}
