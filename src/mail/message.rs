//! SMS to mail item encoding
//!
//! Each SMS becomes one RFC 822 message. The sender/recipient pair follows the
//! SMS direction and the SMS metadata is kept in `X-smssync-*` headers so a
//! later restore can rebuild the original record.

use crate::mail::{MailError, MailResult};
use chrono::{DateTime, Utc};
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Mailbox, Message};
use lettre::Address;
use serde::{Deserialize, Serialize};
use std::time::{Duration, UNIX_EPOCH};

/// Domain used for contact addresses, which are phone numbers rather than mail addresses
const CONTACT_DOMAIN: &str = "unknown.email";

/// Version of the header layout written by this encoder
const BACKUP_FORMAT_VERSION: &str = "1";

/// SMS box the message was read from (Android `type` codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsKind {
    Inbox,
    Sent,
    Draft,
    Outbox,
    Failed,
    Queued,
}

impl SmsKind {
    pub fn code(&self) -> i32 {
        match self {
            SmsKind::Inbox => 1,
            SmsKind::Sent => 2,
            SmsKind::Draft => 3,
            SmsKind::Outbox => 4,
            SmsKind::Failed => 5,
            SmsKind::Queued => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(SmsKind::Inbox),
            2 => Some(SmsKind::Sent),
            3 => Some(SmsKind::Draft),
            4 => Some(SmsKind::Outbox),
            5 => Some(SmsKind::Failed),
            6 => Some(SmsKind::Queued),
            _ => None,
        }
    }

    /// Whether the message was received (contact is the sender)
    pub fn is_incoming(&self) -> bool {
        matches!(self, SmsKind::Inbox)
    }
}

/// One local SMS record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: i64,
    #[serde(default)]
    pub thread_id: Option<i64>,
    pub address: String,
    /// Milliseconds since the Unix epoch
    pub date: i64,
    pub kind: SmsKind,
    pub body: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub protocol: Option<i32>,
    #[serde(default)]
    pub service_center: Option<String>,
}

impl SmsMessage {
    pub fn new(id: i64, address: impl Into<String>, date: i64, kind: SmsKind, body: impl Into<String>) -> Self {
        Self {
            id,
            thread_id: None,
            address: address.into(),
            date,
            kind,
            body: body.into(),
            read: true,
            status: None,
            protocol: None,
            service_center: None,
        }
    }
}

/// Encode `sms` as an RFC 822 message owned by `owner_address`.
pub fn encode_message(
    sms: &SmsMessage,
    owner_address: &str,
    backup_time: DateTime<Utc>,
) -> MailResult<Vec<u8>> {
    let owner: Mailbox = owner_address
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            MailError::Message(format!("Invalid owner address: {}", e))
        })?;
    let contact = contact_mailbox(&sms.address)?;

    let (from, to) = if sms.kind.is_incoming() {
        (contact, owner)
    } else {
        (owner, contact)
    };

    let sent_at = UNIX_EPOCH + Duration::from_millis(sms.date.max(0) as u64);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(format!("SMS with {}", display_address(&sms.address)))
        .date(sent_at)
        .message_id(Some(format!("<{}@sms-backup>", uuid::Uuid::new_v4())))
        .header(ContentType::TEXT_PLAIN);

    let mut headers: Vec<(&'static str, String)> = vec![
        ("X-smssync-id", sms.id.to_string()),
        ("X-smssync-address", sanitize_header_value(&sms.address)),
        ("X-smssync-type", sms.kind.code().to_string()),
        ("X-smssync-date", sms.date.to_string()),
        ("X-smssync-read", if sms.read { "1" } else { "0" }.to_string()),
        ("X-smssync-backup-time", backup_time.to_rfc3339()),
        ("X-smssync-version", BACKUP_FORMAT_VERSION.to_string()),
    ];
    if let Some(thread_id) = sms.thread_id {
        headers.push(("X-smssync-thread", thread_id.to_string()));
    }
    if let Some(status) = sms.status {
        headers.push(("X-smssync-status", status.to_string()));
    }
    if let Some(protocol) = sms.protocol {
        headers.push(("X-smssync-protocol", protocol.to_string()));
    }
    if let Some(center) = &sms.service_center {
        headers.push(("X-smssync-service-center", sanitize_header_value(center)));
    }

    for (name, value) in headers {
        builder = builder.raw_header(HeaderValue::new(HeaderName::new_from_ascii_str(name), value));
    }

    let message = builder
        .body(sms.body.clone())
        .map_err(|e| MailError::Message(format!("Failed to build message: {}", e)))?;

    Ok(message.formatted())
}

/// Mailbox for a phone number: digits and `+` kept as the local part
fn contact_mailbox(address: &str) -> MailResult<Mailbox> {
    let local: String = address
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '+' || *c == '-' || *c == '_')
        .collect();
    let local = if local.is_empty() { "unknown".to_string() } else { local };

    let email = Address::new(local, CONTACT_DOMAIN)
        .map_err(|e| MailError::Message(format!("Invalid contact address: {}", e)))?;
    let name = display_address(address);

    Ok(Mailbox::new(if name.is_empty() { None } else { Some(name) }, email))
}

fn display_address(address: &str) -> String {
    sanitize_header_value(address.trim())
}

/// Strip characters that cannot appear in a single header line
fn sanitize_header_value(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}
