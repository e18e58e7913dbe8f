use chrono::{DateTime, FixedOffset, Utc};
use mail_parser::{Addr, Address, MessageParser, MimeHeaders, PartType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message as delivered by a mailbox connector.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    /// Connector specific handle (file name for Maildir).
    pub key: String,
    pub message_id: Option<String>,
    /// `"Name" <address>`, or the bare address when there is no name.
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<FixedOffset>>,
    /// Every header occurrence in order, continuation lines unfolded.
    pub headers: Vec<(String, String)>,
    pub html_body: Option<String>,
    pub rich_text_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MailMessage {
    /// Read an RFC 822 message. `key` identifies it inside its mailbox.
    pub fn parse(raw: impl AsRef<[u8]>, key: &str) -> Self {
        let mut message = MailMessage {
            key: key.to_string(),
            ..Default::default()
        };

        let Some(parsed) = MessageParser::default().parse(raw.as_ref()) else {
            log::debug!("Message {key} has no parsable header block");
            return message;
        };

        message.headers = parsed
            .headers_raw()
            .map(|(name, value)| (name.to_string(), unfold(value)))
            .collect();
        message.from = format_addresses(parsed.from())
            .into_iter()
            .next()
            .unwrap_or_default();
        message.to = format_addresses(parsed.to());
        message.subject = parsed.subject().unwrap_or_default().to_string();
        message.message_id = parsed
            .message_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        message.date = parsed.date().and_then(to_chrono);

        message.html_body = parsed
            .html_body
            .iter()
            .filter_map(|id| parsed.parts.get(*id))
            .find_map(|part| match &part.body {
                PartType::Html(html) => Some(html.to_string()),
                _ => None,
            });

        for part in &parsed.parts {
            let PartType::Text(text) = &part.body else {
                continue;
            };
            let subtype = part
                .content_type()
                .and_then(|ct| ct.subtype())
                .unwrap_or("plain")
                .to_ascii_lowercase();
            if matches!(subtype.as_str(), "enriched" | "richtext") {
                message.rich_text_body.get_or_insert_with(|| text.to_string());
            }
        }

        message.text_body = parsed
            .text_body
            .iter()
            .filter_map(|id| parsed.parts.get(*id))
            .find_map(|part| match &part.body {
                PartType::Text(text) if Some(&**text) != message.rich_text_body.as_deref() => {
                    Some(text.to_string())
                }
                _ => None,
            });

        message.attachments = parsed
            .attachments()
            .map(|part| Attachment {
                filename: part.attachment_name().unwrap_or("attachment").to_string(),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string())
                    .to_ascii_lowercase(),
                data: part.contents().to_vec(),
            })
            .collect();

        message
    }

    /// First value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Stable identifier used by the dedup gate: `Message-ID`, else the
    /// `Date` header, else the connector key.
    pub fn identifier(&self) -> String {
        if let Some(id) = &self.message_id {
            return id.clone();
        }
        match self.header("date") {
            Some(date) if !date.is_empty() => date.to_string(),
            _ => self.key.clone(),
        }
    }
}

fn unfold(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn format_addresses(address: Option<&Address>) -> Vec<String> {
    let Some(address) = address else {
        return Vec::new();
    };
    let mailboxes: Vec<&Addr> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    mailboxes.into_iter().filter_map(format_mailbox).collect()
}

fn format_mailbox(mailbox: &Addr) -> Option<String> {
    match (mailbox.name(), mailbox.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => {
            Some(format!("\"{}\" <{address}>", name.trim()))
        }
        (_, Some(address)) => Some(address.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

fn to_chrono(date: &mail_parser::DateTime) -> Option<DateTime<FixedOffset>> {
    let sign = if date.tz_before_gmt { -1 } else { 1 };
    let offset = FixedOffset::east_opt(
        sign * (i32::from(date.tz_hour) * 3600 + i32::from(date.tz_minute) * 60),
    )?;
    Some(DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0)?.with_timezone(&offset))
}
