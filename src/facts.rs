use crate::message::MailMessage;
use chrono::{DateTime, FixedOffset};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};

lazy_static! {
    static ref RECEIVED_IP: Regex =
        Regex::new(r"\[(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]").unwrap();
}

/// Everything the classifier and the rules look at, derived from one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFacts {
    pub message_id: String,
    pub sender_name: String,
    pub sender_address: String,
    pub receiver: String,
    pub subject: String,
    pub body: String,
    /// All headers as `name: value` lines, lower-cased.
    pub headers: String,
    pub ip_addresses: Vec<IpAddr>,
    pub date: Option<DateTime<FixedOffset>>,
}

impl MessageFacts {
    /// Fixed-width one-line description used in decision logs.
    pub fn summary(&self) -> String {
        let date = self
            .date
            .map(|d| d.format("%d.%m.%Y %H:%M:%S").to_string())
            .unwrap_or_default();
        let from = if self.sender_name == self.sender_address {
            self.sender_address.clone()
        } else {
            format!("{} <{}>", self.sender_name, self.sender_address)
        };
        format!(
            "{date:<22}{}  {}",
            fit_width(&from, 40),
            fit_width(&self.subject, 60)
        )
    }
}

fn fit_width(text: &str, width: usize) -> String {
    let truncated: String = text.chars().take(width).collect();
    format!("{truncated:<width$}")
}

pub struct FactExtractor;

impl FactExtractor {
    pub fn extract(message: &MailMessage) -> MessageFacts {
        let (sender_name, sender_address) = Self::split_sender(&message.from);

        MessageFacts {
            message_id: message.identifier(),
            sender_name,
            sender_address,
            receiver: message.to.join(", "),
            subject: message.subject.clone(),
            body: Self::body_text(message),
            headers: message
                .headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect::<Vec<_>>()
                .join("\n")
                .to_lowercase(),
            ip_addresses: Self::source_addresses(&message.headers),
            date: message.date,
        }
    }

    /// Split `"Name" <address>` into its parts. Anything not shaped like
    /// that yields the raw string for both.
    pub fn split_sender(raw: &str) -> (String, String) {
        let quoted = raw.find('"').and_then(|open| {
            raw[open + 1..]
                .find('"')
                .map(|close| (open + 1, open + 1 + close))
        });
        let angled = raw.find('<').and_then(|open| {
            raw[open + 1..]
                .find('>')
                .map(|close| (open + 1, open + 1 + close))
        });

        match (quoted, angled) {
            (Some((name_start, name_end)), Some((addr_start, addr_end))) => (
                raw[name_start..name_end].to_string(),
                raw[addr_start..addr_end].to_string(),
            ),
            _ => (raw.to_string(), raw.to_string()),
        }
    }

    /// Richest available representation: html, then rich text, then plain.
    pub fn body_text(message: &MailMessage) -> String {
        [
            &message.html_body,
            &message.rich_text_body,
            &message.text_body,
        ]
        .into_iter()
        .flatten()
        .find(|body| !body.is_empty())
        .cloned()
        .unwrap_or_default()
    }

    /// First bracketed IPv4 address of every `Received` header, deduplicated.
    pub fn source_addresses(headers: &[(String, String)]) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = Vec::new();

        for (_, value) in headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("received"))
        {
            let parsed = RECEIVED_IP
                .captures(value)
                .and_then(|caps| caps[1].parse::<Ipv4Addr>().ok());
            if let Some(ip) = parsed.map(IpAddr::V4) {
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }

        addresses
    }
}
