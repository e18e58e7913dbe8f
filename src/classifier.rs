use crate::config::SpamSettings;
use crate::error::{FilterError, Result};
use crate::facts::MessageFacts;
use crate::normalization::{
    contains_code_unit_above, non_whitelisted_count, special_character_tally, strip_punctuation,
    AccentFolder, NON_LATIN_CODE_UNIT_CUTOFF,
};
use crate::reputation::ReputationLookup;
use crate::training::{TrainingRecord, TrainingSink};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_spam: bool,
    pub reason: String,
}

impl Classification {
    pub fn spam(reason: impl Into<String>) -> Self {
        Classification {
            is_spam: true,
            reason: reason.into(),
        }
    }

    pub fn ham(reason: impl Into<String>) -> Self {
        Classification {
            is_spam: false,
            reason: reason.into(),
        }
    }
}

pub struct Classifier {
    reputation: Arc<dyn ReputationLookup>,
    folder: AccentFolder,
    training_sink: Option<Box<dyn TrainingSink>>,
}

impl Classifier {
    pub fn new(reputation: Arc<dyn ReputationLookup>) -> Self {
        Classifier {
            reputation,
            folder: AccentFolder::new(),
            training_sink: None,
        }
    }

    pub fn with_training_sink(mut self, sink: Box<dyn TrainingSink>) -> Self {
        self.training_sink = Some(sink);
        self
    }

    pub async fn classify_facts(
        &self,
        facts: &MessageFacts,
        settings: Option<&SpamSettings>,
    ) -> Result<Classification> {
        self.classify(
            &facts.ip_addresses,
            Some(&facts.subject),
            Some(&facts.body),
            Some(&facts.sender_name),
            Some(&facts.sender_address),
            settings,
        )
        .await
    }

    /// Decide whether a message is spam. The checks run in a fixed order
    /// and the first one that fires supplies the verdict and the reason.
    pub async fn classify(
        &self,
        ip_addresses: &[IpAddr],
        subject: Option<&str>,
        body: Option<&str>,
        sender_name: Option<&str>,
        sender_address: Option<&str>,
        settings: Option<&SpamSettings>,
    ) -> Result<Classification> {
        let settings = settings.ok_or_else(|| {
            FilterError::Configuration("no spam filter settings available".to_string())
        })?;
        let subject = subject.unwrap_or("");
        let body = body.unwrap_or("");
        let sender_name = sender_name.unwrap_or("");
        let sender_address = sender_address.unwrap_or("");

        let classification = self
            .evaluate(ip_addresses, subject, sender_name, sender_address, settings)
            .await?;

        if let Some(sink) = &self.training_sink {
            let record = TrainingRecord {
                timestamp: chrono::Utc::now(),
                subject: subject.to_string(),
                body: body.to_string(),
                sender_name: sender_name.to_string(),
                sender_address: sender_address.to_string(),
                is_spam: classification.is_spam,
            };
            if let Err(e) = sink.record(&record) {
                log::warn!("Failed to write training record: {e}");
            }
        }

        Ok(classification)
    }

    async fn evaluate(
        &self,
        ip_addresses: &[IpAddr],
        subject: &str,
        sender_name: &str,
        sender_address: &str,
        settings: &SpamSettings,
    ) -> Result<Classification> {
        if contains_code_unit_above(sender_address, NON_LATIN_CODE_UNIT_CUTOFF) {
            return Ok(Classification::spam(
                "the sender email contains non-latin characters",
            ));
        }
        if contains_code_unit_above(sender_name, NON_LATIN_CODE_UNIT_CUTOFF) {
            return Ok(Classification::spam(
                "the sender name contains non-latin characters",
            ));
        }

        let address_lower = sender_address.to_lowercase();
        if settings
            .sender_whitelist
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .any(|entry| address_lower.contains(&entry.to_lowercase()))
        {
            return Ok(Classification::ham(format!(
                "Sender white list contains a part of this sender ({sender_address})"
            )));
        }

        for ip in ip_addresses {
            let listings = self.reputation.look_up(*ip).await?;
            if !listings.is_empty() {
                return Ok(Classification::spam(format!(
                    "sender IP {ip} is listed on {}",
                    listings.join(",")
                )));
            }
        }

        let non_latin = non_whitelisted_count(subject, &settings.character_whitelist);
        if non_latin > settings.non_latin_characters_subject_threshold {
            return Ok(Classification::spam(format!(
                "{non_latin} of {} characters are non-latin in subject",
                subject.chars().count()
            )));
        }

        let whitelist = settings.special_character_whitelist.as_str();
        let name_stripped = strip_punctuation(sender_name);
        let subject_stripped = strip_punctuation(subject);
        let checks: [(&str, usize, &str); 5] = [
            (
                sender_address,
                settings.special_characters_sender_email_threshold,
                " in sender email",
            ),
            (
                sender_name,
                settings.special_characters_sender_name_threshold,
                " in sender name",
            ),
            (
                &name_stripped,
                settings.special_characters_sender_name_threshold,
                " in sender name",
            ),
            (
                subject,
                settings.special_characters_subject_threshold,
                " in subject",
            ),
            (
                &subject_stripped,
                settings.special_characters_subject_threshold,
                " in subject",
            ),
        ];
        for (text, threshold, location) in checks {
            let tally = special_character_tally(text, whitelist);
            if tally.max > threshold {
                return Ok(Classification::spam(format!("{}{location}", tally.details)));
            }
        }

        if let Some(word) = self
            .folder
            .first_match(&settings.sender_blacklist, &[sender_name, sender_address])
        {
            return Ok(Classification::spam(format!(
                "the sender contains the blacklisted word '{word}'"
            )));
        }

        if !subject.is_empty() {
            if let Some(word) = self
                .folder
                .first_match(&settings.subject_blacklist, &[subject])
            {
                return Ok(Classification::spam(format!(
                    "the subject contains the blacklisted word '{word}'"
                )));
            }
        }

        let mut texts = vec![sender_name, sender_address];
        if !subject.is_empty() {
            texts.push(subject);
        }
        if let Some(word) = self.folder.first_match(&settings.general_blacklist, &texts) {
            return Ok(Classification::spam(format!(
                "the mail contains the blacklisted word '{word}'"
            )));
        }

        Ok(Classification::ham(""))
    }
}
