use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,
    #[serde(default)]
    pub state_file: Option<String>,
    #[serde(default)]
    pub training_sink: Option<String>,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    pub general_spamfilter_settings: SpamSettings,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Root of the account's Maildir++ tree.
    pub mailbox_path: String,
    #[serde(default = "default_inbox")]
    pub inbox_folder: String,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub starttls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Address used as sender of forwarded mail.
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub if_mail_is_spam: bool,
    #[serde(default)]
    pub if_mail_was_sent_by: Vec<String>,
    #[serde(default)]
    pub if_mail_was_sent_to: Vec<String>,
    #[serde(default)]
    pub if_mail_contains_words_in_header: Vec<String>,
    #[serde(default)]
    pub if_mail_contains_words_in_subject: Vec<String>,
    #[serde(default)]
    pub if_mail_contains_words_in_body: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub stop_after_action: bool,
    /// Rule specific settings, only honoured when the special character
    /// whitelist is not blank.
    #[serde(default)]
    pub spamfilter_settings: Option<SpamSettings>,
}

impl Rule {
    pub fn new(name: &str) -> Self {
        Rule {
            name: name.to_string(),
            if_mail_is_spam: false,
            if_mail_was_sent_by: Vec::new(),
            if_mail_was_sent_to: Vec::new(),
            if_mail_contains_words_in_header: Vec::new(),
            if_mail_contains_words_in_subject: Vec::new(),
            if_mail_contains_words_in_body: Vec::new(),
            actions: Vec::new(),
            stop_after_action: false,
            spamfilter_settings: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    MoveToFolder {
        folder: String,
    },
    Forward {
        receiver: String,
        subject: Option<String>,
        body: Option<String>,
    },
    MarkAsRead,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::MoveToFolder { .. } => "MoveToFolder",
            Action::Forward { .. } => "Forward",
            Action::MarkAsRead => "MarkAsRead",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamSettings {
    pub recheck_every_unread_message: bool,
    /// Characters that are never counted as special characters.
    pub special_character_whitelist: String,
    /// Full alphabet a subject is expected to be written in.
    pub character_whitelist: String,
    pub special_characters_sender_email_threshold: usize,
    pub special_characters_sender_name_threshold: usize,
    pub special_characters_subject_threshold: usize,
    pub non_latin_characters_subject_threshold: usize,
    pub sender_whitelist: Vec<String>,
    pub sender_blacklist: Vec<String>,
    pub subject_blacklist: Vec<String>,
    pub general_blacklist: Vec<String>,
}

impl SpamSettings {
    /// Settings suitable for mostly German/English mailboxes.
    pub fn recommended() -> Self {
        SpamSettings {
            recheck_every_unread_message: false,
            special_character_whitelist:
                "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyzäöüÄÖÜß?!§$%&/()[]<>'#*@_-.,: "
                    .to_string(),
            character_whitelist:
                "abcdefghijklmnopqrstuvwxyzäöüßABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÜ0123456789<>|,;.:-_#'+*~´`?\\!\"§$%&/()[]="
                    .to_string(),
            special_characters_sender_email_threshold: 3,
            special_characters_sender_name_threshold: 3,
            special_characters_subject_threshold: 5,
            non_latin_characters_subject_threshold: 5,
            sender_whitelist: Vec::new(),
            sender_blacklist: Vec::new(),
            subject_blacklist: Vec::new(),
            general_blacklist: Vec::new(),
        }
    }

    pub fn has_special_character_whitelist(&self) -> bool {
        !self.special_character_whitelist.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// DNSBL zone queried for every sender IP.
    pub zone: String,
    pub bootstrap_v4: Vec<IpAddr>,
    pub bootstrap_v6: Vec<IpAddr>,
    pub use_ipv6: bool,
    pub use_cache: bool,
    /// Treat DNS failures as "not listed" instead of returning an error.
    pub quiet_mode: bool,
    pub query_timeout_seconds: u64,
    /// Static allow/deny lists (file paths or http(s) URLs) in
    /// `network/mask ; identifier` format.
    pub feeds: Vec<String>,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            zone: "zen.spamhaus.org".to_string(),
            bootstrap_v4: vec![
                IpAddr::from([8, 8, 8, 8]),
                IpAddr::from([8, 8, 4, 4]),
            ],
            bootstrap_v6: vec![
                IpAddr::from([0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888]),
                IpAddr::from([0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8844]),
            ],
            use_ipv6: false,
            use_cache: true,
            quiet_mode: true,
            query_timeout_seconds: 10,
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
    pub sliding_expiration_hours: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            capacity: 10_000,
            sliding_expiration_hours: 24,
        }
    }
}

fn default_check_interval() -> u64 {
    5
}

fn default_inbox() -> String {
    "INBOX".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        let mut spam_rule = Rule::new("Move spam to junk folder");
        spam_rule.if_mail_is_spam = true;
        spam_rule.actions = vec![Action::MoveToFolder {
            folder: "Junk".to_string(),
        }];
        spam_rule.stop_after_action = true;

        let mut sales_rule = Rule::new("Forward sales enquiries");
        sales_rule.if_mail_was_sent_to = vec!["sales@".to_string()];
        sales_rule.actions = vec![
            Action::Forward {
                receiver: "sales-team@example.com".to_string(),
                subject: None,
                body: None,
            },
            Action::MarkAsRead,
        ];

        let mut settings = SpamSettings::recommended();
        settings.general_blacklist = vec!["bitcoin".to_string(), "[casino*bonus]".to_string()];

        Config {
            check_interval_minutes: default_check_interval(),
            state_file: None,
            training_sink: None,
            reputation: ReputationConfig::default(),
            dedup: DedupConfig::default(),
            general_spamfilter_settings: settings,
            accounts: vec![AccountConfig {
                name: "default".to_string(),
                mailbox_path: "/var/mail/Maildir".to_string(),
                inbox_folder: default_inbox(),
                smtp: None,
                rules: vec![spam_rule, sales_rule],
            }],
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the structural requirements serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_interval_minutes == 0 {
            bail!("check_interval_minutes must be greater than zero");
        }
        if self.reputation.zone.trim().is_empty() {
            bail!("reputation.zone must not be empty");
        }
        if self.reputation.query_timeout_seconds == 0 {
            bail!("reputation.query_timeout_seconds must be greater than zero");
        }
        if self.dedup.capacity == 0 {
            bail!("dedup.capacity must be greater than zero");
        }

        for account in &self.accounts {
            if account.name.trim().is_empty() {
                bail!("every account needs a name");
            }
            if account.mailbox_path.trim().is_empty() {
                bail!("account '{}' has no mailbox_path", account.name);
            }
            for rule in &account.rules {
                for action in &rule.actions {
                    match action {
                        Action::MoveToFolder { folder } if folder.trim().is_empty() => {
                            bail!(
                                "rule '{}' of account '{}' moves to an empty folder name",
                                rule.name,
                                account.name
                            );
                        }
                        Action::Forward { receiver, .. } if receiver.trim().is_empty() => {
                            bail!(
                                "rule '{}' of account '{}' forwards to an empty receiver",
                                rule.name,
                                account.name
                            );
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    pub fn log_options(&self) {
        log::debug!("Blocklist zone                    : {}", self.reputation.zone);
        log::debug!(
            "Blocklist feeds                   : {}",
            self.reputation.feeds.join(",")
        );
        log::debug!(
            "Accounts                          : {}",
            self.accounts
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
}

/// Re-reads the configuration file only when its modification time changes.
/// A snapshot is offered again until the caller reports it as applied.
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    pending: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl AsRef<Path>) -> Self {
        ConfigWatcher {
            path: path.as_ref().to_path_buf(),
            last_modified: None,
            pending: None,
        }
    }

    /// Returns a fresh snapshot on the first call and whenever the file was
    /// modified since the last applied snapshot.
    pub fn reload_if_changed(&mut self) -> anyhow::Result<Option<Config>> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", self.path.display()))?;

        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let config = Config::from_file(&self.path.to_string_lossy())?;
        config.validate()?;
        self.pending = Some(modified);
        Ok(Some(config))
    }

    /// Record the last returned snapshot as in effect.
    pub fn mark_applied(&mut self) {
        if let Some(modified) = self.pending.take() {
            self.last_modified = Some(modified);
        }
    }
}
