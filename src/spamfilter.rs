use crate::cache::DedupCache;
use crate::classifier::Classifier;
use crate::config::{AccountConfig, Config, SpamSettings};
use crate::error::Result;
use crate::facts::FactExtractor;
use crate::mailbox::{resolve_folder, Connector, MailSender, Mailbox};
use crate::message::MailMessage;
use crate::reputation::ReputationResolver;
use crate::rules::{ActionContext, MessageVerdicts, RuleEvaluator};
use crate::state::StateFile;
use crate::training::JsonLinesSink;
use std::sync::Arc;

/// Outcome of one pass over all accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub accounts: usize,
    pub failed_accounts: Vec<String>,
    pub messages: usize,
    pub matched: usize,
}

#[derive(Debug, Default)]
struct AccountStats {
    messages: usize,
    matched: usize,
}

/// Runs the rules of every configured account against its unread mail.
pub struct Spamfilter {
    config: Config,
    connector: Box<dyn Connector>,
    resolver: Arc<ReputationResolver>,
    evaluator: RuleEvaluator,
    dedup: DedupCache,
    state: StateFile,
    general_settings: SpamSettings,
}

impl Spamfilter {
    pub fn new(config: Config, connector: Box<dyn Connector>) -> Self {
        let resolver = Arc::new(ReputationResolver::new(config.reputation.clone()));
        Self::with_resolver(config, connector, resolver)
    }

    pub fn with_resolver(
        config: Config,
        connector: Box<dyn Connector>,
        resolver: Arc<ReputationResolver>,
    ) -> Self {
        let evaluator = build_evaluator(&config, &resolver);
        let dedup = DedupCache::new(&config.dedup);
        let state = StateFile::default();
        let general_settings = merge_blocked_senders(&config.general_spamfilter_settings, &state);

        Spamfilter {
            config,
            connector,
            resolver,
            evaluator,
            dedup,
            state,
            general_settings,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<ReputationResolver> {
        &self.resolver
    }

    pub fn set_state(&mut self, state: StateFile) {
        self.general_settings =
            merge_blocked_senders(&self.config.general_spamfilter_settings, &state);
        self.state = state;
    }

    pub fn state(&self) -> &StateFile {
        &self.state
    }

    /// Load the configured blocklist feeds and discover the blocklist servers.
    pub async fn initialize(&self) -> Result<()> {
        self.resolver.load_configured_feeds().await?;
        self.resolver.initialize().await
    }

    /// Evaluate all unread mail of every account once. A failing account is
    /// logged and never keeps the others from being processed.
    pub async fn process_all_accounts(&mut self) -> PassSummary {
        let accounts = self.config.accounts.clone();
        let mut summary = PassSummary {
            accounts: accounts.len(),
            ..Default::default()
        };

        for account in &accounts {
            log::debug!("Checking account '{}'", account.name);
            match self.process_account(account).await {
                Ok(stats) => {
                    summary.messages += stats.messages;
                    summary.matched += stats.matched;
                }
                Err(e) => {
                    log::error!("Account '{}' failed: {e}", account.name);
                    summary.failed_accounts.push(account.name.clone());
                }
            }
        }

        summary
    }

    async fn process_account(&mut self, account: &AccountConfig) -> Result<AccountStats> {
        let mut mailbox = self.connector.mailbox(account)?;
        let sender = self.connector.sender(account)?;

        mailbox.open().await?;
        let result = self
            .process_mailbox(account, mailbox.as_mut(), sender.as_deref())
            .await;
        if let Err(e) = mailbox.close().await {
            log::warn!("Failed to close mailbox of '{}': {e}", account.name);
        }
        result
    }

    async fn process_mailbox(
        &mut self,
        account: &AccountConfig,
        mailbox: &mut dyn Mailbox,
        sender: Option<&dyn MailSender>,
    ) -> Result<AccountStats> {
        let inbox = resolve_folder(&*mailbox, &account.inbox_folder).await?;
        let messages = mailbox.fetch_unread(&inbox).await?;
        if messages.is_empty() {
            log::debug!("No new mail in '{}' of '{}'", inbox, account.name);
        }

        let mut stats = AccountStats::default();
        for mut message in messages {
            stats.messages += 1;
            if self
                .process_message(account, mailbox, sender, &inbox, &mut message)
                .await?
            {
                stats.matched += 1;
            }
        }
        Ok(stats)
    }

    /// Returns whether any rule matched the message.
    async fn process_message(
        &mut self,
        account: &AccountConfig,
        mailbox: &mut dyn Mailbox,
        sender: Option<&dyn MailSender>,
        inbox: &str,
        message: &mut MailMessage,
    ) -> Result<bool> {
        let facts = FactExtractor::extract(message);

        if !self.general_settings.recheck_every_unread_message
            && self.dedup.seen(&facts.message_id)
        {
            log::trace!("Already checked {}", facts.message_id);
            return Ok(false);
        }

        let mut ctx = ActionContext {
            mailbox,
            sender,
            forward_from: account.smtp.as_ref().map(|smtp| smtp.from.as_str()),
            message,
            folder: inbox.to_string(),
        };

        let mut verdicts = MessageVerdicts::new();
        let mut matched = false;
        for rule in &account.rules {
            let outcome = self
                .evaluator
                .evaluate(rule, &facts, Some(&self.general_settings), &mut verdicts)
                .await?;
            if !outcome.matched {
                continue;
            }
            matched = true;
            if let Some(reason) = &outcome.spam_reason {
                log::info!("SPAM      : {}  Reason: {reason}", facts.summary());
            }
            log::info!("Rule '{}' matched: {}", rule.name, outcome.reason);

            let acted = self
                .evaluator
                .execute_actions(rule, &facts, &mut ctx)
                .await?;
            if acted && rule.stop_after_action {
                log::debug!("Rule '{}' stops further rules", rule.name);
                break;
            }
        }

        if !matched {
            log::debug!("OK        : {}", facts.summary());
        }
        Ok(matched)
    }

    /// Re-evaluate all unread mail on the next pass.
    pub fn forget_processed_messages(&mut self) {
        self.dedup.reset();
        log::info!("Forgot all processed messages");
    }

    pub async fn reinitialize_resolver(&self) -> Result<()> {
        self.resolver.initialize().await
    }

    /// Switch to a new configuration snapshot. Processed messages are
    /// forgotten and the resolver rediscovers its servers; a changed
    /// reputation section starts with a fresh resolver. Nothing changes
    /// when the new resolver cannot be prepared.
    pub async fn apply_config(&mut self, config: Config) -> Result<()> {
        let resolver = if config.reputation != self.config.reputation {
            let resolver = Arc::new(ReputationResolver::new(config.reputation.clone()));
            resolver.load_configured_feeds().await?;
            resolver
        } else {
            self.resolver.clone()
        };
        resolver.initialize().await?;

        self.evaluator = build_evaluator(&config, &resolver);
        self.dedup = DedupCache::new(&config.dedup);
        self.general_settings =
            merge_blocked_senders(&config.general_spamfilter_settings, &self.state);
        self.resolver = resolver;
        self.config = config;
        log::info!("Configuration reloaded");
        Ok(())
    }
}

fn build_evaluator(config: &Config, resolver: &Arc<ReputationResolver>) -> RuleEvaluator {
    let mut classifier = Classifier::new(resolver.clone());
    if let Some(path) = &config.training_sink {
        classifier = classifier.with_training_sink(Box::new(JsonLinesSink::new(path)));
    }
    RuleEvaluator::new(Arc::new(classifier))
}

fn merge_blocked_senders(settings: &SpamSettings, state: &StateFile) -> SpamSettings {
    let mut settings = settings.clone();
    for sender in &state.blocked_senders {
        if !settings.sender_blacklist.contains(sender) {
            settings.sender_blacklist.push(sender.clone());
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Action, Rule, SmtpConfig};
    use crate::test_support::{MemoryMailbox, OfflineTransport, RecordingSender, TestConnector};

    const SPAM: &str = "From: \"Sam Spammer\" <spammer@evil.net>\nTo: me@example.com\n\
        Subject: bitcoin wholesale\nMessage-ID: <spam-1@evil.net>\n\nbuy\n";
    const SALES: &str = "From: \"Jane Doe\" <jane@customer.org>\nTo: sales@example.com\n\
        Subject: quote request\nMessage-ID: <sales-1@customer.org>\n\nplease\n";
    const PLAIN: &str = "From: \"Bob\" <bob@friend.org>\nTo: me@example.com\n\
        Subject: lunch\nMessage-ID: <lunch-1@friend.org>\n\nnoon?\n";

    fn account(name: &str, rules: Vec<Rule>) -> AccountConfig {
        AccountConfig {
            name: name.to_string(),
            mailbox_path: String::new(),
            inbox_folder: "inbox".to_string(),
            smtp: Some(SmtpConfig {
                host: "localhost".to_string(),
                port: 25,
                starttls: false,
                username: None,
                password: None,
                from: "filter@example.com".to_string(),
            }),
            rules,
        }
    }

    fn spam_rule() -> Rule {
        let mut rule = Rule::new("spam");
        rule.if_mail_is_spam = true;
        rule.actions = vec![
            Action::MoveToFolder {
                folder: "Junk".to_string(),
            },
            Action::MarkAsRead,
        ];
        rule.stop_after_action = true;
        rule
    }

    fn sales_rule() -> Rule {
        let mut rule = Rule::new("sales");
        rule.if_mail_was_sent_to = vec!["sales@".to_string()];
        rule.actions = vec![Action::Forward {
            receiver: "team@example.com".to_string(),
            subject: None,
            body: None,
        }];
        rule
    }

    fn config(accounts: Vec<AccountConfig>) -> Config {
        let mut config = Config::default();
        config.general_spamfilter_settings.general_blacklist = vec!["bitcoin".to_string()];
        config.accounts = accounts;
        config
    }

    fn spamfilter(config: Config, connector: TestConnector) -> Spamfilter {
        let resolver = Arc::new(ReputationResolver::with_transport(
            config.reputation.clone(),
            Box::new(OfflineTransport),
        ));
        Spamfilter::with_resolver(config, Box::new(connector), resolver)
    }

    fn mailbox() -> MemoryMailbox {
        let mailbox = MemoryMailbox::with_folders(&["INBOX", "Junk"]);
        mailbox.deliver("INBOX", SPAM, "1");
        mailbox.deliver("INBOX", SALES, "2");
        mailbox.deliver("INBOX", PLAIN, "3");
        mailbox
    }

    #[tokio::test]
    async fn test_pass_moves_spam_and_forwards_sales() {
        let home = mailbox();
        let sender = RecordingSender::default();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(sender.clone());

        let mut filter = spamfilter(
            config(vec![account("home", vec![spam_rule(), sales_rule()])]),
            connector,
        );
        let summary = filter.process_all_accounts().await;

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.matched, 2);
        assert!(summary.failed_accounts.is_empty());
        assert_eq!(home.contents("Junk"), vec![("1".to_string(), true)]);
        assert_eq!(
            home.contents("INBOX"),
            vec![("2".to_string(), false), ("3".to_string(), false)]
        );

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "filter@example.com");
        assert_eq!(sent[0].subject, "FW: quote request");

        let state = home.state.lock().unwrap();
        assert_eq!((state.opened, state.closed), (1, 1));
    }

    #[tokio::test]
    async fn test_processed_messages_are_skipped_until_forgotten() {
        let home = mailbox();
        let sender = RecordingSender::default();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(sender.clone());

        let mut filter = spamfilter(
            config(vec![account("home", vec![sales_rule()])]),
            connector,
        );

        assert_eq!(filter.process_all_accounts().await.matched, 1);
        assert_eq!(filter.process_all_accounts().await.matched, 0);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        filter.forget_processed_messages();
        assert_eq!(filter.process_all_accounts().await.matched, 1);
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recheck_bypasses_dedup() {
        let home = mailbox();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(RecordingSender::default());

        let mut config = config(vec![account("home", vec![sales_rule()])]);
        config.general_spamfilter_settings.recheck_every_unread_message = true;
        let mut filter = spamfilter(config, connector);

        assert_eq!(filter.process_all_accounts().await.matched, 1);
        assert_eq!(filter.process_all_accounts().await.matched, 1);
    }

    #[tokio::test]
    async fn test_stop_after_action_skips_later_rules() {
        let home = mailbox();
        let sender = RecordingSender::default();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(sender.clone());

        let mut catch_all = Rule::new("everything");
        catch_all.actions = vec![Action::Forward {
            receiver: "archive@example.com".to_string(),
            subject: None,
            body: None,
        }];

        let mut filter = spamfilter(
            config(vec![account("home", vec![spam_rule(), catch_all])]),
            connector,
        );
        filter.process_all_accounts().await;

        let sent = sender.sent.lock().unwrap();
        let subjects: Vec<&str> = sent.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["FW: quote request", "FW: lunch"]);
    }

    #[tokio::test]
    async fn test_failing_account_does_not_block_others() {
        let broken = MemoryMailbox {
            fail_open: true,
            ..mailbox()
        };
        let no_inbox = MemoryMailbox::with_folders(&["Archive"]);
        let healthy = mailbox();

        let mut connector = TestConnector::default();
        connector.mailboxes.insert("broken".to_string(), broken);
        connector.mailboxes.insert("no-inbox".to_string(), no_inbox.clone());
        connector.mailboxes.insert("healthy".to_string(), healthy.clone());

        let mut filter = spamfilter(
            config(vec![
                account("broken", vec![spam_rule()]),
                account("no-inbox", vec![spam_rule()]),
                account("healthy", vec![spam_rule()]),
            ]),
            connector,
        );
        let summary = filter.process_all_accounts().await;

        assert_eq!(summary.accounts, 3);
        assert_eq!(summary.failed_accounts, vec!["broken", "no-inbox"]);
        assert_eq!(summary.matched, 1);
        assert_eq!(healthy.contents("Junk").len(), 1);
        // The session is closed even when the inbox is missing
        assert_eq!(no_inbox.state.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn test_blocked_senders_from_state() {
        let home = mailbox();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());

        let mut filter = spamfilter(
            config(vec![account("home", vec![spam_rule()])]),
            connector,
        );
        filter.set_state(StateFile {
            blocked_senders: vec!["bob@friend.org".to_string()],
        });
        filter.process_all_accounts().await;

        assert_eq!(
            home.contents("Junk"),
            vec![("1".to_string(), true), ("3".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_apply_config_resets_dedup() {
        let home = mailbox();
        let sender = RecordingSender::default();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(sender.clone());

        let config = config(vec![account("home", vec![sales_rule()])]);
        let mut filter = spamfilter(config.clone(), connector);
        filter.process_all_accounts().await;

        let resolver = filter.resolver().clone();
        filter.apply_config(config).await.unwrap();
        assert!(Arc::ptr_eq(&resolver, filter.resolver()));

        filter.process_all_accounts().await;
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_config_keeps_previous_snapshot() {
        let home = mailbox();
        let sender = RecordingSender::default();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());
        connector.sender = Some(sender.clone());

        let config = config(vec![account("home", vec![sales_rule()])]);
        let mut filter = spamfilter(config.clone(), connector);
        filter.process_all_accounts().await;

        let mut broken = config;
        broken.check_interval_minutes = 42;
        broken.reputation.quiet_mode = false;
        broken.reputation.feeds = vec!["/nonexistent/feed.txt".to_string()];

        let resolver = filter.resolver().clone();
        assert!(filter.apply_config(broken).await.is_err());
        assert!(Arc::ptr_eq(&resolver, filter.resolver()));
        assert_eq!(filter.config().check_interval_minutes, 5);
        assert!(filter.config().reputation.feeds.is_empty());

        // Processed messages are still remembered
        assert_eq!(filter.process_all_accounts().await.matched, 0);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_forward_does_not_stop_later_rules() {
        let home = mailbox();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());

        let mut forward_only = sales_rule();
        forward_only.if_mail_was_sent_to.clear();
        forward_only.stop_after_action = true;
        let mut mark = Rule::new("mark");
        mark.actions = vec![Action::MarkAsRead];

        let mut filter = spamfilter(
            config(vec![account("home", vec![forward_only, mark])]),
            connector,
        );
        let summary = filter.process_all_accounts().await;

        assert_eq!(summary.matched, 3);
        assert!(home.contents("INBOX").iter().all(|(_, read)| *read));
    }

    #[tokio::test]
    async fn test_each_message_is_classified_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("training.jsonl");

        let home = mailbox();
        let mut connector = TestConnector::default();
        connector.mailboxes.insert("home".to_string(), home.clone());

        let mut first = spam_rule();
        first.actions = vec![Action::MarkAsRead];
        first.stop_after_action = false;
        let second = first.clone();

        let mut config = config(vec![account("home", vec![first, second])]);
        config.training_sink = Some(sink.to_string_lossy().into_owned());
        let mut filter = spamfilter(config, connector);
        assert_eq!(filter.process_all_accounts().await.matched, 1);

        let records = std::fs::read_to_string(&sink).unwrap();
        assert_eq!(records.lines().count(), 3);
    }
}
