use crate::classifier::{Classification, Classifier};
use crate::config::{Action, Rule, SpamSettings};
use crate::error::Result;
use crate::facts::MessageFacts;
use crate::mailbox::{resolve_folder, MailSender, Mailbox, OutgoingMail};
use crate::message::MailMessage;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub matched: bool,
    pub reason: String,
    /// Classifier reason when the rule required spam and matched.
    pub spam_reason: Option<String>,
}

impl RuleMatch {
    fn miss() -> Self {
        RuleMatch {
            matched: false,
            reason: String::new(),
            spam_reason: None,
        }
    }
}

/// Classifications of one message, computed at most once per settings set.
#[derive(Debug, Default)]
pub struct MessageVerdicts {
    classified: Vec<(SpamSettings, Classification)>,
}

impl MessageVerdicts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.classified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classified.is_empty()
    }
}

/// Everything an action may touch while it runs.
pub struct ActionContext<'a> {
    pub mailbox: &'a mut dyn Mailbox,
    pub sender: Option<&'a dyn MailSender>,
    /// Sender address of forwarded mail.
    pub forward_from: Option<&'a str>,
    pub message: &'a mut MailMessage,
    /// Folder currently holding `message`; moves update it.
    pub folder: String,
}

pub struct RuleEvaluator {
    classifier: Arc<Classifier>,
}

impl RuleEvaluator {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        RuleEvaluator { classifier }
    }

    /// Rule settings win when their special character whitelist is set.
    pub fn effective_settings<'s>(
        rule: &'s Rule,
        general: Option<&'s SpamSettings>,
    ) -> Option<&'s SpamSettings> {
        match &rule.spamfilter_settings {
            Some(settings) if settings.has_special_character_whitelist() => Some(settings),
            _ => general,
        }
    }

    /// Classify `facts` under `settings`, reusing an earlier verdict for the
    /// same settings.
    pub async fn classify(
        &self,
        facts: &MessageFacts,
        settings: Option<&SpamSettings>,
        verdicts: &mut MessageVerdicts,
    ) -> Result<Classification> {
        if let Some(settings) = settings {
            if let Some((_, known)) = verdicts.classified.iter().find(|(s, _)| s == settings) {
                return Ok(known.clone());
            }
        }

        let classification = self.classifier.classify_facts(facts, settings).await?;
        if let Some(settings) = settings {
            verdicts
                .classified
                .push((settings.clone(), classification.clone()));
        }
        Ok(classification)
    }

    pub async fn evaluate(
        &self,
        rule: &Rule,
        facts: &MessageFacts,
        general: Option<&SpamSettings>,
        verdicts: &mut MessageVerdicts,
    ) -> Result<RuleMatch> {
        let mut reasons: Vec<String> = Vec::new();
        let mut spam_reason = None;

        if rule.if_mail_is_spam {
            let settings = Self::effective_settings(rule, general);
            let classification = self.classify(facts, settings, verdicts).await?;
            if !classification.is_spam {
                log::debug!(
                    "Rule '{}': not spam ({})",
                    rule.name,
                    classification.reason
                );
                return Ok(RuleMatch::miss());
            }
            reasons.push(format!("is spam ({})", classification.reason));
            spam_reason = Some(classification.reason);
        }

        let sender = format!("{} {}", facts.sender_name, facts.sender_address);
        let conditions: [(&[String], &str, &str); 5] = [
            (&rule.if_mail_was_sent_by, &sender, "sender"),
            (&rule.if_mail_was_sent_to, &facts.receiver, "receiver"),
            (&rule.if_mail_contains_words_in_header, &facts.headers, "header"),
            (&rule.if_mail_contains_words_in_subject, &facts.subject, "subject"),
            (&rule.if_mail_contains_words_in_body, &facts.body, "body"),
        ];

        for (words, text, category) in conditions {
            if words.is_empty() {
                continue;
            }
            match first_contained(words, text) {
                Some(word) => reasons.push(format!("{category} contains '{word}'")),
                None => return Ok(RuleMatch::miss()),
            }
        }

        let reason = if reasons.is_empty() {
            "no condition".to_string()
        } else {
            reasons.join(", ")
        };
        Ok(RuleMatch {
            matched: true,
            reason,
            spam_reason,
        })
    }

    /// Run the actions of `rule` in order. Returns whether at least one of
    /// them succeeded; the first failing action aborts the rest.
    pub async fn execute_actions(
        &self,
        rule: &Rule,
        facts: &MessageFacts,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool> {
        let mut succeeded = false;

        for action in &rule.actions {
            match self.execute(action, facts, ctx).await {
                Ok(true) => succeeded = true,
                Ok(false) => {}
                Err(e) => {
                    log::error!(
                        "Action {} of rule '{}' failed: {e}",
                        action.name(),
                        rule.name
                    );
                    return Err(e);
                }
            }
        }

        Ok(succeeded)
    }

    async fn execute(
        &self,
        action: &Action,
        facts: &MessageFacts,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool> {
        match action {
            Action::MoveToFolder { folder } => {
                let target = resolve_folder(&*ctx.mailbox, folder).await?;
                ctx.mailbox
                    .move_message(ctx.message, &ctx.folder, &target)
                    .await?;
                log::info!("MOVED     : {}  to {target}", facts.summary());
                ctx.folder = target;
                Ok(true)
            }
            Action::Forward {
                receiver,
                subject,
                body,
            } => {
                let (sender, from) = match (ctx.sender, ctx.forward_from) {
                    (Some(sender), Some(from)) => (sender, from),
                    _ => {
                        log::warn!(
                            "Forward to {receiver} skipped, no outbound mail configured"
                        );
                        return Ok(false);
                    }
                };
                let mail = OutgoingMail {
                    from: from.to_string(),
                    to: receiver.clone(),
                    subject: subject
                        .clone()
                        .unwrap_or_else(|| format!("FW: {}", facts.subject)),
                    body: body.clone().unwrap_or_else(|| {
                        ctx.message
                            .text_body
                            .clone()
                            .unwrap_or_else(|| facts.body.clone())
                    }),
                    attachments: ctx.message.attachments.clone(),
                };
                sender.send(mail).await?;
                log::info!("FORWARDED : {}  to {receiver}", facts.summary());
                Ok(true)
            }
            Action::MarkAsRead => {
                ctx.mailbox.mark_read(ctx.message, &ctx.folder).await?;
                log::info!("MARKEDREAD: {}", facts.summary());
                Ok(true)
            }
        }
    }
}

fn first_contained<'w>(words: &'w [String], text: &str) -> Option<&'w str> {
    let text = text.to_lowercase();
    words
        .iter()
        .map(|w| w.as_str())
        .find(|w| !w.is_empty() && text.contains(&w.to_lowercase()))
}
