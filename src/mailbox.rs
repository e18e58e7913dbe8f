use crate::config::{AccountConfig, SmtpConfig};
use crate::error::{FilterError, Result};
use crate::message::{Attachment, MailMessage};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as LettreAttachment, Mailbox as Address, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::{Path, PathBuf};

pub const INBOX: &str = "INBOX";

/// A mail store holding folders of messages.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn folders(&self) -> Result<Vec<String>>;
    async fn fetch_unread(&mut self, folder: &str) -> Result<Vec<MailMessage>>;
    /// Move `message` and update its key to the new location.
    async fn move_message(&mut self, message: &mut MailMessage, from: &str, to: &str)
        -> Result<()>;
    async fn mark_read(&mut self, message: &mut MailMessage, folder: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<()>;
}

/// Actual name of `name` in the mailbox, compared case-insensitively.
pub async fn resolve_folder(mailbox: &dyn Mailbox, name: &str) -> Result<String> {
    let existing = mailbox.folders().await?;
    existing
        .iter()
        .find(|folder| folder.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| FilterError::FolderNotFound {
            folder: name.to_string(),
            existing,
        })
}

/// Maildir++ tree: the root holds the inbox, `.Name` sub-directories hold
/// the other folders.
pub struct MaildirMailbox {
    root: PathBuf,
    open: bool,
}

impl MaildirMailbox {
    pub fn new(root: impl AsRef<Path>) -> Self {
        MaildirMailbox {
            root: root.as_ref().to_path_buf(),
            open: false,
        }
    }

    fn folder_path(&self, folder: &str) -> PathBuf {
        if folder.eq_ignore_ascii_case(INBOX) {
            self.root.clone()
        } else {
            self.root.join(format!(".{folder}"))
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(FilterError::Connectivity(format!(
                "Maildir {} is not open",
                self.root.display()
            )))
        }
    }

    async fn existing_folder(&self, folder: &str) -> Result<PathBuf> {
        let path = self.folder_path(folder);
        if tokio::fs::metadata(path.join("cur")).await.is_ok() {
            return Ok(path);
        }
        Err(FilterError::FolderNotFound {
            folder: folder.to_string(),
            existing: self.folders().await?,
        })
    }

    /// Create the directory layout of `folder`.
    pub async fn create_folder(&self, folder: &str) -> Result<()> {
        let path = self.folder_path(folder);
        for sub in ["cur", "new", "tmp"] {
            tokio::fs::create_dir_all(path.join(sub)).await?;
        }
        Ok(())
    }
}

fn split_info(file_name: &str) -> (&str, &str) {
    match file_name.split_once(":2,") {
        Some((base, flags)) => (base, flags),
        None => (file_name, ""),
    }
}

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[async_trait]
impl Mailbox for MaildirMailbox {
    async fn open(&mut self) -> Result<()> {
        if tokio::fs::metadata(self.root.join("cur")).await.is_err() {
            return Err(FilterError::Connectivity(format!(
                "Maildir {} not found",
                self.root.display()
            )));
        }
        self.open = true;
        log::debug!("Opened maildir {}", self.root.display());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn folders(&self) -> Result<Vec<String>> {
        let mut folders = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(folder) = name.strip_prefix('.') {
                if !folder.is_empty()
                    && folder != "."
                    && tokio::fs::metadata(entry.path().join("cur")).await.is_ok()
                {
                    folders.push(folder.to_string());
                }
            }
        }
        folders.sort();
        folders.insert(0, INBOX.to_string());
        Ok(folders)
    }

    async fn fetch_unread(&mut self, folder: &str) -> Result<Vec<MailMessage>> {
        self.ensure_open()?;
        let path = self.existing_folder(folder).await?;
        let mut messages = Vec::new();

        for sub in ["new", "cur"] {
            let dir = path.join(sub);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if file_name.starts_with('.') {
                    continue;
                }
                if sub == "cur" && split_info(&file_name).1.contains('S') {
                    continue;
                }
                let raw = tokio::fs::read(entry.path()).await?;
                let key = format!("{sub}/{file_name}");
                messages.push(MailMessage::parse(&raw, &key));
            }
        }

        messages.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(messages)
    }

    async fn move_message(
        &mut self,
        message: &mut MailMessage,
        from: &str,
        to: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        let source = self.existing_folder(from).await?;
        let target = self.existing_folder(to).await?;

        tokio::fs::rename(source.join(&message.key), target.join(&message.key)).await?;
        log::debug!("Moved {} from {from} to {to}", message.key);
        Ok(())
    }

    async fn mark_read(&mut self, message: &mut MailMessage, folder: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.existing_folder(folder).await?;

        let (base, flags) = split_info(file_name_of(&message.key));
        let mut flags: Vec<char> = flags.chars().filter(|c| *c != 'S').collect();
        flags.push('S');
        flags.sort_unstable();
        let new_key = format!("cur/{base}:2,{}", flags.into_iter().collect::<String>());

        tokio::fs::rename(path.join(&message.key), path.join(&new_key)).await?;
        message.key = new_key;
        Ok(())
    }
}

/// Sends forwarded mail through an SMTP relay.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = (if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        })
        .map_err(|e| {
            FilterError::Configuration(format!("invalid SMTP host '{}': {e}", config.host))
        })?;

        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(SmtpSender {
            transport: builder.build(),
        })
    }
}

fn build_message(mail: OutgoingMail) -> Result<Message> {
    let from = mail
        .from
        .parse::<Address>()
        .map_err(|e| FilterError::action("Forward", format!("invalid sender '{}': {e}", mail.from)))?;
    let to = mail
        .to
        .parse::<Address>()
        .map_err(|e| FilterError::action("Forward", format!("invalid receiver '{}': {e}", mail.to)))?;
    let builder = Message::builder().from(from).to(to).subject(mail.subject);

    let message = if mail.attachments.is_empty() {
        builder.body(mail.body)
    } else {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(mail.body));
        for attachment in mail.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or(ContentType::TEXT_PLAIN);
            multipart = multipart.singlepart(
                LettreAttachment::new(attachment.filename).body(attachment.data, content_type),
            );
        }
        builder.multipart(multipart)
    };

    message.map_err(|e| FilterError::action("Forward", format!("failed to build mail: {e}")))
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        let message = build_message(mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| FilterError::action("Forward", e))?;
        Ok(())
    }
}

/// Builds the mailbox and the outbound sender of an account.
pub trait Connector: Send + Sync {
    fn mailbox(&self, account: &AccountConfig) -> Result<Box<dyn Mailbox>>;
    fn sender(&self, account: &AccountConfig) -> Result<Option<Box<dyn MailSender>>>;
}

/// Maildir on the local file system plus SMTP when configured.
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn mailbox(&self, account: &AccountConfig) -> Result<Box<dyn Mailbox>> {
        Ok(Box::new(MaildirMailbox::new(&account.mailbox_path)))
    }

    fn sender(&self, account: &AccountConfig) -> Result<Option<Box<dyn MailSender>>> {
        match &account.smtp {
            Some(smtp) => Ok(Some(Box::new(SmtpSender::new(smtp)?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIL: &str = "From: \"Jane\" <jane@example.com>\nSubject: hello\n\nbody\n";

    async fn maildir() -> (tempfile::TempDir, MaildirMailbox) {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = MaildirMailbox::new(dir.path());
        mailbox.create_folder(INBOX).await.unwrap();
        mailbox.create_folder("Junk").await.unwrap();
        (dir, mailbox)
    }

    #[tokio::test]
    async fn test_open_missing_maildir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut mailbox = MaildirMailbox::new(dir.path().join("nope"));
        assert!(matches!(
            mailbox.open().await,
            Err(FilterError::Connectivity(_))
        ));
    }

    #[tokio::test]
    async fn test_folders_and_resolution() {
        let (_dir, mailbox) = maildir().await;
        assert_eq!(mailbox.folders().await.unwrap(), vec!["INBOX", "Junk"]);
        assert_eq!(resolve_folder(&mailbox, "junk").await.unwrap(), "Junk");

        let err = resolve_folder(&mailbox, "Spam").await.unwrap_err();
        match err {
            FilterError::FolderNotFound { folder, existing } => {
                assert_eq!(folder, "Spam");
                assert_eq!(existing, vec!["INBOX", "Junk"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_unread_move_and_mark_read() {
        let (dir, mut mailbox) = maildir().await;
        std::fs::write(dir.path().join("new/1.host"), MAIL).unwrap();
        std::fs::write(dir.path().join("cur/2.host:2,S"), MAIL).unwrap();
        std::fs::write(dir.path().join("cur/3.host:2,F"), MAIL).unwrap();

        mailbox.open().await.unwrap();
        let mut unread = mailbox.fetch_unread(INBOX).await.unwrap();
        let keys: Vec<&str> = unread.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["cur/3.host:2,F", "new/1.host"]);
        assert_eq!(unread[0].subject, "hello");

        let mut flagged = unread.remove(0);
        mailbox.mark_read(&mut flagged, INBOX).await.unwrap();
        assert_eq!(flagged.key, "cur/3.host:2,FS");
        assert!(dir.path().join("cur/3.host:2,FS").exists());

        let mut fresh = unread.remove(0);
        mailbox
            .move_message(&mut fresh, INBOX, "Junk")
            .await
            .unwrap();
        assert!(dir.path().join(".Junk/new/1.host").exists());
        mailbox.mark_read(&mut fresh, "Junk").await.unwrap();
        assert!(dir.path().join(".Junk/cur/1.host:2,S").exists());

        assert!(mailbox.fetch_unread(INBOX).await.unwrap().is_empty());
        mailbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_to_missing_folder_fails() {
        let (dir, mut mailbox) = maildir().await;
        std::fs::write(dir.path().join("new/1.host"), MAIL).unwrap();
        mailbox.open().await.unwrap();

        let mut message = mailbox.fetch_unread(INBOX).await.unwrap().remove(0);
        let result = mailbox.move_message(&mut message, INBOX, "Spam").await;
        assert!(matches!(result, Err(FilterError::FolderNotFound { .. })));
        assert!(dir.path().join("new/1.host").exists());
    }

    #[test]
    fn test_build_message_with_attachment() {
        let mail = OutgoingMail {
            from: "filter@example.com".to_string(),
            to: "team@example.com".to_string(),
            subject: "FW: hello".to_string(),
            body: "body".to_string(),
            attachments: vec![Attachment {
                filename: "data.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                data: vec![0, 1, 2],
            }],
        };
        let message = build_message(mail).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: FW: hello"));
        assert!(formatted.contains("data.bin"));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let mail = OutgoingMail {
            from: "not an address".to_string(),
            to: "team@example.com".to_string(),
            subject: String::new(),
            body: String::new(),
            attachments: Vec::new(),
        };
        assert!(matches!(
            build_message(mail),
            Err(FilterError::ActionExecution { .. })
        ));
    }
}
