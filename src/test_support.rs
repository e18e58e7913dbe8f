use crate::config::AccountConfig;
use crate::error::{FilterError, Result};
use crate::mailbox::{Connector, MailSender, Mailbox, OutgoingMail};
use crate::message::MailMessage;
use crate::reputation::ReputationLookup;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MailState {
    pub folders: Vec<(String, Vec<(MailMessage, bool)>)>,
    pub opened: usize,
    pub closed: usize,
}

impl MailState {
    fn folder_mut(&mut self, name: &str) -> Result<&mut Vec<(MailMessage, bool)>> {
        let existing: Vec<String> = self.folders.iter().map(|(n, _)| n.clone()).collect();
        self.folders
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, messages)| messages)
            .ok_or_else(|| FilterError::FolderNotFound {
                folder: name.to_string(),
                existing,
            })
    }
}

/// Mailbox kept in memory, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    pub state: Arc<Mutex<MailState>>,
    pub fail_open: bool,
}

impl MemoryMailbox {
    pub fn with_folders(names: &[&str]) -> Self {
        let mailbox = MemoryMailbox::default();
        mailbox.state.lock().unwrap().folders = names
            .iter()
            .map(|n| (n.to_string(), Vec::new()))
            .collect();
        mailbox
    }

    pub fn deliver(&self, folder: &str, raw: &str, key: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .folder_mut(folder)
            .unwrap()
            .push((MailMessage::parse(raw, key), false));
    }

    /// Keys of the messages in `folder` with their read flag.
    pub fn contents(&self, folder: &str) -> Vec<(String, bool)> {
        let mut state = self.state.lock().unwrap();
        state
            .folder_mut(folder)
            .unwrap()
            .iter()
            .map(|(m, read)| (m.key.clone(), *read))
            .collect()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(FilterError::Connectivity("server unreachable".to_string()));
        }
        self.state.lock().unwrap().opened += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }

    async fn folders(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .folders
            .iter()
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn fetch_unread(&mut self, folder: &str) -> Result<Vec<MailMessage>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .folder_mut(folder)?
            .iter()
            .filter(|(_, read)| !read)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn move_message(
        &mut self,
        message: &mut MailMessage,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.folder_mut(to)?;
        let source = state.folder_mut(from)?;
        let position = source
            .iter()
            .position(|(m, _)| m.key == message.key)
            .ok_or_else(|| FilterError::action("MoveToFolder", "message vanished"))?;
        let entry = source.remove(position);
        state.folder_mut(to)?.push(entry);
        Ok(())
    }

    async fn mark_read(&mut self, message: &mut MailMessage, folder: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .folder_mut(folder)?
            .iter_mut()
            .find(|(m, _)| m.key == message.key)
            .ok_or_else(|| FilterError::action("MarkAsRead", "message vanished"))?;
        entry.1 = true;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSender {
    pub sent: Arc<Mutex<Vec<OutgoingMail>>>,
}

#[async_trait]
impl MailSender for RecordingSender {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Hands out the prepared mailboxes by account name.
#[derive(Default)]
pub struct TestConnector {
    pub mailboxes: HashMap<String, MemoryMailbox>,
    pub sender: Option<RecordingSender>,
}

impl Connector for TestConnector {
    fn mailbox(&self, account: &AccountConfig) -> Result<Box<dyn Mailbox>> {
        self.mailboxes
            .get(&account.name)
            .cloned()
            .map(|m| Box::new(m) as Box<dyn Mailbox>)
            .ok_or_else(|| FilterError::Configuration(format!("no mailbox for {}", account.name)))
    }

    fn sender(&self, _account: &AccountConfig) -> Result<Option<Box<dyn MailSender>>> {
        Ok(self
            .sender
            .clone()
            .map(|s| Box::new(s) as Box<dyn MailSender>))
    }
}

/// Reputation source with a fixed list of blocked addresses.
#[derive(Default)]
pub struct StaticReputation {
    pub listed: Vec<(IpAddr, String)>,
}

#[async_trait]
impl ReputationLookup for StaticReputation {
    async fn look_up(&self, ip: IpAddr) -> Result<Vec<String>> {
        Ok(self
            .listed
            .iter()
            .filter(|(listed, _)| *listed == ip)
            .map(|(_, id)| id.clone())
            .collect())
    }
}

/// DNS transport that never finds anything.
pub struct OfflineTransport;

#[async_trait]
impl crate::reputation::DnsTransport for OfflineTransport {
    async fn name_servers(
        &self,
        _servers: &[IpAddr],
        _zone: &str,
        _timeout: std::time::Duration,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn host_addresses(
        &self,
        _servers: &[IpAddr],
        _host: &str,
        _timeout: std::time::Duration,
    ) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    async fn query_a(
        &self,
        _servers: &[IpAddr],
        _name: &str,
        _timeout: std::time::Duration,
    ) -> Result<Vec<std::net::Ipv4Addr>> {
        Ok(Vec::new())
    }
}
