//! Client connection state

use crate::{Error, Result};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stable identity for one connection, assigned at accept time and never
/// reused. Every cross-reference (channel membership, nickname registry)
/// stores this id and re-resolves it through the client table at use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection protocol state plus the handle to its outbound queue.
///
/// Registration is tracked as three independent flags; `registered` becomes
/// true exactly once, when all three are set, and never reverts.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    remote_addr: String,
    sender: mpsc::UnboundedSender<String>,
    token: CancellationToken,
    nickname: String,
    username: String,
    realname: String,
    passed: bool,
    has_nick: bool,
    has_user: bool,
    registered: bool,
}

impl Client {
    /// Create a new client
    pub fn new(
        id: ClientId,
        remote_addr: String,
        sender: mpsc::UnboundedSender<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            sender,
            token,
            nickname: String::new(),
            username: String::new(),
            realname: String::new(),
            passed: false,
            has_nick: false,
            has_user: false,
            registered: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Queue one line on the connection's outbound queue.
    pub fn send(&self, line: &str) -> Result<()> {
        self.sender
            .send(line.to_string())
            .map_err(|_| Error::Connection(format!("client {} outbound queue closed", self.id)))
    }

    /// Stop this connection's reader task; dropping the client afterwards
    /// closes the socket once the writer drains.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Nickname for reply targets, `*` before one is set.
    pub fn nick_or_star(&self) -> &str {
        if self.nickname.is_empty() {
            "*"
        } else {
            &self.nickname
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn realname(&self) -> &str {
        &self.realname
    }

    pub fn set_nickname(&mut self, nick: &str) {
        self.nickname = nick.to_string();
        self.has_nick = true;
    }

    pub fn set_user(&mut self, username: &str, realname: &str) {
        self.username = username.to_string();
        self.realname = realname.to_string();
        self.has_user = true;
    }

    pub fn mark_passed(&mut self) {
        self.passed = true;
    }

    pub fn has_passed(&self) -> bool {
        self.passed
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// True when all three registration steps are done but the one-way
    /// transition to registered has not fired yet.
    pub fn ready_for_welcome(&self) -> bool {
        self.passed && self.has_nick && self.has_user && !self.registered
    }

    pub fn mark_registered(&mut self) {
        self.registered = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (Client, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(
            ClientId::new(7),
            "127.0.0.1:54321".to_string(),
            tx,
            CancellationToken::new(),
        );
        (client, rx)
    }

    #[test]
    fn test_registration_flags() {
        let (mut client, _rx) = test_client();
        assert!(!client.ready_for_welcome());
        client.mark_passed();
        client.set_nickname("alice");
        assert!(!client.ready_for_welcome());
        client.set_user("al", "Alice");
        assert!(client.ready_for_welcome());
        client.mark_registered();
        assert!(client.is_registered());
        assert!(!client.ready_for_welcome());
        assert_eq!(client.realname(), "Alice");
    }

    #[test]
    fn test_nick_or_star() {
        let (mut client, _rx) = test_client();
        assert_eq!(client.nick_or_star(), "*");
        client.set_nickname("alice");
        assert_eq!(client.nick_or_star(), "alice");
    }

    #[test]
    fn test_send_queues_line() {
        let (client, mut rx) = test_client();
        client.send("PING :x\r\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "PING :x\r\n");
        drop(rx);
        assert!(client.send("PONG :x\r\n").is_err());
    }
}
