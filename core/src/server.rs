//! Main server implementation
//!
//! [`ServerState`] owns every table: the client table keyed by connection
//! identity, the nickname registry, and the channel table. All handlers
//! take it by exclusive reference, so every event is processed to
//! completion before the next one is looked at and no locking is needed.
//!
//! [`Server`] wraps the state together with the listening socket and the
//! event loop that multiplexes accepts, connection events, and shutdown.

use crate::{
    buffer::MAX_LINE_LEN,
    channel::{Channel, ModeStep},
    client::{Client, ClientId},
    config::Config,
    connection::{self, ServerEvent},
    message::{self, Command},
    Result,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// All mutable server state: clients, nicknames, channels.
///
/// Handlers never hold references between entities; membership and registry
/// entries store [`ClientId`]s that are re-resolved through the tables at
/// point of use, so a disconnect can never leave a dangling reference.
pub struct ServerState {
    config: Config,
    clients: HashMap<ClientId, Client>,
    nicks: HashMap<String, ClientId>,
    channels: HashMap<String, Channel>,
}

impl ServerState {
    /// Create an empty state for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Insert a freshly accepted client into the table.
    pub fn add_client(&mut self, client: Client) {
        self.clients.insert(client.id(), client);
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Exact-string, case-sensitive nickname lookup.
    pub fn lookup_nick(&self, nick: &str) -> Option<ClientId> {
        self.nicks.get(nick).copied()
    }

    /// Process one framed protocol line whose text length equals its wire
    /// length (always true for valid UTF-8 input).
    pub fn handle_line(&mut self, id: ClientId, line: &str) {
        self.handle_framed_line(id, line, line.len());
    }

    /// Process one framed protocol line from a connection. `wire_len` is
    /// the line's length in wire bytes, at most `line.len()`; the two
    /// differ when invalid bytes were replaced during decoding.
    ///
    /// Oversized lines are rejected without disconnecting; empty lines are
    /// skipped. After every processed line the registration conjunction is
    /// re-evaluated so the welcome fires on the exact line completing it.
    pub fn handle_framed_line(&mut self, id: ClientId, line: &str, wire_len: usize) {
        if !self.clients.contains_key(&id) {
            return;
        }
        if wire_len > MAX_LINE_LEN {
            self.reply_raw(id, "ERROR :Line too long\r\n");
            return;
        }
        let (verb, args) = message::split_command(line);
        if verb.is_empty() {
            return;
        }
        let command = Command::from(verb);
        let registered = self
            .clients
            .get(&id)
            .map(Client::is_registered)
            .unwrap_or(false);
        if command.requires_registration() && !registered {
            self.status(id, ":You have not registered");
            return;
        }
        match command {
            Command::Pass => self.handle_pass(id, args),
            Command::Nick => self.handle_nick(id, args),
            Command::User => self.handle_user(id, args),
            Command::Join => self.handle_join(id, args),
            Command::Part => self.handle_part(id, args),
            Command::PrivMsg => self.handle_privmsg(id, args),
            Command::Ping => self.handle_ping(id, args),
            Command::Quit => self.handle_quit(id, args),
            Command::Kick => self.handle_kick(id, args),
            Command::Invite => self.handle_invite(id, args),
            Command::Topic => self.handle_topic(id, args),
            Command::Mode => self.handle_mode(id, args),
            Command::Unknown(verb) => {
                self.status(id, &format!("{} :Unknown command", verb));
            }
        }
        self.welcome_if_ready(id);
    }

    /// Tear down a connection: departure notices, channel and registry
    /// cleanup, then removal from the client table. A no-op when the
    /// connection is already gone, so double disconnects are harmless.
    pub fn disconnect(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let nick = client.nickname().to_string();
        let prefix = self.user_prefix(id);

        let mut emptied = Vec::new();
        for (name, channel) in self.channels.iter_mut() {
            if !channel.is_member(id) {
                continue;
            }
            let line = format!(":{} PART {} :Quit: {}\r\n", prefix, name, reason);
            broadcast_to(&self.clients, channel, &line, Some(id));
            channel.remove_member(id);
            if channel.is_empty() {
                emptied.push(name.clone());
            } else {
                ensure_channel_has_operator(&self.clients, &self.config, channel);
            }
        }
        for name in emptied {
            self.channels.remove(&name);
            tracing::debug!("channel {} destroyed", name);
        }

        if !nick.is_empty() && self.nicks.get(&nick) == Some(&id) {
            self.nicks.remove(&nick);
        }
        if let Some(client) = self.clients.remove(&id) {
            client.cancel();
            tracing::info!(
                "client {} ({}) disconnected: {}",
                id,
                client.remote_addr(),
                reason
            );
        }
    }

    /// Release everything: cancel every connection and drop all tables.
    /// Pending writes are not drained. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for client in self.clients.values() {
            client.cancel();
        }
        self.clients.clear();
        self.nicks.clear();
        self.channels.clear();
    }

    // ---- command handlers ------------------------------------------------

    fn handle_pass(&mut self, id: ClientId, args: &str) {
        let registered = self
            .clients
            .get(&id)
            .map(Client::is_registered)
            .unwrap_or(false);
        if registered {
            self.status(id, ":You may not re-register");
            return;
        }
        if args.is_empty() {
            self.status(id, "PASS :Not enough parameters");
            self.notice(id, "PASS command requires a parameter.");
            return;
        }
        let pass = args.strip_prefix(':').unwrap_or(args);
        if pass == self.config.password {
            if let Some(client) = self.clients.get_mut(&id) {
                client.mark_passed();
            }
            self.notice(id, "Password accepted.");
        } else {
            self.status(id, ":Password incorrect");
            self.notice(id, "Incorrect password.");
        }
    }

    fn handle_nick(&mut self, id: ClientId, args: &str) {
        let nick = args.trim_end();
        if nick.is_empty() {
            self.status(id, ":No nickname given");
            return;
        }
        if nick
            .bytes()
            .any(|b| b <= 0x20 || b == b',' || b == 0x7f)
        {
            self.status(id, &format!("{} :Erroneous nickname", nick));
            return;
        }
        if let Some(owner) = self.nicks.get(nick) {
            if *owner != id {
                self.status(id, &format!("{} :Nickname is already in use", nick));
                return;
            }
        }
        // release the old registry entry before taking the new one
        if let Some(client) = self.clients.get(&id) {
            let old = client.nickname().to_string();
            if !old.is_empty() && self.nicks.get(&old) == Some(&id) {
                self.nicks.remove(&old);
            }
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.set_nickname(nick);
        }
        self.nicks.insert(nick.to_string(), id);
    }

    fn handle_user(&mut self, id: ClientId, args: &str) {
        let registered = self
            .clients
            .get(&id)
            .map(Client::is_registered)
            .unwrap_or(false);
        if registered {
            self.status(id, ":You may not reregister");
            return;
        }
        let (username, rest) = message::split_token(args);
        let (_mode, rest) = message::split_token(rest);
        let (_unused, rest) = message::split_token(rest);
        let realname = message::trailing(rest);
        if username.is_empty() {
            self.status(id, "USER :Not enough parameters");
            return;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.set_user(username, realname);
        }
    }

    fn handle_join(&mut self, id: ClientId, args: &str) {
        let (chan, rest) = message::split_token(args);
        if chan.is_empty() {
            self.status(id, "JOIN :Not enough parameters");
            return;
        }
        if !chan.starts_with('#') {
            self.status(id, ":Bad Channel Mask");
            return;
        }
        let (key, _) = message::split_token(rest);
        let chan = chan.to_string();

        // run the gating checks before the channel is ever created, so a
        // refused JOIN cannot leave an empty channel behind
        let mut newly_created = false;
        let refusal = match self.channels.get(&chan) {
            None => {
                newly_created = true;
                None
            }
            Some(channel) => {
                if channel.is_member(id) {
                    Some((
                        format!("You are already on channel {}", chan),
                        format!("{} :is already on channel", chan),
                    ))
                } else if channel.is_invite_only() && !channel.is_invited(id) {
                    Some((
                        format!("JOIN {} failed: Invite only channel", chan),
                        format!("{} :Invite only channel", chan),
                    ))
                } else if !channel.key_matches(key) {
                    Some((
                        format!("JOIN {} failed: Incorrect password", chan),
                        format!("{} :Cannot join channel (+k)", chan),
                    ))
                } else if channel.is_full() {
                    Some((
                        format!("JOIN {} failed: Channel is full", chan),
                        format!("{} :Channel is full", chan),
                    ))
                } else {
                    None
                }
            }
        };
        if let Some((notice, status)) = refusal {
            self.notice(id, &notice);
            self.status(id, &status);
            return;
        }

        if newly_created {
            let mut channel = Channel::new(chan.clone());
            channel.add_operator(id); // creator gets op
            self.channels.insert(chan.clone(), channel);
            tracing::debug!("channel {} created by client {}", chan, id);
        }
        if let Some(channel) = self.channels.get_mut(&chan) {
            channel.add_member(id);
        }

        let prefix = self.user_prefix(id);
        let join_line = format!(":{} JOIN :{}\r\n", prefix, chan);
        self.broadcast_channel(&chan, &join_line, None);
        self.notice(id, &format!("You have joined channel {}.", chan));
        self.send_topic_state(id, &chan);
        self.send_names(id, &chan);
    }

    fn handle_part(&mut self, id: ClientId, args: &str) {
        let (chan, _) = message::split_token(args);
        if chan.is_empty() {
            self.status(id, "PART :Not enough parameters");
            return;
        }
        if !self.channels.contains_key(chan) {
            self.status(id, &format!("{} :No such channel", chan));
            return;
        }
        let member = self
            .channels
            .get(chan)
            .map_or(false, |channel| channel.is_member(id));
        if !member {
            self.status(id, &format!("{} :You're not on that channel", chan));
            return;
        }
        let prefix = self.user_prefix(id);
        let line = format!(":{} PART {}\r\n", prefix, chan);
        self.broadcast_channel(chan, &line, None);
        self.remove_member_from(chan, id);
    }

    fn handle_privmsg(&mut self, id: ClientId, args: &str) {
        let (target, rest) = message::split_token(args);
        let text = message::trailing(rest);
        if target.is_empty() || text.is_empty() {
            self.status(id, "PRIVMSG :Not enough parameters");
            return;
        }
        let prefix = self.user_prefix(id);
        let line = format!(":{} PRIVMSG {} :{}\r\n", prefix, target, text);
        if target.starts_with('#') {
            let Some(channel) = self.channels.get(target) else {
                self.status(id, &format!("{} :No such channel", target));
                return;
            };
            if !channel.is_member(id) {
                self.status(id, &format!("{} :Cannot send to channel", target));
                return;
            }
            self.broadcast_channel(target, &line, Some(id));
        } else {
            let Some(recipient) = self.nicks.get(target).copied() else {
                self.status(id, &format!("{} :No such nick", target));
                return;
            };
            self.reply_raw(recipient, &line);
        }
    }

    fn handle_ping(&mut self, id: ClientId, args: &str) {
        let token = args.strip_prefix(':').unwrap_or(args);
        let token = if token.is_empty() { "ping" } else { token };
        self.reply_raw(id, &format!("PONG :{}\r\n", token));
    }

    fn handle_quit(&mut self, id: ClientId, args: &str) {
        let reason = args.strip_prefix(':').unwrap_or(args);
        let reason = if reason.is_empty() { "Client Quit" } else { reason };
        let prefix = self.user_prefix(id);
        let line = format!(":{} QUIT :{}\r\n", prefix, reason);
        let joined: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_member(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in joined {
            self.broadcast_channel(&name, &line, Some(id));
        }
        let reason = reason.to_string();
        self.disconnect(id, &reason);
    }

    fn handle_kick(&mut self, id: ClientId, args: &str) {
        let (chan, rest) = message::split_token(args);
        let (nick, _) = message::split_token(rest);
        if chan.is_empty() || nick.is_empty() {
            self.status(id, "KICK :Not enough parameters");
            return;
        }
        let Some(channel) = self.channels.get(chan) else {
            self.status(id, &format!("{} :No such channel", chan));
            return;
        };
        if !channel.is_member(id) {
            self.status(id, &format!("{} :You're not on that channel", chan));
            return;
        }
        if !channel.is_operator(id) {
            self.status(id, &format!("{} :You're not channel operator", chan));
            return;
        }
        let victim = self
            .nicks
            .get(nick)
            .copied()
            .filter(|v| channel.is_member(*v));
        let Some(victim) = victim else {
            self.status(id, &format!("{} {} :They aren't on that channel", nick, chan));
            return;
        };
        let prefix = self.user_prefix(id);
        let line = format!(":{} KICK {} {}\r\n", prefix, chan, nick);
        self.broadcast_channel(chan, &line, None);
        self.remove_member_from(chan, victim);
    }

    fn handle_invite(&mut self, id: ClientId, args: &str) {
        let (nick, rest) = message::split_token(args);
        let (chan, _) = message::split_token(rest);
        if nick.is_empty() || chan.is_empty() {
            self.status(id, "INVITE :Not enough parameters");
            return;
        }
        let Some(channel) = self.channels.get(chan) else {
            self.status(id, &format!("{} :No such channel", chan));
            return;
        };
        if !channel.is_member(id) {
            self.status(id, &format!("{} :You're not on that channel", chan));
            return;
        }
        if !channel.is_operator(id) {
            self.status(id, &format!("{} :You're not channel operator", chan));
            return;
        }
        let Some(target) = self.nicks.get(nick).copied() else {
            self.status(id, &format!("{} :No such nick", nick));
            return;
        };
        if let Some(channel) = self.channels.get_mut(chan) {
            channel.invite(target);
        }
        let prefix = self.user_prefix(id);
        self.reply_raw(target, &format!(":{} INVITE {} :{}\r\n", prefix, nick, chan));
        self.status(id, &format!("{} {}", nick, chan));
    }

    fn handle_topic(&mut self, id: ClientId, args: &str) {
        let (chan, rest) = message::split_token(args);
        if chan.is_empty() {
            self.status(id, "TOPIC :Not enough parameters");
            return;
        }
        let Some(channel) = self.channels.get(chan) else {
            self.status(id, &format!("{} :No such channel", chan));
            return;
        };
        if !channel.is_member(id) {
            self.status(id, &format!("{} :You're not on that channel", chan));
            return;
        }
        let text = message::trailing(rest);
        if text.is_empty() {
            self.send_topic_state(id, chan);
            return;
        }
        if channel.is_topic_restricted() && !channel.is_operator(id) {
            self.status(id, &format!("{} :You're not channel operator", chan));
            return;
        }
        let text = text.to_string();
        if let Some(channel) = self.channels.get_mut(chan) {
            channel.set_topic(&text);
        }
        let prefix = self.user_prefix(id);
        let line = format!(":{} TOPIC {} :{}\r\n", prefix, chan, text);
        self.broadcast_channel(chan, &line, None);
    }

    fn handle_mode(&mut self, id: ClientId, args: &str) {
        let (chan, rest) = message::split_token(args);
        if chan.is_empty() {
            self.status(id, "MODE :Not enough parameters");
            return;
        }
        let Some(channel) = self.channels.get(chan) else {
            self.status(id, &format!("{} :No such channel", chan));
            return;
        };
        let (flags, rest) = message::split_token(rest);
        if flags.is_empty() {
            // mode query needs no operator status
            self.status(id, &format!("{} +{}", chan, channel.modes_string()));
            return;
        }
        if !channel.is_operator(id) {
            self.status(id, &format!("{} :You're not channel operator", chan));
            return;
        }

        let steps = match self.channels.get_mut(chan) {
            Some(channel) => {
                let mut params = rest.split_whitespace();
                channel.apply_mode_flags(flags, &mut params)
            }
            None => return,
        };

        let prefix = self.user_prefix(id);
        let mut applied = Vec::new();
        for step in steps {
            match step {
                ModeStep::Applied(change) => applied.push(change),
                ModeStep::Operator { nick, adding } => {
                    let target = self
                        .nicks
                        .get(&nick)
                        .copied()
                        .filter(|t| {
                            self.channels
                                .get(chan)
                                .map_or(false, |channel| channel.is_member(*t))
                        });
                    let Some(target) = target else {
                        self.status(
                            id,
                            &format!("{} {} :They aren't on that channel", nick, chan),
                        );
                        continue;
                    };
                    if let Some(channel) = self.channels.get_mut(chan) {
                        if adding {
                            channel.add_operator(target);
                        } else {
                            channel.remove_operator(target);
                        }
                    }
                    let change = if adding { "+o" } else { "-o" };
                    let line = format!(":{} MODE {} {} {}\r\n", prefix, chan, change, nick);
                    self.broadcast_channel(chan, &line, None);
                }
                ModeStep::MissingParam => {
                    self.status(id, "MODE :Not enough parameters");
                }
                ModeStep::Unknown(flag) => {
                    self.status(id, &format!("{} :is unknown mode char to me", flag));
                }
            }
        }
        if !applied.is_empty() {
            let line = format!(":{} MODE {} {}\r\n", prefix, chan, applied.join(" "));
            self.broadcast_channel(chan, &line, None);
        }
    }

    // ---- reply and broadcast plumbing ------------------------------------

    /// Queue a raw, already-terminated line on one connection.
    fn reply_raw(&self, id: ClientId, line: &str) {
        if let Some(client) = self.clients.get(&id) {
            if let Err(e) = client.send(line) {
                tracing::debug!("dropping reply to client {}: {}", id, e);
            }
        }
    }

    /// Server-originated status line: `:<server> <nick-or-*> <text>`.
    fn status(&self, id: ClientId, text: &str) {
        if let Some(client) = self.clients.get(&id) {
            let line = format!(
                ":{} {} {}\r\n",
                self.config.server_name,
                client.nick_or_star(),
                text
            );
            if let Err(e) = client.send(&line) {
                tracing::debug!("dropping reply to client {}: {}", id, e);
            }
        }
    }

    /// Server NOTICE to one connection.
    fn notice(&self, id: ClientId, text: &str) {
        if let Some(client) = self.clients.get(&id) {
            let line = format!(
                ":{} NOTICE {} :{}\r\n",
                self.config.server_name,
                client.nick_or_star(),
                text
            );
            if let Err(e) = client.send(&line) {
                tracing::debug!("dropping reply to client {}: {}", id, e);
            }
        }
    }

    /// Fan one line out to a channel's membership in identity order,
    /// honoring an optional exclusion.
    fn broadcast_channel(&self, name: &str, line: &str, exclude: Option<ClientId>) {
        if let Some(channel) = self.channels.get(name) {
            broadcast_to(&self.clients, channel, line, exclude);
        }
    }

    fn user_prefix(&self, id: ClientId) -> String {
        match self.clients.get(&id) {
            Some(client) => message::user_prefix(
                client.nickname(),
                client.username(),
                &self.config.server_name,
            ),
            None => String::new(),
        }
    }

    /// Fire the welcome exactly once, on the line completing registration.
    fn welcome_if_ready(&mut self, id: ClientId) {
        let ready = self
            .clients
            .get(&id)
            .map_or(false, Client::ready_for_welcome);
        if !ready {
            return;
        }
        let nick = match self.clients.get_mut(&id) {
            Some(client) => {
                client.mark_registered();
                client.nickname().to_string()
            }
            None => return,
        };
        self.status(id, &format!(":Welcome to the IRC network {}", nick));
        self.status(id, &format!(":Your host is {}", self.config.server_name));
        tracing::debug!("client {} registered as {}", id, nick);
    }

    /// Remove one member, destroying the channel when it empties and
    /// re-asserting operator presence otherwise.
    fn remove_member_from(&mut self, name: &str, id: ClientId) {
        let now_empty = match self.channels.get_mut(name) {
            Some(channel) => {
                channel.remove_member(id);
                channel.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.channels.remove(name);
            tracing::debug!("channel {} destroyed", name);
        } else if let Some(channel) = self.channels.get_mut(name) {
            ensure_channel_has_operator(&self.clients, &self.config, channel);
        }
    }
}

/// Fan one line out to every member of a channel, skipping the exclusion.
/// Delivery order follows the member set's ascending identity order.
fn broadcast_to(
    clients: &HashMap<ClientId, Client>,
    channel: &Channel,
    line: &str,
    exclude: Option<ClientId>,
) {
    for member in channel.members() {
        if Some(member) == exclude {
            continue;
        }
        if let Some(client) = clients.get(&member) {
            if let Err(e) = client.send(line) {
                tracing::debug!("dropping broadcast to client {}: {}", member, e);
            }
        }
    }
}

/// Promote the lowest-identity member to operator when a non-empty channel
/// has none left. Runs after every membership-reducing event.
fn ensure_channel_has_operator(
    clients: &HashMap<ClientId, Client>,
    config: &Config,
    channel: &mut Channel,
) {
    if channel.is_empty() || channel.has_operator() {
        return;
    }
    let Some(new_op) = channel.first_member() else {
        return;
    };
    channel.add_operator(new_op);
    let nick = clients
        .get(&new_op)
        .map(|client| client.nickname().to_string())
        .unwrap_or_default();
    let line = format!(":{} MODE {} +o {}\r\n", config.server_name, channel.name(), nick);
    broadcast_to(clients, channel, &line, None);
}

impl ServerState {
    /// Topic state for one requester: numeric 331 when unset, 332 otherwise.
    fn send_topic_state(&self, id: ClientId, chan: &str) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let topic = self
            .channels
            .get(chan)
            .map(|channel| channel.topic().to_string())
            .unwrap_or_default();
        let line = if topic.is_empty() {
            format!(
                ":{} 331 {} {} :No topic is set\r\n",
                self.config.server_name,
                client.nickname(),
                chan
            )
        } else {
            format!(
                ":{} 332 {} {} :{}\r\n",
                self.config.server_name,
                client.nickname(),
                chan,
                topic
            )
        };
        self.reply_raw(id, &line);
    }

    /// NAMES listing (operators prefixed with `@`) plus the end-of-list
    /// marker, sent to the joiner alone.
    fn send_names(&self, id: ClientId, chan: &str) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let Some(channel) = self.channels.get(chan) else {
            return;
        };
        let names = channel
            .members()
            .map(|member| {
                let nick = self
                    .clients
                    .get(&member)
                    .map(|c| c.nickname().to_string())
                    .unwrap_or_default();
                if channel.is_operator(member) {
                    format!("@{}", nick)
                } else {
                    nick
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        self.reply_raw(
            id,
            &format!(
                ":{} 353 {} = {} :{}\r\n",
                self.config.server_name,
                client.nickname(),
                chan,
                names
            ),
        );
        self.reply_raw(
            id,
            &format!(
                ":{} 366 {} {} :End of /NAMES list\r\n",
                self.config.server_name,
                client.nickname(),
                chan
            ),
        );
    }
}

/// The listening socket plus the event loop driving all connections.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: CancellationToken,
    next_id: u64,
}

impl Server {
    /// Bind the listening socket. Fails fast on a bad configuration or an
    /// unbindable address, leaving no partial state behind.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener =
            TcpListener::bind(format!("{}:{}", config.bind_address, config.port)).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            state: ServerState::new(config),
            events_tx,
            events_rx,
            shutdown: CancellationToken::new(),
            next_id: 0,
        })
    }

    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Request shutdown. Idempotent; [`run`](Self::run) observes it on its
    /// next loop iteration and releases all connections and channels.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Clone of the shutdown token, for signal-handling glue.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the event loop until a stop request is observed.
    ///
    /// One task multiplexes accepts and connection events; every event is
    /// handled to completion before the next is taken, so state invariants
    /// hold between events without locking.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            mut state,
            events_tx,
            mut events_rx,
            shutdown,
            mut next_id,
        } = self;
        tracing::info!("ircserv listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        accept_client(
                            &mut state,
                            &events_tx,
                            &shutdown,
                            ClientId::new(next_id),
                            stream,
                            addr,
                        );
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                    }
                },
                event = events_rx.recv() => match event {
                    Some(ServerEvent::Line(id, line, wire_len)) => {
                        state.handle_framed_line(id, &line, wire_len);
                    }
                    Some(ServerEvent::Closed(id, reason)) => state.disconnect(id, &reason),
                    None => break,
                },
            }
        }

        state.shutdown();
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Wire up a freshly accepted socket: split it, spawn its reader and writer
/// tasks, and insert the client into the table.
fn accept_client(
    state: &mut ServerState,
    events: &mpsc::UnboundedSender<ServerEvent>,
    shutdown: &CancellationToken,
    id: ClientId,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let (sender, outq) = mpsc::unbounded_channel();
    let token = shutdown.child_token();
    connection::spawn_reader(id, read_half, events.clone(), token.clone());
    connection::spawn_writer(id, write_half, outq, events.clone());
    state.add_client(Client::new(id, addr.to_string(), sender, token));
    tracing::info!("client {} connected from {}", id, addr);
}
