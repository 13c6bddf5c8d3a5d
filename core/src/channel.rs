//! Channel entity: membership, operators, invites, and moderation modes

use crate::client::ClientId;
use std::collections::BTreeSet;

/// One step produced by a MODE flag scan.
///
/// `i`/`t`/`k`/`l` changes are applied to the channel during the scan and
/// reported back as compact text for the aggregate notice. Operator changes
/// need a nickname resolved against the registry, so they are deferred to
/// the caller, as are the two per-character error cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeStep {
    /// An applied `i`/`t`/`k`/`l` change, e.g. `+i` or `+k secret`.
    Applied(String),
    /// An `o` flag; the caller resolves the nickname and broadcasts.
    Operator { nick: String, adding: bool },
    /// A flag that consumes a parameter had none left.
    MissingParam,
    /// An unrecognized flag character.
    Unknown(char),
}

/// A named group of connections sharing broadcast messaging, a topic, and
/// moderation modes. Created on first JOIN and destroyed the moment its
/// membership becomes empty.
///
/// Member sets are ordered by client identity, which fixes the NAMES listing
/// and operator re-assertion order.
#[derive(Debug)]
pub struct Channel {
    name: String,
    topic: String,
    members: BTreeSet<ClientId>,
    operators: BTreeSet<ClientId>,
    invited: BTreeSet<ClientId>,
    invite_only: bool,
    topic_restricted: bool,
    key: Option<String>,
    user_limit: Option<usize>,
}

impl Channel {
    /// Create a new channel. Names are `#`-prefixed; the caller validates.
    pub fn new(name: String) -> Self {
        Self {
            name,
            topic: String::new(),
            members: BTreeSet::new(),
            operators: BTreeSet::new(),
            invited: BTreeSet::new(),
            invite_only: false,
            topic_restricted: false,
            key: None,
            user_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&mut self, topic: &str) {
        self.topic = topic.to_string();
    }

    /// Add a member, consuming any pending invite for that identity.
    pub fn add_member(&mut self, id: ClientId) {
        self.members.insert(id);
        self.invited.remove(&id);
    }

    /// Remove a member and any operator status it held.
    pub fn remove_member(&mut self, id: ClientId) {
        self.members.remove(&id);
        self.operators.remove(&id);
    }

    pub fn is_member(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members in ascending identity order.
    pub fn members(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.members.iter().copied()
    }

    /// Lowest-identity member, the promotion target for operator re-assertion.
    pub fn first_member(&self) -> Option<ClientId> {
        self.members.iter().next().copied()
    }

    pub fn add_operator(&mut self, id: ClientId) {
        self.operators.insert(id);
    }

    pub fn remove_operator(&mut self, id: ClientId) {
        self.operators.remove(&id);
    }

    pub fn is_operator(&self, id: ClientId) -> bool {
        self.operators.contains(&id)
    }

    /// Whether any current member holds operator status.
    pub fn has_operator(&self) -> bool {
        self.members.iter().any(|m| self.operators.contains(m))
    }

    pub fn invite(&mut self, id: ClientId) {
        self.invited.insert(id);
    }

    pub fn is_invited(&self, id: ClientId) -> bool {
        self.invited.contains(&id)
    }

    pub fn is_invite_only(&self) -> bool {
        self.invite_only
    }

    pub fn is_topic_restricted(&self) -> bool {
        self.topic_restricted
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// True when no key is set or the supplied key matches exactly.
    pub fn key_matches(&self, supplied: &str) -> bool {
        match &self.key {
            Some(key) => key == supplied,
            None => true,
        }
    }

    pub fn user_limit(&self) -> Option<usize> {
        self.user_limit
    }

    pub fn is_full(&self) -> bool {
        self.user_limit
            .map_or(false, |limit| self.members.len() >= limit)
    }

    /// Active mode flags as a compact string, subset of `itkl`.
    pub fn modes_string(&self) -> String {
        let mut s = String::new();
        if self.invite_only {
            s.push('i');
        }
        if self.topic_restricted {
            s.push('t');
        }
        if self.key.is_some() {
            s.push('k');
        }
        if self.user_limit.is_some() {
            s.push('l');
        }
        s
    }

    /// Scan a MODE flag string left to right, applying `i`/`t`/`k`/`l`
    /// changes in place and reporting every step in processed order.
    ///
    /// A `+`/`-` toggles the adding sense for subsequent flags (default is
    /// adding). Flags that take a parameter consume the next token from
    /// `params`; a missing parameter aborts that flag only. User limits are
    /// clamped to a minimum of 1.
    pub fn apply_mode_flags<'a, I>(&mut self, flags: &str, params: &mut I) -> Vec<ModeStep>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut steps = Vec::new();
        let mut adding = true;
        for flag in flags.chars() {
            match flag {
                '+' => adding = true,
                '-' => adding = false,
                'i' => {
                    self.invite_only = adding;
                    steps.push(ModeStep::Applied(format!("{}i", sign(adding))));
                }
                't' => {
                    self.topic_restricted = adding;
                    steps.push(ModeStep::Applied(format!("{}t", sign(adding))));
                }
                'k' => {
                    if adding {
                        match params.next() {
                            Some(key) => {
                                self.key = Some(key.to_string());
                                steps.push(ModeStep::Applied(format!("+k {}", key)));
                            }
                            None => steps.push(ModeStep::MissingParam),
                        }
                    } else {
                        self.key = None;
                        steps.push(ModeStep::Applied("-k".to_string()));
                    }
                }
                'l' => {
                    if adding {
                        match params.next() {
                            Some(raw) => {
                                let limit = raw.parse::<i64>().unwrap_or(0).max(1) as usize;
                                self.user_limit = Some(limit);
                                steps.push(ModeStep::Applied(format!("+l {}", limit)));
                            }
                            None => steps.push(ModeStep::MissingParam),
                        }
                    } else {
                        self.user_limit = None;
                        steps.push(ModeStep::Applied("-l".to_string()));
                    }
                }
                'o' => match params.next() {
                    Some(nick) => steps.push(ModeStep::Operator {
                        nick: nick.to_string(),
                        adding,
                    }),
                    None => steps.push(ModeStep::MissingParam),
                },
                other => steps.push(ModeStep::Unknown(other)),
            }
        }
        steps
    }
}

fn sign(adding: bool) -> char {
    if adding {
        '+'
    } else {
        '-'
    }
}
