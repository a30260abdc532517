//! Topic id tables.
//!
//! MQTT-SN replaces topic names with 16-bit ids of three kinds:
//!
//! - **Registered**: assigned per connection through a REGISTER/REGACK
//!   exchange, see [`TopicAliases`].
//! - **Predefined**: agreed out of band, configured per client id or for
//!   every client, see [`PredefinedTopics`].
//! - **Short**: two characters packed directly into the id, never
//!   registered, see [`encode_short`].

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Client id under which predefined topics apply to every client.
pub const ANY_CLIENT: &str = "*";

/// Whether `name` is an MQTT filter rather than a concrete topic.
pub fn has_wildcard(name: &str) -> bool {
    name.contains(['+', '#'])
}

/// Pack a two-character topic name into a short topic id.
///
/// Returns `None` unless `name` is exactly two printable ASCII characters
/// with no wildcard.
pub fn encode_short(name: &str) -> Option<u16> {
    let bytes = name.as_bytes();
    if bytes.len() != 2 || has_wildcard(name) {
        return None;
    }
    if !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Unpack a short topic id.
pub fn decode_short(id: u16) -> Option<String> {
    let bytes = id.to_be_bytes();
    if !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Clone, Copy)]
struct Alias {
    id: u16,
    confirmed: bool,
}

/// Per-connection table of registered topic ids.
///
/// An alias is *pending* from allocation until its registration is
/// acknowledged, then *confirmed*. A pending alias is reused if the same
/// name needs registering again, so a name never holds two ids.
#[derive(Debug)]
pub struct TopicAliases {
    by_name: HashMap<String, Alias>,
    by_id: HashMap<u16, String>,
    next: u16,
    max: u16,
}

impl Default for TopicAliases {
    fn default() -> Self {
        Self::new(u16::MAX)
    }
}

impl TopicAliases {
    /// Table allowing ids `1..=max`.
    pub fn new(max: u16) -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next: 1,
            max: max.max(1),
        }
    }

    /// Id for `name`, allocating a pending alias if it has none.
    ///
    /// Returns the id and whether it is already confirmed.
    pub fn register(&mut self, name: &str) -> Result<(u16, bool)> {
        if let Some(alias) = self.by_name.get(name) {
            return Ok((alias.id, alias.confirmed));
        }
        let id = self.allocate()?;
        self.by_name.insert(name.to_string(), Alias { id, confirmed: false });
        self.by_id.insert(id, name.to_string());
        Ok((id, false))
    }

    /// Register and confirm in one step, for ids the peer asked for.
    pub fn register_confirmed(&mut self, name: &str) -> Result<u16> {
        let (id, _) = self.register(name)?;
        self.confirm(id);
        Ok(id)
    }

    /// Record an id assigned by the peer.
    pub fn insert(&mut self, name: &str, id: u16) {
        if let Some(old) = self.by_name.remove(name) {
            self.by_id.remove(&old.id);
        }
        if let Some(old_name) = self.by_id.remove(&id) {
            self.by_name.remove(&old_name);
        }
        self.by_name.insert(name.to_string(), Alias { id, confirmed: true });
        self.by_id.insert(id, name.to_string());
    }

    pub fn confirm(&mut self, id: u16) {
        if let Some(name) = self.by_id.get(&id) {
            if let Some(alias) = self.by_name.get_mut(name) {
                alias.confirmed = true;
            }
        }
    }

    /// Whether `name` holds an alias, confirmed or not.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Drop an alias, e.g. after the peer rejected its registration.
    pub fn remove(&mut self, id: u16) {
        if let Some(name) = self.by_id.remove(&id) {
            self.by_name.remove(&name);
        }
    }

    /// Confirmed id for `name`.
    pub fn id(&self, name: &str) -> Option<u16> {
        self.by_name
            .get(name)
            .filter(|alias| alias.confirmed)
            .map(|alias| alias.id)
    }

    /// Name behind a confirmed id.
    pub fn name(&self, id: u16) -> Option<&str> {
        let name = self.by_id.get(&id)?;
        self.by_name
            .get(name)
            .filter(|alias| alias.confirmed)
            .map(|_| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
        self.next = 1;
    }

    fn allocate(&mut self) -> Result<u16> {
        for _ in 0..self.max {
            let id = self.next;
            self.next = if self.next >= self.max { 1 } else { self.next + 1 };
            if !self.by_id.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Exhausted("topic aliases"))
    }
}

/// Predefined topic configuration for all clients.
#[derive(Debug, Clone, Default)]
pub struct PredefinedTopics {
    entries: HashMap<String, HashMap<u16, String>>,
}

impl PredefinedTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predefine `name` as `id` for `client_id`, or for everyone with [`ANY_CLIENT`].
    pub fn insert(&mut self, client_id: &str, id: u16, name: &str) -> &mut Self {
        self.entries
            .entry(client_id.to_string())
            .or_default()
            .insert(id, name.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|topics| topics.is_empty())
    }

    /// The table seen by `client_id`: shared entries overlaid by its own.
    pub fn for_client(&self, client_id: Option<&str>) -> PredefinedTable {
        let mut table = PredefinedTable::default();
        if let Some(shared) = self.entries.get(ANY_CLIENT) {
            for (id, name) in shared {
                table.insert(*id, name);
            }
        }
        if let Some(own) = client_id.and_then(|id| self.entries.get(id)) {
            for (id, name) in own {
                table.insert(*id, name);
            }
        }
        table
    }
}

/// Predefined topics resolved for one connection.
#[derive(Debug, Clone, Default)]
pub struct PredefinedTable {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
}

impl PredefinedTable {
    pub fn insert(&mut self, id: u16, name: &str) {
        if let Some(old) = self.by_id.insert(id, name.to_string()) {
            self.by_name.remove(&old);
        }
        self.by_name.insert(name.to_string(), id);
    }

    pub fn id(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// How an outbound publish addresses its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Short(u16),
    Registered(u16),
    Predefined(u16),
    /// No id yet; a REGISTER must precede the publish.
    Unregistered,
}

/// Resolve `name` for a gateway-originated publish: short first, then
/// registered, then predefined.
pub fn resolve(name: &str, aliases: &TopicAliases, predefined: &PredefinedTable) -> Resolved {
    if let Some(id) = encode_short(name) {
        Resolved::Short(id)
    } else if let Some(id) = aliases.id(name) {
        Resolved::Registered(id)
    } else if let Some(id) = predefined.id(name) {
        Resolved::Predefined(id)
    } else {
        Resolved::Unregistered
    }
}
