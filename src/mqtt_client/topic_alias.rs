// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

/// Topic aliases the client may use when sending, as negotiated for the
/// current connection.
///
/// The table is built when the connection is established and only read while
/// publishes are written.
#[derive(Debug, Clone, Default)]
pub struct TopicAliasMapping {
    aliases: HashMap<String, u16>,
    /// Topic Alias Maximum advertised by the broker
    maximum: u16,
}

impl TopicAliasMapping {
    pub fn new(maximum: u16) -> Self {
        Self {
            aliases: HashMap::new(),
            maximum,
        }
    }

    /// Binds `topic` to `alias`. Aliases outside `1..=maximum` are rejected.
    pub fn insert(&mut self, topic: impl Into<String>, alias: u16) -> bool {
        if alias == 0 || alias > self.maximum {
            return false;
        }
        self.aliases.insert(topic.into(), alias);
        true
    }

    pub fn lookup(&self, topic: &str) -> Option<u16> {
        self.aliases.get(topic).copied()
    }

    pub fn maximum(&self) -> u16 {
        self.maximum
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
