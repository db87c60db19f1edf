//! Structured view of a caller-supplied key.

/// A key split into `(name, value)` pairs for policy matching.
///
/// Keys are opaque to the counting logic; this view only exists so policy
/// rules can match on namespaces. `"tenant:acme:user:42"` reads as
/// `[(tenant, acme), (user, 42)]`. A trailing name without a value gets an
/// empty value.
///
/// Values containing `:` are split like any other segment, so
/// `"ip:2001:db8::1"` has the entry `(ip, 2001)`. [`value_to_end`] recovers
/// the whole remainder of the key from an entry's value onwards.
///
/// [`value_to_end`]: KeyDescriptor::value_to_end
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyDescriptor {
    pub entries: Vec<(String, String)>,
    key: String,
    value_offsets: Vec<usize>,
}

impl KeyDescriptor {
    /// Parse a key into its descriptor entries.
    pub fn parse(key: &str) -> Self {
        let mut segments = key.split(':');
        let mut entries = Vec::new();
        let mut value_offsets = Vec::new();
        let mut offset = 0;

        while let Some(name) = segments.next() {
            let value_offset = (offset + name.len() + 1).min(key.len());
            let value = segments.next().unwrap_or_default();
            offset = value_offset + value.len() + 1;

            entries.push((name.to_string(), value.to_string()));
            value_offsets.push(value_offset);
        }

        Self {
            entries,
            key: key.to_string(),
            value_offsets,
        }
    }

    /// The key from entry `index`'s value to the end, separators included.
    pub fn value_to_end(&self, index: usize) -> Option<&str> {
        let offset = *self.value_offsets.get(index)?;
        self.key.get(offset..)
    }

    /// Render the entries back into `name=value` form for logging.
    pub fn to_string_key(&self) -> String {
        let entries_str: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        entries_str.join(",")
    }
}

impl std::fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
