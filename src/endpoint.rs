use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use crate::dns::ensure_trailing_dot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Txt,
}

impl Display for RecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Txt => "TXT",
        })
    }
}

/// A single DNS record set: one name, one type, any number of targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub dns_name: String,
    pub record_type: RecordType,
    pub targets: Vec<String>,
    pub ttl: Option<u32>,
    /// Opaque backend data, e.g. record identifiers.
    pub provider_specific: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(dns_name: impl Into<String>, record_type: RecordType, targets: Vec<String>) -> Self {
        Self {
            dns_name: dns_name.into(),
            record_type,
            targets,
            ttl: None,
            provider_specific: BTreeMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Identity of the record set, with the name in canonical form.
    pub fn key(&self) -> (String, RecordType) {
        (ensure_trailing_dot(&self.dns_name), self.record_type)
    }

    /// Targets in the form they should be compared in.
    ///
    /// Only CNAME targets are hostnames; everything else is compared verbatim.
    pub fn comparable_targets(&self) -> Vec<String> {
        match self.record_type {
            RecordType::Cname => self.targets.iter().map(|t| ensure_trailing_dot(t)).collect(),
            _ => self.targets.clone(),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [{}]", self.dns_name, self.record_type, self.targets.join(", "))?;
        if let Some(ttl) = self.ttl {
            write!(f, " ttl={}", ttl)?;
        }
        Ok(())
    }
}
