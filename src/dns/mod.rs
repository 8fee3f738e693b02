use std::collections::HashSet;
use std::net::IpAddr;
use crate::{
    context::Context,
    endpoint::Endpoint,
    plan::Changes,
};

#[cfg(feature = "aws")]
pub mod route53;
#[cfg(feature = "cloudflare")]
pub mod cloudflare;
pub mod memory;

/// A DNS backend the updater can read from and write to.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    type Error: ProviderError;

    /// Returns every record currently known to the backend.
    async fn records(&self, ctx: &Context) -> Result<Vec<Endpoint>, Self::Error>;

    /// Applies `changes` to the backend.
    ///
    /// `cached` may carry the result of an earlier [`Provider::records`] call
    /// so implementations can avoid querying the zone again. `None` is always
    /// valid. Whether a failure leaves earlier changes applied is backend
    /// specific; see [`ProviderError::partially_applied`].
    async fn apply_changes(
        &self,
        ctx: &Context,
        changes: &Changes,
        cached: Option<&[Endpoint]>,
    ) -> Result<(), Self::Error>;
}

pub trait ProviderError: std::error::Error + Send + Sync + 'static {
    /// Whether some, but not all, of a changeset made it to the backend.
    fn partially_applied(&self) -> bool {
        false
    }
}

/// Puts a hostname in fully qualified form.
///
/// IP literals are returned as is. Anything else ends up with exactly one
/// trailing dot.
pub fn ensure_trailing_dot(hostname: &str) -> String {
    if hostname.parse::<IpAddr>().is_ok() {
        return hostname.to_owned();
    }

    let mut fqdn = hostname.trim_end_matches('.').to_owned();
    fqdn.push('.');
    fqdn
}

/// Partition of two identifier sets, see [`difference`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Difference<'a> {
    pub add: Vec<&'a str>,
    pub remove: Vec<&'a str>,
    pub leave: Vec<&'a str>,
}

impl Difference<'_> {
    /// True if `current` already matches `desired`.
    pub fn is_unchanged(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Tells which entries need to be added, removed or left untouched to turn
/// `current` into `desired`.
///
/// Both inputs are treated as sets. `add` and `leave` follow the order of
/// `desired`, `remove` follows the order of `current`.
pub fn difference<'a, C, D>(current: &'a [C], desired: &'a [D]) -> Difference<'a>
where
    C: AsRef<str>,
    D: AsRef<str>,
{
    let mut index: HashSet<&str> = current.iter().map(AsRef::as_ref).collect();
    let mut seen = HashSet::with_capacity(desired.len());
    let mut diff = Difference::default();

    for x in desired.iter().map(AsRef::as_ref) {
        if !seen.insert(x) {
            continue;
        }
        if index.remove(x) {
            diff.leave.push(x);
        } else {
            diff.add.push(x);
        }
    }

    diff.remove = current.iter()
        .map(AsRef::as_ref)
        .filter(|x| index.remove(x))
        .collect();

    diff
}
